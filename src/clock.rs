//! Frame clock for animated scripts.
//!
//! ```text
//! Idle --compile ok--> Compiled --population pass with draw()--> Running
//!                          ^                                        |
//!                          +---- population pass <---- Stopped <----+ (past `last`, halt, crash, stop())
//! ```

use crate::diagnostics::{ErrorKind, ScriptPhase};
use crate::engine::ExecutionEngine;
use crate::metadata::RunMetadata;
use crate::outcome::Outcome;

/// Frame rate used when an animated script never calls `speed()`.
pub const DEFAULT_FPS: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    /// Nothing compiled.
    Idle,
    /// Compiled; static, or not yet run.
    Compiled,
    Running,
    /// Finished for this invocation; the next population pass starts over.
    Stopped,
}

#[derive(Debug)]
pub struct AnimationClock {
    state: ClockState,
    fps: Option<f64>,
    /// Leave the `stop` hook to an explicit [`AnimationClock::stop`] when the run ends.
    defer_stop: bool,
    stop_pending: bool,
}

impl Default for AnimationClock {
    fn default() -> Self {
        Self::new()
    }
}

impl AnimationClock {
    pub fn new() -> Self {
        Self {
            state: ClockState::Idle,
            fps: None,
            defer_stop: false,
            stop_pending: false,
        }
    }

    /// While set, a run that ends in `draw` (past `last`, `speed(0)` or `halt()`) stops
    /// the clock without calling the script's `stop` hook; the next
    /// [`AnimationClock::stop`] calls it instead.
    pub fn set_defer_stop(&mut self, defer: bool) {
        self.defer_stop = defer;
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    /// Effective frame rate of the current animation (`None` for static scripts).
    pub fn fps(&self) -> Option<f64> {
        self.fps
    }

    pub fn is_running(&self) -> bool {
        self.state == ClockState::Running
    }

    pub fn compile(&mut self, engine: &mut ExecutionEngine, source: &str) -> Outcome {
        let outcome = engine.compile(source);
        self.state = if outcome.ok {
            ClockState::Compiled
        } else {
            ClockState::Idle
        };
        self.fps = None;
        self.stop_pending = false;
        outcome
    }

    /// Render the population pass (`None`) or a hook. `draw` renders advance the clock.
    pub fn render(
        &mut self,
        engine: &mut ExecutionEngine,
        meta: &mut RunMetadata,
        method: Option<&str>,
    ) -> Outcome {
        match method {
            None => self.populate(engine, meta),
            Some("draw") => self.draw(engine, meta),
            Some(hook) => engine.render(Some(hook), meta),
        }
    }

    fn populate(&mut self, engine: &mut ExecutionEngine, meta: &mut RunMetadata) -> Outcome {
        meta.running = false;
        meta.rewind();
        self.fps = None;
        self.stop_pending = false;

        let outcome = engine.render(None, meta);
        if !outcome.ok {
            self.state = if engine.script().is_compiled() {
                ClockState::Compiled
            } else {
                ClockState::Idle
            };
            return outcome;
        }
        self.state = ClockState::Compiled;
        if outcome.halted {
            return outcome;
        }

        match (engine.speed(), engine.animated()) {
            (Some(fps), false) => {
                let error = Outcome::error(
                    ErrorKind::ConfigurationError,
                    ScriptPhase::Population,
                    format!(
                        "speed({}) was called but the script defines no draw() function",
                        fps
                    ),
                );
                outcome.merge(error)
            }
            (speed, true) => {
                self.fps = Some(speed.unwrap_or(DEFAULT_FPS));
                self.state = ClockState::Running;
                meta.running = true;
                log::debug!("animation running at {:?} fps", self.fps);
                outcome
            }
            (None, false) => outcome,
        }
    }

    fn draw(&mut self, engine: &mut ExecutionEngine, meta: &mut RunMetadata) -> Outcome {
        if self.state != ClockState::Running {
            return Outcome::empty();
        }

        let outcome = engine.render(Some("draw"), meta);
        if !outcome.ok {
            // crashed scripts skip their stop hook
            self.halt(meta);
            return outcome;
        }
        if outcome.halted {
            return match self.end_run(engine, meta) {
                Some(stop) => outcome.merge(stop),
                None => outcome,
            };
        }
        match self.advance(engine, meta) {
            Some(stop) => outcome.merge(stop),
            None => outcome,
        }
    }

    /// Step `next` forward. Returns the stop hook's outcome if the run ended.
    pub fn advance(&mut self, engine: &mut ExecutionEngine, meta: &mut RunMetadata) -> Option<Outcome> {
        if self.fps == Some(0.0) {
            return self.end_run(engine, meta);
        }
        meta.next += 1;
        match meta.last {
            Some(last) if meta.next > last => {
                if meta.loop_ {
                    meta.next = meta.first;
                    None
                } else {
                    self.end_run(engine, meta)
                }
            }
            _ => None,
        }
    }

    fn end_run(&mut self, engine: &mut ExecutionEngine, meta: &mut RunMetadata) -> Option<Outcome> {
        if self.defer_stop {
            self.halt(meta);
            self.stop_pending = true;
            return None;
        }
        Some(self.stop(engine, meta))
    }

    fn halt(&mut self, meta: &mut RunMetadata) {
        self.state = ClockState::Stopped;
        meta.running = false;
    }

    /// End the run, calling the script's `stop` hook once. Idempotent.
    pub fn stop(&mut self, engine: &mut ExecutionEngine, meta: &mut RunMetadata) -> Outcome {
        let pending = std::mem::take(&mut self.stop_pending);
        if self.state != ClockState::Running && !pending {
            return Outcome::empty();
        }
        self.halt(meta);
        if engine.crashed() {
            return Outcome::empty();
        }
        engine.call(Some("stop"), meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineLimits;

    fn setup(src: &str) -> (AnimationClock, ExecutionEngine, RunMetadata) {
        let mut clock = AnimationClock::new();
        let mut engine = ExecutionEngine::new(&EngineLimits::default());
        assert!(clock.compile(&mut engine, src).ok);
        (clock, engine, RunMetadata::default())
    }

    #[test]
    fn test_static_script_stays_compiled() {
        let (mut clock, mut engine, mut meta) = setup("rect(0, 0, 1, 1);");
        assert_eq!(clock.state(), ClockState::Compiled);
        assert!(clock.render(&mut engine, &mut meta, None).ok);
        assert_eq!(clock.state(), ClockState::Compiled);
        assert_eq!(clock.fps(), None);
    }

    #[test]
    fn test_speed_without_draw_is_configuration_error() {
        let (mut clock, mut engine, mut meta) = setup("speed(24);");
        let out = clock.render(&mut engine, &mut meta, None);
        assert!(!out.ok);
        assert_eq!(out.kind(), Some(ErrorKind::ConfigurationError));
        assert!(!clock.is_running());
    }

    #[test]
    fn test_default_fps_and_advance() {
        let (mut clock, mut engine, mut meta) = setup("fn draw() { rect(0, 0, 1, 1); }");
        meta.last = Some(3);
        assert!(clock.render(&mut engine, &mut meta, None).ok);
        assert_eq!(clock.fps(), Some(DEFAULT_FPS));
        assert!(clock.is_running());
        assert_eq!(meta.next, 1);

        for _ in 0..3 {
            assert!(clock.render(&mut engine, &mut meta, Some("draw")).ok);
        }
        assert_eq!(clock.state(), ClockState::Stopped);
        assert!(!meta.running);

        // further draws are no-ops
        let out = clock.render(&mut engine, &mut meta, Some("draw"));
        assert!(out.ok && out.output.is_empty());
    }

    #[test]
    fn test_loop_wraps_to_first() {
        let (mut clock, mut engine, mut meta) = setup("fn draw() {}");
        meta.first = 2;
        meta.last = Some(3);
        meta.loop_ = true;
        clock.render(&mut engine, &mut meta, None);
        assert_eq!(meta.next, 2);
        clock.render(&mut engine, &mut meta, Some("draw"));
        clock.render(&mut engine, &mut meta, Some("draw"));
        assert_eq!(meta.next, 2);
        assert!(clock.is_running());
    }

    #[test]
    fn test_stop_hook_runs_once() {
        let (mut clock, mut engine, mut meta) =
            setup(r#"fn draw() {} fn stop() { print("stopped"); }"#);
        clock.render(&mut engine, &mut meta, None);
        let first = clock.stop(&mut engine, &mut meta);
        assert_eq!(first.stdout_text(), "stopped\n");
        let second = clock.stop(&mut engine, &mut meta);
        assert!(second.ok);
        assert!(second.output.is_empty());
    }

    #[test]
    fn test_crash_skips_stop_hook() {
        let (mut clock, mut engine, mut meta) =
            setup(r#"fn draw() { throw "x"; } fn stop() { print("stopped"); }"#);
        clock.render(&mut engine, &mut meta, None);
        let out = clock.render(&mut engine, &mut meta, Some("draw"));
        assert!(!out.ok);
        assert_eq!(clock.state(), ClockState::Stopped);
        assert!(!out.stdout_text().contains("stopped"));
        assert!(clock.stop(&mut engine, &mut meta).output.is_empty());
    }

    #[test]
    fn test_halt_stops_clock() {
        let (mut clock, mut engine, mut meta) =
            setup(r#"fn draw() { halt(); } fn stop() { print("bye"); }"#);
        clock.render(&mut engine, &mut meta, None);
        let out = clock.render(&mut engine, &mut meta, Some("draw"));
        assert!(out.ok && out.halted);
        assert_eq!(out.stdout_text(), "bye\n");
        assert_eq!(clock.state(), ClockState::Stopped);
    }

    #[test]
    fn test_deferred_stop_runs_hook_on_explicit_stop() {
        let (mut clock, mut engine, mut meta) =
            setup(r#"fn draw() { print(FRAME); } fn stop() { print("stopped"); }"#);
        meta.last = Some(2);
        clock.set_defer_stop(true);
        clock.render(&mut engine, &mut meta, None);
        clock.render(&mut engine, &mut meta, Some("draw"));
        let last = clock.render(&mut engine, &mut meta, Some("draw"));
        assert_eq!(last.stdout_text(), "2\n");
        assert_eq!(clock.state(), ClockState::Stopped);

        assert_eq!(clock.stop(&mut engine, &mut meta).stdout_text(), "stopped\n");
        assert!(clock.stop(&mut engine, &mut meta).output.is_empty());
    }

    #[test]
    fn test_zero_speed_draws_once() {
        let (mut clock, mut engine, mut meta) = setup("speed(0); fn draw() {}");
        clock.render(&mut engine, &mut meta, None);
        assert!(clock.is_running());
        clock.render(&mut engine, &mut meta, Some("draw"));
        assert_eq!(clock.state(), ClockState::Stopped);
    }
}
