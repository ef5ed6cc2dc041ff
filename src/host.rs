//! The façade a GUI or CLI drives: script state, run metadata, the animation clock
//! and at most one running export.
//!
//! Exports are cooperative. [`ScriptHost::export`] only prepares the run and queues the
//! first batch; the caller then calls [`ScriptHost::pump`] from its own loop (or
//! [`ScriptHost::run_until_idle`]) until it returns [`Pump::Idle`]. Everything the
//! export produces is reported through the [`Delegate`](crate::delegate::Delegate).

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use crate::canvas::Canvas;
use crate::clock::AnimationClock;
use crate::config::HostConfig;
use crate::delegate::SharedDelegate;
use crate::diagnostics::{ErrorKind, ScriptPhase};
use crate::engine::{ExecutionEngine, UiState};
use crate::export::{ExportKind, ExportOptions, ExportSession, ExportTarget, FileWriters, WriterFactory};
use crate::metadata::{ConsoleSink, MetadataUpdate, RunMetadata};
use crate::namespace::{Namespace, NamespaceTemplate};
use crate::outcome::Outcome;
use crate::scheduler::{BatchScheduler, CancelToken, FrameSource, Pump};

/// Engine, clock and metadata: everything a frame render touches.
struct Runtime {
    engine: ExecutionEngine,
    clock: AnimationClock,
    meta: RunMetadata,
    /// Loop flag to restore once the export releases the clock.
    saved_loop: Option<bool>,
}

impl FrameSource for Runtime {
    fn render_frame(&mut self, index: u32, method: Option<&str>) -> Outcome {
        self.meta.next = index;
        match method {
            // static scripts re-run their global scope once per page
            None => self.engine.render(None, &mut self.meta),
            Some(hook) => {
                let mut outcome = self.clock.render(&mut self.engine, &mut self.meta, Some(hook));
                // a clock that stopped short of `last` ends the export after this frame
                if outcome.ok && !self.clock.is_running() && Some(index) < self.meta.last {
                    outcome.halted = true;
                }
                outcome
            }
        }
    }

    fn canvas(&self) -> &dyn Canvas {
        self.engine.canvas()
    }

    fn finish(&mut self) -> Outcome {
        self.clock.stop(&mut self.engine, &mut self.meta)
    }
}

struct ActiveExport {
    session: ExportSession,
    scheduler: BatchScheduler,
}

pub struct ScriptHost {
    runtime: Runtime,
    delegate: SharedDelegate,
    export: Option<ActiveExport>,
    config: HostConfig,
    writers: Rc<dyn WriterFactory>,
}

impl ScriptHost {
    pub fn new(delegate: SharedDelegate) -> Self {
        Self::with_config(HostConfig::default(), delegate, Rc::new(FileWriters))
    }

    pub fn with_config(
        config: HostConfig,
        delegate: SharedDelegate,
        writers: Rc<dyn WriterFactory>,
    ) -> Self {
        let engine = ExecutionEngine::new(&config.limits);
        Self {
            runtime: Runtime {
                engine,
                clock: AnimationClock::new(),
                meta: RunMetadata::default(),
                saved_loop: None,
            },
            delegate,
            export: None,
            config,
            writers,
        }
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.runtime.engine
    }

    pub fn clock(&self) -> &AnimationClock {
        &self.runtime.clock
    }

    pub fn namespace(&self) -> &Namespace {
        self.runtime.engine.namespace()
    }

    pub fn canvas(&self) -> &dyn Canvas {
        self.runtime.engine.canvas()
    }

    /// Merge host-supplied built-ins into every run's namespace.
    pub fn extend_template(&mut self, extra: NamespaceTemplate) {
        self.runtime.engine.extend_template(extra);
    }

    pub fn set_path(&mut self, path: Option<PathBuf>) {
        self.runtime.engine.set_path(path);
    }

    pub fn set_ui_state(&mut self, ui: UiState) {
        self.runtime.engine.set_ui_state(ui);
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.runtime.meta
    }

    pub fn set_metadata(&mut self, update: MetadataUpdate) {
        self.runtime.meta.apply(update);
    }

    pub fn set_console(&mut self, console: Option<ConsoleSink>) {
        self.runtime.meta.console = console;
    }

    /// Read and compile the script at `path`.
    pub fn load(&mut self, path: &Path) -> Outcome {
        match std::fs::read_to_string(path) {
            Ok(source) => {
                self.set_path(Some(path.to_path_buf()));
                self.compile(&source)
            }
            Err(e) => {
                let outcome = Outcome::error(
                    ErrorKind::ConfigurationError,
                    ScriptPhase::Compile,
                    format!("Failed to read script {:?}: {}", path, e),
                );
                self.runtime.meta.echo(&outcome.output);
                outcome
            }
        }
    }

    pub fn compile(&mut self, source: &str) -> Outcome {
        let rt = &mut self.runtime;
        let outcome = rt.clock.compile(&mut rt.engine, source);
        rt.meta.echo(&outcome.output);
        outcome
    }

    pub fn call(&mut self, method: Option<&str>) -> Outcome {
        self.runtime.engine.call(method, &self.runtime.meta)
    }

    /// `None` runs the population pass; hooks go through the animation clock.
    pub fn render(&mut self, method: Option<&str>) -> Outcome {
        let rt = &mut self.runtime;
        rt.clock.render(&mut rt.engine, &mut rt.meta, method)
    }

    pub fn stop(&mut self) -> Outcome {
        let rt = &mut self.runtime;
        rt.clock.stop(&mut rt.engine, &mut rt.meta)
    }

    pub fn is_exporting(&self) -> bool {
        self.export.is_some()
    }

    /// Token that cancels the running export from any thread.
    pub fn export_cancel_token(&self) -> Option<CancelToken> {
        self.export.as_ref().map(|e| e.session.cancel_token())
    }

    pub fn cancel_export(&mut self) {
        if let Some(active) = self.export.as_mut() {
            active.session.cancel();
        }
    }

    /// Register a callback for the end of the running export. Returns false if no
    /// export is running.
    pub fn on_export_complete(&mut self, cb: impl FnOnce() + 'static) -> bool {
        match self.export.as_mut() {
            Some(active) => {
                active.session.on_complete(cb);
                true
            }
            None => false,
        }
    }

    fn report(&self, outcome: Outcome) -> Outcome {
        self.delegate.borrow_mut().export_status(&outcome, None);
        outcome
    }

    /// Prepare an export of `filename` and queue its first batch.
    ///
    /// Every outcome is also sent to the delegate. The returned outcome is `ok` when the
    /// export was started.
    pub fn export(&mut self, target: ExportTarget, filename: impl AsRef<Path>, opts: &ExportOptions) -> Outcome {
        if self.export.is_some() {
            return self.report(Outcome::error(
                ErrorKind::ConfigurationError,
                ScriptPhase::Export,
                "An export is already running",
            ));
        }
        // writers run on their own thread while scripts may change the working directory
        let filename = std::path::absolute(filename.as_ref())
            .unwrap_or_else(|_| filename.as_ref().to_path_buf());
        let filename = filename.as_path();
        let kind = match ExportKind::resolve(target, filename, opts) {
            Ok(kind) => kind,
            Err(msg) => {
                return self.report(Outcome::error(
                    ErrorKind::ConfigurationError,
                    ScriptPhase::Export,
                    msg,
                ))
            }
        };
        let first = opts.first;
        let last = kind.last_frame(opts);

        let rt = &mut self.runtime;
        rt.meta.first = first;
        rt.meta.last = Some(last);
        rt.saved_loop = Some(rt.meta.loop_);
        rt.meta.loop_ = false;
        rt.clock.set_defer_stop(true);

        let mut prepared = rt.clock.render(&mut rt.engine, &mut rt.meta, None);
        let animated = prepared.ok && rt.clock.is_running();
        if animated {
            let setup = rt.clock.render(&mut rt.engine, &mut rt.meta, Some("setup"));
            prepared = prepared.merge(setup);
        }
        if !prepared.ok {
            let rt = &mut self.runtime;
            rt.clock.stop(&mut rt.engine, &mut rt.meta);
            self.release_clock();
            return self.report(prepared);
        }
        self.delegate.borrow_mut().export_status(&prepared, None);

        let batch_size = if kind.is_movie() {
            self.config.movie_batch_size
        } else {
            self.config.image_batch_size
        };
        let mut session = ExportSession::new(kind, filename, first, last, batch_size, self.writers.clone())
            .with_poll_interval(self.config.poll_interval);
        let delegate = self.delegate.clone();
        session.on_progress(move |p| {
            delegate
                .borrow_mut()
                .export_progress(p.written, p.total, p.cancelled)
        });
        session.begin((last - first + 1) as usize);

        let mut scheduler = BatchScheduler::new(animated.then_some("draw"));
        scheduler.start(&mut session);
        self.export = Some(ActiveExport { session, scheduler });
        Outcome::empty()
    }

    fn release_clock(&mut self) {
        if let Some(looping) = self.runtime.saved_loop.take() {
            self.runtime.meta.loop_ = looping;
        }
        self.runtime.meta.running = false;
        self.runtime.clock.set_defer_stop(false);
    }

    /// Run one unit of export work.
    pub fn pump(&mut self) -> Pump {
        let Some(active) = self.export.as_mut() else {
            return Pump::Idle;
        };
        let state = active
            .scheduler
            .pump(&mut self.runtime, &mut active.session, &self.delegate);
        if state == Pump::Idle {
            self.export = None;
            self.release_clock();
        }
        state
    }

    /// Pump until the export is over, sleeping briefly while the writer flushes.
    pub fn run_until_idle(&mut self) {
        let nap = (self.config.poll_interval / 10).max(Duration::from_millis(1));
        loop {
            match self.pump() {
                Pump::Busy => {}
                Pump::Waiting => std::thread::sleep(nap),
                Pump::Idle => break,
            }
        }
    }
}

impl std::fmt::Debug for ScriptHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptHost")
            .field("engine", &self.runtime.engine)
            .field("clock", &self.runtime.clock)
            .field("exporting", &self.export.is_some())
            .finish()
    }
}
