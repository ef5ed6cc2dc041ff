//! Cooperative batch scheduling of export frames.
//!
//! Work is a queue of discrete tasks: one task per batch of frame indices, then a
//! single finishing task. [`BatchScheduler::pump`] runs at most one task and returns,
//! so the caller's loop stays responsive between batches. When the queue is empty
//! the scheduler only polls the session until the writer has finished.

use std::collections::VecDeque;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::canvas::Canvas;
use crate::delegate::{ExportEvent, SharedDelegate};
use crate::diagnostics::{ErrorKind, ScriptPhase};
use crate::export::{ExportSession, SessionStatus};
use crate::outcome::Outcome;

/// Shared cancellation flag; safe to trip from any thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Inclusive range of frame indices processed before yielding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batch {
    pub first: u32,
    pub last: u32,
}

impl Batch {
    pub fn indices(&self) -> RangeInclusive<u32> {
        self.first..=self.last
    }
}

/// Split `[first, last]` into consecutive batches of at most `size` indices.
pub fn split_batches(first: u32, last: u32, size: u32) -> Vec<Batch> {
    let size = size.max(1);
    let mut batches = Vec::new();
    let mut start = first;
    while start <= last {
        let end = start.saturating_add(size - 1).min(last);
        batches.push(Batch {
            first: start,
            last: end,
        });
        if end == u32::MAX {
            break;
        }
        start = end + 1;
    }
    batches
}

/// What the scheduler renders frames with.
pub trait FrameSource {
    /// Render frame `index` by running `method` (`None` re-runs the whole script).
    fn render_frame(&mut self, index: u32, method: Option<&str>) -> Outcome;

    /// The canvas holding the most recent render.
    fn canvas(&self) -> &dyn Canvas;

    /// Called once after the last batch (runs the script's `stop` hook).
    fn finish(&mut self) -> Outcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Batch(Batch),
    Finish,
}

/// Result of one [`BatchScheduler::pump`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pump {
    /// A task ran; call again soon.
    Busy,
    /// Waiting on the writer to flush.
    Waiting,
    /// The export is over.
    Idle,
}

#[derive(Debug)]
pub struct BatchScheduler {
    queue: VecDeque<Task>,
    method: Option<String>,
    finishing: bool,
    done: bool,
}

impl BatchScheduler {
    pub fn new(method: Option<&str>) -> Self {
        Self {
            queue: VecDeque::new(),
            method: method.map(str::to_string),
            finishing: false,
            done: false,
        }
    }

    pub fn start(&mut self, session: &mut ExportSession) {
        self.schedule_next(session);
    }

    fn schedule_next(&mut self, session: &mut ExportSession) {
        match session.next_batch() {
            Some(batch) => self.queue.push_back(Task::Batch(batch)),
            None => self.schedule_finish(),
        }
    }

    fn schedule_finish(&mut self) {
        if !self.finishing {
            self.finishing = true;
            self.queue.push_back(Task::Finish);
        }
    }

    /// True if the session is cancelled; tells the delegate the first time.
    fn check_cancel(&self, session: &mut ExportSession, delegate: &SharedDelegate) -> bool {
        if session.observe_cancel() && session.failure().is_none() {
            let added = session.added();
            delegate
                .borrow_mut()
                .export_event(ExportEvent::Cancelled { added });
        }
        session.is_cancelled()
    }

    /// Run at most one task.
    pub fn pump(
        &mut self,
        source: &mut dyn FrameSource,
        session: &mut ExportSession,
        delegate: &SharedDelegate,
    ) -> Pump {
        if self.done {
            return Pump::Idle;
        }
        let Some(task) = self.queue.pop_front() else {
            return self.wait(session, delegate);
        };

        match task {
            Task::Batch(batch) => {
                self.run_batch(batch, source, session, delegate);
                if self.check_cancel(session, delegate) {
                    self.schedule_finish();
                } else {
                    self.schedule_next(session);
                }
            }
            Task::Finish => {
                let outcome = source.finish();
                delegate.borrow_mut().export_status(&outcome, None);
                session.done();
            }
        }
        session.poll(Instant::now());
        Pump::Busy
    }

    fn wait(&mut self, session: &mut ExportSession, delegate: &SharedDelegate) -> Pump {
        match session.poll(Instant::now()) {
            SessionStatus::Pending => Pump::Waiting,
            SessionStatus::Complete => {
                self.done = true;
                delegate.borrow_mut().export_event(ExportEvent::Complete);
                Pump::Idle
            }
            SessionStatus::Failed(message) => {
                self.done = true;
                delegate
                    .borrow_mut()
                    .export_event(ExportEvent::Failed { message });
                Pump::Idle
            }
        }
    }

    fn run_batch(
        &mut self,
        batch: Batch,
        source: &mut dyn FrameSource,
        session: &mut ExportSession,
        delegate: &SharedDelegate,
    ) {
        log::debug!("rendering batch {}-{}", batch.first, batch.last);
        for index in batch.indices() {
            if self.check_cancel(session, delegate) {
                break;
            }

            let outcome = source.render_frame(index, self.method.as_deref());
            delegate
                .borrow_mut()
                .export_status(&outcome, Some(source.canvas()));

            if !outcome.ok {
                let message = outcome
                    .diagnostic
                    .as_ref()
                    .map(|d| d.message.clone())
                    .unwrap_or_else(|| format!("frame {} failed", index));
                session.fail(message);
                break;
            }

            if let Err(err) = session.add(source.canvas(), index) {
                let failure = Outcome::error(
                    ErrorKind::ExportWriteError,
                    ScriptPhase::Export,
                    err.to_string(),
                );
                delegate.borrow_mut().export_status(&failure, None);
                session.abort(&err);
                break;
            }

            if outcome.halted {
                session.cancel();
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::{ImageFormat, RasterCanvas};
    use crate::delegate::Delegate;
    use crate::export::{ExportError, ExportKind, Frame, MovieSpec, Writer, WriterFactory};
    use crate::gfx::Drawing;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_split_batches_covers_range_once() {
        for (first, last, size) in [(1, 1, 8), (1, 10, 3), (5, 20, 16), (3, 9, 1)] {
            let batches = split_batches(first, last, size);
            let indices: Vec<u32> = batches.iter().flat_map(|b| b.indices()).collect();
            let expected: Vec<u32> = (first..=last).collect();
            assert_eq!(indices, expected);
            assert!(batches.iter().all(|b| b.indices().count() <= size as usize));
        }
        assert!(split_batches(5, 4, 8).is_empty());
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let other = token.clone();
        std::thread::spawn(move || other.cancel()).join().unwrap();
        assert!(token.is_cancelled());
    }

    struct Source {
        canvas: RasterCanvas,
        rendered: Vec<u32>,
        fail_at: Option<u32>,
        halt_at: Option<u32>,
        finished: usize,
    }

    impl Source {
        fn new() -> Self {
            Self {
                canvas: RasterCanvas::new(),
                rendered: Vec::new(),
                fail_at: None,
                halt_at: None,
                finished: 0,
            }
        }
    }

    impl FrameSource for Source {
        fn render_frame(&mut self, index: u32, _method: Option<&str>) -> Outcome {
            self.rendered.push(index);
            if Some(index) == self.fail_at {
                return Outcome::error(ErrorKind::RuntimeError, ScriptPhase::Draw, "boom");
            }
            self.canvas.draw(Drawing {
                width: 2,
                height: 2,
                background: None,
                grobs: vec![],
            });
            if Some(index) == self.halt_at {
                return Outcome::halted(vec![]);
            }
            Outcome::empty()
        }

        fn canvas(&self) -> &dyn Canvas {
            &self.canvas
        }

        fn finish(&mut self) -> Outcome {
            self.finished += 1;
            Outcome::empty()
        }
    }

    #[derive(Default)]
    struct Events(Vec<ExportEvent>);

    impl Delegate for Events {
        fn export_status(&mut self, _outcome: &Outcome, _canvas: Option<&dyn Canvas>) {}
        fn export_progress(&mut self, _written: usize, _total: usize, _cancelled: bool) {}
        fn export_event(&mut self, event: ExportEvent) {
            self.0.push(event);
        }
    }

    struct Counter(Rc<RefCell<usize>>, bool);

    impl Writer for Counter {
        fn write(&mut self, _frame: Frame) -> Result<(), ExportError> {
            *self.0.borrow_mut() += 1;
            Ok(())
        }
        fn frames_written(&self) -> usize {
            *self.0.borrow()
        }
        fn close(&mut self) {
            self.1 = true;
        }
        fn is_finished(&self) -> bool {
            self.1
        }
        fn failure(&self) -> Option<String> {
            None
        }
    }

    struct Factory(Rc<RefCell<usize>>);

    impl WriterFactory for Factory {
        fn pages(&self) -> Result<Box<dyn Writer>, ExportError> {
            Ok(Box::new(Counter(self.0.clone(), false)))
        }
        fn movie(&self, _spec: &MovieSpec) -> Result<Box<dyn Writer>, ExportError> {
            Ok(Box::new(Counter(self.0.clone(), false)))
        }
    }

    fn run(source: &mut Source, first: u32, last: u32) -> (ExportSession, Rc<RefCell<Events>>, usize) {
        let count = Rc::new(RefCell::new(0));
        let kind = ExportKind::Image { format: ImageFormat::Png };
        let mut session =
            ExportSession::new(kind, "p.png", first, last, 4, Rc::new(Factory(count.clone())));
        session.begin((last - first + 1) as usize);
        let events = Rc::new(RefCell::new(Events::default()));
        let delegate: SharedDelegate = events.clone();

        let mut scheduler = BatchScheduler::new(None);
        scheduler.start(&mut session);
        let mut pumps = 0;
        while scheduler.pump(source, &mut session, &delegate) != Pump::Idle {
            pumps += 1;
            assert!(pumps < 1000);
        }
        let written = *count.borrow();
        (session, events, written)
    }

    #[test]
    fn test_frames_rendered_in_order() {
        let mut source = Source::new();
        let (session, events, written) = run(&mut source, 3, 12);
        assert_eq!(source.rendered, (3..=12).collect::<Vec<_>>());
        assert_eq!(written, 10);
        assert_eq!(source.finished, 1);
        assert!(session.is_finished());
        assert_eq!(events.borrow().0, vec![ExportEvent::Complete]);
    }

    #[test]
    fn test_failure_aborts_export() {
        let mut source = Source::new();
        source.fail_at = Some(6);
        let (session, events, written) = run(&mut source, 1, 10);
        assert_eq!(source.rendered, (1..=6).collect::<Vec<_>>());
        assert_eq!(written, 5);
        assert_eq!(source.finished, 1);
        assert!(session.failure().is_some());
        assert!(matches!(events.borrow().0.as_slice(), [ExportEvent::Failed { .. }]));
    }

    #[test]
    fn test_halt_keeps_frame_and_cancels() {
        let mut source = Source::new();
        source.halt_at = Some(2);
        let (session, events, written) = run(&mut source, 1, 10);
        assert_eq!(source.rendered, vec![1, 2]);
        assert_eq!(written, 2);
        assert_eq!(session.progress().total, 2);
        assert_eq!(
            events.borrow().0,
            vec![ExportEvent::Cancelled { added: 2 }, ExportEvent::Complete]
        );
    }
}
