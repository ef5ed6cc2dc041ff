//! One export request, from the first frame to the closed output file.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

use super::error::{ExportError, ExportPhase};
use super::writer::{Frame, MovieSpec, Writer, WriterFactory};
use super::{page_path, ExportKind};
use crate::canvas::Canvas;
use crate::scheduler::{split_batches, Batch, CancelToken};

/// Snapshot of export progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub written: usize,
    /// Frames expected; the added count once cancelled.
    pub total: usize,
    pub cancelled: bool,
}

impl Progress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            (self.written as f64 / self.total as f64).min(1.0)
        }
    }

    pub fn message(&self) -> String {
        if self.cancelled {
            format!(
                "Cancelling… {} frames to go",
                self.total.saturating_sub(self.written)
            )
        } else if self.written >= self.total {
            "Finishing…".to_string()
        } else {
            format!("Frame {}/{}", self.written + 1, self.total)
        }
    }

    /// ASCII bar such as `[#####.....]`.
    pub fn bar(&self, width: usize) -> String {
        let filled = ((self.fraction() * width as f64).round() as usize).min(width);
        format!("[{}{}]", "#".repeat(filled), ".".repeat(width - filled))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Pending,
    Complete,
    Failed(String),
}

type ProgressCallback = Box<dyn FnMut(Progress)>;
type CompleteCallback = Box<dyn FnOnce()>;

pub struct ExportSession {
    kind: ExportKind,
    filename: PathBuf,
    first: u32,
    last: u32,
    total: usize,
    written: usize,
    added: usize,
    batches: VecDeque<Batch>,
    cancel: CancelToken,
    cancel_seen: bool,
    running: bool,
    closed: bool,
    finished: bool,
    failure: Option<String>,
    writer: Option<Box<dyn Writer>>,
    factory: Rc<dyn WriterFactory>,
    on_progress: Option<ProgressCallback>,
    on_complete: Option<CompleteCallback>,
    poll_interval: Duration,
    next_report: Option<Instant>,
}

impl ExportSession {
    pub fn new(
        kind: ExportKind,
        filename: impl Into<PathBuf>,
        first: u32,
        last: u32,
        batch_size: u32,
        factory: Rc<dyn WriterFactory>,
    ) -> Self {
        Self {
            kind,
            filename: filename.into(),
            first,
            last,
            total: 0,
            written: 0,
            added: 0,
            batches: split_batches(first, last, batch_size).into(),
            cancel: CancelToken::new(),
            cancel_seen: false,
            running: false,
            closed: false,
            finished: false,
            failure: None,
            writer: None,
            factory,
            on_progress: None,
            on_complete: None,
            poll_interval: crate::config::POLL_INTERVAL,
            next_report: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn kind(&self) -> &ExportKind {
        &self.kind
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn added(&self) -> usize {
        self.added
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Shared flag that cancels this session from anywhere.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn progress(&self) -> Progress {
        let cancelled = self.is_cancelled();
        Progress {
            written: self.written,
            total: if cancelled { self.added } else { self.total },
            cancelled,
        }
    }

    /// Record the amount of work and start reporting progress.
    pub fn begin(&mut self, total: usize) {
        self.total = total;
        self.running = true;
        self.next_report = Some(Instant::now());
        log::info!(
            "export of {:?} started: {} frame(s), {} batch(es)",
            self.filename,
            total,
            self.batches.len()
        );
    }

    /// Next batch to render, unless the session was cancelled.
    pub fn next_batch(&mut self) -> Option<Batch> {
        if self.is_cancelled() {
            self.batches.clear();
            return None;
        }
        self.batches.pop_front()
    }

    /// Output path for frame `index` of an image export.
    pub fn page_filename(&self, index: u32) -> PathBuf {
        if self.first == self.last {
            self.filename.clone()
        } else {
            page_path(&self.filename, index)
        }
    }

    /// Hand the freshly rendered canvas to the writer. The canvas is not retained.
    pub fn add(&mut self, canvas: &dyn Canvas, index: u32) -> Result<(), ExportError> {
        if self.is_cancelled() || self.closed {
            return Ok(());
        }
        let frame = match &self.kind {
            ExportKind::Image { format } => Frame::Page {
                data: canvas.snapshot(*format)?,
                path: self.page_filename(index),
            },
            ExportKind::Movie { .. } => Frame::Image(canvas.rasterize()?),
        };

        if self.writer.is_none() {
            self.writer = Some(self.create_writer(&frame)?);
        }
        match self.writer.as_mut() {
            Some(writer) => writer.write(frame)?,
            None => return Err(ExportError::new(ExportPhase::Setup, "no writer available")),
        }
        self.added += 1;
        Ok(())
    }

    fn create_writer(&self, frame: &Frame) -> Result<Box<dyn Writer>, ExportError> {
        match (&self.kind, frame) {
            (
                ExportKind::Movie {
                    format,
                    fps,
                    bitrate,
                    loop_count,
                },
                Frame::Image(img),
            ) => {
                let spec = MovieSpec {
                    path: self.filename.clone(),
                    format: *format,
                    width: img.width(),
                    height: img.height(),
                    fps: *fps,
                    bitrate: *bitrate,
                    loop_count: *loop_count,
                };
                log::info!("movie encoder selected: {:?} {}x{}", format, spec.width, spec.height);
                self.factory.movie(&spec)
            }
            _ => self.factory.pages(),
        }
    }

    /// Stop accepting frames. Whatever was already added is still finalized.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.batches.clear();
    }

    /// Returns true the first time a cancellation is noticed.
    pub fn observe_cancel(&mut self) -> bool {
        if self.cancel_seen || !self.cancel.is_cancelled() {
            return false;
        }
        self.cancel_seen = true;
        self.batches.clear();
        log::warn!(
            "export of {:?} cancelled after {} of {} frame(s)",
            self.filename,
            self.added,
            self.total
        );
        true
    }

    /// Fatal write failure: no further frames are accepted.
    pub fn abort(&mut self, err: &ExportError) {
        self.fail(err.to_string());
    }

    /// Mark the export as failed. What was already added is still finalized, but the
    /// session completes as failed.
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::error!("export of {:?} failed: {}", self.filename, message);
        self.failure.get_or_insert(message);
        self.cancel();
    }

    /// No more frames; ask the writer to finalize.
    pub fn done(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(writer) = self.writer.as_mut() {
            writer.close();
        }
    }

    pub fn on_progress(&mut self, cb: impl FnMut(Progress) + 'static) {
        if !self.finished {
            self.on_progress = Some(Box::new(cb));
        }
    }

    /// Register the completion callback; runs immediately if already finished.
    pub fn on_complete(&mut self, cb: impl FnOnce() + 'static) {
        if self.finished {
            cb();
        } else {
            self.on_complete = Some(Box::new(cb));
        }
    }

    fn report(&mut self) {
        let progress = self.progress();
        if let Some(cb) = self.on_progress.as_mut() {
            cb(progress);
        }
    }

    /// Refresh the written count, report progress and detect completion.
    pub fn poll(&mut self, now: Instant) -> SessionStatus {
        if self.finished {
            return match &self.failure {
                Some(msg) => SessionStatus::Failed(msg.clone()),
                None => SessionStatus::Complete,
            };
        }
        if !self.running {
            return SessionStatus::Pending;
        }

        let mut writer_done = true;
        let mut writer_failure = None;
        if let Some(writer) = &self.writer {
            let flushed = writer.frames_written().min(self.total);
            self.written = self.written.max(flushed);
            writer_done = writer.is_finished();
            writer_failure = writer.failure();
        }
        if let Some(msg) = writer_failure {
            if self.failure.is_none() {
                self.abort(&ExportError::new(ExportPhase::Write, msg));
            }
        }

        if self.next_report.map_or(true, |at| now >= at) {
            self.report();
            self.next_report = Some(now + self.poll_interval);
        }

        if !self.closed || !writer_done {
            return SessionStatus::Pending;
        }

        let expected = self.progress().total;
        if self.failure.is_none() && self.written < expected {
            self.failure = Some(format!(
                "writer finished after {} of {} frame(s)",
                self.written, expected
            ));
        }
        self.shutdown();
        match &self.failure {
            Some(msg) => SessionStatus::Failed(msg.clone()),
            None => SessionStatus::Complete,
        }
    }

    fn shutdown(&mut self) {
        self.report();
        self.running = false;
        self.finished = true;
        self.on_progress = None;
        self.writer = None;
        log::info!(
            "export of {:?} finished: {} frame(s) written",
            self.filename,
            self.written
        );
        if let Some(cb) = self.on_complete.take() {
            cb();
        }
    }
}

impl std::fmt::Debug for ExportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportSession")
            .field("kind", &self.kind)
            .field("filename", &self.filename)
            .field("total", &self.total)
            .field("written", &self.written)
            .field("added", &self.added)
            .field("cancelled", &self.is_cancelled())
            .field("running", &self.running)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::{ImageFormat, RasterCanvas};
    use crate::export::MovieFormat;
    use std::cell::{Cell, RefCell};

    #[derive(Default)]
    struct Log {
        paths: Vec<PathBuf>,
        frames: usize,
        closed: bool,
    }

    struct MemoryWriter(Rc<RefCell<Log>>);

    impl Writer for MemoryWriter {
        fn write(&mut self, frame: Frame) -> Result<(), ExportError> {
            let mut log = self.0.borrow_mut();
            if let Frame::Page { path, .. } = frame {
                log.paths.push(path);
            }
            log.frames += 1;
            Ok(())
        }
        fn frames_written(&self) -> usize {
            self.0.borrow().frames
        }
        fn close(&mut self) {
            self.0.borrow_mut().closed = true;
        }
        fn is_finished(&self) -> bool {
            self.0.borrow().closed
        }
        fn failure(&self) -> Option<String> {
            None
        }
    }

    #[derive(Default)]
    struct MemoryFactory(Rc<RefCell<Log>>);

    impl WriterFactory for MemoryFactory {
        fn pages(&self) -> Result<Box<dyn Writer>, ExportError> {
            Ok(Box::new(MemoryWriter(self.0.clone())))
        }
        fn movie(&self, _spec: &MovieSpec) -> Result<Box<dyn Writer>, ExportError> {
            Ok(Box::new(MemoryWriter(self.0.clone())))
        }
    }

    fn session(first: u32, last: u32) -> (ExportSession, Rc<RefCell<Log>>) {
        let factory = MemoryFactory::default();
        let log = factory.0.clone();
        let kind = ExportKind::Image { format: ImageFormat::Png };
        let mut s = ExportSession::new(kind, "out/page.png", first, last, 2, Rc::new(factory));
        s.begin((last - first + 1) as usize);
        (s, log)
    }

    fn canvas() -> RasterCanvas {
        let mut c = RasterCanvas::new();
        c.draw(crate::gfx::Drawing {
            width: 4,
            height: 4,
            background: None,
            grobs: vec![],
        });
        c
    }

    #[test]
    fn test_single_page_keeps_filename() {
        let (mut s, log) = session(4, 4);
        s.add(&canvas(), 4).unwrap();
        assert_eq!(log.borrow().paths, vec![PathBuf::from("out/page.png")]);
    }

    #[test]
    fn test_completion_and_callbacks() {
        let (mut s, _log) = session(1, 3);
        let completed = Rc::new(Cell::new(0));
        let c = completed.clone();
        s.on_complete(move || c.set(c.get() + 1));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sn = seen.clone();
        s.on_progress(move |p| sn.borrow_mut().push(p));

        let canvas = canvas();
        while let Some(batch) = s.next_batch() {
            for i in batch.indices() {
                s.add(&canvas, i).unwrap();
            }
        }
        assert_eq!(s.poll(Instant::now()), SessionStatus::Pending);
        s.done();
        assert_eq!(s.poll(Instant::now()), SessionStatus::Complete);
        assert_eq!(completed.get(), 1);
        assert_eq!(s.written(), 3);

        let last = *seen.borrow().last().unwrap();
        assert_eq!(last.written, 3);
        assert_eq!(last.message(), "Finishing…");

        // registering after completion fires immediately
        let late = Rc::new(Cell::new(false));
        let l = late.clone();
        s.on_complete(move || l.set(true));
        assert!(late.get());
    }

    #[test]
    fn test_cancel_reports_added_as_total() {
        let (mut s, log) = session(1, 10);
        let canvas = canvas();
        for i in 1..=3 {
            s.add(&canvas, i).unwrap();
        }
        s.cancel();
        assert!(s.next_batch().is_none());
        s.add(&canvas, 4).unwrap();
        assert_eq!(s.added(), 3);

        s.done();
        assert!(log.borrow().closed);
        assert_eq!(s.poll(Instant::now()), SessionStatus::Complete);
        let p = s.progress();
        assert_eq!((p.written, p.total, p.cancelled), (3, 3, true));
    }

    #[test]
    fn test_vector_format_fails_on_raster_canvas() {
        let factory = MemoryFactory::default();
        let kind = ExportKind::Image { format: ImageFormat::Pdf };
        let mut s = ExportSession::new(kind, "out.pdf", 1, 1, 8, Rc::new(factory));
        s.begin(1);
        let err = s.add(&canvas(), 1).unwrap_err();
        s.abort(&err);
        s.done();
        assert!(matches!(s.poll(Instant::now()), SessionStatus::Failed(_)));
    }

    #[test]
    fn test_movie_writer_is_created_lazily() {
        let factory = MemoryFactory::default();
        let log = factory.0.clone();
        let kind = ExportKind::Movie {
            format: MovieFormat::Gif,
            fps: 10.0,
            bitrate: 1.0,
            loop_count: 0,
        };
        let mut s = ExportSession::new(kind, "a.gif", 1, 2, 8, Rc::new(factory));
        s.begin(2);
        assert_eq!(log.borrow().frames, 0);
        s.add(&canvas(), 1).unwrap();
        s.add(&canvas(), 2).unwrap();
        assert_eq!(log.borrow().frames, 2);
        assert!(log.borrow().paths.is_empty());
    }

    #[test]
    fn test_progress_strings() {
        let p = Progress {
            written: 2,
            total: 10,
            cancelled: false,
        };
        assert_eq!(p.message(), "Frame 3/10");
        assert_eq!(p.bar(10), "[##........]");
        let c = Progress {
            written: 1,
            total: 3,
            cancelled: true,
        };
        assert_eq!(c.message(), "Cancelling… 2 frames to go");
    }
}
