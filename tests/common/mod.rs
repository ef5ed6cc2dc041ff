//! Recording writer and delegate shared by the integration tests.
#![allow(dead_code)]

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use sketchbox::canvas::Canvas;
use sketchbox::config::HostConfig;
use sketchbox::delegate::{Delegate, ExportEvent};
use sketchbox::export::{ExportError, Frame, MovieSpec, Writer, WriterFactory};
use sketchbox::{Outcome, ScriptHost};

#[derive(Debug, Default)]
pub struct Recorder {
    pub pages: Vec<PathBuf>,
    pub frames: usize,
    pub closed: usize,
    pub movies: Vec<MovieSpec>,
}

pub struct RecordingWriter(Rc<RefCell<Recorder>>);

impl Writer for RecordingWriter {
    fn write(&mut self, frame: Frame) -> Result<(), ExportError> {
        let mut rec = self.0.borrow_mut();
        if let Frame::Page { path, .. } = frame {
            rec.pages.push(path);
        }
        rec.frames += 1;
        Ok(())
    }

    fn frames_written(&self) -> usize {
        self.0.borrow().frames
    }

    fn close(&mut self) {
        self.0.borrow_mut().closed += 1;
    }

    fn is_finished(&self) -> bool {
        self.0.borrow().closed > 0
    }

    fn failure(&self) -> Option<String> {
        None
    }
}

pub struct RecordingWriters(pub Rc<RefCell<Recorder>>);

impl WriterFactory for RecordingWriters {
    fn pages(&self) -> Result<Box<dyn Writer>, ExportError> {
        Ok(Box::new(RecordingWriter(self.0.clone())))
    }

    fn movie(&self, spec: &MovieSpec) -> Result<Box<dyn Writer>, ExportError> {
        self.0.borrow_mut().movies.push(spec.clone());
        Ok(Box::new(RecordingWriter(self.0.clone())))
    }
}

#[derive(Debug, Default)]
pub struct RecordingDelegate {
    pub statuses: Vec<Outcome>,
    /// Stdout of each rendered frame, in order.
    pub frame_output: Vec<String>,
    pub progress: Vec<(usize, usize, bool)>,
    pub events: Vec<ExportEvent>,
}

impl Delegate for RecordingDelegate {
    fn export_status(&mut self, outcome: &Outcome, canvas: Option<&dyn Canvas>) {
        if canvas.is_some() {
            self.frame_output.push(outcome.stdout_text());
        }
        self.statuses.push(outcome.clone());
    }

    fn export_progress(&mut self, written: usize, total: usize, cancelled: bool) {
        self.progress.push((written, total, cancelled));
    }

    fn export_event(&mut self, event: ExportEvent) {
        self.events.push(event);
    }
}

pub struct Harness {
    pub host: ScriptHost,
    pub writes: Rc<RefCell<Recorder>>,
    pub delegate: Rc<RefCell<RecordingDelegate>>,
}

/// A host writing to memory, reporting progress on every poll.
pub fn harness(batch_size: u32) -> Harness {
    let config = HostConfig {
        image_batch_size: batch_size,
        movie_batch_size: batch_size,
        poll_interval: Duration::ZERO,
        ..HostConfig::default()
    };
    let writes = Rc::new(RefCell::new(Recorder::default()));
    let delegate = Rc::new(RefCell::new(RecordingDelegate::default()));
    let host = ScriptHost::with_config(
        config,
        delegate.clone(),
        Rc::new(RecordingWriters(writes.clone())),
    );
    Harness {
        host,
        writes,
        delegate,
    }
}
