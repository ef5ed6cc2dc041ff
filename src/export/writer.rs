//! Writers persist rendered frames off the run-loop thread.
//!
//! A [`ThreadedWriter`] owns one I/O thread fed through a channel. The only state it
//! shares with the caller is the monotonic `frames_written` counter, the finished
//! flag and a failure slot.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use image::RgbaImage;

use super::error::{ExportError, ExportPhase};
use super::ffmpeg::FfmpegSink;
use super::gif::GifSink;
use super::MovieFormat;

/// Frames a writer buffers before `write` blocks (two image batches).
pub const QUEUE_DEPTH: usize = 32;

/// One unit of output handed to a writer.
#[derive(Debug)]
pub enum Frame {
    /// An encoded image destined for its own file.
    Page { data: Vec<u8>, path: PathBuf },
    /// A raw frame for a movie encoder.
    Image(RgbaImage),
}

pub trait Writer {
    /// Queue a frame. Fails if the writer has already failed or was closed.
    fn write(&mut self, frame: Frame) -> Result<(), ExportError>;

    /// Frames flushed so far. Never decreases.
    fn frames_written(&self) -> usize;

    /// No more frames; flush and finalize in the background.
    fn close(&mut self);

    /// True once `close` has been processed and the output is final.
    fn is_finished(&self) -> bool;

    /// First failure reported by the I/O side, if any.
    fn failure(&self) -> Option<String>;
}

/// Movie parameters known once the first frame's dimensions are.
#[derive(Debug, Clone, PartialEq)]
pub struct MovieSpec {
    pub path: PathBuf,
    pub format: MovieFormat,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Mbit/s.
    pub bitrate: f64,
    /// `< 0` forever, `0` play once, `n` repeat n times.
    pub loop_count: i32,
}

/// Creates writers for an export session.
pub trait WriterFactory {
    fn pages(&self) -> Result<Box<dyn Writer>, ExportError>;
    fn movie(&self, spec: &MovieSpec) -> Result<Box<dyn Writer>, ExportError>;
}

/// Writes to the filesystem (and ffmpeg for video containers).
#[derive(Debug, Clone, Copy, Default)]
pub struct FileWriters;

impl WriterFactory for FileWriters {
    fn pages(&self) -> Result<Box<dyn Writer>, ExportError> {
        Ok(Box::new(ThreadedWriter::spawn("page-writer", PageSink)?))
    }

    fn movie(&self, spec: &MovieSpec) -> Result<Box<dyn Writer>, ExportError> {
        match spec.format {
            MovieFormat::Mov | MovieFormat::Mp4 => {
                let sink = FfmpegSink::start(spec)?;
                Ok(Box::new(ThreadedWriter::spawn("ffmpeg-writer", sink)?))
            }
            MovieFormat::Gif => {
                let sink = GifSink::create(spec)?;
                Ok(Box::new(ThreadedWriter::spawn("gif-writer", sink)?))
            }
        }
    }
}

/// The blocking half of a writer, run on the I/O thread.
pub trait Sink: Send + 'static {
    fn write(&mut self, frame: Frame) -> Result<(), ExportError>;
    fn finish(&mut self) -> Result<(), ExportError>;
}

/// Writes each page to its own file.
#[derive(Debug, Default)]
pub struct PageSink;

impl Sink for PageSink {
    fn write(&mut self, frame: Frame) -> Result<(), ExportError> {
        match frame {
            Frame::Page { data, path } => write_page(&path, &data),
            Frame::Image(_) => Err(ExportError::new(
                ExportPhase::Write,
                "page writer received a raw movie frame",
            )),
        }
    }

    fn finish(&mut self) -> Result<(), ExportError> {
        Ok(())
    }
}

fn write_page(path: &Path, data: &[u8]) -> Result<(), ExportError> {
    std::fs::write(path, data).map_err(|e| {
        ExportError::with_source(ExportPhase::Write, format!("Failed to write {:?}", path), e)
    })
}

#[derive(Debug, Default)]
struct Shared {
    written: AtomicUsize,
    finished: AtomicBool,
    failure: Mutex<Option<String>>,
}

impl Shared {
    fn fail(&self, err: &ExportError) {
        log::error!("writer failed: {}", err);
        if let Ok(mut slot) = self.failure.lock() {
            slot.get_or_insert_with(|| err.to_string());
        }
    }
}

pub struct ThreadedWriter {
    tx: Option<SyncSender<Frame>>,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl ThreadedWriter {
    pub fn spawn<S: Sink>(name: &str, mut sink: S) -> Result<Self, ExportError> {
        let (tx, rx) = mpsc::sync_channel::<Frame>(QUEUE_DEPTH);
        let shared = Arc::new(Shared::default());
        let worker = Arc::clone(&shared);

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut failed = false;
                for frame in rx {
                    if failed {
                        continue;
                    }
                    match sink.write(frame) {
                        Ok(()) => {
                            worker.written.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(e) => {
                            worker.fail(&e);
                            failed = true;
                        }
                    }
                }
                if let Err(e) = sink.finish() {
                    worker.fail(&e);
                }
                worker.finished.store(true, Ordering::SeqCst);
            })
            .map_err(|e| {
                ExportError::with_source(ExportPhase::Setup, "Failed to start writer thread", e)
            })?;

        Ok(Self {
            tx: Some(tx),
            shared,
            handle: Some(handle),
        })
    }
}

impl Writer for ThreadedWriter {
    fn write(&mut self, frame: Frame) -> Result<(), ExportError> {
        if let Some(msg) = self.failure() {
            return Err(ExportError::new(ExportPhase::Write, msg));
        }
        let Some(tx) = &self.tx else {
            return Err(ExportError::new(ExportPhase::Write, "writer is closed"));
        };
        tx.send(frame)
            .map_err(|_| ExportError::new(ExportPhase::Write, "writer thread exited"))
    }

    fn frames_written(&self) -> usize {
        self.shared.written.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        self.tx.take();
    }

    fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::SeqCst)
    }

    fn failure(&self) -> Option<String> {
        self.shared.failure.lock().ok().and_then(|slot| slot.clone())
    }
}

impl Drop for ThreadedWriter {
    fn drop(&mut self) {
        self.close();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("writer thread panicked");
            }
        }
    }
}
