//! Animated GIF output via the `image` crate.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use image::codecs::gif::{GifEncoder, Repeat};
use image::Delay;

use super::error::{ExportError, ExportPhase};
use super::writer::{Frame, MovieSpec, Sink};

/// Netscape loop setting for a `loop` option. `None` plays once.
pub fn repeat_for(loop_count: i32) -> Option<Repeat> {
    match loop_count {
        n if n < 0 => Some(Repeat::Infinite),
        0 => None,
        n => Some(Repeat::Finite(n.min(u16::MAX as i32) as u16)),
    }
}

/// Per-frame delay for `fps`, kept to 1/100 fps precision.
pub fn frame_delay(fps: f64) -> Delay {
    let denom = (fps * 100.0).round().max(1.0) as u32;
    Delay::from_numer_denom_ms(100_000, denom)
}

/// Output file shared with the encoder, so it can still be flushed once the encoder
/// has written the trailer.
#[derive(Clone)]
struct SharedFile(Arc<Mutex<BufWriter<File>>>);

impl SharedFile {
    fn with<T>(&self, f: impl FnOnce(&mut BufWriter<File>) -> io::Result<T>) -> io::Result<T> {
        let mut file = self
            .0
            .lock()
            .map_err(|_| io::Error::other("GIF output lock poisoned"))?;
        f(&mut file)
    }
}

impl Write for SharedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with(|file| file.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with(|file| file.flush())
    }
}

pub struct GifSink {
    encoder: Option<GifEncoder<SharedFile>>,
    file: SharedFile,
    path: PathBuf,
    delay: Delay,
}

impl GifSink {
    pub fn create(spec: &MovieSpec) -> Result<Self, ExportError> {
        let file = File::create(&spec.path).map_err(|e| {
            ExportError::with_source(ExportPhase::Setup, format!("Failed to create {:?}", spec.path), e)
        })?;
        let file = SharedFile(Arc::new(Mutex::new(BufWriter::new(file))));
        let mut encoder = GifEncoder::new(file.clone());
        if let Some(repeat) = repeat_for(spec.loop_count) {
            encoder.set_repeat(repeat).map_err(|e| {
                ExportError::with_source(ExportPhase::Setup, "Failed to set GIF loop count", e)
            })?;
        }
        Ok(Self {
            encoder: Some(encoder),
            file,
            path: spec.path.clone(),
            delay: frame_delay(spec.fps),
        })
    }
}

impl Sink for GifSink {
    fn write(&mut self, frame: Frame) -> Result<(), ExportError> {
        let Frame::Image(img) = frame else {
            return Err(ExportError::new(
                ExportPhase::Encode,
                "GIF encoder received an encoded page",
            ));
        };
        let Some(encoder) = self.encoder.as_mut() else {
            return Err(ExportError::new(ExportPhase::Encode, "GIF encoder is already finalized"));
        };
        encoder
            .encode_frame(image::Frame::from_parts(img, 0, 0, self.delay))
            .map_err(|e| ExportError::with_source(ExportPhase::Encode, "Failed to encode GIF frame", e))
    }

    fn finish(&mut self) -> Result<(), ExportError> {
        // dropping the encoder writes the trailer
        drop(self.encoder.take());
        self.file.with(|file| file.flush()).map_err(|e| {
            ExportError::with_source(ExportPhase::Finalize, format!("Failed to finalize {:?}", self.path), e)
        })
    }
}
