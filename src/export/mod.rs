//! Export of rendered frames to image files, image sequences and movies.

pub mod error;
pub mod ffmpeg;
pub mod gif;
pub mod session;
pub mod writer;

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::canvas::ImageFormat;

pub use error::{ExportError, ExportPhase};
pub use session::{ExportSession, Progress, SessionStatus};
pub use writer::{FileWriters, Frame, MovieSpec, Writer, WriterFactory};

/// Frames exported when a movie request names no last frame.
pub const DEFAULT_MOVIE_FRAMES: u32 = 150;

/// What the host asked to export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportTarget {
    Image,
    Movie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovieFormat {
    Mov,
    Mp4,
    Gif,
}

impl MovieFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "mov" => Some(Self::Mov),
            "mp4" => Some(Self::Mp4),
            "gif" => Some(Self::Gif),
            _ => None,
        }
    }
}

/// Options accompanying an export request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportOptions {
    /// Overrides the filename extension.
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default = "default_first")]
    pub first: u32,
    #[serde(default)]
    pub last: Option<u32>,
    #[serde(default = "default_fps")]
    pub fps: f64,
    /// Mbit/s.
    #[serde(default = "default_bitrate")]
    pub bitrate: f64,
    #[serde(default, rename = "loop")]
    pub loop_count: i32,
}

fn default_first() -> u32 {
    1
}

fn default_fps() -> f64 {
    30.0
}

fn default_bitrate() -> f64 {
    1.0
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            format: None,
            first: default_first(),
            last: None,
            fps: default_fps(),
            bitrate: default_bitrate(),
            loop_count: 0,
        }
    }
}

impl ExportOptions {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(last) = self.last {
            if last < self.first {
                return Err(format!(
                    "Frame range must be ascending (got {}-{})",
                    self.first, last
                ));
            }
        }
        if self.fps <= 0.0 {
            return Err("FPS must be positive".to_string());
        }
        if self.bitrate <= 0.0 {
            return Err("Bitrate must be positive".to_string());
        }
        Ok(())
    }
}

/// Kind-specific export parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum ExportKind {
    Image {
        format: ImageFormat,
    },
    Movie {
        format: MovieFormat,
        fps: f64,
        bitrate: f64,
        loop_count: i32,
    },
}

impl ExportKind {
    /// Pick the export kind for a request, rejecting unknown formats up front.
    pub fn resolve(target: ExportTarget, filename: &Path, opts: &ExportOptions) -> Result<Self, String> {
        opts.validate()?;
        let format = opts
            .format
            .clone()
            .or_else(|| {
                filename
                    .extension()
                    .map(|ext| ext.to_string_lossy().to_string())
            })
            .unwrap_or_default();

        match target {
            ExportTarget::Image => ImageFormat::from_extension(&format)
                .map(|format| ExportKind::Image { format })
                .ok_or_else(|| format!("Unrecognized image format: {:?}", format)),
            ExportTarget::Movie => MovieFormat::from_extension(&format)
                .map(|format| ExportKind::Movie {
                    format,
                    fps: opts.fps,
                    bitrate: opts.bitrate,
                    loop_count: opts.loop_count,
                })
                .ok_or_else(|| format!("Unrecognized movie format: {:?}", format)),
        }
    }

    pub fn is_movie(&self) -> bool {
        matches!(self, ExportKind::Movie { .. })
    }

    /// Last frame of the export when the request leaves it open.
    pub fn last_frame(&self, opts: &ExportOptions) -> u32 {
        match (opts.last, self) {
            (Some(last), _) => last,
            (None, ExportKind::Image { .. }) => opts.first,
            (None, ExportKind::Movie { .. }) => opts.first + DEFAULT_MOVIE_FRAMES - 1,
        }
    }
}

fn hash_run() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("#+").expect("page template regex must compile"))
}

/// Filename for page `index` of a multi-page export.
///
/// A run of `#` in the file name is replaced by the zero-padded index of that width;
/// otherwise `-00001` style numbering is inserted before the extension.
pub fn page_path(filename: &Path, index: u32) -> PathBuf {
    let name = filename
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let numbered = match hash_run().find(&name) {
        Some(m) => format!(
            "{}{:0width$}{}",
            &name[..m.start()],
            index,
            &name[m.end()..],
            width = m.len()
        ),
        None => {
            let stem = filename
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            match filename.extension() {
                Some(ext) => format!("{}-{:05}.{}", stem, index, ext.to_string_lossy()),
                None => format!("{}-{:05}", stem, index),
            }
        }
    };
    filename.with_file_name(numbered)
}
