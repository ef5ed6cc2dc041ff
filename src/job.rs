//! Headless job specification, as read by the `console` subcommand or assembled
//! from `run` flags.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::export::{ExportOptions, ExportTarget};
use crate::metadata::MetadataUpdate;

/// Extensions accepted for `export`.
pub const EXPORT_EXTENSIONS: [&str; 10] =
    ["pdf", "eps", "png", "jpg", "jpeg", "tiff", "gif", "bmp", "mov", "mp4"];

fn default_first() -> u32 {
    1
}

fn default_fps() -> f64 {
    30.0
}

fn default_bitrate() -> f64 {
    1.0
}

/// One headless run: a script, and optionally a file to export it to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleJob {
    /// Script to run.
    pub file: PathBuf,

    /// Export destination. None renders headlessly without writing anything.
    #[serde(default)]
    pub export: Option<PathBuf>,

    #[serde(default = "default_first")]
    pub first: u32,

    /// Last frame. None means unbounded (or a single page for image exports).
    #[serde(default)]
    pub last: Option<u32>,

    #[serde(default = "default_fps")]
    pub fps: f64,

    /// Video bitrate in Mbit/s.
    #[serde(default = "default_bitrate")]
    pub bitrate: f64,

    /// GIF repeat count for exports; any non-zero value loops headless animations.
    #[serde(default, rename = "loop")]
    pub loop_count: i32,

    /// Accepted for compatibility; there is no window to fill.
    #[serde(default)]
    pub fullscreen: bool,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub virtualenv: Option<PathBuf>,

    /// Re-run whenever the script file changes.
    #[serde(default)]
    pub live: bool,
}

impl ConsoleJob {
    pub fn new(file: PathBuf) -> Self {
        Self {
            file,
            export: None,
            first: default_first(),
            last: None,
            fps: default_fps(),
            bitrate: default_bitrate(),
            loop_count: 0,
            fullscreen: false,
            args: Vec::new(),
            virtualenv: None,
            live: false,
        }
    }

    pub fn from_json(line: &str) -> Result<Self, String> {
        serde_json::from_str(line.trim()).map_err(|e| format!("Failed to parse job: {}", e))
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.file.exists() {
            return Err(format!("Script file not found: {:?}", self.file));
        }
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
        if let Some(export) = &self.export {
            let ext = export_extension(export);
            if !EXPORT_EXTENSIONS.contains(&ext.as_str()) {
                return Err(format!(
                    "Unrecognized export format {:?} (expected one of: {})",
                    ext,
                    EXPORT_EXTENSIONS.join(", ")
                ));
            }
            let dir = export.parent().filter(|p| !p.as_os_str().is_empty());
            if let Some(dir) = dir {
                if !dir.is_dir() {
                    return Err(format!("Export directory not found: {:?}", dir));
                }
            }
        }
        Ok(())
    }

    /// Image or movie, judged from the export extension and frame range.
    pub fn export_target(&self) -> Option<ExportTarget> {
        let export = self.export.as_ref()?;
        let target = match export_extension(export).as_str() {
            "mov" | "mp4" => ExportTarget::Movie,
            "gif" if self.last.is_some_and(|last| last > self.first) => ExportTarget::Movie,
            _ => ExportTarget::Image,
        };
        Some(target)
    }

    pub fn export_options(&self) -> ExportOptions {
        ExportOptions {
            format: None,
            first: self.first,
            last: self.last,
            fps: self.fps,
            bitrate: self.bitrate,
            loop_count: self.loop_count,
        }
    }

    pub fn metadata(&self) -> MetadataUpdate {
        MetadataUpdate {
            args: Some(self.args.clone()),
            virtualenv: self.virtualenv.clone(),
            first: Some(self.first),
            last: self.last,
            loop_: Some(self.loop_count != 0),
            live: Some(self.live),
        }
    }
}

fn export_extension(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

/// Parse a `--frames` value: `N` (frames 1 to N), `M-N`, or `M-` (open ended).
pub fn parse_frames(spec: &str) -> Result<(u32, Option<u32>), String> {
    let bad = || format!("Invalid frame range {:?} (expected N, M-N or M-)", spec);
    let number = |s: &str| s.trim().parse::<u32>().map_err(|_| bad());

    let (first, last) = match spec.split_once('-') {
        None => (1, Some(number(spec)?)),
        Some((first, "")) => (number(first)?, None),
        Some((first, last)) => (number(first)?, Some(number(last)?)),
    };
    if first == 0 {
        return Err("Frame numbers start at 1".to_string());
    }
    if let Some(last) = last {
        if last < first {
            return Err(format!("Frame range must be ascending (got {}-{})", first, last));
        }
    }
    Ok((first, last))
}
