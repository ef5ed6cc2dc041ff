//! H.264 movie encoding through an external `ffmpeg` process.
//!
//! Raw RGBA frames are piped to ffmpeg's stdin; ffmpeg converts to yuv420p and
//! writes the container named by the output extension (`.mov` or `.mp4`).

use std::io::Write as _;
use std::process::{Child, ChildStdin, Command, Stdio};

use super::error::{ExportError, ExportPhase};
use super::writer::{Frame, MovieSpec, Sink};

/// Result of checking FFmpeg availability.
#[derive(Debug)]
pub enum FfmpegStatus {
    /// FFmpeg is available with the given version string.
    Available(String),
    NotFound,
    /// FFmpeg was found but couldn't determine version.
    Unknown,
}

/// Check if FFmpeg is available on the system.
pub fn check_ffmpeg() -> FfmpegStatus {
    match Command::new("ffmpeg").arg("-version").output() {
        Ok(output) => {
            if output.status.success() {
                let stdout = String::from_utf8_lossy(&output.stdout);
                // e.g. "ffmpeg version 6.0 ..."
                match stdout.lines().next() {
                    Some(first_line) => FfmpegStatus::Available(first_line.to_string()),
                    None => FfmpegStatus::Unknown,
                }
            } else {
                FfmpegStatus::NotFound
            }
        }
        Err(_) => FfmpegStatus::NotFound,
    }
}

/// Arguments for an rgba-over-stdin encode of `spec`.
pub fn ffmpeg_args(spec: &MovieSpec) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-loglevel".into(),
        "error".into(),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "rgba".into(),
        "-s".into(),
        format!("{}x{}", spec.width, spec.height),
        "-r".into(),
        spec.fps.to_string(),
        "-i".into(),
        "pipe:0".into(),
        "-an".into(),
        "-c:v".into(),
        "libx264".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-b:v".into(),
        format!("{}M", spec.bitrate),
    ];
    // yuv420p needs even dimensions
    if spec.width % 2 != 0 || spec.height % 2 != 0 {
        args.push("-vf".into());
        args.push("pad=ceil(iw/2)*2:ceil(ih/2)*2".into());
    }
    args.push(spec.path.to_string_lossy().to_string());
    args
}

pub struct FfmpegSink {
    width: u32,
    height: u32,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
}

impl FfmpegSink {
    pub fn start(spec: &MovieSpec) -> Result<Self, ExportError> {
        match check_ffmpeg() {
            FfmpegStatus::Available(version) => log::info!("Using {}", version),
            FfmpegStatus::NotFound => {
                return Err(ExportError::new(
                    ExportPhase::Setup,
                    "FFmpeg not found. Install FFmpeg and ensure it's in your PATH.",
                ));
            }
            FfmpegStatus::Unknown => {
                log::warn!("FFmpeg found but version unknown, proceeding anyway");
            }
        }

        let mut child = Command::new("ffmpeg")
            .args(ffmpeg_args(spec))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExportError::with_source(ExportPhase::Setup, "Failed to run FFmpeg", e))?;

        let stdin = child.stdin.take().ok_or_else(|| {
            ExportError::new(ExportPhase::Setup, "Failed to open FFmpeg stdin")
        })?;

        log::info!(
            "encoding {}x{} @ {} fps to {:?}",
            spec.width,
            spec.height,
            spec.fps,
            spec.path
        );
        Ok(Self {
            width: spec.width,
            height: spec.height,
            child: Some(child),
            stdin: Some(stdin),
        })
    }
}

impl Sink for FfmpegSink {
    fn write(&mut self, frame: Frame) -> Result<(), ExportError> {
        let Frame::Image(img) = frame else {
            return Err(ExportError::new(
                ExportPhase::Encode,
                "movie encoder received an encoded page",
            ));
        };
        if img.dimensions() != (self.width, self.height) {
            return Err(ExportError::new(
                ExportPhase::Encode,
                format!(
                    "frame size changed to {}x{} (movie is {}x{})",
                    img.width(),
                    img.height(),
                    self.width,
                    self.height
                ),
            ));
        }
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(ExportError::new(ExportPhase::Encode, "FFmpeg encoder is already finalized"));
        };
        stdin.write_all(img.as_raw()).map_err(|e| {
            ExportError::with_source(ExportPhase::Encode, "Failed to write frame to FFmpeg", e)
        })
    }

    fn finish(&mut self) -> Result<(), ExportError> {
        drop(self.stdin.take());
        let Some(child) = self.child.take() else {
            return Ok(());
        };
        let output = child.wait_with_output().map_err(|e| {
            ExportError::with_source(ExportPhase::Finalize, "Failed to wait for FFmpeg", e)
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExportError::new(
                ExportPhase::Finalize,
                format!("FFmpeg encoding failed:\n{}", stderr),
            ));
        }
        log::info!("movie finalized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::MovieFormat;
    use std::path::PathBuf;

    fn spec(width: u32, height: u32) -> MovieSpec {
        MovieSpec {
            path: PathBuf::from("out.mov"),
            format: MovieFormat::Mov,
            width,
            height,
            fps: 30.0,
            bitrate: 2.5,
            loop_count: 0,
        }
    }

    #[test]
    fn test_check_ffmpeg() {
        // Result depends on whether FFmpeg is installed.
        match check_ffmpeg() {
            FfmpegStatus::Available(v) => println!("FFmpeg available: {}", v),
            FfmpegStatus::NotFound => println!("FFmpeg not found"),
            FfmpegStatus::Unknown => println!("FFmpeg status unknown"),
        }
    }

    #[test]
    fn test_args_use_bitrate_and_size() {
        let args = ffmpeg_args(&spec(640, 480));
        assert!(args.windows(2).any(|w| w[0] == "-b:v" && w[1] == "2.5M"));
        assert!(args.windows(2).any(|w| w[0] == "-s" && w[1] == "640x480"));
        assert!(!args.contains(&"-vf".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("out.mov"));
    }

    #[test]
    fn test_odd_dimensions_are_padded() {
        let args = ffmpeg_args(&spec(101, 50));
        assert!(args.contains(&"-vf".to_string()));
    }
}
