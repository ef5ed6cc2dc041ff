use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::cell::RefCell;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime};

use crate::delegate::{print_outcome, ConsoleDelegate, SharedDelegate};
use crate::export::ExportTarget;
use crate::host::ScriptHost;
use crate::job::{parse_frames, ConsoleJob};
use crate::scheduler::{CancelToken, Pump};

/// How often `--live` checks the script for changes.
const WATCH_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script headlessly, optionally exporting its output
    Run {
        /// Script to run
        script: PathBuf,

        /// Export to an image (pdf, eps, png, jpg, tiff, gif, bmp) or movie (mov, mp4, gif)
        #[arg(long)]
        export: Option<PathBuf>,

        /// Frames to render: N, M-N or M-
        #[arg(long)]
        frames: Option<String>,

        /// Movie frame rate
        #[arg(long, default_value_t = 30.0)]
        fps: f64,

        /// Movie bitrate in Mbit/s
        #[arg(long, default_value_t = 1.0)]
        rate: f64,

        /// Loop the animation; for GIF exports, the repeat count (forever if omitted)
        #[arg(long = "loop", num_args = 0..=1, default_missing_value = "-1")]
        loop_count: Option<i32>,

        /// Re-run whenever the script changes
        #[arg(long)]
        live: bool,

        /// Extra module search directory
        #[arg(long)]
        virtualenv: Option<PathBuf>,

        /// Arguments passed to the script as ARGV
        #[arg(long, num_args = 1.., allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Read one JSON job from stdin; a later line containing CANCEL stops the run
    Console,
}

/// Parse the command line and run it. `Ok(false)` means the script failed.
pub fn run() -> Result<bool> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            script,
            export,
            frames,
            fps,
            rate,
            loop_count,
            live,
            virtualenv,
            args,
        } => {
            let mut job = ConsoleJob::new(script);
            if let Some(frames) = frames {
                let (first, last) = parse_frames(&frames).map_err(anyhow::Error::msg)?;
                job.first = first;
                job.last = last;
            }
            job.export = export;
            job.fps = fps;
            job.bitrate = rate;
            job.loop_count = loop_count.unwrap_or(0);
            job.live = live;
            job.virtualenv = virtualenv;
            job.args = args;
            execute(job, &CancelToken::new())
        }
        Commands::Console => console(),
    }
}

fn console() -> Result<bool> {
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read job from stdin")?;
    let job = ConsoleJob::from_json(&line).map_err(anyhow::Error::msg)?;

    let cancel = CancelToken::new();
    watch_stdin(cancel.clone());
    execute(job, &cancel)
}

/// Trip `cancel` when stdin delivers a line containing `CANCEL`.
fn watch_stdin(cancel: CancelToken) {
    let spawned = std::thread::Builder::new()
        .name("stdin-watch".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) if line.contains("CANCEL") => {
                        log::info!("cancel requested on stdin");
                        cancel.cancel();
                        break;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        });
    if let Err(e) = spawned {
        log::warn!("stdin watcher unavailable: {}", e);
    }
}

fn execute(mut job: ConsoleJob, cancel: &CancelToken) -> Result<bool> {
    job.validate().map_err(anyhow::Error::msg)?;
    if job.fullscreen {
        log::debug!("fullscreen has no effect on a headless run");
    }
    job.file = std::fs::canonicalize(&job.file)
        .with_context(|| format!("Failed to resolve {:?}", job.file))?;

    let console = Rc::new(RefCell::new(ConsoleDelegate::new()));
    let delegate: SharedDelegate = console.clone();
    let mut host = ScriptHost::new(delegate);
    host.set_metadata(job.metadata());

    let mut stamp = modified(&job.file);
    loop {
        console.borrow_mut().reset();
        let ok = match job.export_target() {
            Some(target) => export_once(&mut host, &job, target, cancel, &console),
            None => run_once(&mut host, &job, cancel, stamp),
        };
        if !job.live || cancel.is_cancelled() {
            return Ok(ok);
        }
        if !wait_for_change(&job.file, &mut stamp, cancel) {
            return Ok(ok);
        }
        log::info!("{:?} changed, running again", job.file);
    }
}

fn export_once(
    host: &mut ScriptHost,
    job: &ConsoleJob,
    target: ExportTarget,
    cancel: &CancelToken,
    console: &Rc<RefCell<ConsoleDelegate>>,
) -> bool {
    let Some(path) = job.export.as_ref() else {
        return false;
    };
    let compiled = host.load(&job.file);
    if !compiled.ok {
        print_outcome(&compiled);
        return false;
    }
    if !host.export(target, path, &job.export_options()).ok {
        return false;
    }

    loop {
        if cancel.is_cancelled() {
            host.cancel_export();
        }
        match host.pump() {
            Pump::Busy => {}
            Pump::Waiting => std::thread::sleep(Duration::from_millis(10)),
            Pump::Idle => break,
        }
    }
    let failed = console.borrow().failed();
    !failed
}

/// Run once without exporting: static scripts a single time, animations paced at their
/// frame rate until they stop, fail, are cancelled, or (when live) the file changes.
fn run_once(
    host: &mut ScriptHost,
    job: &ConsoleJob,
    cancel: &CancelToken,
    stamp: Option<SystemTime>,
) -> bool {
    let compiled = host.load(&job.file);
    print_outcome(&compiled);
    if !compiled.ok {
        return false;
    }
    let populated = host.render(None);
    print_outcome(&populated);
    if !populated.ok || !host.clock().is_running() {
        return populated.ok;
    }

    let setup = host.render(Some("setup"));
    print_outcome(&setup);
    if !setup.ok {
        host.stop();
        return false;
    }

    let interval = host
        .clock()
        .fps()
        .filter(|fps| *fps > 0.0)
        .map(|fps| Duration::from_secs_f64(1.0 / fps))
        .unwrap_or_default();

    let mut ok = true;
    while host.clock().is_running() {
        if cancel.is_cancelled() || (job.live && modified(&job.file) != stamp) {
            break;
        }
        let started = Instant::now();
        let frame = host.render(Some("draw"));
        print_outcome(&frame);
        if !frame.ok {
            ok = false;
            break;
        }
        if let Some(rest) = interval.checked_sub(started.elapsed()) {
            std::thread::sleep(rest);
        }
    }
    print_outcome(&host.stop());
    ok
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Block until the file's modification time moves. Returns false if cancelled.
fn wait_for_change(path: &Path, stamp: &mut Option<SystemTime>, cancel: &CancelToken) -> bool {
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = modified(path);
        if now != *stamp {
            *stamp = now;
            return true;
        }
        std::thread::sleep(WATCH_INTERVAL);
    }
}
