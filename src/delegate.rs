//! Host-side receiver of export status and progress.

use std::cell::RefCell;
use std::io::Write as _;
use std::rc::Rc;

use crate::canvas::Canvas;
use crate::export::Progress;
use crate::outcome::Outcome;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportEvent {
    Cancelled { added: usize },
    Failed { message: String },
    Complete,
}

pub trait Delegate {
    /// Result of one engine call during an export. `canvas` is set for rendered frames.
    fn export_status(&mut self, outcome: &Outcome, canvas: Option<&dyn Canvas>);

    fn export_progress(&mut self, written: usize, total: usize, cancelled: bool);

    fn export_event(&mut self, _event: ExportEvent) {}
}

pub type SharedDelegate = Rc<RefCell<dyn Delegate>>;

/// Ignores everything.
#[derive(Debug, Default)]
pub struct NullDelegate;

impl Delegate for NullDelegate {
    fn export_status(&mut self, _outcome: &Outcome, _canvas: Option<&dyn Canvas>) {}

    fn export_progress(&mut self, _written: usize, _total: usize, _cancelled: bool) {}
}

/// Echoes script output to the process streams and draws a progress bar on stderr.
#[derive(Debug)]
pub struct ConsoleDelegate {
    bar_width: usize,
    progress_shown: bool,
    failed: bool,
}

impl Default for ConsoleDelegate {
    fn default() -> Self {
        Self {
            bar_width: 30,
            progress_shown: false,
            failed: false,
        }
    }
}

impl ConsoleDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any reported outcome or export failed since the last reset.
    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn reset(&mut self) {
        self.failed = false;
    }

    fn end_progress_line(&mut self) {
        if self.progress_shown {
            eprintln!();
            self.progress_shown = false;
        }
    }
}

/// Write an outcome's output to stdout/stderr in order.
pub fn print_outcome(outcome: &Outcome) {
    let stdout = std::io::stdout();
    let stderr = std::io::stderr();
    for entry in &outcome.output {
        let result = if entry.is_err {
            stderr.lock().write_all(entry.text.as_bytes())
        } else {
            stdout.lock().write_all(entry.text.as_bytes())
        };
        if let Err(e) = result {
            log::warn!("failed to echo script output: {}", e);
            return;
        }
    }
    let _ = stdout.lock().flush();
}

impl Delegate for ConsoleDelegate {
    fn export_status(&mut self, outcome: &Outcome, _canvas: Option<&dyn Canvas>) {
        self.failed |= !outcome.ok;
        if outcome.output.is_empty() {
            return;
        }
        self.end_progress_line();
        print_outcome(outcome);
    }

    fn export_progress(&mut self, written: usize, total: usize, cancelled: bool) {
        let progress = Progress {
            written,
            total,
            cancelled,
        };
        eprint!("\r{} {}\x1b[K", progress.bar(self.bar_width), progress.message());
        let _ = std::io::stderr().flush();
        self.progress_shown = true;
    }

    fn export_event(&mut self, event: ExportEvent) {
        self.end_progress_line();
        match event {
            ExportEvent::Cancelled { added } => {
                log::info!("export cancelled, finishing {} frame(s)", added)
            }
            ExportEvent::Failed { message } => {
                self.failed = true;
                eprintln!("Export failed: {}", message)
            }
            ExportEvent::Complete => log::info!("export complete"),
        }
    }
}
