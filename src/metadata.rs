//! Runtime parameters for a script run.

use std::path::PathBuf;
use std::sync::mpsc::Sender;

use serde::{Deserialize, Serialize};

use crate::outcome::Output;

/// Receives a copy of every output entry produced by engine calls.
pub type ConsoleSink = Sender<Output>;

#[derive(Debug, Clone)]
pub struct RunMetadata {
    /// Extra arguments appended to `ARGV` after the script name.
    pub args: Vec<String>,
    /// Extra module search directory, consulted after the script's own directory.
    pub virtualenv: Option<PathBuf>,
    pub first: u32,
    /// Frame to render next.
    pub next: u32,
    /// Last frame; `None` means unbounded.
    pub last: Option<u32>,
    pub running: bool,
    pub loop_: bool,
    pub live: bool,
    pub console: Option<ConsoleSink>,
}

impl Default for RunMetadata {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            virtualenv: None,
            first: 1,
            next: 1,
            last: None,
            running: false,
            loop_: false,
            live: false,
            console: None,
        }
    }
}

impl RunMetadata {
    /// Rewind the frame counter to `first`.
    pub fn rewind(&mut self) {
        self.next = self.first;
    }

    pub fn apply(&mut self, update: MetadataUpdate) {
        if let Some(args) = update.args {
            self.args = args;
        }
        if let Some(venv) = update.virtualenv {
            self.virtualenv = Some(venv);
        }
        if let Some(first) = update.first {
            self.first = first;
        }
        if let Some(last) = update.last {
            self.last = Some(last);
        }
        if let Some(looping) = update.loop_ {
            self.loop_ = looping;
        }
        if let Some(live) = update.live {
            self.live = live;
        }
    }

    pub fn snapshot(&self) -> MetadataUpdate {
        MetadataUpdate {
            args: Some(self.args.clone()),
            virtualenv: self.virtualenv.clone(),
            first: Some(self.first),
            last: self.last,
            loop_: Some(self.loop_),
            live: Some(self.live),
        }
    }

    /// Forward output entries to the console sink, if one is attached.
    pub fn echo(&self, output: &[Output]) {
        let Some(console) = &self.console else {
            return;
        };
        for entry in output {
            if console.send(entry.clone()).is_err() {
                log::debug!("console sink disconnected");
                break;
            }
        }
    }
}

/// Partial update of [`RunMetadata`]; absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataUpdate {
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub virtualenv: Option<PathBuf>,
    #[serde(default)]
    pub first: Option<u32>,
    #[serde(default)]
    pub last: Option<u32>,
    #[serde(default, rename = "loop")]
    pub loop_: Option<bool>,
    #[serde(default)]
    pub live: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_update() {
        let mut meta = RunMetadata::default();
        let update: MetadataUpdate =
            serde_json::from_str(r#"{"first": 3, "loop": true, "unknown": 1}"#).unwrap();
        meta.apply(update);
        assert_eq!(meta.first, 3);
        assert!(meta.loop_);
        assert_eq!(meta.last, None);
        assert!(meta.args.is_empty());
    }

    #[test]
    fn test_echo_to_console() {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut meta = RunMetadata::default();
        meta.console = Some(tx);
        meta.echo(&[Output::stdout("a"), Output::stderr("b")]);
        let got: Vec<Output> = rx.try_iter().collect();
        assert_eq!(got, vec![Output::stdout("a"), Output::stderr("b")]);
    }
}
