//! Script output capture.
//!
//! Everything a script prints (`print`, `debug`, `log.info/warn/error`) is appended to
//! an in-memory [`OutputCapture`] rather than the process streams, so each engine call
//! can hand the host an ordered list of `(is_err, text)` entries.

use std::cell::RefCell;
use std::rc::Rc;

use crate::outcome::Output;

/// Default maximum number of output entries kept per call.
pub const DEFAULT_MAX_OUTPUT_ENTRIES: usize = 1000;

/// Log level for script messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn prefix(&self) -> Option<&'static str> {
        match self {
            LogLevel::Info => None,
            LogLevel::Warn => Some("[WARN]"),
            LogLevel::Error => Some("[ERROR]"),
        }
    }
}

#[derive(Debug, Default)]
struct CaptureState {
    entries: Vec<Output>,
    limit: usize,
    dropped: bool,
}

/// Shared sink that the engine's print/debug callbacks write into.
#[derive(Debug, Clone, Default)]
pub struct OutputCapture {
    state: Rc<RefCell<CaptureState>>,
}

impl OutputCapture {
    pub fn new(limit: usize) -> Self {
        Self {
            state: Rc::new(RefCell::new(CaptureState {
                entries: Vec::new(),
                limit,
                dropped: false,
            })),
        }
    }

    pub fn write(&self, is_err: bool, text: impl Into<String>) {
        let mut state = self.state.borrow_mut();
        if state.limit > 0 && state.entries.len() >= state.limit {
            if !state.dropped {
                state.dropped = true;
                let limit = state.limit;
                log::warn!("script output limit reached ({} entries), dropping the rest", limit);
                state.entries.push(Output::stderr(format!(
                    "Script output limit exceeded ({} entries). Further output dropped.\n",
                    limit
                )));
            }
            return;
        }
        state.entries.push(Output {
            is_err,
            text: text.into(),
        });
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        match level.prefix() {
            None => self.write(false, format!("{}\n", message)),
            Some(prefix) => self.write(true, format!("{} {}\n", prefix, message)),
        }
    }

    /// Take everything written so far and start a fresh buffer.
    pub fn take(&self) -> Vec<Output> {
        let mut state = self.state.borrow_mut();
        state.dropped = false;
        std::mem::take(&mut state.entries)
    }
}

/// Convert a Rhai Dynamic value to a string safely.
pub fn stringify_dynamic(value: &rhai::Dynamic) -> String {
    if let Ok(s) = value.clone().into_string() {
        return s;
    }

    if value.is_array() {
        if let Some(arr) = value.clone().try_cast::<rhai::Array>() {
            let parts: Vec<String> = arr.iter().map(stringify_dynamic).collect();
            return parts.join(" ");
        }
    }

    if value.is_map() {
        if let Some(map) = value.clone().try_cast::<rhai::Map>() {
            let parts: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", k, stringify_dynamic(v)))
                .collect();
            return format!("{{{}}}", parts.join(", "));
        }
    }

    if value.is_unit() {
        return "()".to_string();
    }

    value.to_string()
}

/// The `log` object exposed to scripts.
#[derive(Debug, Clone)]
pub struct ScriptLogger {
    capture: OutputCapture,
}

impl ScriptLogger {
    pub fn new(capture: OutputCapture) -> Self {
        Self { capture }
    }

    pub fn info(&mut self, value: rhai::Dynamic) {
        self.capture.log(LogLevel::Info, &stringify_dynamic(&value));
    }

    pub fn warn(&mut self, value: rhai::Dynamic) {
        self.capture.log(LogLevel::Warn, &stringify_dynamic(&value));
    }

    pub fn error(&mut self, value: rhai::Dynamic) {
        self.capture.log(LogLevel::Error, &stringify_dynamic(&value));
    }
}

/// Route the engine's print/debug hooks and the `log` type into `capture`.
pub fn register_output_api(engine: &mut rhai::Engine, capture: &OutputCapture) {
    let out = capture.clone();
    engine.on_print(move |text| out.write(false, format!("{}\n", text)));

    let err = capture.clone();
    engine.on_debug(move |text, _source, _pos| err.write(true, format!("{}\n", text)));

    engine
        .register_type_with_name::<ScriptLogger>("Log")
        .register_fn("info", ScriptLogger::info)
        .register_fn("warn", ScriptLogger::warn)
        .register_fn("error", ScriptLogger::error);
}
