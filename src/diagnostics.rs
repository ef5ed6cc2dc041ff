//! Structured script diagnostics.
//!
//! Rhai reports parse and runtime failures with positions and, for errors raised
//! inside script functions, a chain of `ErrorInFunctionCall` wrappers. This module
//! turns those into a stable, JSON-serializable [`Diagnostic`] plus the formatted
//! traceback text that is written to the script's error stream.

use std::path::Path;

use rhai::EvalAltResult;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Syntax/parse errors (compile time).
    CompileError,
    /// Uncaught errors raised while running user code.
    RuntimeError,
    /// Author mistakes detectable without running every frame (missing `draw`,
    /// unknown export format, export already running).
    ConfigurationError,
    /// The image writer or movie encoder failed.
    ExportWriteError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::CompileError => write!(f, "CompileError"),
            ErrorKind::RuntimeError => write!(f, "RuntimeError"),
            ErrorKind::ConfigurationError => write!(f, "ConfigurationError"),
            ErrorKind::ExportWriteError => write!(f, "ExportWriteError"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScriptPhase {
    Compile,
    /// The first pass through the script's global scope.
    Population,
    Setup,
    Draw,
    Stop,
    Export,
}

impl ScriptPhase {
    /// Phase implied by the hook being invoked (`None` is the global scope).
    pub fn for_method(method: Option<&str>) -> Self {
        match method {
            None => ScriptPhase::Population,
            Some("setup") => ScriptPhase::Setup,
            Some("stop") => ScriptPhase::Stop,
            Some(_) => ScriptPhase::Draw,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ScriptLocation {
    /// 1-based line number in the user script.
    pub line: u32,
    /// 1-based column number.
    pub column: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub kind: ErrorKind,
    pub phase: ScriptPhase,
    pub message: String,
    pub location: Option<ScriptLocation>,
}

impl Diagnostic {
    pub fn new(kind: ErrorKind, phase: ScriptPhase, message: impl Into<String>) -> Self {
        Self {
            kind,
            phase,
            message: message.into(),
            location: None,
        }
    }
}

/// What the formatter needs to know about the script that failed.
#[derive(Debug, Clone, Copy)]
pub struct TraceContext<'a> {
    /// Name the AST was tagged with (the script path, or `<untitled>`).
    pub script_name: &'a str,
    /// Directory used to shorten absolute paths in the trace.
    pub script_dir: Option<&'a Path>,
    /// Current script source, used for line snippets.
    pub source: &'a str,
}

impl TraceContext<'_> {
    fn snippet(&self, file: &str, line: usize) -> Option<&str> {
        if file != self.script_name || line == 0 {
            return None;
        }
        self.source.lines().nth(line - 1)
    }

    fn display_path(&self, file: &str) -> String {
        let Some(dir) = self.script_dir else {
            return file.to_string();
        };
        match Path::new(file).strip_prefix(dir) {
            Ok(rel) => {
                let rel = rel.to_string_lossy().to_string();
                if !rel.is_empty() && rel.len() < file.len() {
                    rel
                } else {
                    file.to_string()
                }
            }
            Err(_) => file.to_string(),
        }
    }
}

/// One entry of a runtime traceback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub file: String,
    pub line: Option<usize>,
    pub function: String,
}

impl StackFrame {
    /// Frames without a position or from host-provided sources (`<...>` names other
    /// than the script itself) are engine internals.
    fn is_internal(&self, script_name: &str) -> bool {
        self.line.is_none() || (self.file.starts_with('<') && self.file != script_name)
    }
}

pub fn from_parse_error(err: &rhai::ParseError, ctx: &TraceContext<'_>) -> (Diagnostic, String) {
    let message = err.err_type().to_string();
    let pos = err.position();
    let line = pos.line().unwrap_or(0);
    let column = pos.position().unwrap_or(0);

    let mut text = String::new();
    if line > 0 {
        text.push_str(&format!(
            "  File \"{}\", line {}, column {}\n",
            ctx.display_path(ctx.script_name),
            line,
            column.max(1)
        ));
        if let Some(snippet) = ctx.snippet(ctx.script_name, line) {
            text.push_str(&format!("    {}\n", snippet.trim_end()));
            text.push_str(&format!("    {}^\n", " ".repeat(column.saturating_sub(1))));
        }
    }
    text.push_str(&format!("{}: {}\n", ErrorKind::CompileError, message));

    let diag = Diagnostic {
        kind: ErrorKind::CompileError,
        phase: ScriptPhase::Compile,
        message,
        location: (line > 0).then(|| ScriptLocation {
            line: line as u32,
            column: column.max(1) as u32,
        }),
    };
    (diag, text)
}

/// Walk the function-call chain of a runtime error, returning the frames
/// (outermost first) and the innermost error.
pub fn unwind(err: EvalAltResult, entry: &str, script_name: &str) -> (Vec<StackFrame>, EvalAltResult) {
    let mut frames = Vec::new();
    let mut caller = entry.to_string();
    let mut file = script_name.to_string();
    let mut current = err;

    loop {
        match current {
            EvalAltResult::ErrorInFunctionCall(name, source, inner, pos) => {
                frames.push(StackFrame {
                    file: file.clone(),
                    line: pos.line(),
                    function: caller,
                });
                caller = name;
                if !source.is_empty() {
                    file = source;
                }
                current = *inner;
            }
            EvalAltResult::ErrorInModule(module, inner, pos) => {
                frames.push(StackFrame {
                    file: file.clone(),
                    line: pos.line(),
                    function: caller,
                });
                caller = "<module>".to_string();
                file = module;
                current = *inner;
            }
            other => {
                frames.push(StackFrame {
                    file,
                    line: other.position().line(),
                    function: caller,
                });
                return (frames, other);
            }
        }
    }
}

pub fn from_eval_error(
    phase: ScriptPhase,
    err: EvalAltResult,
    entry: &str,
    ctx: &TraceContext<'_>,
) -> (Diagnostic, String) {
    let (frames, mut innermost) = unwind(err, entry, ctx.script_name);
    let pos = innermost.take_position();
    let message = innermost.to_string();

    let frames: Vec<StackFrame> = frames
        .into_iter()
        .filter(|f| !f.is_internal(ctx.script_name))
        .collect();

    let mut text = String::new();
    if !frames.is_empty() {
        text.push_str("Traceback (most recent call last):\n");
    }
    for frame in &frames {
        let line = frame.line.unwrap_or(0);
        text.push_str(&format!(
            "  File \"{}\", line {}, in {}\n",
            ctx.display_path(&frame.file),
            line,
            frame.function
        ));
        if let Some(snippet) = ctx.snippet(&frame.file, line) {
            text.push_str(&format!("    {}\n", snippet.trim()));
        }
    }
    text.push_str(&format!("{}: {}\n", ErrorKind::RuntimeError, message));

    // Report the deepest position that lies in the user script.
    let location = frames
        .iter()
        .rev()
        .find(|f| f.file == ctx.script_name)
        .and_then(|f| f.line)
        .or_else(|| pos.line())
        .map(|line| ScriptLocation {
            line: line as u32,
            column: pos.position().unwrap_or(1).max(1) as u32,
        });

    let diag = Diagnostic {
        kind: ErrorKind::RuntimeError,
        phase,
        message,
        location,
    };
    (diag, text)
}
