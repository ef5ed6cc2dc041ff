//! The uniform result value returned by every engine entry point.

use serde::Serialize;

use crate::diagnostics::{Diagnostic, ErrorKind, ScriptPhase};

/// One chunk of text the script wrote, tagged with the stream it went to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Output {
    pub is_err: bool,
    pub text: String,
}

impl Output {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            is_err: false,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            is_err: true,
            text: text.into(),
        }
    }
}

/// Result of compiling, calling or rendering a script.
///
/// `ok` is false for compile/runtime/configuration/write failures. A script that
/// called `halt()` finishes with `ok == true` and `halted == true`.
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub ok: bool,
    pub halted: bool,
    pub output: Vec<Output>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<Diagnostic>,
}

impl Outcome {
    pub fn success(output: Vec<Output>) -> Self {
        Self {
            ok: true,
            halted: false,
            output,
            diagnostic: None,
        }
    }

    pub fn empty() -> Self {
        Self::success(Vec::new())
    }

    pub fn halted(output: Vec<Output>) -> Self {
        Self {
            ok: true,
            halted: true,
            output,
            diagnostic: None,
        }
    }

    /// A failed outcome. The diagnostic's formatted text is expected to already be
    /// part of `output` (on the error stream).
    pub fn failure(diagnostic: Diagnostic, output: Vec<Output>) -> Self {
        Self {
            ok: false,
            halted: false,
            output,
            diagnostic: Some(diagnostic),
        }
    }

    /// Failure that carries no captured script output, only its own message.
    pub fn error(kind: ErrorKind, phase: ScriptPhase, message: impl Into<String>) -> Self {
        let message = message.into();
        let output = vec![Output::stderr(format!("{}\n", message))];
        Self::failure(Diagnostic::new(kind, phase, message), output)
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        self.diagnostic.as_ref().map(|d| d.kind)
    }

    /// Append another outcome's output; the combined outcome fails if either did.
    pub fn merge(mut self, other: Outcome) -> Self {
        self.output.extend(other.output);
        if !other.ok {
            self.ok = false;
            self.diagnostic = other.diagnostic;
        }
        self.halted |= other.halted;
        self
    }

    /// All stdout text concatenated.
    pub fn stdout_text(&self) -> String {
        self.output
            .iter()
            .filter(|o| !o.is_err)
            .map(|o| o.text.as_str())
            .collect()
    }

    /// All stderr text concatenated.
    pub fn stderr_text(&self) -> String {
        self.output
            .iter()
            .filter(|o| o.is_err)
            .map(|o| o.text.as_str())
            .collect()
    }
}
