//! Errors raised by writers and encoders.

/// Export stage a failure occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportPhase {
    Setup,
    Encode,
    Write,
    Finalize,
}

impl std::fmt::Display for ExportPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportPhase::Setup => write!(f, "Setup"),
            ExportPhase::Encode => write!(f, "Encode"),
            ExportPhase::Write => write!(f, "Write"),
            ExportPhase::Finalize => write!(f, "Finalize"),
        }
    }
}

/// Structured error for writer/encoder failures.
#[derive(Debug)]
pub struct ExportError {
    pub phase: ExportPhase,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl std::fmt::Display for ExportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.phase, self.message)?;
        if let Some(ref source) = self.source {
            write!(f, " (caused by: {})", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for ExportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl ExportError {
    pub fn new(phase: ExportPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        phase: ExportPhase,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            phase,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_phase_and_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err = ExportError::with_source(ExportPhase::Encode, "ffmpeg stopped", io);
        assert_eq!(
            err.to_string(),
            "[Encode] ffmpeg stopped (caused by: pipe closed)"
        );
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(ExportError::new(ExportPhase::Setup, "x").to_string(), "[Setup] x");
    }
}
