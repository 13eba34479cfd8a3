//! Error types for all phases of the interpreter.

use std::fmt;

use thiserror::Error;

use crate::span::Span;

/// Scanner errors.
#[derive(Debug, Clone, Error)]
pub enum LexerError {
    #[error("Unexpected character '{0}'.")]
    UnexpectedChar(char, Span),

    #[error("Unterminated string.")]
    UnterminatedString(Span),
}

impl LexerError {
    pub fn span(&self) -> Span {
        match self {
            Self::UnexpectedChar(_, span) => *span,
            Self::UnterminatedString(span) => *span,
        }
    }
}

/// Where a compile diagnostic points in the token stream.
#[derive(Debug, Clone)]
pub enum ErrorLocation {
    /// At a concrete token.
    At(String),
    /// At the end of the source.
    AtEnd,
    /// No usable token (the scanner produced the message itself).
    Bare,
}

/// A single compile diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub line: usize,
    pub location: ErrorLocation,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] Error", self.line)?;
        match &self.location {
            ErrorLocation::At(lexeme) => write!(f, " at '{}'", lexeme)?,
            ErrorLocation::AtEnd => write!(f, " at end")?,
            ErrorLocation::Bare => {}
        }
        write!(f, ": {}", self.message)
    }
}

/// Compilation failed; carries every diagnostic reported before the
/// compiler gave up.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileError {
    pub fn new(diagnostics: Vec<Diagnostic>) -> Self {
        Self { diagnostics }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, diagnostic) in self.diagnostics.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", diagnostic)?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

/// One frame of a runtime stack trace, newest first.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub line: usize,
    /// Function name, or `None` for the top-level script.
    pub name: Option<String>,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "[line {}] in {}()", self.line, name),
            None => write!(f, "[line {}] in script", self.line),
        }
    }
}

/// The VM hit an unrecoverable error; all frames have been unwound.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: Vec::new(),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for frame in &self.trace {
            write!(f, "\n{}", frame)?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// A unified error type for all phases.
#[derive(Debug, Error)]
pub enum OpalError {
    #[error("{0}")]
    Compile(#[from] CompileError),

    #[error("{0}")]
    Runtime(#[from] RuntimeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_display() {
        let diagnostic = Diagnostic {
            line: 3,
            location: ErrorLocation::At("}".to_string()),
            message: "Expect expression.".to_string(),
        };
        assert_eq!(
            diagnostic.to_string(),
            "[line 3] Error at '}': Expect expression."
        );

        let at_end = Diagnostic {
            line: 7,
            location: ErrorLocation::AtEnd,
            message: "Expect ';' after value.".to_string(),
        };
        assert_eq!(
            at_end.to_string(),
            "[line 7] Error at end: Expect ';' after value."
        );
    }

    #[test]
    fn test_runtime_error_display() {
        let error = RuntimeError {
            message: "Operands must be numbers.".to_string(),
            trace: vec![
                TraceFrame {
                    line: 2,
                    name: Some("b".to_string()),
                },
                TraceFrame { line: 4, name: None },
            ],
        };
        assert_eq!(
            error.to_string(),
            "Operands must be numbers.\n[line 2] in b()\n[line 4] in script"
        );
    }
}
