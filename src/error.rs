//! Error taxonomy surfaced to the driver.
//!
//! `SyntaxError`/`DeclarationError`/`StatementError` are produced by the
//! collaborator parser and passed through unchanged; the emitter only ever
//! raises `InternalError` or `EncodingError`.

use std::fmt;

/// A source location, when one is known. The collaborator parser is the only
/// component that can attach one with full confidence; the emitter attaches
/// the IR index it was processing when it can't do better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Location {
    pub line: u32,
    pub col: u32,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("[{location}] Syntax: {message}")]
    Syntax { location: Location, message: String },

    #[error("[{location}] Declaration: {message}")]
    Declaration { location: Location, message: String },

    #[error("[{location}] Statement: {message}")]
    Statement { location: Location, message: String },

    /// Violated invariant: missing symbol, unreachable switch arm, spill of a
    /// non-existent register owner. Not recoverable.
    #[error("internal error at ir#{ip_src}: {message}")]
    Internal { ip_src: usize, message: String },

    /// Representable as bytes but the operand is out of the encodable range.
    /// Not recoverable by design (no automatic widening).
    #[error("encoding error at ir#{ip_src}: {message}")]
    Encoding { ip_src: usize, message: String },
}

impl CompileError {
    pub fn internal(ip_src: usize, message: impl Into<String>) -> Self {
        CompileError::Internal {
            ip_src,
            message: message.into(),
        }
    }

    pub fn encoding(ip_src: usize, message: impl Into<String>) -> Self {
        CompileError::Encoding {
            ip_src,
            message: message.into(),
        }
    }

    /// Exit code the driver should use for this error. Any non-zero value is
    /// contractually acceptable; distinct codes just make scripted
    /// test harnesses easier to read.
    pub fn exit_code(&self) -> i32 {
        match self {
            CompileError::Syntax { .. } => 1,
            CompileError::Declaration { .. } => 2,
            CompileError::Statement { .. } => 3,
            CompileError::Internal { .. } => 4,
            CompileError::Encoding { .. } => 5,
        }
    }
}

pub type CompileResult<T> = Result<T, CompileError>;
