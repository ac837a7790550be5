//! Error types for the engine.
//!
//! Every failure that is not a clean termination predicate aborts the run.
//! There is no local recovery: evaluation faults, transport faults, and
//! checkpoint corruption all surface as a fatal [`EngineError`] on rank 0,
//! which prints a single-line diagnostic to stderr and maps the error to a
//! process exit code.

use thiserror::Error;

/// Unified error type for all engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Configuration validation failed; the run aborts before initialization.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A fitness or environment callback produced a non-finite value, or an
    /// importance weight / rescaled reward became non-finite.
    #[error("evaluation failed: {0}")]
    Evaluation(String),

    /// Message passing between ranks failed. Fatal, no retry.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A checkpoint could not be parsed or is internally inconsistent.
    #[error("corrupt checkpoint: {0}")]
    Checkpoint(String),

    /// I/O error while reading or writing a checkpoint file.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        EngineError::Configuration(message.into())
    }

    /// Creates an evaluation error.
    pub fn evaluation(message: impl Into<String>) -> Self {
        EngineError::Evaluation(message.into())
    }

    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        EngineError::Transport(message.into())
    }

    /// Creates a checkpoint error.
    pub fn checkpoint(message: impl Into<String>) -> Self {
        EngineError::Checkpoint(message.into())
    }

    /// Process exit code for this error kind. `0` is reserved for clean
    /// termination and never returned here.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Configuration(_) => 2,
            EngineError::Evaluation(_) => 3,
            EngineError::Transport(_) => 4,
            EngineError::Checkpoint(_) => 5,
            EngineError::Io(_) => 6,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;
