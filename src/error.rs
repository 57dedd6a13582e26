//! Error types for the profiling core.

use thiserror::Error;

/// Errors surfaced by the collector and its edges.
///
/// Only [`ProfilerError::UnbalancedExit`] can come out of the collector
/// itself; everything else in the core degrades to an "unknown" value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProfilerError {
    #[error("exit called before enter (open slots: {slots})")]
    UnbalancedExit { slots: usize },

    #[error("collector is already borrowed")]
    CollectorBusy,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("trace line {line}: {message}")]
    Replay { line: usize, message: String },
}

/// Result type alias for profiler operations
pub type Result<T> = std::result::Result<T, ProfilerError>;
