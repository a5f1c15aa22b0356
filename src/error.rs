//! Error types for fanjoin.

use crate::status::TerminationReason;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for fanjoin.
#[derive(Error, Debug)]
pub enum JoinError {
    #[error("Cannot start worker {index} ({command}): {source}")]
    Spawn {
        index: usize,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot open input file {}: {source}", path.display())]
    InputOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read input: {0}")]
    InputRead(#[source] std::io::Error),

    #[error("All {dropped} workers stopped accepting input")]
    NoWorkersLeft { dropped: usize },

    #[error("Failed to merge {stream} of worker {index}: {source}")]
    Merge {
        stream: &'static str,
        index: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write merged {stream}: {source}")]
    Output {
        stream: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to relay diagnostics: {0}")]
    Relay(#[source] std::io::Error),

    #[error("Worker {index} {reason}")]
    WorkerExit {
        index: usize,
        reason: TerminationReason,
    },

    #[error("Joiner thread panicked")]
    JoinerPanicked,

    #[error("System call failed: {0}")]
    Sys(#[from] nix::errno::Errno),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl JoinError {
    /// Process exit code this error maps to.
    ///
    /// A failing worker passes its own status through; everything else is 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::WorkerExit { reason, .. } => reason.exit_code(),
            _ => 1,
        }
    }
}

/// Result type alias for fanjoin operations.
pub type Result<T> = std::result::Result<T, JoinError>;
