//! Error types for sshbuild-core

use std::net::SocketAddr;
use std::process::ExitStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Standard input is not an interactive terminal")]
    NotATerminal,

    #[error("Failed to allocate pseudo-terminal: {0}")]
    PtyAllocation(String),

    #[error("Failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("Failed to switch terminal mode: {0}")]
    TerminalState(std::io::Error),

    #[error("`{command}` failed ({status})")]
    CommandFailed { command: String, status: ExitStatus },

    #[error("Failed to bind content server on {addr}: {source}")]
    ServerBind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Content server stopped unexpectedly: {0}")]
    ServerFailed(String),

    #[error("Scratch directory error: {0}")]
    Scratch(std::io::Error),

    #[error("Interrupted")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// True for errors caused by bad flags rather than a failed run
    pub fn is_usage(&self) -> bool {
        matches!(self, CoreError::InvalidConfig(_))
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
