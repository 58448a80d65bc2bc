use std::io;

use thiserror::Error;

use crate::cleanup::SafetyGate;

#[derive(Error, Debug)]
pub enum LauncherError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("Depot {depot_id} failed: {message}")]
    Depot { depot_id: String, message: String },
    #[error("Download process terminated unexpectedly: {0}")]
    UnexpectedTermination(String),
    #[error("Cleanup safety check failed [{gate}]: {reason}")]
    Safety { gate: SafetyGate, reason: String },
    #[error("Process control error: {0}")]
    Process(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Invalid output pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl LauncherError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn safety(gate: SafetyGate, reason: impl Into<String>) -> Self {
        Self::Safety {
            gate,
            reason: reason.into(),
        }
    }

    /// Whether the message reads like a user-initiated cancellation rather than a failure.
    pub fn looks_cancelled(message: &str) -> bool {
        message.to_lowercase().contains("cancel")
    }
}

pub type Result<T> = std::result::Result<T, LauncherError>;
