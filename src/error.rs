//! Error types for the scheduler client and the process runner

use thiserror::Error;

/// Errors talking to the scheduler or the upload service
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Server { status: u16, body: String },

    #[error("could not decode response: {0}")]
    Decode(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    /// The scheduler handed out a task this device cannot run
    #[error("invalid assignment {task_id}: {reason}")]
    InvalidAssignment { task_id: String, reason: String },
}

impl SchedulerError {
    /// True for 5xx-class responses
    pub fn is_server_error(&self) -> bool {
        match self {
            Self::Server { status, .. } => (500..600).contains(status),
            Self::Transport(e) => e.status().map(|s| s.is_server_error()).unwrap_or(false),
            _ => false,
        }
    }
}

/// Errors launching or polling an external process
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("empty command")]
    EmptyCommand,

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write sandbox profile: {0}")]
    Profile(#[source] std::io::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
