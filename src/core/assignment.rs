//! Task assignment - one unit of work handed out by the scheduler

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// What the assignment's file content is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Ready-to-run program, compile phase is skipped
    PrebuiltProgram,
    /// Job description that must be compiled first
    SourceDescription,
}

impl FileKind {
    /// Map the scheduler's `filetype` field
    pub fn from_wire(filetype: &str) -> Self {
        match filetype.trim().to_ascii_lowercase().as_str() {
            "py" => Self::PrebuiltProgram,
            _ => Self::SourceDescription,
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrebuiltProgram => write!(f, "prebuilt-program"),
            Self::SourceDescription => write!(f, "source-description"),
        }
    }
}

/// Remote status of an assignment, as seen by the watchdog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Completed,
    Deleted,
    Error,
    /// Anything the scheduler reports that we do not know about
    #[serde(other)]
    Unknown,
}

impl TaskStatus {
    pub fn from_wire(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "active" => Self::Active,
            "completed" => Self::Completed,
            "deleted" => Self::Deleted,
            "error" => Self::Error,
            _ => Self::Unknown,
        }
    }

    /// Whether the local run has to stop
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Deleted)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Deleted => write!(f, "deleted"),
            Self::Error => write!(f, "error"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Immutable description of one task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskAssignment {
    pub task_id: String,
    pub session_id: String,
    pub kind: FileKind,
    /// Original file name, when the scheduler sends one
    pub file_name: Option<String>,
    pub content: String,
    /// Budget for the whole pipeline, counted from acquisition
    pub max_time: Duration,
}

impl TaskAssignment {
    pub fn new(
        task_id: impl Into<String>,
        session_id: impl Into<String>,
        kind: FileKind,
        content: impl Into<String>,
        max_time: Duration,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            session_id: session_id.into(),
            kind,
            file_name: None,
            content: content.into(),
            max_time,
        }
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_kind_from_wire() {
        assert_eq!(FileKind::from_wire("py"), FileKind::PrebuiltProgram);
        assert_eq!(FileKind::from_wire("PY "), FileKind::PrebuiltProgram);
        assert_eq!(FileKind::from_wire("grc"), FileKind::SourceDescription);
        assert_eq!(FileKind::from_wire(""), FileKind::SourceDescription);
    }

    #[test]
    fn test_status_terminal() {
        assert!(TaskStatus::from_wire("deleted").is_terminal());
        assert!(TaskStatus::from_wire("completed").is_terminal());
        assert!(!TaskStatus::from_wire("active").is_terminal());
        assert!(!TaskStatus::from_wire("error").is_terminal());
        assert_eq!(TaskStatus::from_wire("queued"), TaskStatus::Unknown);
    }

    #[test]
    fn test_status_deserialize_unknown() {
        let status: TaskStatus = serde_json::from_str("\"processing\"").unwrap();
        assert_eq!(status, TaskStatus::Unknown);
        let status: TaskStatus = serde_json::from_str("\"deleted\"").unwrap();
        assert_eq!(status, TaskStatus::Deleted);
    }
}
