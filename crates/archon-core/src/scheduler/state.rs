//! Task state machine.
//!
//! Enforces the allowed transition graph:
//!
//! ```text
//! pending  -> waiting
//! waiting  -> ready
//! waiting  -> skipped   (condition false / upstream failed)
//! waiting  -> failed    (condition evaluation error)
//! ready    -> running
//! running  -> completed
//! running  -> failed
//! running  -> timeout
//! running  -> retrying
//! timeout  -> retrying  (timeout counts toward max_retries)
//! retrying -> running
//! retrying -> timeout   (plan cancelled during backoff)
//! retrying -> failed
//! ```
//!
//! Terminal states: `completed`, `failed`, `timeout`, `skipped`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Waiting,
    Ready,
    Running,
    Completed,
    Failed,
    Timeout,
    Retrying,
    Skipped,
}

impl TaskState {
    /// Whether a task in this state will never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Skipped
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Waiting => "waiting",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Retrying => "retrying",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskState {
    type Err = TaskStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "waiting" => Ok(Self::Waiting),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "retrying" => Ok(Self::Retrying),
            "skipped" => Ok(Self::Skipped),
            other => Err(TaskStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskState`] string.
#[derive(Debug, Clone)]
pub struct TaskStateParseError(pub String);

impl fmt::Display for TaskStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task state: {:?}", self.0)
    }
}

impl std::error::Error for TaskStateParseError {}

/// Check whether `from -> to` is an edge of the state graph.
pub fn is_valid_transition(from: TaskState, to: TaskState) -> bool {
    use TaskState::*;
    matches!(
        (from, to),
        (Pending, Waiting)
            | (Waiting, Ready)
            | (Waiting, Skipped)
            | (Waiting, Failed)
            | (Ready, Running)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Timeout)
            | (Running, Retrying)
            | (Timeout, Retrying)
            | (Retrying, Running)
            | (Retrying, Timeout)
            | (Retrying, Failed)
    )
}

/// A recorded state transition, as persisted in task logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from_state: TaskState,
    pub to_state: TaskState,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
}
