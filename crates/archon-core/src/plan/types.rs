//! Closed enumerations used by plan tasks.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The kind of work a task represents. The scheduler resolves handlers by
/// task type; the default registry dispatches every type to an external
/// agent through the postbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Validation,
    DataProcessing,
    ReportGeneration,
    Notification,
    HealthCheck,
    Custom,
    TaskAssignment,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::DataProcessing => "data_processing",
            Self::ReportGeneration => "report_generation",
            Self::Notification => "notification",
            Self::HealthCheck => "health_check",
            Self::Custom => "custom",
            Self::TaskAssignment => "task_assignment",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskType {
    type Err = TaskTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "validation" => Ok(Self::Validation),
            "data_processing" => Ok(Self::DataProcessing),
            "report_generation" => Ok(Self::ReportGeneration),
            "notification" => Ok(Self::Notification),
            "health_check" => Ok(Self::HealthCheck),
            "custom" => Ok(Self::Custom),
            "task_assignment" => Ok(Self::TaskAssignment),
            other => Err(TaskTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskType`] string.
#[derive(Debug, Clone)]
pub struct TaskTypeParseError(pub String);

impl fmt::Display for TaskTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task type: {:?}", self.0)
    }
}

impl std::error::Error for TaskTypeParseError {}

// ---------------------------------------------------------------------------

/// Dispatch priority of a task. Advisory ordering hint; does not affect
/// correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = PriorityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(PriorityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Priority`] string.
#[derive(Debug, Clone)]
pub struct PriorityParseError(pub String);

impl fmt::Display for PriorityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid priority: {:?}", self.0)
    }
}

impl std::error::Error for PriorityParseError {}

// ---------------------------------------------------------------------------

/// How retry delays are computed after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Immediate,
    FixedDelay,
    ExponentialBackoff,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::ExponentialBackoff
    }
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Immediate => "immediate",
            Self::FixedDelay => "fixed_delay",
            Self::ExponentialBackoff => "exponential_backoff",
        };
        f.write_str(s)
    }
}

impl FromStr for RetryStrategy {
    type Err = RetryStrategyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "immediate" => Ok(Self::Immediate),
            "fixed_delay" => Ok(Self::FixedDelay),
            "exponential_backoff" => Ok(Self::ExponentialBackoff),
            other => Err(RetryStrategyParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RetryStrategy`] string.
#[derive(Debug, Clone)]
pub struct RetryStrategyParseError(pub String);

impl fmt::Display for RetryStrategyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid retry strategy: {:?}", self.0)
    }
}

impl std::error::Error for RetryStrategyParseError {}
