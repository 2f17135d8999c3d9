//! Per-task execution logs.
//!
//! One [`TaskLog`] per task, keyed by `trace_id` (stable across retries
//! and fallback re-dispatch), flushed atomically to
//! `<dir>/<trace_id>.json` after every state transition and retry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::write_json_atomic;
use crate::scheduler::state::StateTransition;

/// DAG placement and static attributes of the task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub layer: usize,
    pub dependencies: Vec<String>,
    pub task_type: String,
    pub priority: String,
    /// Number of tasks sharing this task's layer.
    pub parallel_tasks: usize,
    /// Total depth of the plan's DAG.
    pub depth: usize,
}

/// Creation/update/start/finish timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTimestamps {
    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,
}

/// Final outcome of the task as reported by the agent (or synthesized on
/// timeout/skip).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_sec: Option<f64>,
    #[serde(default)]
    pub output_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// The agent's response envelope, verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<serde_json::Value>,
}

/// One retry of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRecord {
    /// Retry number, starting at 1.
    pub attempt: u32,
    /// The agent the retry was routed to.
    pub target: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub delay_sec: f64,
}

/// The complete per-task log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLog {
    pub trace_id: String,
    pub plan_id: String,
    pub task_id: String,
    pub agent: String,
    pub execution_metadata: ExecutionMetadata,
    pub state_transitions: Vec<StateTransition>,
    pub timestamps: TaskTimestamps,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_result: Option<ExecutionResult>,
    #[serde(default)]
    pub retry_history: Vec<RetryRecord>,
    pub task_content: serde_json::Value,
}

/// Writer for task logs. Single-writer by construction (only the
/// scheduler mutates it), so a plain mutex suffices.
pub struct TaskLogger {
    dir: PathBuf,
    logs: Mutex<HashMap<String, TaskLog>>,
}

impl TaskLogger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            logs: Mutex::new(HashMap::new()),
        }
    }

    /// Register a fresh task log and flush it.
    pub fn create(&self, log: TaskLog) {
        let mut logs = self.logs.lock().unwrap();
        self.flush(&log);
        logs.insert(log.trace_id.clone(), log);
    }

    /// Append a state transition, maintain the timestamp block, and
    /// flush.
    pub fn record_transition(&self, trace_id: &str, transition: StateTransition) {
        let mut logs = self.logs.lock().unwrap();
        let Some(log) = logs.get_mut(trace_id) else {
            tracing::warn!(trace_id, "transition for unknown task log");
            return;
        };
        log.timestamps.last_updated = transition.timestamp;
        if transition.to_state == crate::scheduler::state::TaskState::Running
            && log.timestamps.started.is_none()
        {
            log.timestamps.started = Some(transition.timestamp);
        }
        if transition.to_state.is_terminal() {
            log.timestamps.completed = Some(transition.timestamp);
        }
        log.state_transitions.push(transition);
        self.flush(log);
    }

    /// Append a retry record and flush.
    pub fn record_retry(&self, trace_id: &str, retry: RetryRecord) {
        let mut logs = self.logs.lock().unwrap();
        let Some(log) = logs.get_mut(trace_id) else {
            tracing::warn!(trace_id, "retry for unknown task log");
            return;
        };
        log.timestamps.last_updated = retry.timestamp;
        log.retry_history.push(retry);
        self.flush(log);
    }

    /// Store the final execution result and flush.
    pub fn set_result(&self, trace_id: &str, result: ExecutionResult) {
        let mut logs = self.logs.lock().unwrap();
        let Some(log) = logs.get_mut(trace_id) else {
            tracing::warn!(trace_id, "result for unknown task log");
            return;
        };
        log.execution_result = Some(result);
        self.flush(log);
    }

    /// A copy of a task log (tests and the CLI).
    pub fn get(&self, trace_id: &str) -> Option<TaskLog> {
        self.logs.lock().unwrap().get(trace_id).cloned()
    }

    fn flush(&self, log: &TaskLog) {
        let path = self.dir.join(format!("{}.json", log.trace_id));
        if let Err(e) = write_json_atomic(&path, log) {
            tracing::warn!(path = %path.display(), error = %e, "failed to flush task log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::state::TaskState;

    fn new_log(trace_id: &str) -> TaskLog {
        let now = Utc::now();
        TaskLog {
            trace_id: trace_id.to_owned(),
            plan_id: "p".to_owned(),
            task_id: "T1".to_owned(),
            agent: "CA".to_owned(),
            execution_metadata: ExecutionMetadata {
                layer: 0,
                dependencies: vec![],
                task_type: "custom".to_owned(),
                priority: "medium".to_owned(),
                parallel_tasks: 1,
                depth: 1,
            },
            state_transitions: vec![],
            timestamps: TaskTimestamps {
                created: now,
                last_updated: now,
                started: None,
                completed: None,
            },
            execution_result: None,
            retry_history: vec![],
            task_content: serde_json::json!({}),
        }
    }

    fn transition(from: TaskState, to: TaskState) -> StateTransition {
        StateTransition {
            from_state: from,
            to_state: to,
            timestamp: Utc::now(),
            reason: None,
            retry_count: None,
        }
    }

    #[test]
    fn transitions_update_timestamps() {
        let dir = tempfile::TempDir::new().unwrap();
        let logger = TaskLogger::new(dir.path());
        logger.create(new_log("t-1"));

        logger.record_transition("t-1", transition(TaskState::Pending, TaskState::Waiting));
        logger.record_transition("t-1", transition(TaskState::Waiting, TaskState::Ready));
        logger.record_transition("t-1", transition(TaskState::Ready, TaskState::Running));
        let log = logger.get("t-1").unwrap();
        assert!(log.timestamps.started.is_some());
        assert!(log.timestamps.completed.is_none());

        logger.record_transition("t-1", transition(TaskState::Running, TaskState::Completed));
        let log = logger.get("t-1").unwrap();
        assert!(log.timestamps.completed.is_some());
        assert_eq!(log.state_transitions.len(), 4);
    }

    #[test]
    fn log_file_is_written_after_each_mutation() {
        let dir = tempfile::TempDir::new().unwrap();
        let logger = TaskLogger::new(dir.path());
        logger.create(new_log("t-2"));

        let path = dir.path().join("t-2.json");
        assert!(path.exists());

        logger.set_result(
            "t-2",
            ExecutionResult {
                status: "success".to_owned(),
                score: Some(0.95),
                duration_sec: Some(1.2),
                output_files: vec!["out.json".to_owned()],
                error_message: None,
                raw_response: None,
            },
        );

        let parsed: TaskLog =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.execution_result.unwrap().score, Some(0.95));
    }

    #[test]
    fn retry_history_accumulates() {
        let dir = tempfile::TempDir::new().unwrap();
        let logger = TaskLogger::new(dir.path());
        logger.create(new_log("t-3"));

        for attempt in 1..=2 {
            logger.record_retry(
                "t-3",
                RetryRecord {
                    attempt,
                    target: "CC".to_owned(),
                    reason: "agent_reported_failure".to_owned(),
                    timestamp: Utc::now(),
                    delay_sec: 1.0,
                },
            );
        }
        assert_eq!(logger.get("t-3").unwrap().retry_history.len(), 2);
    }
}
