//! Plan execution trace: the chronological record of everything that
//! happened during a run, plus the per-task logs ([`task_log`]).
//!
//! The trace logger is a pure observer. It is driven by the scheduler's
//! state transitions and never drives state itself; a failed flush is
//! logged and swallowed.

pub mod task_log;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plan::{Dag, Plan};

pub use task_log::{ExecutionResult, RetryRecord, TaskLog, TaskLogger};

// ---------------------------------------------------------------------------
// Plan status
// ---------------------------------------------------------------------------

/// Final status of a plan run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Success,
    PartialSuccess,
    Failure,
    Timeout,
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Timeline
// ---------------------------------------------------------------------------

/// Kinds of timeline events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventKind {
    PlanStarted,
    TaskCreated,
    TaskWaiting,
    TaskReady,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskTimeout,
    TaskRetry,
    TaskSkipped,
    LayerStarted,
    LayerCompleted,
    PlanCompleted,
    PlanFailed,
}

impl fmt::Display for TimelineEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PlanStarted => "plan_started",
            Self::TaskCreated => "task_created",
            Self::TaskWaiting => "task_waiting",
            Self::TaskReady => "task_ready",
            Self::TaskStarted => "task_started",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
            Self::TaskTimeout => "task_timeout",
            Self::TaskRetry => "task_retry",
            Self::TaskSkipped => "task_skipped",
            Self::LayerStarted => "layer_started",
            Self::LayerCompleted => "layer_completed",
            Self::PlanCompleted => "plan_completed",
            Self::PlanFailed => "plan_failed",
        };
        f.write_str(s)
    }
}

/// One entry in the execution timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub event: TimelineEventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

// ---------------------------------------------------------------------------
// Trace document
// ---------------------------------------------------------------------------

/// Static DAG analysis embedded in the trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagAnalysis {
    pub execution_layers: Vec<Vec<String>>,
    pub critical_path: Vec<String>,
    pub parallelizable_tasks: usize,
    pub total_depth: usize,
    pub agents_involved: Vec<String>,
}

impl DagAnalysis {
    pub fn from_dag(plan: &Plan, dag: &Dag) -> Self {
        let execution_layers = dag
            .layers()
            .iter()
            .map(|layer| {
                layer
                    .iter()
                    .map(|&i| plan.tasks[i].task_id.clone())
                    .collect()
            })
            .collect();
        Self {
            execution_layers,
            critical_path: dag.critical_path().to_vec(),
            parallelizable_tasks: dag.parallelizable_tasks(),
            total_depth: dag.depth(),
            agents_involved: dag
                .agents_involved()
                .iter()
                .map(|a| a.to_string())
                .collect(),
        }
    }
}

/// Aggregate figures computed at plan termination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_duration_sec: f64,
    pub status: PlanStatus,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub tasks_timeout: usize,
    pub tasks_skipped: usize,
    pub total_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_task_score: Option<f64>,
    /// Time-weighted average number of concurrently running tasks.
    pub parallelism_achieved: f64,
}

/// The complete per-plan execution trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub plan_id: String,
    pub execution_id: String,
    pub plan_metadata: serde_json::Value,
    pub dag_analysis: DagAnalysis,
    pub execution_timeline: Vec<TimelineEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<ExecutionSummary>,
}

// ---------------------------------------------------------------------------
// Trace logger
// ---------------------------------------------------------------------------

struct TraceInner {
    trace: ExecutionTrace,
    /// (timestamp, +1/-1) markers for running-task intervals, used to
    /// compute `parallelism_achieved`.
    running_deltas: Vec<(DateTime<Utc>, i64)>,
}

/// Accumulates the execution trace and flushes it to disk after every
/// event.
pub struct TraceLogger {
    path: PathBuf,
    inner: Mutex<TraceInner>,
}

impl TraceLogger {
    pub fn new(
        path: impl Into<PathBuf>,
        plan_id: impl Into<String>,
        execution_id: impl Into<String>,
        plan_metadata: serde_json::Value,
        dag_analysis: DagAnalysis,
    ) -> Self {
        let trace = ExecutionTrace {
            plan_id: plan_id.into(),
            execution_id: execution_id.into(),
            plan_metadata,
            dag_analysis,
            execution_timeline: Vec::new(),
            summary: None,
        };
        Self {
            path: path.into(),
            inner: Mutex::new(TraceInner {
                trace,
                running_deltas: Vec::new(),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a timeline event and flush.
    ///
    /// The timeline is kept ordered by `(timestamp, task_id)`; events
    /// recorded concurrently by different workers may arrive slightly out
    /// of order, and the stable sort restores the canonical order.
    pub fn record(&self, event: TimelineEvent) {
        let mut inner = self.inner.lock().unwrap();
        inner.trace.execution_timeline.push(event);
        inner
            .trace
            .execution_timeline
            .sort_by(|a, b| {
                (a.timestamp, a.task_id.as_deref().unwrap_or(""))
                    .cmp(&(b.timestamp, b.task_id.as_deref().unwrap_or("")))
            });
        self.flush(&inner.trace);
    }

    /// Mark the start (`+1`) or end (`-1`) of a running interval.
    pub fn record_running_delta(&self, timestamp: DateTime<Utc>, delta: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.running_deltas.push((timestamp, delta));
    }

    /// Compute and store the summary, then flush one last time.
    #[allow(clippy::too_many_arguments)]
    pub fn finalize(
        &self,
        status: PlanStatus,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        tasks_completed: usize,
        tasks_failed: usize,
        tasks_timeout: usize,
        tasks_skipped: usize,
        total_retries: u32,
        avg_task_score: Option<f64>,
    ) -> ExecutionSummary {
        let mut inner = self.inner.lock().unwrap();
        let parallelism_achieved =
            weighted_parallelism(&mut inner.running_deltas, start_time, end_time);
        let summary = ExecutionSummary {
            start_time,
            end_time,
            total_duration_sec: (end_time - start_time).num_milliseconds() as f64 / 1000.0,
            status,
            tasks_completed,
            tasks_failed,
            tasks_timeout,
            tasks_skipped,
            total_retries,
            avg_task_score,
            parallelism_achieved,
        };
        inner.trace.summary = Some(summary.clone());
        self.flush(&inner.trace);
        summary
    }

    /// A copy of the current trace (tests and the CLI summary printer).
    pub fn snapshot(&self) -> ExecutionTrace {
        self.inner.lock().unwrap().trace.clone()
    }

    fn flush(&self, trace: &ExecutionTrace) {
        if let Err(e) = write_json_atomic(&self.path, trace) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to flush execution trace");
        }
    }
}

/// Time-weighted average of the running-task count over the plan window.
fn weighted_parallelism(
    deltas: &mut Vec<(DateTime<Utc>, i64)>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> f64 {
    let total_ms = (end - start).num_milliseconds();
    if total_ms <= 0 || deltas.is_empty() {
        return 0.0;
    }
    deltas.sort_by_key(|(t, _)| *t);

    let mut weighted_ms: i64 = 0;
    let mut level: i64 = 0;
    let mut cursor = start;
    for (t, delta) in deltas.iter() {
        let t = (*t).clamp(start, end);
        weighted_ms += level * (t - cursor).num_milliseconds();
        level += delta;
        cursor = t;
    }
    weighted_ms += level * (end - cursor).num_milliseconds();

    weighted_ms as f64 / total_ms as f64
}

/// Serialize `value` to `path` via a temp file and rename.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "trace".to_owned());
    let tmp = path.with_file_name(format!(".tmp-{file_name}"));
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn analysis() -> DagAnalysis {
        DagAnalysis {
            execution_layers: vec![vec!["A".into()]],
            critical_path: vec!["A".into()],
            parallelizable_tasks: 1,
            total_depth: 1,
            agents_involved: vec!["CA".into()],
        }
    }

    #[test]
    fn events_are_sorted_by_timestamp_then_task_id() {
        let dir = tempfile::TempDir::new().unwrap();
        let logger = TraceLogger::new(
            dir.path().join("trace.json"),
            "p",
            "e",
            serde_json::json!({}),
            analysis(),
        );

        let t0 = Utc::now();
        let t1 = t0 + ChronoDuration::seconds(1);

        logger.record(TimelineEvent {
            event: TimelineEventKind::TaskStarted,
            timestamp: t1,
            task_id: Some("B".into()),
            layer: None,
            detail: None,
        });
        logger.record(TimelineEvent {
            event: TimelineEventKind::TaskStarted,
            timestamp: t1,
            task_id: Some("A".into()),
            layer: None,
            detail: None,
        });
        logger.record(TimelineEvent {
            event: TimelineEventKind::PlanStarted,
            timestamp: t0,
            task_id: None,
            layer: None,
            detail: None,
        });

        let trace = logger.snapshot();
        let kinds: Vec<(TimelineEventKind, Option<String>)> = trace
            .execution_timeline
            .iter()
            .map(|e| (e.event, e.task_id.clone()))
            .collect();
        assert_eq!(kinds[0], (TimelineEventKind::PlanStarted, None));
        assert_eq!(kinds[1], (TimelineEventKind::TaskStarted, Some("A".into())));
        assert_eq!(kinds[2], (TimelineEventKind::TaskStarted, Some("B".into())));
    }

    #[test]
    fn trace_file_is_written_and_parseable() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("trace.json");
        let logger = TraceLogger::new(&path, "p", "e", serde_json::json!({}), analysis());
        logger.record(TimelineEvent {
            event: TimelineEventKind::PlanStarted,
            timestamp: Utc::now(),
            task_id: None,
            layer: None,
            detail: None,
        });

        let contents = std::fs::read_to_string(&path).unwrap();
        let parsed: ExecutionTrace = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.plan_id, "p");
        assert_eq!(parsed.execution_timeline.len(), 1);
    }

    #[test]
    fn parallelism_of_two_overlapping_tasks() {
        let start = Utc::now();
        let end = start + ChronoDuration::seconds(10);
        let mut deltas = vec![
            (start, 1),
            (start, 1),
            (start + ChronoDuration::seconds(5), -1),
            (end, -1),
        ];
        // 2 tasks for 5s, 1 task for 5s => 1.5 average.
        let p = weighted_parallelism(&mut deltas, start, end);
        assert!((p - 1.5).abs() < 0.01, "got {p}");
    }

    #[test]
    fn parallelism_with_no_activity_is_zero() {
        let start = Utc::now();
        let end = start + ChronoDuration::seconds(10);
        assert_eq!(weighted_parallelism(&mut Vec::new(), start, end), 0.0);
    }

    #[test]
    fn finalize_records_summary() {
        let dir = tempfile::TempDir::new().unwrap();
        let logger = TraceLogger::new(
            dir.path().join("trace.json"),
            "p",
            "e",
            serde_json::json!({}),
            analysis(),
        );
        let start = Utc::now();
        let end = start + ChronoDuration::seconds(2);
        let summary = logger.finalize(
            PlanStatus::Success,
            start,
            end,
            3,
            0,
            0,
            1,
            2,
            Some(0.9),
        );
        assert_eq!(summary.status, PlanStatus::Success);
        assert!((summary.total_duration_sec - 2.0).abs() < 0.01);
        assert_eq!(logger.snapshot().summary.unwrap().tasks_completed, 3);
    }
}
