//! DAG-aware task scheduler: runs a plan to completion by dispatching
//! tasks layer by layer, enforcing concurrency limits, eligibility
//! conditions, and retry/fallback/timeout policy.
//!
//! The scheduler is a single supervising loop. Within a layer every
//! eligible task is driven by its own spawned worker (bounded by a
//! semaphore); the loop does not advance to layer `N+1` until every task
//! in layer `N` is terminal. Workers report back over an mpsc channel,
//! and the runtime context is extended with each task's outcome before
//! the next layer's eligibility checks.

pub mod retry;
pub mod state;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use serde_json::json;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use archon_postbox::{AgentId, Envelope, EnvelopeError, MessageType, PostboxStore, ResultStatus};

use crate::alert::AlertEvaluator;
use crate::clock::Clock;
use crate::condition;
use crate::context::RuntimeContext;
use crate::handler::{AttemptOutcome, HandlerRegistry, TaskDispatch};
use crate::plan::{Dag, Plan, Task};
use crate::trace::task_log::{ExecutionMetadata, TaskTimestamps};
use crate::trace::{
    DagAnalysis, ExecutionResult, ExecutionSummary, PlanStatus, RetryRecord, TaskLog, TaskLogger,
    TimelineEvent, TimelineEventKind, TraceLogger,
};

pub use retry::{RetryPolicy, DEFAULT_BACKOFF_CAP};
pub use state::{is_valid_transition, StateTransition, TaskState};

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Bound on concurrently running workers.
    pub max_concurrent_tasks: usize,
    /// Overall plan timeout; a plan-level `timeout` field overrides it.
    pub plan_timeout: Duration,
    /// Ceiling for exponential backoff delays.
    pub backoff_cap: Duration,
    /// Treat `partial_success` results as success for scheduling.
    pub partial_success_ok: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            plan_timeout: Duration::from_secs(3600),
            backoff_cap: DEFAULT_BACKOFF_CAP,
            partial_success_ok: false,
        }
    }
}

/// Result of running a plan to termination.
#[derive(Debug, Clone)]
pub struct SchedulerOutcome {
    pub status: PlanStatus,
    pub execution_id: String,
    /// Final state of every task, keyed by task id.
    pub task_states: BTreeMap<String, TaskState>,
    pub summary: ExecutionSummary,
    pub trace_path: PathBuf,
}

/// The orchestrator.
pub struct Scheduler {
    store: PostboxStore,
    registry: Arc<HandlerRegistry>,
    alerts: Option<Arc<AlertEvaluator>>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    log_dir: PathBuf,
}

impl Scheduler {
    pub fn new(
        store: PostboxStore,
        registry: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            registry,
            alerts: None,
            clock,
            config,
            log_dir: log_dir.into(),
        }
    }

    /// Attach an alert evaluator; every incoming result/error envelope is
    /// matched against its rules.
    pub fn with_alerts(mut self, alerts: Arc<AlertEvaluator>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Execute `plan` to termination.
    pub async fn run(
        &self,
        plan: &Plan,
        dag: &Dag,
        cancel: CancellationToken,
    ) -> Result<SchedulerOutcome> {
        let execution_id = Uuid::new_v4().to_string();
        let start_time = self.clock.now();

        // Postboxes for every agent the plan touches, plus our own.
        self.store
            .ensure_agent(AgentId::Arch.as_str())
            .context("creating orchestrator postbox")?;
        for agent in dag.agents_involved() {
            self.store
                .ensure_agent(agent.as_str())
                .with_context(|| format!("creating postbox for {agent}"))?;
        }

        let trace_path = self
            .log_dir
            .join("traces")
            .join(format!("{}_{}.json", plan.plan_id, execution_id));
        let metadata = json!({
            "plan_id": plan.plan_id,
            "name": plan.name,
            "version": plan.version,
            "description": plan.description,
            "task_count": plan.tasks.len(),
        });
        let tracer = TraceLogger::new(
            &trace_path,
            &plan.plan_id,
            &execution_id,
            metadata,
            DagAnalysis::from_dag(plan, dag),
        );
        let task_logger = TaskLogger::new(self.log_dir.join("tasks"));

        let shared = Arc::new(RunShared {
            store: self.store.clone(),
            registry: Arc::clone(&self.registry),
            alerts: self.alerts.clone(),
            clock: Arc::clone(&self.clock),
            tracer,
            task_logger,
            plan_id: plan.plan_id.clone(),
            partial_success_ok: self.config.partial_success_ok,
            backoff_cap: self.config.backoff_cap,
        });

        shared.tracer.record(TimelineEvent {
            event: TimelineEventKind::PlanStarted,
            timestamp: start_time,
            task_id: None,
            layer: None,
            detail: None,
        });
        tracing::info!(plan_id = %plan.plan_id, execution_id = %execution_id, "plan started");

        // Create every task record up front: pending -> waiting.
        let mut runs = create_task_runs(plan, dag, &shared)?;

        let mut context = RuntimeContext::seeded(&plan.context);
        let plan_timeout = plan.timeout.unwrap_or(self.config.plan_timeout);
        let deadline = tokio::time::Instant::now() + plan_timeout;
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_tasks.max(1)));
        let run_cancel = cancel.child_token();

        let mut total_retries: u32 = 0;
        let mut aborting = false;
        let mut abort_plan = false;

        for (layer_idx, layer) in dag.layers().iter().enumerate() {
            if aborting || abort_plan {
                // Stop dispatching: everything not yet terminal is
                // skipped.
                for &i in layer {
                    if runs[i].state == TaskState::Waiting {
                        skip_task(
                            &shared,
                            &mut runs[i],
                            &plan.tasks[i],
                            &mut context,
                            "plan_cancelled",
                        )?;
                    }
                }
                continue;
            }

            shared.tracer.record(TimelineEvent {
                event: TimelineEventKind::LayerStarted,
                timestamp: shared.clock.now(),
                task_id: None,
                layer: Some(layer_idx),
                detail: None,
            });

            // Eligibility pass, in task_id order. Dependency states are
            // stable here: dependencies live in earlier layers.
            let states: Vec<TaskState> = runs.iter().map(|r| r.state).collect();
            let mut dispatched: Vec<usize> = Vec::new();
            for &i in layer {
                let task = &plan.tasks[i];
                let upstream_ok = task.dependencies.iter().all(|dep| {
                    let di = dag.index_of(dep).expect("dependency resolved at build");
                    matches!(states[di], TaskState::Completed | TaskState::Skipped)
                });
                if !upstream_ok {
                    skip_task(&shared, &mut runs[i], task, &mut context, "upstream_failed")?;
                    continue;
                }

                match check_eligibility(task, &context) {
                    Eligibility::Eligible => {
                        shared.transition(
                            &task.task_id,
                            &runs[i].trace_id,
                            TaskState::Waiting,
                            TaskState::Ready,
                            None,
                            None,
                        )?;
                        runs[i].state = TaskState::Ready;
                        dispatched.push(i);
                    }
                    Eligibility::Skip(reason) => {
                        skip_task(&shared, &mut runs[i], task, &mut context, reason)?;
                    }
                    Eligibility::EvalError(message) => {
                        fail_at_eligibility(&shared, &mut runs[i], task, &mut context, &message)?;
                    }
                }
            }

            // Dispatch: one worker per ready task, bounded by the
            // semaphore.
            let (tx, mut rx) = mpsc::channel::<WorkerDone>(dispatched.len().max(1));
            for &i in &dispatched {
                let permit = Arc::clone(&semaphore)
                    .acquire_owned()
                    .await
                    .context("scheduler semaphore closed")?;
                let worker = TaskWorker {
                    shared: Arc::clone(&shared),
                    index: i,
                    task: plan.tasks[i].clone(),
                    trace_id: runs[i].trace_id.clone(),
                    context: context.clone(),
                    cancel: run_cancel.clone(),
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let done = worker.run().await;
                    drop(permit);
                    let _ = tx.send(done).await;
                });
            }
            drop(tx);

            // Collect the layer, watching the plan deadline and external
            // cancellation.
            let mut pending = dispatched.len();
            while pending > 0 {
                tokio::select! {
                    maybe_done = rx.recv() => {
                        let Some(done) = maybe_done else {
                            // A worker died without reporting; the tasks it
                            // owned are handled below.
                            break;
                        };
                        pending -= 1;
                        total_retries += done.retries_used;
                        abort_plan |= done.abort_plan;
                        let task_id = plan.tasks[done.index].task_id.clone();
                        runs[done.index].state = done.state;
                        runs[done.index].score = done.score;
                        context.record_outcome(&task_id, &done.status, done.score, done.success);
                    }
                    _ = tokio::time::sleep_until(deadline), if !aborting => {
                        tracing::warn!(plan_id = %plan.plan_id, "plan timeout elapsed, cancelling in-flight tasks");
                        run_cancel.cancel();
                        aborting = true;
                    }
                    _ = run_cancel.cancelled(), if !aborting => {
                        tracing::info!(plan_id = %plan.plan_id, "plan cancelled, draining in-flight tasks");
                        aborting = true;
                    }
                }
            }

            // Any dispatched task still non-terminal lost its worker.
            for &i in &dispatched {
                if !runs[i].state.is_terminal() {
                    tracing::error!(task_id = %plan.tasks[i].task_id, "worker vanished without a result");
                    runs[i].state = TaskState::Failed;
                    context.record_outcome(&plan.tasks[i].task_id, "failed", None, false);
                    abort_plan = true;
                }
            }

            shared.tracer.record(TimelineEvent {
                event: TimelineEventKind::LayerCompleted,
                timestamp: shared.clock.now(),
                task_id: None,
                layer: Some(layer_idx),
                detail: None,
            });
        }

        // Final status and summary.
        let status = if aborting {
            PlanStatus::Timeout
        } else if abort_plan {
            PlanStatus::Failure
        } else {
            compute_plan_status(dag, &runs)
        };

        let end_time = shared.clock.now();
        shared.tracer.record(TimelineEvent {
            event: match status {
                PlanStatus::Success => TimelineEventKind::PlanCompleted,
                _ => TimelineEventKind::PlanFailed,
            },
            timestamp: end_time,
            task_id: None,
            layer: None,
            detail: Some(status.to_string()),
        });

        let counts = StateCounts::from_runs(&runs);
        let scored: Vec<f64> = runs.iter().filter_map(|r| r.score).collect();
        let avg_task_score = if scored.is_empty() {
            None
        } else {
            Some(scored.iter().sum::<f64>() / scored.len() as f64)
        };

        let summary = shared.tracer.finalize(
            status,
            start_time,
            end_time,
            counts.completed,
            counts.failed,
            counts.timeout,
            counts.skipped,
            total_retries,
            avg_task_score,
        );

        tracing::info!(
            plan_id = %plan.plan_id,
            status = %status,
            completed = counts.completed,
            failed = counts.failed,
            timeout = counts.timeout,
            skipped = counts.skipped,
            "plan terminated"
        );

        let task_states = runs
            .iter()
            .map(|r| (plan.tasks[r.index].task_id.clone(), r.state))
            .collect();

        Ok(SchedulerOutcome {
            status,
            execution_id,
            task_states,
            summary,
            trace_path,
        })
    }
}

// ---------------------------------------------------------------------------
// Per-run shared state
// ---------------------------------------------------------------------------

struct RunShared {
    store: PostboxStore,
    registry: Arc<HandlerRegistry>,
    alerts: Option<Arc<AlertEvaluator>>,
    clock: Arc<dyn Clock>,
    tracer: TraceLogger,
    task_logger: TaskLogger,
    plan_id: String,
    partial_success_ok: bool,
    backoff_cap: Duration,
}

impl RunShared {
    /// Execute a validated state transition: record it in the task log
    /// and emit the corresponding timeline event.
    fn transition(
        &self,
        task_id: &str,
        trace_id: &str,
        from: TaskState,
        to: TaskState,
        reason: Option<String>,
        retry_count: Option<u32>,
    ) -> Result<()> {
        if !is_valid_transition(from, to) {
            bail!("invalid state transition: {from} -> {to} for task {task_id}");
        }
        let now = self.clock.now();
        self.task_logger.record_transition(
            trace_id,
            StateTransition {
                from_state: from,
                to_state: to,
                timestamp: now,
                reason: reason.clone(),
                retry_count,
            },
        );
        self.tracer.record(TimelineEvent {
            event: event_for(from, to),
            timestamp: now,
            task_id: Some(task_id.to_owned()),
            layer: None,
            detail: reason,
        });
        tracing::debug!(task_id, %from, %to, "task state transition");
        Ok(())
    }
}

/// Timeline event kind for a state transition.
fn event_for(from: TaskState, to: TaskState) -> TimelineEventKind {
    match to {
        TaskState::Waiting => TimelineEventKind::TaskWaiting,
        TaskState::Ready => TimelineEventKind::TaskReady,
        TaskState::Running if from == TaskState::Retrying => TimelineEventKind::TaskRetry,
        TaskState::Running => TimelineEventKind::TaskStarted,
        TaskState::Retrying => TimelineEventKind::TaskRetry,
        TaskState::Completed => TimelineEventKind::TaskCompleted,
        TaskState::Failed => TimelineEventKind::TaskFailed,
        TaskState::Timeout => TimelineEventKind::TaskTimeout,
        TaskState::Skipped => TimelineEventKind::TaskSkipped,
        TaskState::Pending => TimelineEventKind::TaskCreated,
    }
}

// ---------------------------------------------------------------------------
// Task bookkeeping
// ---------------------------------------------------------------------------

/// Mutable per-task record owned by the scheduler loop.
struct TaskRun {
    index: usize,
    trace_id: String,
    state: TaskState,
    score: Option<f64>,
}

fn create_task_runs(plan: &Plan, dag: &Dag, shared: &Arc<RunShared>) -> Result<Vec<TaskRun>> {
    let mut runs: Vec<Option<TaskRun>> = (0..plan.tasks.len()).map(|_| None).collect();
    for (layer_idx, layer) in dag.layers().iter().enumerate() {
        for &i in layer {
            let task = &plan.tasks[i];
            let trace_id = Uuid::new_v4().to_string();
            let now = shared.clock.now();

            shared.task_logger.create(TaskLog {
                trace_id: trace_id.clone(),
                plan_id: shared.plan_id.clone(),
                task_id: task.task_id.clone(),
                agent: task.agent.to_string(),
                execution_metadata: ExecutionMetadata {
                    layer: layer_idx,
                    dependencies: task.dependencies.clone(),
                    task_type: task.task_type.to_string(),
                    priority: task.priority.to_string(),
                    parallel_tasks: layer.len(),
                    depth: dag.depth(),
                },
                state_transitions: Vec::new(),
                timestamps: TaskTimestamps {
                    created: now,
                    last_updated: now,
                    started: None,
                    completed: None,
                },
                execution_result: None,
                retry_history: Vec::new(),
                task_content: task.content.clone(),
            });

            shared.tracer.record(TimelineEvent {
                event: TimelineEventKind::TaskCreated,
                timestamp: now,
                task_id: Some(task.task_id.clone()),
                layer: Some(layer_idx),
                detail: None,
            });
            shared.transition(
                &task.task_id,
                &trace_id,
                TaskState::Pending,
                TaskState::Waiting,
                None,
                None,
            )?;

            runs[i] = Some(TaskRun {
                index: i,
                trace_id,
                state: TaskState::Waiting,
                score: None,
            });
        }
    }
    Ok(runs
        .into_iter()
        .map(|r| r.expect("every task sits in exactly one layer"))
        .collect())
}

// ---------------------------------------------------------------------------
// Eligibility
// ---------------------------------------------------------------------------

enum Eligibility {
    Eligible,
    Skip(&'static str),
    EvalError(String),
}

fn check_eligibility(task: &Task, context: &RuntimeContext) -> Eligibility {
    if let Some(when) = &task.when {
        match condition::evaluate(when, context) {
            Ok(true) => {}
            Ok(false) => return Eligibility::Skip("condition_when_false"),
            Err(e) => return Eligibility::EvalError(e.to_string()),
        }
    }
    if let Some(unless) = &task.unless {
        match condition::evaluate(unless, context) {
            Ok(false) => {}
            Ok(true) => return Eligibility::Skip("condition_unless_true"),
            Err(e) => return Eligibility::EvalError(e.to_string()),
        }
    }
    Eligibility::Eligible
}

fn skip_task(
    shared: &Arc<RunShared>,
    run: &mut TaskRun,
    task: &Task,
    context: &mut RuntimeContext,
    reason: &str,
) -> Result<()> {
    shared.transition(
        &task.task_id,
        &run.trace_id,
        TaskState::Waiting,
        TaskState::Skipped,
        Some(reason.to_owned()),
        None,
    )?;
    shared.task_logger.set_result(
        &run.trace_id,
        ExecutionResult {
            status: "skipped".to_owned(),
            score: None,
            duration_sec: None,
            output_files: Vec::new(),
            error_message: Some(reason.to_owned()),
            raw_response: None,
        },
    );
    run.state = TaskState::Skipped;
    context.record_outcome(&task.task_id, "skipped", None, false);
    tracing::info!(task_id = %task.task_id, reason, "task skipped");
    Ok(())
}

fn fail_at_eligibility(
    shared: &Arc<RunShared>,
    run: &mut TaskRun,
    task: &Task,
    context: &mut RuntimeContext,
    message: &str,
) -> Result<()> {
    shared.transition(
        &task.task_id,
        &run.trace_id,
        TaskState::Waiting,
        TaskState::Failed,
        Some("condition_eval_error".to_owned()),
        None,
    )?;
    shared.task_logger.set_result(
        &run.trace_id,
        ExecutionResult {
            status: "failed".to_owned(),
            score: None,
            duration_sec: None,
            output_files: Vec::new(),
            error_message: Some(message.to_owned()),
            raw_response: None,
        },
    );
    run.state = TaskState::Failed;
    context.record_outcome(&task.task_id, "failed", None, false);
    tracing::error!(task_id = %task.task_id, error = %message, "condition evaluation failed");
    Ok(())
}

// ---------------------------------------------------------------------------
// Plan status
// ---------------------------------------------------------------------------

struct StateCounts {
    completed: usize,
    failed: usize,
    timeout: usize,
    skipped: usize,
}

impl StateCounts {
    fn from_runs(runs: &[TaskRun]) -> Self {
        let mut counts = Self {
            completed: 0,
            failed: 0,
            timeout: 0,
            skipped: 0,
        };
        for run in runs {
            match run.state {
                TaskState::Completed => counts.completed += 1,
                TaskState::Failed => counts.failed += 1,
                TaskState::Timeout => counts.timeout += 1,
                TaskState::Skipped => counts.skipped += 1,
                _ => {}
            }
        }
        counts
    }
}

fn compute_plan_status(dag: &Dag, runs: &[TaskRun]) -> PlanStatus {
    let counts = StateCounts::from_runs(runs);
    if counts.failed + counts.timeout == 0 {
        return PlanStatus::Success;
    }
    if counts.completed == 0 {
        return PlanStatus::Failure;
    }
    // A broken critical path with nothing completing downstream is a
    // failure even when independent subtrees succeeded.
    for task_id in dag.critical_path() {
        let i = dag.index_of(task_id).expect("critical path task exists");
        if matches!(runs[i].state, TaskState::Failed | TaskState::Timeout) {
            let downstream = dag.descendants_of(i);
            if downstream
                .iter()
                .all(|&d| runs[d].state != TaskState::Completed)
            {
                return PlanStatus::Failure;
            }
        }
    }
    PlanStatus::PartialSuccess
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Message sent from a worker back to the scheduler loop.
struct WorkerDone {
    index: usize,
    state: TaskState,
    /// Status string recorded in the runtime context.
    status: String,
    score: Option<f64>,
    success: bool,
    retries_used: u32,
    /// Set when the failure indicates an orchestrator bug (outgoing
    /// envelope validation, state machine violation).
    abort_plan: bool,
}

/// Drives one task through dispatch, result classification, and
/// retry/fallback until a terminal state.
struct TaskWorker {
    shared: Arc<RunShared>,
    index: usize,
    task: Task,
    trace_id: String,
    context: RuntimeContext,
    cancel: CancellationToken,
}

/// Classification of one attempt's outcome.
enum Attempt {
    Succeeded { status: ResultStatus, envelope: Envelope },
    RetryableFailure { reason: String, envelope: Option<Envelope> },
    Fatal { reason: &'static str, envelope: Option<Envelope>, abort_plan: bool },
    TimedOut,
    Cancelled,
}

impl TaskWorker {
    async fn run(self) -> WorkerDone {
        match self.drive().await {
            Ok(done) => done,
            Err(e) => {
                tracing::error!(
                    task_id = %self.task.task_id,
                    error = %e,
                    "worker failed with internal error"
                );
                WorkerDone {
                    index: self.index,
                    state: TaskState::Failed,
                    status: "failed".to_owned(),
                    score: None,
                    success: false,
                    retries_used: 0,
                    abort_plan: true,
                }
            }
        }
    }

    async fn drive(&self) -> Result<WorkerDone> {
        let policy = RetryPolicy::for_task(&self.task, self.shared.backoff_cap);
        let handler = self.shared.registry.resolve(self.task.task_type);

        let mut retries_used: u32 = 0;
        let mut target = self.task.agent;
        let mut from_state = TaskState::Ready;

        loop {
            self.transition(from_state, TaskState::Running, None, Some(retries_used))?;
            self.shared
                .tracer
                .record_running_delta(self.shared.clock.now(), 1);

            let dispatch = TaskDispatch {
                task: self.task.clone(),
                plan_id: self.shared.plan_id.clone(),
                trace_id: self.trace_id.clone(),
                attempt: retries_used,
                target,
                context: self.context.clone(),
            };
            let outcome = handler.execute(&dispatch, &self.cancel).await;

            self.shared
                .tracer
                .record_running_delta(self.shared.clock.now(), -1);

            let attempt = self.classify(outcome).await;

            match attempt {
                Attempt::Succeeded { status, envelope } => {
                    self.transition(
                        TaskState::Running,
                        TaskState::Completed,
                        None,
                        Some(retries_used),
                    )?;
                    self.record_result(&status.to_string(), Some(&envelope), None);
                    return Ok(WorkerDone {
                        index: self.index,
                        state: TaskState::Completed,
                        status: status.to_string(),
                        score: envelope.score(),
                        success: true,
                        retries_used,
                        abort_plan: false,
                    });
                }
                Attempt::Cancelled => {
                    self.transition(
                        TaskState::Running,
                        TaskState::Timeout,
                        Some("plan_cancelled".to_owned()),
                        Some(retries_used),
                    )?;
                    self.record_result("timeout", None, Some("plan_cancelled"));
                    return Ok(self.done_failure(TaskState::Timeout, "timeout", retries_used));
                }
                Attempt::Fatal {
                    reason,
                    envelope,
                    abort_plan,
                } => {
                    self.transition(
                        TaskState::Running,
                        TaskState::Failed,
                        Some(reason.to_owned()),
                        Some(retries_used),
                    )?;
                    self.record_result("failed", envelope.as_ref(), Some(reason));
                    let mut done = self.done_failure(TaskState::Failed, "failed", retries_used);
                    done.abort_plan = abort_plan;
                    return Ok(done);
                }
                Attempt::TimedOut => {
                    self.transition(
                        TaskState::Running,
                        TaskState::Timeout,
                        Some("no_response".to_owned()),
                        Some(retries_used),
                    )?;
                    if !policy.can_retry(retries_used) {
                        self.record_result("timeout", None, Some("no_response"));
                        return Ok(self.done_failure(TaskState::Timeout, "timeout", retries_used));
                    }
                    match self
                        .backoff(&policy, TaskState::Timeout, "no_response", retries_used, &mut target)
                        .await?
                    {
                        BackoffOutcome::Retry => {
                            retries_used += 1;
                            from_state = TaskState::Retrying;
                        }
                        BackoffOutcome::Cancelled => {
                            self.record_result("timeout", None, Some("plan_cancelled"));
                            return Ok(self.done_failure(
                                TaskState::Timeout,
                                "timeout",
                                retries_used,
                            ));
                        }
                    }
                }
                Attempt::RetryableFailure { reason, envelope } => {
                    if !policy.can_retry(retries_used) {
                        self.transition(
                            TaskState::Running,
                            TaskState::Failed,
                            Some(reason.clone()),
                            Some(retries_used),
                        )?;
                        self.record_result("failed", envelope.as_ref(), Some(&reason));
                        return Ok(self.done_failure(TaskState::Failed, "failed", retries_used));
                    }
                    match self
                        .backoff(&policy, TaskState::Running, &reason, retries_used, &mut target)
                        .await?
                    {
                        BackoffOutcome::Retry => {
                            retries_used += 1;
                            from_state = TaskState::Retrying;
                        }
                        BackoffOutcome::Cancelled => {
                            self.record_result("timeout", None, Some("plan_cancelled"));
                            return Ok(self.done_failure(
                                TaskState::Timeout,
                                "timeout",
                                retries_used,
                            ));
                        }
                    }
                }
            }
        }
    }

    /// Transition into `retrying`, sleep the backoff delay
    /// (cancellation-aware), pick the retry target, and record the retry.
    async fn backoff(
        &self,
        policy: &RetryPolicy,
        from: TaskState,
        reason: &str,
        retries_used: u32,
        target: &mut AgentId,
    ) -> Result<BackoffOutcome> {
        let delay = policy.backoff_delay(retries_used);
        self.transition(
            from,
            TaskState::Retrying,
            Some(reason.to_owned()),
            Some(retries_used),
        )?;

        if !delay.is_zero() {
            tokio::select! {
                _ = self.shared.clock.sleep(delay) => {}
                _ = self.cancel.cancelled() => {
                    self.transition(
                        TaskState::Retrying,
                        TaskState::Timeout,
                        Some("plan_cancelled".to_owned()),
                        Some(retries_used),
                    )?;
                    return Ok(BackoffOutcome::Cancelled);
                }
            }
        } else if self.cancel.is_cancelled() {
            self.transition(
                TaskState::Retrying,
                TaskState::Timeout,
                Some("plan_cancelled".to_owned()),
                Some(retries_used),
            )?;
            return Ok(BackoffOutcome::Cancelled);
        }

        let next_retry = retries_used + 1;
        // Fallback takes over from the second attempt onward.
        if next_retry == 1 {
            if let Some(fallback) = self.task.fallback_agent {
                *target = fallback;
            }
        }

        self.shared.task_logger.record_retry(
            &self.trace_id,
            RetryRecord {
                attempt: next_retry,
                target: target.to_string(),
                reason: reason.to_owned(),
                timestamp: self.shared.clock.now(),
                delay_sec: delay.as_secs_f64(),
            },
        );
        tracing::info!(
            task_id = %self.task.task_id,
            retry = next_retry,
            target = %target,
            delay_sec = delay.as_secs_f64(),
            reason,
            "retrying task"
        );
        Ok(BackoffOutcome::Retry)
    }

    /// Classify what one attempt produced.
    async fn classify(&self, outcome: Result<AttemptOutcome>) -> Attempt {
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                // An outgoing envelope that fails validation is a
                // programmer error and aborts the plan; anything else
                // (inbox write failure) is a retryable dispatch error.
                if e.downcast_ref::<EnvelopeError>().is_some() {
                    tracing::error!(task_id = %self.task.task_id, error = %e, "outgoing envelope invalid");
                    return Attempt::Fatal {
                        reason: "envelope_validation",
                        envelope: None,
                        abort_plan: true,
                    };
                }
                tracing::warn!(task_id = %self.task.task_id, error = %e, "dispatch failed");
                return Attempt::RetryableFailure {
                    reason: "dispatch_error".to_owned(),
                    envelope: None,
                };
            }
        };

        match outcome {
            AttemptOutcome::TimedOut => Attempt::TimedOut,
            AttemptOutcome::Cancelled => Attempt::Cancelled,
            AttemptOutcome::Response(envelope) => {
                if let Err(e) = envelope.validate() {
                    tracing::warn!(task_id = %self.task.task_id, error = %e, "agent response failed validation");
                    return Attempt::Fatal {
                        reason: "invalid_response",
                        envelope: Some(envelope),
                        abort_plan: false,
                    };
                }

                if let Some(alerts) = &self.shared.alerts {
                    alerts.evaluate(&envelope).await;
                }

                match envelope.kind {
                    MessageType::TaskResult => {
                        let status = envelope
                            .result_status()
                            .expect("validated task_result has a status");
                        match status {
                            ResultStatus::Success => Attempt::Succeeded {
                                status,
                                envelope,
                            },
                            ResultStatus::PartialSuccess if self.shared.partial_success_ok => {
                                Attempt::Succeeded { status, envelope }
                            }
                            _ => Attempt::RetryableFailure {
                                reason: "agent_reported_failure".to_owned(),
                                envelope: Some(envelope),
                            },
                        }
                    }
                    MessageType::Error => Attempt::RetryableFailure {
                        reason: "agent_error".to_owned(),
                        envelope: Some(envelope),
                    },
                    MessageType::NeedsInput => Attempt::Fatal {
                        reason: "needs_input_unsupported",
                        envelope: Some(envelope),
                        abort_plan: false,
                    },
                    _ => Attempt::Fatal {
                        reason: "unexpected_message_type",
                        envelope: Some(envelope),
                        abort_plan: false,
                    },
                }
            }
        }
    }

    fn transition(
        &self,
        from: TaskState,
        to: TaskState,
        reason: Option<String>,
        retry_count: Option<u32>,
    ) -> Result<()> {
        self.shared
            .transition(&self.task.task_id, &self.trace_id, from, to, reason, retry_count)
    }

    fn record_result(&self, status: &str, envelope: Option<&Envelope>, error: Option<&str>) {
        let output_files = envelope
            .and_then(|e| e.payload.get("output_files"))
            .and_then(|v| v.as_array())
            .map(|files| {
                files
                    .iter()
                    .filter_map(|f| f.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();
        let error_message = error
            .map(str::to_owned)
            .or_else(|| envelope.and_then(|e| e.error_message().map(str::to_owned)));

        self.shared.task_logger.set_result(
            &self.trace_id,
            ExecutionResult {
                status: status.to_owned(),
                score: envelope.and_then(Envelope::score),
                duration_sec: envelope.and_then(Envelope::duration_sec),
                output_files,
                error_message,
                raw_response: envelope.and_then(|e| serde_json::to_value(e).ok()),
            },
        );
        // The orchestrator observes outcomes into its own agent log; it
        // never writes another agent's log.
        let entry = json!({
            "timestamp": self.shared.clock.now(),
            "plan_id": self.shared.plan_id,
            "task_id": self.task.task_id,
            "trace_id": self.trace_id,
            "status": status,
        });
        if let Err(e) = self
            .shared
            .store
            .append_task_log(AgentId::Arch.as_str(), &entry)
        {
            tracing::warn!(error = %e, "failed to append orchestrator task log");
        }
    }

    fn done_failure(&self, state: TaskState, status: &str, retries_used: u32) -> WorkerDone {
        WorkerDone {
            index: self.index,
            state,
            status: status.to_owned(),
            score: None,
            success: false,
            retries_used,
            abort_plan: false,
        }
    }
}

enum BackoffOutcome {
    Retry,
    Cancelled,
}
