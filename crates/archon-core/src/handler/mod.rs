//! The `TaskHandler` trait -- the adapter interface between the scheduler
//! and whatever executes a task.
//!
//! Handlers are resolved by [`TaskType`]; the default registry contains a
//! single implementation, [`PostboxDispatchHandler`], which hands the
//! task to an external agent through the postbox and waits for its
//! response. Custom handlers can be registered per task type without
//! touching the scheduler.
//!
//! [`PostboxDispatchHandler`]: postbox_dispatch::PostboxDispatchHandler

pub mod postbox_dispatch;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use archon_postbox::{AgentId, Envelope};

use crate::context::RuntimeContext;
use crate::plan::{Task, TaskType};

pub use postbox_dispatch::{PostboxDispatchConfig, PostboxDispatchHandler};

/// Everything a handler needs to execute one attempt of a task.
#[derive(Debug, Clone)]
pub struct TaskDispatch {
    pub task: Task,
    pub plan_id: String,
    /// Stable per-task trace id; constant across retries and fallback.
    pub trace_id: String,
    /// Zero-based attempt counter; becomes the envelope `retry_count`.
    pub attempt: u32,
    /// The agent this attempt targets (primary or fallback).
    pub target: AgentId,
    /// Snapshot of the runtime context at dispatch time.
    pub context: RuntimeContext,
}

/// What came back from one attempt.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// The agent responded: a `task_result`, `error`, or `needs_input`
    /// envelope matching this task and trace.
    Response(Envelope),
    /// No matching response arrived within the task's timeout.
    TimedOut,
    /// The attempt was abandoned because the plan was cancelled.
    Cancelled,
}

/// Adapter interface for executing a single task attempt.
///
/// The trait is object-safe so implementations can be stored as
/// `Arc<dyn TaskHandler>` in the [`HandlerRegistry`].
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Human-readable name, used in logs.
    fn name(&self) -> &str;

    /// Execute one attempt and classify what came back. Implementations
    /// must honor `cancel` at every suspension point.
    async fn execute(
        &self,
        dispatch: &TaskDispatch,
        cancel: &CancellationToken,
    ) -> Result<AttemptOutcome>;
}

// Compile-time assertion: TaskHandler must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn TaskHandler) {}
};

/// Handlers keyed by task type, with a default for everything else.
pub struct HandlerRegistry {
    default: Arc<dyn TaskHandler>,
    by_type: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Create a registry where every task type resolves to `default`.
    pub fn with_default(default: Arc<dyn TaskHandler>) -> Self {
        Self {
            default,
            by_type: HashMap::new(),
        }
    }

    /// Register a handler for a specific task type, replacing any
    /// previous registration for that type.
    pub fn register(&mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) {
        self.by_type.insert(task_type, handler);
    }

    /// Resolve the handler for a task type.
    pub fn resolve(&self, task_type: TaskType) -> Arc<dyn TaskHandler> {
        self.by_type
            .get(&task_type)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default))
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("default", &self.default.name())
            .field("by_type", &self.by_type.keys().collect::<Vec<_>>())
            .finish()
    }
}
