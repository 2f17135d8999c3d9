//! Default task handler: dispatch to an external agent via the postbox.
//!
//! One attempt is: encode a `task_assignment` envelope, enqueue it on the
//! target agent's inbox, optionally fire the agent's trigger command, and
//! poll the agent's outbox until a response matching the task and trace
//! arrives or the task's timeout elapses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use archon_postbox::{AgentId, Envelope, MessageType, PostboxStore};

use crate::clock::Clock;
use super::{AttemptOutcome, TaskDispatch, TaskHandler};

/// Configuration for the postbox dispatch handler.
#[derive(Debug, Clone)]
pub struct PostboxDispatchConfig {
    /// How often the outbox is polled while waiting for a response.
    pub poll_interval: Duration,
    /// Optional per-agent trigger commands, spawned fire-and-forget after
    /// each enqueue so the agent observes its inbox promptly. The first
    /// element is the program, the rest are arguments.
    pub trigger_commands: HashMap<AgentId, Vec<String>>,
}

impl Default for PostboxDispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            trigger_commands: HashMap::new(),
        }
    }
}

/// Dispatches task assignments through the postbox and waits for the
/// agent's response.
pub struct PostboxDispatchHandler {
    store: PostboxStore,
    clock: Arc<dyn Clock>,
    config: PostboxDispatchConfig,
}

impl PostboxDispatchHandler {
    pub fn new(store: PostboxStore, clock: Arc<dyn Clock>, config: PostboxDispatchConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    fn build_assignment(&self, dispatch: &TaskDispatch) -> Envelope {
        let payload = if dispatch.task.content.is_null() {
            serde_json::json!({})
        } else {
            dispatch.task.content.clone()
        };
        Envelope::new(
            MessageType::TaskAssignment,
            AgentId::Arch.as_str(),
            dispatch.target.as_str(),
            dispatch.task.task_id.clone(),
            payload,
        )
        .with_trace_id(dispatch.trace_id.clone())
        .with_retry_count(dispatch.attempt)
        .with_context(dispatch.context.to_json())
    }

    fn fire_trigger(&self, target: AgentId) {
        let Some(command) = self.config.trigger_commands.get(&target) else {
            return;
        };
        let Some((program, args)) = command.split_first() else {
            return;
        };
        match tokio::process::Command::new(program).args(args).spawn() {
            Ok(_child) => {
                tracing::debug!(agent = %target, program = %program, "triggered agent worker");
            }
            Err(e) => {
                // The agent may also be watching its inbox on its own;
                // a failed trigger is not a dispatch failure.
                tracing::warn!(agent = %target, error = %e, "failed to trigger agent worker");
            }
        }
    }
}

#[async_trait]
impl TaskHandler for PostboxDispatchHandler {
    fn name(&self) -> &str {
        "postbox-dispatch"
    }

    async fn execute(
        &self,
        dispatch: &TaskDispatch,
        cancel: &CancellationToken,
    ) -> Result<AttemptOutcome> {
        let envelope = self.build_assignment(dispatch);

        // An outgoing envelope that fails validation is a programmer
        // error; the typed error bubbles up so the scheduler can abort
        // the plan instead of retrying.
        envelope.validate()?;

        let target = dispatch.target.as_str();
        self.store
            .enqueue_inbox(target, &envelope)
            .with_context(|| format!("enqueueing assignment for {target}"))?;

        tracing::info!(
            task_id = %dispatch.task.task_id,
            trace_id = %dispatch.trace_id,
            recipient = %target,
            retry_count = dispatch.attempt,
            "dispatched task assignment"
        );

        self.fire_trigger(dispatch.target);

        let task_id = &dispatch.task.task_id;
        let trace_id = &dispatch.trace_id;
        let deadline = tokio::time::Instant::now() + dispatch.task.timeout;

        loop {
            let response = self.store.take_outbox_where(target, |e| {
                e.task_id == *task_id
                    && e.trace_id.as_deref() == Some(trace_id.as_str())
                    && e.recipient_id == AgentId::Arch.as_str()
                    && matches!(
                        e.kind,
                        MessageType::TaskResult | MessageType::Error | MessageType::NeedsInput
                    )
            })?;
            if let Some(envelope) = response {
                return Ok(AttemptOutcome::Response(envelope));
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(AttemptOutcome::TimedOut);
            }

            tokio::select! {
                _ = self.clock.sleep(self.config.poll_interval) => {}
                _ = cancel.cancelled() => return Ok(AttemptOutcome::Cancelled),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::context::RuntimeContext;
    use crate::plan::{Priority, RetryStrategy, Task, TaskType};
    use serde_json::json;

    fn test_task(timeout: Duration) -> Task {
        Task {
            task_id: "T1".to_owned(),
            agent: AgentId::Ca,
            task_type: TaskType::Custom,
            description: None,
            content: json!({"action": "noop"}),
            dependencies: vec![],
            max_retries: 0,
            fallback_agent: None,
            timeout,
            retry_strategy: RetryStrategy::Immediate,
            retry_delay: Duration::from_secs(1),
            priority: Priority::Medium,
            when: None,
            unless: None,
        }
    }

    fn handler(store: &PostboxStore, poll: Duration) -> PostboxDispatchHandler {
        PostboxDispatchHandler::new(
            store.clone(),
            Arc::new(SystemClock),
            PostboxDispatchConfig {
                poll_interval: poll,
                trigger_commands: HashMap::new(),
            },
        )
    }

    fn dispatch_for(task: Task) -> TaskDispatch {
        TaskDispatch {
            target: task.agent,
            task,
            plan_id: "p".to_owned(),
            trace_id: "trace-1".to_owned(),
            attempt: 0,
            context: RuntimeContext::default(),
        }
    }

    #[tokio::test]
    async fn dispatch_enqueues_and_receives_matching_response() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = PostboxStore::open(dir.path()).unwrap();
        let handler = handler(&store, Duration::from_millis(10));
        let dispatch = dispatch_for(test_task(Duration::from_secs(5)));

        // Simulated agent: wait for the assignment, then answer.
        let agent_store = store.clone();
        let agent = tokio::spawn(async move {
            loop {
                let inbox = agent_store.drain_inbox("CA").unwrap();
                if let Some(assignment) = inbox.first() {
                    assert_eq!(assignment.sender_id, "ARCH");
                    assert_eq!(assignment.retry_count, 0);
                    let reply = Envelope::new(
                        MessageType::TaskResult,
                        "CA",
                        "ARCH",
                        assignment.task_id.clone(),
                        json!({"status": "success", "success": true, "score": 1.0}),
                    )
                    .with_trace_id(assignment.trace_id.clone().unwrap());
                    agent_store.enqueue_outbox("CA", &reply).unwrap();
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let outcome = handler
            .execute(&dispatch, &CancellationToken::new())
            .await
            .unwrap();
        agent.await.unwrap();

        match outcome {
            AttemptOutcome::Response(envelope) => {
                assert_eq!(envelope.kind, MessageType::TaskResult);
                assert_eq!(envelope.task_id, "T1");
            }
            other => panic!("expected a response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn silence_times_out() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = PostboxStore::open(dir.path()).unwrap();
        let handler = handler(&store, Duration::from_millis(10));
        let dispatch = dispatch_for(test_task(Duration::from_millis(50)));

        let outcome = handler
            .execute(&dispatch, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, AttemptOutcome::TimedOut));

        // The assignment is still sitting in the agent's inbox.
        assert_eq!(store.drain_inbox("CA").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_abandons_the_poll() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = PostboxStore::open(dir.path()).unwrap();
        let handler = handler(&store, Duration::from_millis(20));
        let dispatch = dispatch_for(test_task(Duration::from_secs(60)));

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel_clone.cancel();
        });

        let outcome = handler.execute(&dispatch, &cancel).await.unwrap();
        assert!(matches!(outcome, AttemptOutcome::Cancelled));
    }

    #[tokio::test]
    async fn responses_for_other_traces_are_left_in_place() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = PostboxStore::open(dir.path()).unwrap();
        let handler = handler(&store, Duration::from_millis(10));
        let dispatch = dispatch_for(test_task(Duration::from_millis(80)));

        // A stale response from an earlier trace must not satisfy this
        // attempt.
        let stale = Envelope::new(
            MessageType::TaskResult,
            "CA",
            "ARCH",
            "T1",
            json!({"status": "success", "success": true}),
        )
        .with_trace_id("old-trace");
        store.enqueue_outbox("CA", &stale).unwrap();

        let outcome = handler
            .execute(&dispatch, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, AttemptOutcome::TimedOut));
        assert_eq!(store.drain_outbox("CA").unwrap().len(), 1);
    }
}
