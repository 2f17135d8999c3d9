//! Shared helpers for integration tests: tempdir-rooted postbox layout
//! and a scripted agent worker that stands in for the external agent
//! processes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use archon_postbox::{AgentId, Envelope, MessageType, PostboxStore};

/// Tempdir-rooted postbox, archive, and log layout for one test.
pub struct TestEnv {
    pub dir: tempfile::TempDir,
    pub store: PostboxStore,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::TempDir::new().expect("failed to create temp dir");
        let store = PostboxStore::open(dir.path().join("postbox")).expect("failed to open postbox");
        Self { dir, store }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.dir.path().join("logs")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.dir.path().join("archive")
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// One scripted reply to a task assignment.
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Success { score: f64 },
    PartialSuccess { score: f64 },
    Failed,
    Error { code: String },
    NeedsInput,
    /// Do not answer; the orchestrator's task timeout fires.
    Silence,
}

/// Per-task response scripts for one agent. Attempt `n` for a task uses
/// the `n`-th scripted response; the last entry repeats once the script
/// is exhausted. Tasks without a script succeed with score 1.0.
#[derive(Debug, Clone, Default)]
pub struct AgentScript {
    responses: HashMap<String, Vec<ScriptedResponse>>,
    /// Simulated work time before each reply.
    pub response_delay: Duration,
}

impl AgentScript {
    pub fn new() -> Self {
        Self {
            responses: HashMap::new(),
            response_delay: Duration::from_millis(20),
        }
    }

    pub fn on(mut self, task_id: impl Into<String>, responses: Vec<ScriptedResponse>) -> Self {
        self.responses.insert(task_id.into(), responses);
        self
    }

    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    fn response_for(&self, task_id: &str, attempt: usize) -> ScriptedResponse {
        match self.responses.get(task_id) {
            Some(responses) if !responses.is_empty() => responses
                .get(attempt)
                .unwrap_or_else(|| responses.last().unwrap())
                .clone(),
            _ => ScriptedResponse::Success { score: 1.0 },
        }
    }
}

/// Handle to a running scripted agent.
pub struct ScriptedAgentHandle {
    /// Every assignment the agent consumed, in arrival order.
    pub received: Arc<Mutex<Vec<Envelope>>>,
    join: tokio::task::JoinHandle<()>,
}

impl ScriptedAgentHandle {
    /// Assignments received so far.
    pub fn assignments(&self) -> Vec<Envelope> {
        self.received.lock().unwrap().clone()
    }

    /// Stop the agent loop.
    pub async fn shutdown(self) {
        self.join.abort();
        let _ = self.join.await;
    }
}

/// A background worker that drains an agent's inbox and answers each
/// `task_assignment` per its script, writing replies to the agent's own
/// outbox addressed to the orchestrator.
pub struct ScriptedAgent;

impl ScriptedAgent {
    pub fn spawn(
        store: PostboxStore,
        agent: AgentId,
        script: AgentScript,
        cancel: CancellationToken,
    ) -> ScriptedAgentHandle {
        let received: Arc<Mutex<Vec<Envelope>>> = Arc::new(Mutex::new(Vec::new()));
        let received_clone = Arc::clone(&received);

        let join = tokio::spawn(async move {
            let mut attempts: HashMap<String, usize> = HashMap::new();
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                let inbox = match store.drain_inbox(agent.as_str()) {
                    Ok(inbox) => inbox,
                    Err(e) => {
                        tracing::warn!(agent = %agent, error = %e, "scripted agent failed to drain inbox");
                        Vec::new()
                    }
                };
                for assignment in inbox {
                    if assignment.kind != MessageType::TaskAssignment {
                        continue;
                    }
                    received_clone.lock().unwrap().push(assignment.clone());

                    let attempt = attempts.entry(assignment.task_id.clone()).or_insert(0);
                    let response = script.response_for(&assignment.task_id, *attempt);
                    *attempt += 1;

                    if matches!(response, ScriptedResponse::Silence) {
                        continue;
                    }

                    tokio::time::sleep(script.response_delay).await;

                    let reply = build_reply(agent, &assignment, &response);
                    if let Err(e) = store.enqueue_outbox(agent.as_str(), &reply) {
                        tracing::warn!(agent = %agent, error = %e, "scripted agent failed to reply");
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        ScriptedAgentHandle { received, join }
    }
}

fn build_reply(agent: AgentId, assignment: &Envelope, response: &ScriptedResponse) -> Envelope {
    let (kind, payload) = match response {
        ScriptedResponse::Success { score } => (
            MessageType::TaskResult,
            json!({
                "status": "success",
                "success": true,
                "score": score,
                "duration_sec": 0.02,
            }),
        ),
        ScriptedResponse::PartialSuccess { score } => (
            MessageType::TaskResult,
            json!({
                "status": "partial_success",
                "success": false,
                "score": score,
            }),
        ),
        ScriptedResponse::Failed => (
            MessageType::TaskResult,
            json!({
                "status": "failed",
                "success": false,
                "error_message": "scripted failure",
            }),
        ),
        ScriptedResponse::Error { code } => (
            MessageType::Error,
            json!({
                "error_code": code,
                "error_message": "scripted error",
            }),
        ),
        ScriptedResponse::NeedsInput => (
            MessageType::NeedsInput,
            json!({"question": "scripted question"}),
        ),
        ScriptedResponse::Silence => unreachable!("silence never builds a reply"),
    };

    let mut reply = Envelope::new(
        kind,
        agent.as_str(),
        AgentId::Arch.as_str(),
        assignment.task_id.clone(),
        payload,
    )
    .with_retry_count(assignment.retry_count);
    reply.trace_id = assignment.trace_id.clone();
    reply
}
