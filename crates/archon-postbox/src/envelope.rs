//! MCP message envelope: encode/decode and schema validation.
//!
//! Every message exchanged between the orchestrator, the router, and the
//! agent workers is wrapped in an [`Envelope`]. The envelope carries the
//! protocol version, addressing, a task reference, and a type-specific
//! payload. Validation enforces the invariants the rest of the system
//! relies on (assignment addressing, result-payload consistency) before a
//! message is dispatched or consumed.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Protocol version emitted by this implementation.
///
/// Incoming envelopes are accepted for any `1.x`; a different major version
/// is rejected.
pub const PROTOCOL_VERSION: &str = "1.3";

/// Maximum length of the free-form `notes` field in a result payload.
pub const MAX_NOTES_LEN: usize = 1000;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// The closed set of agent workers a plan may address.
///
/// `ARCH` is the orchestrator itself; `CA`, `CC`, and `WA` are the worker
/// agents. Envelope sender/recipient fields are free-form uppercase tokens
/// (foreign ids appear in alert rules), but plan tasks and the router's
/// delivery targets are restricted to this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentId {
    #[serde(rename = "ARCH")]
    Arch,
    #[serde(rename = "CA")]
    Ca,
    #[serde(rename = "CC")]
    Cc,
    #[serde(rename = "WA")]
    Wa,
}

impl AgentId {
    /// All known agents, in a stable order.
    pub const ALL: [AgentId; 4] = [AgentId::Arch, AgentId::Ca, AgentId::Cc, AgentId::Wa];

    /// The worker agents (everything except the orchestrator).
    pub const WORKERS: [AgentId; 3] = [AgentId::Ca, AgentId::Cc, AgentId::Wa];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Arch => "ARCH",
            Self::Ca => "CA",
            Self::Cc => "CC",
            Self::Wa => "WA",
        }
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentId {
    type Err = AgentIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ARCH" => Ok(Self::Arch),
            "CA" => Ok(Self::Ca),
            "CC" => Ok(Self::Cc),
            "WA" => Ok(Self::Wa),
            other => Err(AgentIdParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an unknown [`AgentId`] token.
#[derive(Debug, Clone)]
pub struct AgentIdParseError(pub String);

impl fmt::Display for AgentIdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown agent id: {:?}", self.0)
    }
}

impl std::error::Error for AgentIdParseError {}

// ---------------------------------------------------------------------------

/// The type of a message envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskAssignment,
    TaskResult,
    Error,
    NeedsInput,
    TaskStatus,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TaskAssignment => "task_assignment",
            Self::TaskResult => "task_result",
            Self::Error => "error",
            Self::NeedsInput => "needs_input",
            Self::TaskStatus => "task_status",
        };
        f.write_str(s)
    }
}

impl FromStr for MessageType {
    type Err = MessageTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task_assignment" => Ok(Self::TaskAssignment),
            "task_result" => Ok(Self::TaskResult),
            "error" => Ok(Self::Error),
            "needs_input" => Ok(Self::NeedsInput),
            "task_status" => Ok(Self::TaskStatus),
            other => Err(MessageTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`MessageType`] string.
#[derive(Debug, Clone)]
pub struct MessageTypeParseError(pub String);

impl fmt::Display for MessageTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid message type: {:?}", self.0)
    }
}

impl std::error::Error for MessageTypeParseError {}

// ---------------------------------------------------------------------------

/// Reported status inside a `task_result` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    PartialSuccess,
    Failed,
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for ResultStatus {
    type Err = ResultStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "partial_success" => Ok(Self::PartialSuccess),
            "failed" => Ok(Self::Failed),
            other => Err(ResultStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ResultStatus`] string.
#[derive(Debug, Clone)]
pub struct ResultStatusParseError(pub String);

impl fmt::Display for ResultStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid result status: {:?}", self.0)
    }
}

impl std::error::Error for ResultStatusParseError {}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Validation and codec errors for envelopes.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed protocol version {0:?} (expected MAJOR.MINOR)")]
    MalformedVersion(String),

    #[error("unsupported protocol major version in {0:?} (this implementation speaks 1.x)")]
    UnsupportedVersion(String),

    #[error("{field} {value:?} is not an uppercase agent token")]
    InvalidAgentToken { field: &'static str, value: String },

    #[error("task_id {0:?} does not match [A-Z0-9_-]+")]
    InvalidTaskId(String),

    #[error("task_assignment sender must be ARCH, got {0:?}")]
    AssignmentSender(String),

    #[error("task_assignment recipient must be a worker agent, got {0:?}")]
    AssignmentRecipient(String),

    #[error("task_result payload has no valid status field")]
    MissingResultStatus,

    #[error("task_result payload inconsistent: success={success} but status={status}")]
    InconsistentResult { success: bool, status: ResultStatus },

    #[error("score {0} is outside [0, 1]")]
    ScoreOutOfRange(f64),

    #[error("duration_sec {0} is negative")]
    NegativeDuration(f64),

    #[error("notes field is {0} chars (max {MAX_NOTES_LEN})")]
    NotesTooLong(usize),
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A versioned MCP message envelope.
///
/// Unknown fields are tolerated on decode so that minor protocol revisions
/// can add optional fields without breaking older peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub protocol_version: String,
    #[serde(default = "new_message_id")]
    pub message_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub timestamp: DateTime<Utc>,
    pub task_id: String,
    pub payload: Value,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    /// Relative TTL, measured from `timestamp`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_seconds: Option<u64>,
    /// Absolute expiry. Takes precedence over `max_age_seconds` when both
    /// are present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

impl Envelope {
    /// Build a new envelope with the current timestamp and a fresh
    /// message id, speaking [`PROTOCOL_VERSION`].
    pub fn new(
        kind: MessageType,
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        task_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            kind,
            protocol_version: PROTOCOL_VERSION.to_string(),
            message_id: new_message_id(),
            sender_id: sender_id.into(),
            recipient_id: recipient_id.into(),
            timestamp: Utc::now(),
            task_id: task_id.into(),
            payload,
            retry_count: 0,
            trace_id: None,
            context: None,
            max_age_seconds: None,
            expires_at: None,
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_max_age_seconds(mut self, secs: u64) -> Self {
        self.max_age_seconds = Some(secs);
        self
    }

    /// Serialize to a JSON string.
    pub fn encode(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Deserialize from a JSON string. Does not validate; call
    /// [`Envelope::validate`] before acting on the result.
    pub fn decode(s: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Validate the envelope against the message schema.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        validate_version(&self.protocol_version)?;

        if !is_agent_token(&self.sender_id) {
            return Err(EnvelopeError::InvalidAgentToken {
                field: "sender_id",
                value: self.sender_id.clone(),
            });
        }
        if !is_agent_token(&self.recipient_id) {
            return Err(EnvelopeError::InvalidAgentToken {
                field: "recipient_id",
                value: self.recipient_id.clone(),
            });
        }
        if !is_agent_token(&self.task_id) {
            return Err(EnvelopeError::InvalidTaskId(self.task_id.clone()));
        }

        if self.kind == MessageType::TaskAssignment {
            if self.sender_id != AgentId::Arch.as_str() {
                return Err(EnvelopeError::AssignmentSender(self.sender_id.clone()));
            }
            let is_worker = AgentId::WORKERS
                .iter()
                .any(|w| w.as_str() == self.recipient_id);
            if !is_worker {
                return Err(EnvelopeError::AssignmentRecipient(self.recipient_id.clone()));
            }
        }

        if self.kind == MessageType::TaskResult {
            self.validate_result_payload()?;
        }

        Ok(())
    }

    fn validate_result_payload(&self) -> Result<(), EnvelopeError> {
        let status = self.result_status().ok_or(EnvelopeError::MissingResultStatus)?;

        if let Some(success) = self.success() {
            let consistent = success == (status == ResultStatus::Success);
            if !consistent {
                return Err(EnvelopeError::InconsistentResult { success, status });
            }
        }
        if let Some(score) = self.score() {
            if !(0.0..=1.0).contains(&score) {
                return Err(EnvelopeError::ScoreOutOfRange(score));
            }
        }
        if let Some(d) = self.duration_sec() {
            if d < 0.0 {
                return Err(EnvelopeError::NegativeDuration(d));
            }
        }
        if let Some(notes) = self.notes() {
            let len = notes.chars().count();
            if len > MAX_NOTES_LEN {
                return Err(EnvelopeError::NotesTooLong(len));
            }
        }

        Ok(())
    }

    /// Whether this envelope carries a terminal outcome for its task: a
    /// `task_result` with a recognized status, or an `error`.
    pub fn is_terminal_result(&self) -> bool {
        match self.kind {
            MessageType::Error => true,
            MessageType::TaskResult => self.result_status().is_some(),
            _ => false,
        }
    }

    /// Whether the envelope's TTL (if any) has elapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if let Some(expires_at) = self.expires_at {
            return now >= expires_at;
        }
        if let Some(max_age) = self.max_age_seconds {
            let age = now.signed_duration_since(self.timestamp);
            return age.num_seconds() >= 0 && age.num_seconds() as u64 >= max_age;
        }
        false
    }

    // -- payload accessors --------------------------------------------------

    /// `payload.status` as a [`ResultStatus`], if present and recognized.
    pub fn result_status(&self) -> Option<ResultStatus> {
        self.payload
            .get("status")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }

    /// `payload.success`, if present.
    pub fn success(&self) -> Option<bool> {
        self.payload.get("success").and_then(Value::as_bool)
    }

    /// `payload.score`, if present.
    pub fn score(&self) -> Option<f64> {
        self.payload.get("score").and_then(Value::as_f64)
    }

    /// `payload.duration_sec`, if present.
    pub fn duration_sec(&self) -> Option<f64> {
        self.payload.get("duration_sec").and_then(Value::as_f64)
    }

    /// `payload.notes`, if present.
    pub fn notes(&self) -> Option<&str> {
        self.payload.get("notes").and_then(Value::as_str)
    }

    /// `payload.error_code`, if present (error envelopes).
    pub fn error_code(&self) -> Option<&str> {
        self.payload.get("error_code").and_then(Value::as_str)
    }

    /// `payload.error_message` or `payload.message`, if present.
    pub fn error_message(&self) -> Option<&str> {
        self.payload
            .get("error_message")
            .or_else(|| self.payload.get("message"))
            .and_then(Value::as_str)
    }
}

/// Validate `MAJOR.MINOR` shape and require major version 1.
fn validate_version(version: &str) -> Result<(), EnvelopeError> {
    let mut parts = version.split('.');
    let major = parts
        .next()
        .and_then(|p| p.parse::<u32>().ok())
        .ok_or_else(|| EnvelopeError::MalformedVersion(version.to_owned()))?;
    let minor_ok = parts
        .next()
        .map(|p| p.parse::<u32>().is_ok())
        .unwrap_or(false);
    if !minor_ok || parts.next().is_some() {
        return Err(EnvelopeError::MalformedVersion(version.to_owned()));
    }
    if major != 1 {
        return Err(EnvelopeError::UnsupportedVersion(version.to_owned()));
    }
    Ok(())
}

/// Uppercase agent/task token: `[A-Z0-9_-]+`.
pub(crate) fn is_agent_token(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assignment() -> Envelope {
        Envelope::new(
            MessageType::TaskAssignment,
            "ARCH",
            "CA",
            "TASK_A",
            json!({"action": "validate", "parameters": {}}),
        )
        .with_trace_id("trace-1")
    }

    fn result(status: &str) -> Envelope {
        Envelope::new(
            MessageType::TaskResult,
            "CA",
            "ARCH",
            "TASK_A",
            json!({"status": status, "success": status == "success", "score": 0.9}),
        )
    }

    #[test]
    fn encode_decode_roundtrip() {
        let env = assignment();
        let encoded = env.encode().unwrap();
        let decoded = Envelope::decode(&encoded).unwrap();
        assert_eq!(decoded.kind, MessageType::TaskAssignment);
        assert_eq!(decoded.sender_id, "ARCH");
        assert_eq!(decoded.recipient_id, "CA");
        assert_eq!(decoded.task_id, "TASK_A");
        assert_eq!(decoded.trace_id.as_deref(), Some("trace-1"));
        assert_eq!(decoded.message_id, env.message_id);
    }

    #[test]
    fn decode_tolerates_unknown_fields() {
        let raw = json!({
            "type": "task_status",
            "protocol_version": "1.4",
            "sender_id": "CC",
            "recipient_id": "ARCH",
            "timestamp": "2025-06-01T12:00:00Z",
            "task_id": "T1",
            "payload": {},
            "some_future_field": [1, 2, 3]
        });
        let env = Envelope::decode(&raw.to_string()).unwrap();
        env.validate().unwrap();
        assert_eq!(env.kind, MessageType::TaskStatus);
        assert_eq!(env.retry_count, 0);
    }

    #[test]
    fn rejects_major_version_mismatch() {
        let mut env = assignment();
        env.protocol_version = "2.0".to_string();
        assert!(matches!(
            env.validate(),
            Err(EnvelopeError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn rejects_malformed_version() {
        let mut env = assignment();
        env.protocol_version = "1".to_string();
        assert!(matches!(
            env.validate(),
            Err(EnvelopeError::MalformedVersion(_))
        ));
        env.protocol_version = "one.three".to_string();
        assert!(matches!(
            env.validate(),
            Err(EnvelopeError::MalformedVersion(_))
        ));
    }

    #[test]
    fn assignment_must_come_from_arch() {
        let mut env = assignment();
        env.sender_id = "CA".to_string();
        assert!(matches!(
            env.validate(),
            Err(EnvelopeError::AssignmentSender(_))
        ));
    }

    #[test]
    fn assignment_recipient_must_be_worker() {
        let mut env = assignment();
        env.recipient_id = "ARCH".to_string();
        assert!(matches!(
            env.validate(),
            Err(EnvelopeError::AssignmentRecipient(_))
        ));
    }

    #[test]
    fn rejects_lowercase_agent_token() {
        let mut env = assignment();
        env.recipient_id = "ca".to_string();
        assert!(matches!(
            env.validate(),
            Err(EnvelopeError::InvalidAgentToken { .. })
        ));
    }

    #[test]
    fn result_status_and_success_must_agree() {
        let mut env = result("failed");
        env.payload["success"] = json!(true);
        assert!(matches!(
            env.validate(),
            Err(EnvelopeError::InconsistentResult { .. })
        ));

        let mut env = result("success");
        env.payload["success"] = json!(false);
        assert!(matches!(
            env.validate(),
            Err(EnvelopeError::InconsistentResult { .. })
        ));
    }

    #[test]
    fn partial_success_is_not_success() {
        let env = result("partial_success");
        // success=false is the consistent value for partial_success.
        assert!(matches!(
            env.validate(),
            Err(EnvelopeError::InconsistentResult { .. })
        ));

        let mut env = result("partial_success");
        env.payload["success"] = json!(false);
        env.validate().unwrap();
    }

    #[test]
    fn score_must_be_in_unit_interval() {
        let mut env = result("success");
        env.payload["score"] = json!(1.5);
        assert!(matches!(
            env.validate(),
            Err(EnvelopeError::ScoreOutOfRange(_))
        ));
    }

    #[test]
    fn notes_length_is_bounded() {
        let mut env = result("success");
        env.payload["notes"] = json!("x".repeat(MAX_NOTES_LEN + 1));
        assert!(matches!(env.validate(), Err(EnvelopeError::NotesTooLong(_))));
    }

    #[test]
    fn result_without_status_is_rejected() {
        let mut env = result("success");
        env.payload = json!({"success": true});
        assert!(matches!(
            env.validate(),
            Err(EnvelopeError::MissingResultStatus)
        ));
    }

    #[test]
    fn terminal_result_detection() {
        assert!(result("success").is_terminal_result());
        let mut failed = result("failed");
        failed.payload["success"] = json!(false);
        assert!(failed.is_terminal_result());

        let err = Envelope::new(MessageType::Error, "CA", "ARCH", "T1", json!({}));
        assert!(err.is_terminal_result());

        let needs = Envelope::new(MessageType::NeedsInput, "CA", "ARCH", "T1", json!({}));
        assert!(!needs.is_terminal_result());
    }

    #[test]
    fn ttl_relative_and_absolute() {
        let mut env = assignment();
        assert!(!env.is_expired(Utc::now()));

        env.max_age_seconds = Some(60);
        assert!(!env.is_expired(env.timestamp + chrono::Duration::seconds(30)));
        assert!(env.is_expired(env.timestamp + chrono::Duration::seconds(61)));

        // Absolute expiry wins over max_age.
        env.expires_at = Some(env.timestamp + chrono::Duration::seconds(10));
        assert!(env.is_expired(env.timestamp + chrono::Duration::seconds(30)));
    }

    #[test]
    fn agent_id_roundtrip() {
        for agent in AgentId::ALL {
            let parsed: AgentId = agent.as_str().parse().unwrap();
            assert_eq!(parsed, agent);
        }
        assert!("XX".parse::<AgentId>().is_err());
    }
}
