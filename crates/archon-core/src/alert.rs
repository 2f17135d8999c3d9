//! Alert rules: match incoming result/error envelopes against a policy
//! file and fire notification actions.
//!
//! The evaluator is an observer. Rules are evaluated in policy-file
//! order; action failures are logged and swallowed, never affecting task
//! or plan state.
//!
//! Conditions and actions are parsed as flat structs with a
//! discriminator field (`type` / `notify`) and validated per kind at
//! load time, so a field that does not belong to the declared kind is
//! rejected with the rule's name attached.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use glob::Pattern;
use serde::Deserialize;
use thiserror::Error;

use archon_postbox::{Envelope, MessageType, ResultStatus};

/// Errors from loading an alert policy.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read policy file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("policy syntax error: {0}")]
    Syntax(String),

    #[error("policy schema error: {0}")]
    Schema(String),

    #[error("rule {rule:?}: invalid agent pattern {pattern:?}")]
    InvalidPattern { rule: String, pattern: String },

    #[error("rule {rule:?}: field {field:?} is not allowed for {kind} {context}")]
    FieldNotAllowed {
        rule: String,
        field: &'static str,
        kind: &'static str,
        context: &'static str,
    },

    #[error("rule {rule:?}: {kind} {context} requires field {field:?}")]
    MissingField {
        rule: String,
        field: &'static str,
        kind: &'static str,
        context: &'static str,
    },

    #[error("rule {rule:?}: unsupported notification method {method:?}")]
    UnknownMethod { rule: String, method: String },
}

// ---------------------------------------------------------------------------
// Policy file schema
// ---------------------------------------------------------------------------

/// Top-level alert policy document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlertPolicy {
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    pub rules: Vec<AlertRule>,
}

/// One named rule.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlertRule {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub condition: AlertCondition,
    pub action: AlertAction,
}

fn default_enabled() -> bool {
    true
}

/// Condition discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    Error,
    TaskResult,
}

/// What an incoming envelope must look like for the rule to fire.
///
/// `agent`, when present, is a glob over the sender id (e.g.
/// `SYSTEM_*`). The remaining fields apply to one kind only, enforced at
/// load time.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlertCondition {
    #[serde(rename = "type")]
    pub kind: ConditionKind,
    #[serde(default)]
    pub agent: Option<String>,
    /// `error` only: exact match on `payload.error_code`.
    #[serde(default)]
    pub error_code: Option<String>,
    /// `error` only: minimum retry count.
    #[serde(default)]
    pub retry_count: Option<u32>,
    /// `task_result` only.
    #[serde(default)]
    pub score_below: Option<f64>,
    /// `task_result` only.
    #[serde(default)]
    pub score_above: Option<f64>,
    /// `task_result` only.
    #[serde(default)]
    pub duration_above: Option<f64>,
    /// `task_result` only.
    #[serde(default)]
    pub status: Option<ResultStatus>,
}

/// Action discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyTarget {
    Human,
    Webhook,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

/// What happens when a rule fires.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlertAction {
    pub notify: NotifyTarget,
    /// For `human`: must be `console_log`. For `webhook`: the HTTP
    /// method, default POST.
    #[serde(default)]
    pub method: Option<String>,
    /// `human` only.
    #[serde(default)]
    pub level: Option<AlertLevel>,
    /// Message template; `{task_id}`, `{sender}`, `{status}`, `{score}`,
    /// and `{retry_count}` are substituted.
    #[serde(default)]
    pub message: Option<String>,
    /// `webhook` only.
    #[serde(default)]
    pub url: Option<String>,
    /// `webhook` only.
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    /// `webhook` only.
    #[serde(default)]
    pub template: Option<String>,
    /// `webhook` only.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

fn validate_rule(rule: &AlertRule) -> Result<(), PolicyError> {
    let not_allowed = |field: &'static str, kind: &'static str, context: &'static str| {
        PolicyError::FieldNotAllowed {
            rule: rule.name.clone(),
            field,
            kind,
            context,
        }
    };

    let condition = &rule.condition;
    match condition.kind {
        ConditionKind::Error => {
            if condition.score_below.is_some() {
                return Err(not_allowed("score_below", "error", "conditions"));
            }
            if condition.score_above.is_some() {
                return Err(not_allowed("score_above", "error", "conditions"));
            }
            if condition.duration_above.is_some() {
                return Err(not_allowed("duration_above", "error", "conditions"));
            }
            if condition.status.is_some() {
                return Err(not_allowed("status", "error", "conditions"));
            }
        }
        ConditionKind::TaskResult => {
            if condition.error_code.is_some() {
                return Err(not_allowed("error_code", "task_result", "conditions"));
            }
            if condition.retry_count.is_some() {
                return Err(not_allowed("retry_count", "task_result", "conditions"));
            }
        }
    }

    let action = &rule.action;
    match action.notify {
        NotifyTarget::Human => {
            if let Some(method) = &action.method {
                if method != "console_log" {
                    return Err(PolicyError::UnknownMethod {
                        rule: rule.name.clone(),
                        method: method.clone(),
                    });
                }
            }
            if action.level.is_none() {
                return Err(PolicyError::MissingField {
                    rule: rule.name.clone(),
                    field: "level",
                    kind: "human",
                    context: "actions",
                });
            }
            if action.url.is_some() {
                return Err(not_allowed("url", "human", "actions"));
            }
            if action.headers.is_some() {
                return Err(not_allowed("headers", "human", "actions"));
            }
            if action.template.is_some() {
                return Err(not_allowed("template", "human", "actions"));
            }
            if action.timeout_seconds.is_some() {
                return Err(not_allowed("timeout_seconds", "human", "actions"));
            }
        }
        NotifyTarget::Webhook => {
            if action.url.is_none() {
                return Err(PolicyError::MissingField {
                    rule: rule.name.clone(),
                    field: "url",
                    kind: "webhook",
                    context: "actions",
                });
            }
            if let Some(method) = &action.method {
                if reqwest::Method::from_bytes(method.as_bytes()).is_err() {
                    return Err(PolicyError::UnknownMethod {
                        rule: rule.name.clone(),
                        method: method.clone(),
                    });
                }
            }
            if action.level.is_some() {
                return Err(not_allowed("level", "webhook", "actions"));
            }
            if action.message.is_some() {
                return Err(not_allowed("message", "webhook", "actions"));
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

struct CompiledRule {
    rule: AlertRule,
    agent_pattern: Option<Pattern>,
}

/// Matches envelopes against a loaded policy and fires actions.
pub struct AlertEvaluator {
    rules: Vec<CompiledRule>,
    http: reqwest::Client,
}

impl AlertEvaluator {
    /// Load a policy from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| PolicyError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_str(&contents)
    }

    /// Parse a policy from YAML text.
    pub fn from_str(contents: &str) -> Result<Self, PolicyError> {
        let value: serde_yaml::Value =
            serde_yaml::from_str(contents).map_err(|e| PolicyError::Syntax(e.to_string()))?;
        let policy: AlertPolicy =
            serde_yaml::from_value(value).map_err(|e| PolicyError::Schema(e.to_string()))?;
        Self::from_policy(policy)
    }

    /// Validate and compile a parsed policy.
    pub fn from_policy(policy: AlertPolicy) -> Result<Self, PolicyError> {
        let mut rules = Vec::with_capacity(policy.rules.len());
        for rule in policy.rules {
            validate_rule(&rule)?;
            let agent_pattern = rule
                .condition
                .agent
                .as_deref()
                .map(|p| {
                    Pattern::new(p).map_err(|_| PolicyError::InvalidPattern {
                        rule: rule.name.clone(),
                        pattern: p.to_owned(),
                    })
                })
                .transpose()?;
            rules.push(CompiledRule {
                rule,
                agent_pattern,
            });
        }
        Ok(Self {
            rules,
            http: reqwest::Client::new(),
        })
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Evaluate an incoming envelope against every enabled rule, in
    /// policy order. Returns the names of the rules that fired.
    pub async fn evaluate(&self, envelope: &Envelope) -> Vec<String> {
        let mut fired = Vec::new();
        for compiled in &self.rules {
            if !compiled.rule.enabled {
                continue;
            }
            if !matches(
                &compiled.rule.condition,
                compiled.agent_pattern.as_ref(),
                envelope,
            ) {
                continue;
            }
            fired.push(compiled.rule.name.clone());
            self.fire(&compiled.rule, envelope).await;
        }
        fired
    }

    async fn fire(&self, rule: &AlertRule, envelope: &Envelope) {
        match rule.action.notify {
            NotifyTarget::Human => self.fire_console(rule, envelope),
            NotifyTarget::Webhook => self.fire_webhook(rule, envelope).await,
        }
    }

    fn fire_console(&self, rule: &AlertRule, envelope: &Envelope) {
        let text = rule
            .action
            .message
            .as_deref()
            .map(|m| render_template(m, envelope))
            .unwrap_or_else(|| {
                format!(
                    "alert {} fired for task {} from {}",
                    rule.name, envelope.task_id, envelope.sender_id
                )
            });
        match rule.action.level.unwrap_or(AlertLevel::Info) {
            AlertLevel::Info => {
                tracing::info!(rule = %rule.name, task_id = %envelope.task_id, "{text}")
            }
            AlertLevel::Warning => {
                tracing::warn!(rule = %rule.name, task_id = %envelope.task_id, "{text}")
            }
            AlertLevel::Error | AlertLevel::Critical => {
                tracing::error!(rule = %rule.name, task_id = %envelope.task_id, "{text}")
            }
        }
    }

    async fn fire_webhook(&self, rule: &AlertRule, envelope: &Envelope) {
        let action = &rule.action;
        let url = action.url.as_deref().expect("validated webhook has a url");
        let body = match &action.template {
            Some(t) => serde_json::json!({ "text": render_template(t, envelope) }),
            None => serde_json::to_value(envelope).unwrap_or_default(),
        };
        let method_text = action.method.as_deref().unwrap_or("POST");
        let method = match reqwest::Method::from_bytes(method_text.as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                tracing::warn!(rule = %rule.name, method = method_text, "invalid webhook method, alert not sent");
                return;
            }
        };
        let mut request = self
            .http
            .request(method, url)
            .timeout(Duration::from_secs(action.timeout_seconds.unwrap_or(10)))
            .json(&body);
        if let Some(headers) = &action.headers {
            for (key, value) in headers {
                request = request.header(key.as_str(), value.as_str());
            }
        }
        // Failures are logged only; alerts never affect state.
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(rule = %rule.name, url, "webhook alert delivered");
            }
            Ok(response) => {
                tracing::warn!(
                    rule = %rule.name,
                    url,
                    status = %response.status(),
                    "webhook alert rejected"
                );
            }
            Err(e) => {
                tracing::warn!(rule = %rule.name, url, error = %e, "webhook alert failed");
            }
        }
    }
}

fn matches(
    condition: &AlertCondition,
    agent_pattern: Option<&Pattern>,
    envelope: &Envelope,
) -> bool {
    if let Some(pattern) = agent_pattern {
        if !pattern.matches(&envelope.sender_id) {
            return false;
        }
    }
    match condition.kind {
        ConditionKind::Error => {
            if envelope.kind != MessageType::Error {
                return false;
            }
            if let Some(code) = &condition.error_code {
                if envelope.error_code() != Some(code.as_str()) {
                    return false;
                }
            }
            if let Some(min) = condition.retry_count {
                if envelope.retry_count < min {
                    return false;
                }
            }
            true
        }
        ConditionKind::TaskResult => {
            if envelope.kind != MessageType::TaskResult {
                return false;
            }
            if let Some(expected) = condition.status {
                if envelope.result_status() != Some(expected) {
                    return false;
                }
            }
            if let Some(threshold) = condition.score_below {
                match envelope.score() {
                    Some(score) if score < threshold => {}
                    _ => return false,
                }
            }
            if let Some(threshold) = condition.score_above {
                match envelope.score() {
                    Some(score) if score > threshold => {}
                    _ => return false,
                }
            }
            if let Some(threshold) = condition.duration_above {
                match envelope.duration_sec() {
                    Some(duration) if duration > threshold => {}
                    _ => return false,
                }
            }
            true
        }
    }
}

/// Substitute `{task_id}`, `{sender}`, `{status}`, `{score}`, and
/// `{retry_count}` placeholders.
fn render_template(template: &str, envelope: &Envelope) -> String {
    template
        .replace("{task_id}", &envelope.task_id)
        .replace("{sender}", &envelope.sender_id)
        .replace(
            "{status}",
            &envelope
                .result_status()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_owned()),
        )
        .replace(
            "{score}",
            &envelope
                .score()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "n/a".to_owned()),
        )
        .replace("{retry_count}", &envelope.retry_count.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const POLICY: &str = r#"
version: "1.0"
description: test rules
rules:
  - name: low-score
    condition:
      type: task_result
      score_below: 0.5
    action:
      notify: human
      method: console_log
      level: warning
      message: "task {task_id} scored {score}"
  - name: system-errors
    condition:
      type: error
      agent: "SYSTEM_*"
      retry_count: 2
    action:
      notify: human
      method: console_log
      level: error
  - name: disabled-rule
    enabled: false
    condition:
      type: error
    action:
      notify: human
      method: console_log
      level: info
  - name: slow-failures
    condition:
      type: task_result
      status: failed
      duration_above: 60
    action:
      notify: webhook
      url: "http://127.0.0.1:1/unreachable"
      timeout_seconds: 1
"#;

    fn result_envelope(score: f64) -> Envelope {
        Envelope::new(
            MessageType::TaskResult,
            "CA",
            "ARCH",
            "T1",
            json!({"status": "success", "success": true, "score": score}),
        )
    }

    fn error_envelope(sender: &str, retry_count: u32) -> Envelope {
        Envelope::new(
            MessageType::Error,
            sender,
            "ARCH",
            "T1",
            json!({"error_code": "E1"}),
        )
        .with_retry_count(retry_count)
    }

    #[tokio::test]
    async fn low_score_rule_fires() {
        let evaluator = AlertEvaluator::from_str(POLICY).unwrap();
        assert_eq!(evaluator.rule_count(), 4);

        let fired = evaluator.evaluate(&result_envelope(0.3)).await;
        assert_eq!(fired, vec!["low-score"]);

        let fired = evaluator.evaluate(&result_envelope(0.9)).await;
        assert!(fired.is_empty());
    }

    #[tokio::test]
    async fn agent_glob_and_retry_minimum() {
        let evaluator = AlertEvaluator::from_str(POLICY).unwrap();

        let fired = evaluator
            .evaluate(&error_envelope("SYSTEM_MONITOR", 2))
            .await;
        assert_eq!(fired, vec!["system-errors"]);

        // Wrong sender.
        let fired = evaluator.evaluate(&error_envelope("CA", 5)).await;
        assert!(fired.is_empty());

        // Retry count below the minimum.
        let fired = evaluator
            .evaluate(&error_envelope("SYSTEM_MONITOR", 1))
            .await;
        assert!(fired.is_empty());
    }

    #[tokio::test]
    async fn disabled_rules_never_fire() {
        let evaluator = AlertEvaluator::from_str(POLICY).unwrap();
        // An error from CA matches only the disabled catch-all rule.
        let fired = evaluator.evaluate(&error_envelope("CA", 0)).await;
        assert!(fired.is_empty());
    }

    #[tokio::test]
    async fn webhook_failure_is_swallowed() {
        let evaluator = AlertEvaluator::from_str(POLICY).unwrap();
        let envelope = Envelope::new(
            MessageType::TaskResult,
            "CA",
            "ARCH",
            "T1",
            json!({"status": "failed", "success": false, "duration_sec": 120.0}),
        );
        // The webhook target is unreachable; evaluate still returns the
        // fired rule and does not error.
        let fired = evaluator.evaluate(&envelope).await;
        assert_eq!(fired, vec!["slow-failures"]);
    }

    #[test]
    fn unknown_condition_field_is_rejected() {
        let bad = r#"
version: "1.0"
rules:
  - name: r
    condition:
      type: error
      surprise: 1
    action:
      notify: human
      method: console_log
      level: info
"#;
        assert!(matches!(
            AlertEvaluator::from_str(bad),
            Err(PolicyError::Schema(_))
        ));
    }

    #[test]
    fn field_of_wrong_kind_is_rejected() {
        let bad = r#"
version: "1.0"
rules:
  - name: r
    condition:
      type: error
      score_below: 0.5
    action:
      notify: human
      method: console_log
      level: info
"#;
        assert!(matches!(
            AlertEvaluator::from_str(bad),
            Err(PolicyError::FieldNotAllowed {
                field: "score_below",
                ..
            })
        ));
    }

    #[test]
    fn webhook_without_url_is_rejected() {
        let bad = r#"
version: "1.0"
rules:
  - name: r
    condition:
      type: error
    action:
      notify: webhook
"#;
        assert!(matches!(
            AlertEvaluator::from_str(bad),
            Err(PolicyError::MissingField { field: "url", .. })
        ));
    }

    #[test]
    fn invalid_glob_is_rejected() {
        let bad = r#"
version: "1.0"
rules:
  - name: r
    condition:
      type: error
      agent: "SYSTEM_["
    action:
      notify: human
      method: console_log
      level: info
"#;
        assert!(matches!(
            AlertEvaluator::from_str(bad),
            Err(PolicyError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn template_rendering() {
        let envelope = result_envelope(0.25);
        let rendered = render_template("task {task_id} from {sender} scored {score}", &envelope);
        assert_eq!(rendered, "task T1 from CA scored 0.25");
    }
}
