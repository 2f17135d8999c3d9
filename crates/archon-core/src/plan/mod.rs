//! Plan loading and validation.
//!
//! A plan document is parsed from YAML ([`format`]), validated field by
//! field, and converted into the immutable domain [`Plan`]. Structural
//! validation of the dependency graph (unknown deps, duplicates, cycles,
//! layering) lives in [`dag`].

pub mod dag;
pub mod format;
pub mod types;

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use archon_postbox::AgentId;

use crate::context::Scalar;
use crate::duration::parse_duration;

pub use dag::{Dag, DagError};
pub use format::{PlanYaml, TaskYaml};
pub use types::{Priority, RetryStrategy, TaskType};

/// Default per-attempt timeout when a task does not specify one.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

/// Default initial retry delay.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Upper bound on `max_retries`.
pub const MAX_RETRIES_LIMIT: u32 = 10;

/// Errors from loading or validating a plan document.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("failed to read plan file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("plan syntax error: {0}")]
    Syntax(String),

    #[error("plan schema error: {0}")]
    Schema(String),

    #[error("plan has no tasks")]
    NoTasks,

    #[error("plan_id {0:?} does not match [A-Za-z0-9_-]+")]
    InvalidPlanId(String),

    #[error("version {0:?} does not match MAJOR.MINOR.PATCH")]
    InvalidVersion(String),

    #[error("task_id {0:?} does not match [A-Z0-9_-]+")]
    InvalidTaskId(String),

    #[error("task {task}: unknown agent {agent:?}")]
    UnknownAgent { task: String, agent: String },

    #[error("task {task}: unknown task_type {value:?}")]
    UnknownTaskType { task: String, value: String },

    #[error("task {task}: invalid retry_strategy {value:?}")]
    InvalidRetryStrategy { task: String, value: String },

    #[error("task {task}: invalid priority {value:?}")]
    InvalidPriority { task: String, value: String },

    #[error("task {task}: {field} {value:?} is not a valid duration")]
    InvalidDuration {
        task: String,
        field: &'static str,
        value: String,
    },

    #[error("task {task}: max_retries {value} exceeds limit {MAX_RETRIES_LIMIT}")]
    RetriesOutOfRange { task: String, value: u32 },

    #[error("plan timeout {0:?} is not a valid duration")]
    InvalidPlanTimeout(String),

    #[error(transparent)]
    Dag(#[from] DagError),
}

/// A validated, immutable plan.
#[derive(Debug, Clone)]
pub struct Plan {
    pub plan_id: String,
    pub name: Option<String>,
    pub version: String,
    pub description: Option<String>,
    pub context: BTreeMap<String, Scalar>,
    /// Overall plan timeout, when the document specifies one.
    pub timeout: Option<Duration>,
    /// Tasks, arena-style: dependencies are task-id strings resolved to
    /// indices at DAG-build time.
    pub tasks: Vec<Task>,
}

/// A validated task within a plan.
#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: String,
    pub agent: AgentId,
    pub task_type: TaskType,
    pub description: Option<String>,
    /// Opaque body forwarded to the agent as the assignment payload.
    pub content: serde_json::Value,
    pub dependencies: Vec<String>,
    pub max_retries: u32,
    pub fallback_agent: Option<AgentId>,
    pub timeout: Duration,
    pub retry_strategy: RetryStrategy,
    pub retry_delay: Duration,
    pub priority: Priority,
    pub when: Option<String>,
    pub unless: Option<String>,
}

impl Plan {
    /// Load and validate a plan from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PlanError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| PlanError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_str(&contents)
    }

    /// Parse and validate a plan from YAML text.
    ///
    /// Malformed YAML reports a syntax error; a well-formed document that
    /// does not match the plan schema (unknown keys, missing fields,
    /// wrong shapes) reports a schema error; everything else is
    /// field-level validation.
    pub fn from_str(contents: &str) -> Result<Self, PlanError> {
        let value: serde_yaml::Value =
            serde_yaml::from_str(contents).map_err(|e| PlanError::Syntax(e.to_string()))?;
        let raw: PlanYaml =
            serde_yaml::from_value(value).map_err(|e| PlanError::Schema(e.to_string()))?;
        Self::from_yaml(raw)
    }

    fn from_yaml(raw: PlanYaml) -> Result<Self, PlanError> {
        if !is_plan_id(&raw.plan_id) {
            return Err(PlanError::InvalidPlanId(raw.plan_id));
        }
        if !is_semver(&raw.version) {
            return Err(PlanError::InvalidVersion(raw.version));
        }
        if raw.tasks.is_empty() {
            return Err(PlanError::NoTasks);
        }

        let timeout = raw
            .timeout
            .as_deref()
            .map(|s| parse_duration(s).map_err(|_| PlanError::InvalidPlanTimeout(s.to_owned())))
            .transpose()?;

        let mut tasks = Vec::with_capacity(raw.tasks.len());
        for task in raw.tasks {
            tasks.push(Task::from_yaml(task)?);
        }

        Ok(Self {
            plan_id: raw.plan_id,
            name: raw.name,
            version: raw.version,
            description: raw.description,
            context: raw.context,
            timeout,
            tasks,
        })
    }

    pub fn task(&self, index: usize) -> &Task {
        &self.tasks[index]
    }
}

impl Task {
    fn from_yaml(raw: TaskYaml) -> Result<Self, PlanError> {
        let task_id = raw.task_id;
        if !is_task_id(&task_id) {
            return Err(PlanError::InvalidTaskId(task_id));
        }

        let agent = AgentId::from_str(&raw.agent).map_err(|_| PlanError::UnknownAgent {
            task: task_id.clone(),
            agent: raw.agent.clone(),
        })?;

        let task_type =
            TaskType::from_str(&raw.task_type).map_err(|_| PlanError::UnknownTaskType {
                task: task_id.clone(),
                value: raw.task_type.clone(),
            })?;

        if raw.max_retries > MAX_RETRIES_LIMIT {
            return Err(PlanError::RetriesOutOfRange {
                task: task_id,
                value: raw.max_retries,
            });
        }

        let fallback_agent = raw
            .fallback_agent
            .as_deref()
            .map(|s| {
                AgentId::from_str(s).map_err(|_| PlanError::UnknownAgent {
                    task: task_id.clone(),
                    agent: s.to_owned(),
                })
            })
            .transpose()?;

        let timeout = parse_duration_field(&task_id, "timeout", raw.timeout.as_deref())?
            .unwrap_or(DEFAULT_TASK_TIMEOUT);
        let retry_delay = parse_duration_field(&task_id, "retry_delay", raw.retry_delay.as_deref())?
            .unwrap_or(DEFAULT_RETRY_DELAY);

        let retry_strategy = raw
            .retry_strategy
            .as_deref()
            .map(|s| {
                RetryStrategy::from_str(s).map_err(|_| PlanError::InvalidRetryStrategy {
                    task: task_id.clone(),
                    value: s.to_owned(),
                })
            })
            .transpose()?
            .unwrap_or_default();

        let priority = raw
            .priority
            .as_deref()
            .map(|s| {
                Priority::from_str(s).map_err(|_| PlanError::InvalidPriority {
                    task: task_id.clone(),
                    value: s.to_owned(),
                })
            })
            .transpose()?
            .unwrap_or_default();

        let content = serde_json::to_value(&raw.content)
            .map_err(|e| PlanError::Schema(format!("task {task_id}: content: {e}")))?;

        Ok(Self {
            task_id,
            agent,
            task_type,
            description: raw.description,
            content,
            dependencies: raw.dependencies,
            max_retries: raw.max_retries,
            fallback_agent,
            timeout,
            retry_strategy,
            retry_delay,
            priority,
            when: raw.when,
            unless: raw.unless,
        })
    }
}

fn parse_duration_field(
    task: &str,
    field: &'static str,
    value: Option<&str>,
) -> Result<Option<Duration>, PlanError> {
    value
        .map(|s| {
            parse_duration(s).map_err(|_| PlanError::InvalidDuration {
                task: task.to_owned(),
                field,
                value: s.to_owned(),
            })
        })
        .transpose()
}

fn is_plan_id(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn is_task_id(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

fn is_semver(s: &str) -> bool {
    let parts: Vec<&str> = s.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(task_id: &str) -> String {
        format!(
            r#"
plan_id: test-plan
version: 1.0.0
tasks:
  - task_id: {task_id}
    agent: CA
    task_type: custom
"#
        )
    }

    #[test]
    fn loads_minimal_plan_with_defaults() {
        let plan = Plan::from_str(&minimal("A")).unwrap();
        assert_eq!(plan.plan_id, "test-plan");
        let task = &plan.tasks[0];
        assert_eq!(task.agent, AgentId::Ca);
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.retry_strategy, RetryStrategy::ExponentialBackoff);
        assert_eq!(task.retry_delay, DEFAULT_RETRY_DELAY);
        assert_eq!(task.timeout, DEFAULT_TASK_TIMEOUT);
        assert_eq!(task.priority, Priority::Medium);
    }

    #[test]
    fn malformed_yaml_is_a_syntax_error() {
        let err = Plan::from_str(": not yaml : [").unwrap_err();
        assert!(matches!(err, PlanError::Syntax(_)), "got: {err}");
    }

    #[test]
    fn unknown_keys_are_schema_errors() {
        let yaml = r#"
plan_id: p
version: 1.0.0
bogus_key: 1
tasks:
  - task_id: A
    agent: CA
    task_type: custom
"#;
        let err = Plan::from_str(yaml).unwrap_err();
        assert!(matches!(err, PlanError::Schema(_)), "got: {err}");
    }

    #[test]
    fn rejects_lowercase_task_id() {
        let err = Plan::from_str(&minimal("lowercase")).unwrap_err();
        assert!(matches!(err, PlanError::InvalidTaskId(_)), "got: {err}");
    }

    #[test]
    fn rejects_unknown_agent() {
        let yaml = r#"
plan_id: p
version: 1.0.0
tasks:
  - task_id: A
    agent: ROBOT
    task_type: custom
"#;
        let err = Plan::from_str(yaml).unwrap_err();
        assert!(
            matches!(err, PlanError::UnknownAgent { ref agent, .. } if agent == "ROBOT"),
            "got: {err}"
        );
    }

    #[test]
    fn rejects_bad_version() {
        for version in ["1.0", "v1.0.0", "1.0.0-rc1", "1..0"] {
            let yaml = format!(
                r#"
plan_id: p
version: "{version}"
tasks:
  - task_id: A
    agent: CA
    task_type: custom
"#
            );
            let err = Plan::from_str(&yaml).unwrap_err();
            assert!(
                matches!(err, PlanError::InvalidVersion(_)),
                "{version}: got {err}"
            );
        }
    }

    #[test]
    fn rejects_retries_above_limit() {
        let yaml = r#"
plan_id: p
version: 1.0.0
tasks:
  - task_id: A
    agent: CA
    task_type: custom
    max_retries: 11
"#;
        let err = Plan::from_str(yaml).unwrap_err();
        assert!(matches!(err, PlanError::RetriesOutOfRange { value: 11, .. }));
    }

    #[test]
    fn rejects_bad_duration() {
        let yaml = r#"
plan_id: p
version: 1.0.0
tasks:
  - task_id: A
    agent: CA
    task_type: custom
    timeout: 5minutes
"#;
        let err = Plan::from_str(yaml).unwrap_err();
        assert!(matches!(
            err,
            PlanError::InvalidDuration {
                field: "timeout",
                ..
            }
        ));
    }

    #[test]
    fn empty_tasks_rejected() {
        let yaml = "plan_id: p\nversion: 1.0.0\ntasks: []\n";
        let err = Plan::from_str(yaml).unwrap_err();
        assert!(matches!(err, PlanError::NoTasks));
    }

    #[test]
    fn context_scalars_are_seeded() {
        let yaml = r#"
plan_id: p
version: 1.0.0
context:
  environment: production
  threshold: 0.8
  dry_run: false
tasks:
  - task_id: A
    agent: CA
    task_type: custom
"#;
        let plan = Plan::from_str(yaml).unwrap();
        assert_eq!(plan.context.len(), 3);
        assert_eq!(
            plan.context["environment"],
            Scalar::Str("production".into())
        );
        assert_eq!(plan.context["dry_run"], Scalar::Bool(false));
    }

    #[test]
    fn content_is_preserved_as_json() {
        let yaml = r#"
plan_id: p
version: 1.0.0
tasks:
  - task_id: A
    agent: CA
    task_type: data_processing
    content:
      action: transform
      parameters:
        format: csv
      input_files: [a.csv, b.csv]
"#;
        let plan = Plan::from_str(yaml).unwrap();
        let content = &plan.tasks[0].content;
        assert_eq!(content["action"], "transform");
        assert_eq!(content["parameters"]["format"], "csv");
        assert_eq!(content["input_files"][1], "b.csv");
    }
}
