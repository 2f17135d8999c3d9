//! On-disk YAML format for plan files.
//!
//! These types map one-to-one to the plan document and are deserialized
//! via `serde` + `serde_yaml`. `deny_unknown_fields` enforces the schema
//! rule that unrecognized keys are rejected, both at the top level and
//! inside task objects. Enum-valued fields are kept as strings here and
//! validated via `FromStr` during conversion to the domain [`Plan`],
//! so error messages can name the task at fault.
//!
//! [`Plan`]: super::Plan

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::context::Scalar;

/// Top-level structure of a plan YAML document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanYaml {
    /// Plan identity: `[A-Za-z0-9_-]+`.
    pub plan_id: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: Option<String>,
    /// Semantic version: `MAJOR.MINOR.PATCH`.
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Seed values for the runtime context.
    #[serde(default)]
    pub context: BTreeMap<String, Scalar>,
    /// Plan-level variables. Advisory; not consumed by the core.
    #[serde(default)]
    pub variables: Option<serde_yaml::Value>,
    /// Notification hooks. Advisory; not consumed by the core.
    #[serde(default)]
    pub notifications: Option<serde_yaml::Value>,
    /// Lifecycle hooks. Advisory; not consumed by the core.
    #[serde(default)]
    pub hooks: Option<serde_yaml::Value>,
    /// Overall plan timeout (`\d+[smhd]`). Falls back to the
    /// orchestrator default when absent.
    #[serde(default)]
    pub timeout: Option<String>,
    pub tasks: Vec<TaskYaml>,
}

/// A single task entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskYaml {
    /// Unique uppercase token: `[A-Z0-9_-]+`.
    pub task_id: String,
    /// Target agent, from the closed agent enumeration.
    pub agent: String,
    pub task_type: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Opaque task body passed through to the agent (action, parameters,
    /// input/output file lists, requirements).
    #[serde(default)]
    pub content: serde_yaml::Value,
    /// Task ids this task depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub fallback_agent: Option<String>,
    /// Per-attempt timeout (`\d+[smhd]`).
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub retry_strategy: Option<String>,
    /// Initial retry delay (`\d+[smhd]`).
    #[serde(default)]
    pub retry_delay: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    /// Eligibility expression: run only when this is true.
    #[serde(default)]
    pub when: Option<String>,
    /// Eligibility expression: skip when this is true.
    #[serde(default)]
    pub unless: Option<String>,
    /// Per-event email lists. Advisory; not consumed by the core.
    #[serde(default)]
    pub notifications: Option<serde_yaml::Value>,
}

fn default_max_retries() -> u32 {
    3
}
