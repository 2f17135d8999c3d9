//! The runtime context: a scalar map seeded from the plan's `context`
//! block and extended as tasks reach terminal states. Conditional
//! expressions (`when` / `unless`) are evaluated against it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A scalar context value.
///
/// The untagged representation means YAML/JSON scalars deserialize to the
/// natural variant (`true` → `Bool`, `3` → `Int`, `0.85` → `Float`,
/// `"x"` → `Str`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Scalar {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
        }
    }

    /// Numeric view, for comparisons across int/float.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => write!(f, "{s}"),
        }
    }
}

/// The mutable scalar map consumed by conditional expressions.
///
/// Only the scheduler mutates the context, and only between task
/// terminations and the next eligibility check; workers receive a cloned
/// snapshot at dispatch time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeContext {
    values: BTreeMap<String, Scalar>,
}

impl RuntimeContext {
    /// Seed from a plan's `context` block.
    pub fn seeded(initial: &BTreeMap<String, Scalar>) -> Self {
        Self {
            values: initial.clone(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Scalar> {
        self.values.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Scalar) {
        self.values.insert(key.into(), value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Record a task's terminal outcome:
    /// `{TASK_ID}_status`, `{TASK_ID}_score` (when scored),
    /// `{TASK_ID}_success`, and `{TASK_ID}_completed = true`.
    pub fn record_outcome(
        &mut self,
        task_id: &str,
        status: &str,
        score: Option<f64>,
        success: bool,
    ) {
        self.insert(format!("{task_id}_status"), Scalar::Str(status.to_owned()));
        if let Some(score) = score {
            self.insert(format!("{task_id}_score"), Scalar::Float(score));
        }
        self.insert(format!("{task_id}_success"), Scalar::Bool(success));
        self.insert(format!("{task_id}_completed"), Scalar::Bool(true));
    }

    /// Serialize to a JSON object for embedding in an envelope's
    /// `context` field.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.values).unwrap_or(serde_json::Value::Null)
    }
}
