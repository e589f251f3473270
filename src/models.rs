//! Data models for the workflow coordination engine
//!
//! These are semantic containers, not table DDL — `store::Store` is
//! responsible for mapping them onto rows. Timestamps are `None` until the
//! corresponding lifecycle transition sets them.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// `[a-z0-9]([a-z0-9_]{0,61}[a-z0-9])?`
pub fn is_valid_slug(slug: &str) -> bool {
    let bytes = slug.as_bytes();
    if bytes.is_empty() || bytes.len() > 63 {
        return false;
    }
    let is_head_or_tail = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !is_head_or_tail(bytes[0]) || !is_head_or_tail(bytes[bytes.len() - 1]) {
        return false;
    }
    bytes[1..bytes.len() - 1]
        .iter()
        .all(|&b| is_head_or_tail(b) || b == b'_')
}

pub fn validate_slug(slug: &str) -> EngineResult<()> {
    if is_valid_slug(slug) {
        Ok(())
    } else {
        Err(EngineError::Validation(format!("invalid slug: {slug}")))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Single,
    Map,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Single => "single",
            StepKind::Map => "map",
        }
    }

    pub fn from_str(s: &str) -> EngineResult<Self> {
        match s {
            "single" => Ok(StepKind::Single),
            "map" => Ok(StepKind::Map),
            other => Err(EngineError::Internal(format!("unknown step kind: {other}"))),
        }
    }
}

/// Definition-time description of a single step. `initial_tasks` is `None`
/// for a dynamic map whose fan-out is only known once its producing upstream
/// completes.
#[derive(Debug, Clone)]
pub struct StepDefinition {
    pub slug: String,
    pub step_index: i64,
    pub kind: StepKind,
    pub initial_tasks: Option<i64>,
    pub max_attempts_override: Option<u32>,
    pub timeout_s_override: Option<u64>,
    pub callable_ref: String,
}

impl StepDefinition {
    /// `initial_tasks` known at definition time: 1 for `single`, the
    /// configured fixed value for a fixed-fan-out `map`, `None` for dynamic.
    pub fn known_fanout(&self) -> Option<i64> {
        match self.kind {
            StepKind::Single => Some(1),
            StepKind::Map => self.initial_tasks,
        }
    }
}

/// A resolved, callable-bound workflow ready for the Run Initializer.
/// Produced by the Definition Resolver (`definition::resolve`); never
/// mutates the Store itself.
#[derive(Clone)]
pub struct ResolvedWorkflow {
    pub slug: String,
    pub max_attempts: u32,
    pub timeout_s: u64,
    pub steps: HashMap<String, StepDefinition>,
    /// step_slug -> its upstream dependencies
    pub deps: HashMap<String, HashSet<String>>,
    pub roots: Vec<String>,
}

impl ResolvedWorkflow {
    pub fn effective_max_attempts(&self, step_slug: &str) -> u32 {
        self.steps
            .get(step_slug)
            .and_then(|s| s.max_attempts_override)
            .unwrap_or(self.max_attempts)
    }

    pub fn effective_timeout_s(&self, step_slug: &str) -> u64 {
        self.steps
            .get(step_slug)
            .and_then(|s| s.timeout_s_override)
            .unwrap_or(self.timeout_s)
    }

    /// Dependents of `step_slug`, i.e. steps whose dependency set contains it.
    pub fn downstream_of(&self, step_slug: &str) -> Vec<String> {
        self.deps
            .iter()
            .filter(|(_, ups)| ups.contains(step_slug))
            .map(|(slug, _)| slug.clone())
            .collect()
    }

    /// Ordered upstreams of `step_slug`, ascending by `step_index`, used for
    /// deterministic merged-input construction (§6.3).
    pub fn ordered_upstreams(&self, step_slug: &str) -> Vec<String> {
        let mut ups: Vec<String> = self
            .deps
            .get(step_slug)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        ups.sort_by_key(|slug| self.steps.get(slug).map(|s| s.step_index).unwrap_or(i64::MAX));
        ups
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Started => "started",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> EngineResult<Self> {
        match s {
            "started" => Ok(RunStatus::Started),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(EngineError::Internal(format!("unknown run status: {other}"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct Run {
    pub id: Uuid,
    pub workflow_slug: String,
    pub status: RunStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub remaining_steps: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Created,
    Started,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Created => "created",
            StepStatus::Started => "started",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> EngineResult<Self> {
        match s {
            "created" => Ok(StepStatus::Created),
            "started" => Ok(StepStatus::Started),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            other => Err(EngineError::Internal(format!("unknown step status: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepState {
    pub run_id: Uuid,
    pub step_slug: String,
    pub status: StepStatus,
    pub remaining_deps: i64,
    pub initial_tasks: Option<i64>,
    pub remaining_tasks: i64,
    pub attempts_count: i64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Started,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Started => "started",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> EngineResult<Self> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "started" => Ok(TaskStatus::Started),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(EngineError::Internal(format!("unknown task status: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepTask {
    pub run_id: Uuid,
    pub step_slug: String,
    pub task_index: i64,
    pub status: TaskStatus,
    pub attempts: i64,
    pub output: Option<Value>,
    pub error_message: Option<String>,
    pub idempotency_key: String,
    pub last_worker_id: Option<String>,
}

/// Lowercase MD5 hex of `workflow_slug || "::" || step_slug || "::" || run_id
/// || "::" || task_index`, globally unique per §3.
pub fn idempotency_key(workflow_slug: &str, step_slug: &str, run_id: &Uuid, task_index: i64) -> String {
    let material = format!("{workflow_slug}::{step_slug}::{run_id}::{task_index}");
    format!("{:x}", md5::compute(material.as_bytes()))
}

#[derive(Debug, Clone)]
pub struct StepDependency {
    pub run_id: Uuid,
    pub step_slug: String,
    pub depends_on_step: String,
}

/// The opaque payload carried by the Queue (§6.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub run_id: Uuid,
    pub step_slug: String,
    pub task_index: i64,
    pub is_map_task: bool,
}

/// What a user callable returns (§6.1).
pub enum CallableOutcome {
    Ok(Value),
    Err(String),
}

/// A user-supplied step function. Exceptions/panics are caught at the
/// invocation boundary in `worker::Worker` and treated as `Err`.
pub type Callable = Box<dyn Fn(Value) -> CallableOutcome + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_grammar() {
        assert!(is_valid_slug("a"));
        assert!(is_valid_slug("fetch_data"));
        assert!(is_valid_slug("step9"));
        assert!(!is_valid_slug(""));
        assert!(!is_valid_slug("_leading"));
        assert!(!is_valid_slug("trailing_"));
        assert!(!is_valid_slug("Has-Upper"));
        assert!(!is_valid_slug("has space"));
    }

    #[test]
    fn idempotency_key_is_stable_and_32_hex() {
        let run_id = Uuid::new_v4();
        let k1 = idempotency_key("wf", "step", &run_id, 0);
        let k2 = idempotency_key("wf", "step", &run_id, 0);
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 32);
        assert!(k1.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        let k3 = idempotency_key("wf", "step", &run_id, 1);
        assert_ne!(k1, k3);
    }

    #[test]
    fn known_fanout() {
        let single = StepDefinition {
            slug: "a".into(),
            step_index: 0,
            kind: StepKind::Single,
            initial_tasks: None,
            max_attempts_override: None,
            timeout_s_override: None,
            callable_ref: "a".into(),
        };
        assert_eq!(single.known_fanout(), Some(1));

        let fixed_map = StepDefinition {
            kind: StepKind::Map,
            initial_tasks: Some(5),
            ..single.clone()
        };
        assert_eq!(fixed_map.known_fanout(), Some(5));

        let dynamic_map = StepDefinition {
            kind: StepKind::Map,
            initial_tasks: None,
            ..single
        };
        assert_eq!(dynamic_map.known_fanout(), None);
    }
}
