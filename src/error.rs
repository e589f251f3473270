//! Error types for the workflow coordination engine

use thiserror::Error;

/// Engine error taxonomy. Names track the semantic classes the coordination
/// engine distinguishes, not the originating Rust type.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("json serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("uuid parsing error: {0}")]
    UuidParse(#[from] uuid::Error),

    /// Bad slug, unknown dependency edge, no root steps, or a cycle. Rejected
    /// at definition resolution; never reaches the Store.
    #[error("validation error: {0}")]
    Validation(String),

    /// Workflow or callable referenced by the definition is absent.
    #[error("definition missing: {0}")]
    DefinitionMissing(String),

    /// A transient Store failure the caller should retry at the transition
    /// level, not inside a transition.
    #[error("transient store error: {0}")]
    TransientStore(String),

    /// A transient queue read/write failure; the worker retries after
    /// backoff, unacknowledged messages reappear after visibility timeout.
    #[error("transient queue error: {0}")]
    TransientQueue(String),

    /// A callable exceeded its effective timeout.
    #[error("task timed out after {0}s")]
    TaskTimeout(u64),

    /// A callable returned `err(...)` or panicked.
    #[error("task error: {0}")]
    TaskError(String),

    /// A downstream map step required an array output from its producer and
    /// got something else. Not constructed internally: `Store::complete_task`
    /// models this as its `-1` return code and the persisted `Run.error`
    /// string `"type_violation"` (§7), since it's an expected transition
    /// outcome rather than an exceptional failure. Kept for callers that want
    /// to translate a terminal run's persisted error into a typed value.
    #[error("type violation: {0}")]
    TypeViolation(String),

    /// `attempts = max_attempts`; step and run fail, successors never run.
    /// Likewise modeled as persisted `Run`/`StepState` state rather than an
    /// `Err`, not constructed internally; see `TypeViolation`.
    #[error("retries exhausted: {0}")]
    ExhaustedRetries(String),

    /// `complete_task`/`fail_task` observed on a run that is already
    /// terminal. `Store::complete_task` returns `0` for this case instead of
    /// constructing this variant; see `TypeViolation`.
    #[error("late completion for run {0}")]
    LateCompletion(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
