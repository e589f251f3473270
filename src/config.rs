//! Configuration for the workflow coordination engine
//!
//! Centralizes tunables for the Store, Queue, and Worker Loop, supporting
//! both default values and environment variable overrides.

use std::env;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub worker: WorkerConfig,
    pub queue: QueueConfig,
    pub retry: RetryConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub poll_interval_ms: u64,
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub batch_size: usize,
    pub claim_visibility_timeout_s: u64,
    pub visibility_extend_slack_s: u64,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub default_max_attempts: u32,
    pub default_timeout_s: u64,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: String,
    pub busy_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            queue: QueueConfig::default(),
            retry: RetryConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            min_workers: env::var("WORKFLOW_ENGINE_MIN_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            max_workers: env::var("WORKFLOW_ENGINE_MAX_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
            poll_interval_ms: env::var("WORKFLOW_ENGINE_POLL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(250),
            shutdown_grace_ms: env::var("WORKFLOW_ENGINE_SHUTDOWN_GRACE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10_000),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: env::var("WORKFLOW_ENGINE_QUEUE_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            claim_visibility_timeout_s: env::var("WORKFLOW_ENGINE_CLAIM_VISIBILITY_TIMEOUT_S")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            visibility_extend_slack_s: env::var("WORKFLOW_ENGINE_VISIBILITY_EXTEND_SLACK_S")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: env::var("WORKFLOW_ENGINE_DEFAULT_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            default_timeout_s: env::var("WORKFLOW_ENGINE_DEFAULT_TIMEOUT_S")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: env::var("WORKFLOW_ENGINE_DB_PATH")
                .unwrap_or_else(|_| "workflow_engine.db".to_string()),
            busy_timeout_ms: env::var("WORKFLOW_ENGINE_DB_BUSY_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5000),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.worker.min_workers == 0 {
            return Err("minimum workers must be greater than 0".to_string());
        }
        if self.worker.max_workers < self.worker.min_workers {
            return Err("maximum workers must be >= minimum workers".to_string());
        }
        if self.queue.batch_size == 0 {
            return Err("queue batch size must be greater than 0".to_string());
        }
        if self.retry.default_max_attempts == 0 {
            return Err("default max attempts must be greater than 0".to_string());
        }
        if self.retry.default_timeout_s == 0 {
            return Err("default timeout must be greater than 0".to_string());
        }
        Ok(())
    }
}
