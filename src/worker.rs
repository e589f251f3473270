//! The Worker Loop (§4.6): polls the Queue, claims a task, invokes the user
//! callable with its merged input, and reports success/failure back through
//! the Store's transition functions.
//!
//! Grounded on the teacher's `Dispatcher`: an `Arc<Mutex<...>>`-shared pool of
//! long-lived `tokio::spawn` loops, with `spawn_blocking` around the
//! synchronous Store/Queue calls and a shutdown flag checked every
//! iteration. The dispatcher's own cascade bookkeeping (`check_workflow_completion`,
//! `determine_next_steps`) is gone — that logic now lives in `store.rs`'s
//! transition functions, which is where the spec puts it.

use crate::config::{QueueConfig, WorkerConfig};
use crate::error::{EngineError, EngineResult};
use crate::models::{CallableOutcome, Callable, ResolvedWorkflow};
use crate::queue::Queue;
use crate::store::Store;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Computes the merged input for a task of step `step_slug` in run `run_id`
/// (§6.3): `run.input` plus each upstream's aggregated output placed
/// verbatim under its slug (shallow merge), plus `"item"` for a map task.
pub fn merged_input(store: &Store, resolved: &ResolvedWorkflow, run_id: Uuid, step_slug: &str, task_index: i64) -> EngineResult<Value> {
    let run = store
        .get_run(run_id)?
        .ok_or_else(|| EngineError::Internal(format!("no such run {run_id}")))?;
    let mut merged = match run.input {
        Value::Object(map) => map,
        Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("input".to_string(), other);
            map
        }
    };

    for upstream in resolved.ordered_upstreams(step_slug) {
        let upstream_def = resolved.steps.get(&upstream);
        let aggregated = match upstream_def.map(|d| d.kind) {
            Some(crate::models::StepKind::Single) => store
                .get_task(run_id, &upstream, 0)?
                .and_then(|t| t.output)
                .unwrap_or(Value::Null),
            Some(crate::models::StepKind::Map) => {
                let tasks = store.get_completed_tasks(run_id, &upstream)?;
                Value::Array(tasks.into_iter().map(|t| t.output.unwrap_or(Value::Null)).collect())
            }
            None => Value::Null,
        };
        merged.insert(upstream.clone(), aggregated);
    }

    if matches!(resolved.steps.get(step_slug).map(|s| s.kind), Some(crate::models::StepKind::Map)) {
        let producers = resolved.deps.get(step_slug).cloned().unwrap_or_default();
        if producers.len() == 1 {
            let producer = producers.into_iter().next().unwrap();
            if let Some(task) = store.get_task(run_id, &producer, 0)? {
                if let Some(Value::Array(items)) = task.output {
                    if let Some(item) = items.get(task_index as usize) {
                        merged.insert("item".to_string(), item.clone());
                    }
                }
            }
        }
    }

    Ok(Value::Object(merged))
}

/// One worker's view of a resolved workflow: its Store, Queue, and callable
/// registry, plus the tunables from `EngineConfig`.
pub struct Worker {
    pub id: String,
    store: Arc<Store>,
    queue: Arc<dyn Queue>,
    resolved: Arc<ResolvedWorkflow>,
    callables: Arc<HashMap<String, Callable>>,
    worker_config: WorkerConfig,
    queue_config: QueueConfig,
}

impl Worker {
    pub fn new(
        id: String,
        store: Arc<Store>,
        queue: Arc<dyn Queue>,
        resolved: Arc<ResolvedWorkflow>,
        callables: Arc<HashMap<String, Callable>>,
        worker_config: WorkerConfig,
        queue_config: QueueConfig,
    ) -> Self {
        Self { id, store, queue, resolved, callables, worker_config, queue_config }
    }

    /// Claims and runs up to `batch_size` ready tasks in one poll. Returns
    /// the number processed (including duplicate-delivery no-ops). This is
    /// the unit `run_loop` repeats and the unit tests drive directly.
    pub fn run_once(&self) -> EngineResult<usize> {
        let batch = self.queue.read_with_poll(
            &self.resolved.slug,
            self.queue_config.batch_size,
            self.queue_config.claim_visibility_timeout_s,
            0,
        )?;

        for msg in &batch {
            self.process_message(msg)?;
        }
        Ok(batch.len())
    }

    fn process_message(&self, msg: &crate::queue::QueueMessage) -> EngineResult<()> {
        let payload = &msg.payload;
        let claimed = self
            .store
            .claim_task(payload.run_id, &payload.step_slug, payload.task_index, &self.id)?;
        if !claimed {
            // Already completed, failed, or the run is terminal: duplicate
            // delivery under at-least-once. Acknowledge and move on.
            self.queue.delete(&self.resolved.slug, &msg.msg_id)?;
            return Ok(());
        }

        let input = merged_input(&self.store, &self.resolved, payload.run_id, &payload.step_slug, payload.task_index)?;
        if !self.callables.contains_key(&payload.step_slug) {
            return Err(EngineError::DefinitionMissing(format!("missing_callable({})", payload.step_slug)));
        }

        let timeout_s = self.resolved.effective_timeout_s(&payload.step_slug);
        let outcome = self.run_callable(&payload.step_slug, input, timeout_s, &msg.msg_id);

        match outcome {
            Ok(CallableOutcome::Ok(output)) => {
                let code = self.store.complete_task(
                    &self.resolved,
                    payload.run_id,
                    &payload.step_slug,
                    payload.task_index,
                    output,
                    self.queue.as_ref(),
                )?;
                let _ = code; // 1, 0 (late completion), or -1 (type violation) all ack the message.
                self.queue.delete(&self.resolved.slug, &msg.msg_id)?;
            }
            Ok(CallableOutcome::Err(reason)) | Err(reason) => {
                self.store
                    .fail_task(&self.resolved, payload.run_id, &payload.step_slug, payload.task_index, &reason, self.queue.as_ref())?;
                // Re-enqueue-on-fail strategy (SPEC_FULL.md §9): `fail_task`
                // already enqueued a fresh message if attempts remain, so the
                // original is always deleted here.
                self.queue.delete(&self.resolved.slug, &msg.msg_id)?;
            }
        }
        Ok(())
    }

    /// Runs `step_slug`'s callable to completion or until `timeout_s`
    /// elapses (§4.6(d)/§5), whichever comes first. The callable runs on its
    /// own joinable thread so a real hang cannot block the caller past the
    /// deadline; exceptions/panics are equivalent to `err(<text>)` (§6.1).
    ///
    /// While waiting, periodically extends the claimed message's MQ
    /// visibility (§4.6(d)) so a still-running task doesn't have its lease
    /// expire and get redelivered to another worker. The extension period is
    /// derived from the claim visibility timeout minus its configured slack.
    fn run_callable(&self, step_slug: &str, input: Value, timeout_s: u64, msg_id: &str) -> Result<CallableOutcome, String> {
        let callables = self.callables.clone();
        let step_slug = step_slug.to_string();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let callable: &Callable = callables.get(&step_slug).expect("callable presence checked by caller");
                callable(input)
            }));
            let _ = tx.send(result);
        });

        let deadline = Instant::now() + Duration::from_secs(timeout_s);
        let heartbeat = Duration::from_secs(
            self.queue_config
                .claim_visibility_timeout_s
                .saturating_sub(self.queue_config.visibility_extend_slack_s)
                .max(1),
        );

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(EngineError::TaskTimeout(timeout_s).to_string());
            }
            match rx.recv_timeout(heartbeat.min(deadline - now)) {
                Ok(Ok(outcome)) => return Ok(outcome),
                Ok(Err(_)) => return Err(EngineError::TaskError("callable panicked".to_string()).to_string()),
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(EngineError::TaskError("callable thread terminated unexpectedly".to_string()).to_string());
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if let Err(e) = self.queue.set_visibility_timeout(&self.resolved.slug, msg_id, self.queue_config.claim_visibility_timeout_s) {
                        log::warn!("failed to extend visibility for {msg_id}: {e}");
                    }
                }
            }
        }
    }
}

/// Drives a pool of workers until `shutdown` is set, then drains in-flight
/// polls up to `shutdown_grace_ms` before returning. Grounded on the
/// teacher's `Dispatcher::start`/`stop` shutdown-flag idiom: each worker is
/// shared via `Arc` so the polling loop can clone it into `spawn_blocking`
/// without borrowing past the loop iteration.
pub async fn run_worker_pool(workers: Vec<Worker>, shutdown: Arc<AtomicBool>, config: WorkerConfig) {
    let mut handles = Vec::with_capacity(workers.len());
    for worker in workers {
        let worker = Arc::new(worker);
        let shutdown = shutdown.clone();
        let poll_interval = Duration::from_millis(config.poll_interval_ms);
        handles.push(tokio::spawn(async move {
            loop {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let blocking_worker = worker.clone();
                let processed = tokio::task::spawn_blocking(move || blocking_worker.run_once())
                    .await
                    .unwrap_or_else(|e| {
                        log::error!("worker {} task panicked: {e}", worker.id);
                        Ok(0)
                    });
                match processed {
                    Ok(0) => tokio::time::sleep(poll_interval).await,
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("worker {} poll error: {e}", worker.id);
                        tokio::time::sleep(poll_interval).await;
                    }
                }
            }
        }));
    }

    let grace = Duration::from_millis(config.shutdown_grace_ms);
    let drain = async {
        for handle in handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(grace, drain).await.is_err() {
        log::warn!("worker pool shutdown grace period elapsed with workers still draining");
    }
}
