//! The Store: durable relational state for runs, step states, tasks, and
//! dependencies, and the host of the Transition Engine (§4.1, §4.5).
//!
//! Every transition below is one logical transaction: it locks the rows it
//! touches (Run, then affected StepStates in `step_slug` order, then affected
//! StepTasks), mutates them, and returns. Enqueuing onto the `Queue` happens
//! *after* the transaction commits — the Queue is a separate resource and
//! correctness never depends on its ordering, only on Store state (§5).

use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    idempotency_key, ResolvedWorkflow, Run, RunStatus, StepState, StepStatus, StepTask, TaskMessage, TaskStatus,
};
use crate::queue::{EmbeddedQueue, Queue};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// A task to enqueue once the owning transaction has committed, paired with
/// the visibility timeout its step was configured with.
struct PendingEnqueue {
    message: TaskMessage,
    visibility_timeout_s: u64,
}

pub struct Store {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P, clock: Arc<dyn Clock>) -> EngineResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| EngineError::Internal(e.to_string()))?;
            }
        }
        let conn = Connection::open(path).map_err(EngineError::from)?;
        conn.execute_batch(include_str!("schema.sql")).map_err(EngineError::from)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)), clock })
    }

    pub fn in_memory(clock: Arc<dyn Clock>) -> EngineResult<Self> {
        let conn = Connection::open_in_memory().map_err(EngineError::from)?;
        conn.execute_batch(include_str!("schema.sql")).map_err(EngineError::from)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)), clock })
    }

    /// Hands out a `Queue` sharing this Store's connection, for the embedded
    /// single-process adapter.
    pub fn embedded_queue(&self) -> EmbeddedQueue {
        EmbeddedQueue::new(self.conn.clone(), self.clock.clone())
    }

    fn with_tx<T>(&self, f: impl FnOnce(&Transaction, DateTime<Utc>) -> EngineResult<T>) -> EngineResult<T> {
        let mut conn = self.conn.lock().map_err(|_| EngineError::TransientStore("store connection poisoned".into()))?;
        let tx = conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .map_err(EngineError::from)?;
        let now = self.clock.now();
        let result = f(&tx, now)?;
        tx.commit().map_err(EngineError::from)?;
        Ok(result)
    }

    fn flush(&self, queue: &dyn Queue, workflow_slug: &str, pending: Vec<PendingEnqueue>) -> EngineResult<()> {
        for p in pending {
            queue.send(workflow_slug, &p.message, p.visibility_timeout_s)?;
        }
        Ok(())
    }

    /// Persists a resolved workflow's definition-time shape so later resolver
    /// lookups (and the check-constraint slug grammar) are backed by the
    /// Store, per §4.1 / §6.4.
    pub fn register_workflow(&self, resolved: &ResolvedWorkflow) -> EngineResult<()> {
        self.with_tx(|tx, now| {
            tx.execute(
                "INSERT INTO workflows (slug, max_attempts, timeout_s, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(slug) DO UPDATE SET max_attempts = excluded.max_attempts, timeout_s = excluded.timeout_s",
                params![resolved.slug, resolved.max_attempts, resolved.timeout_s as i64, now.to_rfc3339()],
            )?;
            tx.execute("DELETE FROM step_definitions WHERE workflow_slug = ?1", params![resolved.slug])?;
            tx.execute("DELETE FROM step_definition_deps WHERE workflow_slug = ?1", params![resolved.slug])?;
            for (slug, step) in &resolved.steps {
                tx.execute(
                    "INSERT INTO step_definitions
                        (workflow_slug, step_slug, step_index, kind, initial_tasks, max_attempts_override, timeout_s_override, callable_ref)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        resolved.slug,
                        slug,
                        step.step_index,
                        step.kind.as_str(),
                        step.initial_tasks,
                        step.max_attempts_override,
                        step.timeout_s_override.map(|v| v as i64),
                        step.callable_ref,
                    ],
                )?;
            }
            for (slug, ups) in &resolved.deps {
                for dep in ups {
                    tx.execute(
                        "INSERT INTO step_definition_deps (workflow_slug, step_slug, depends_on_step) VALUES (?1, ?2, ?3)",
                        params![resolved.slug, slug, dep],
                    )?;
                }
            }
            Ok(())
        })
    }

    // ---- Run Initializer (§4.2) -------------------------------------------------

    pub fn insert_run(&self, resolved: &ResolvedWorkflow, queue: &dyn Queue, input: Value) -> EngineResult<Uuid> {
        if resolved.steps.is_empty() || resolved.roots.is_empty() {
            return Err(EngineError::Validation("no_root_steps".to_string()));
        }

        let run_id = Uuid::new_v4();
        let pending = self.with_tx(|tx, now| {
            tx.execute(
                "INSERT INTO runs (id, workflow_slug, status, input, remaining_steps, created_at, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    run_id.to_string(),
                    resolved.slug,
                    RunStatus::Started.as_str(),
                    serde_json::to_string(&input)?,
                    resolved.steps.len() as i64,
                    now.to_rfc3339(),
                ],
            )?;

            for (slug, step) in &resolved.steps {
                let deps = resolved.deps.get(slug).cloned().unwrap_or_default();
                tx.execute(
                    "INSERT INTO step_states (run_id, step_slug, status, remaining_deps, initial_tasks, remaining_tasks, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        run_id.to_string(),
                        slug,
                        StepStatus::Created.as_str(),
                        deps.len() as i64,
                        step.known_fanout(),
                        step.known_fanout().unwrap_or(0),
                        now.to_rfc3339(),
                    ],
                )?;
                for dep in &deps {
                    tx.execute(
                        "INSERT INTO step_dependencies (run_id, step_slug, depends_on_step) VALUES (?1, ?2, ?3)",
                        params![run_id.to_string(), slug, dep],
                    )?;
                }
            }

            let mut pending = start_ready_steps_tx(tx, resolved, run_id, now)?;
            pending.extend(cascade_complete_taskless_steps_tx(tx, resolved, run_id, now)?);
            maybe_complete_run_tx(tx, resolved, run_id, now)?;
            Ok(pending)
        })?;

        self.flush(queue, &resolved.slug, pending)?;
        Ok(run_id)
    }

    // ---- Transition Engine (§4.5) -----------------------------------------------

    pub fn start_ready_steps(&self, resolved: &ResolvedWorkflow, run_id: Uuid, queue: &dyn Queue) -> EngineResult<()> {
        let pending = self.with_tx(|tx, now| start_ready_steps_tx(tx, resolved, run_id, now))?;
        self.flush(queue, &resolved.slug, pending)
    }

    pub fn cascade_complete_taskless_steps(&self, resolved: &ResolvedWorkflow, run_id: Uuid, queue: &dyn Queue) -> EngineResult<()> {
        let pending = self.with_tx(|tx, now| cascade_complete_taskless_steps_tx(tx, resolved, run_id, now))?;
        self.flush(queue, &resolved.slug, pending)
    }

    pub fn maybe_complete_run(&self, resolved: &ResolvedWorkflow, run_id: Uuid) -> EngineResult<()> {
        self.with_tx(|tx, now| maybe_complete_run_tx(tx, resolved, run_id, now))
    }

    /// Returns `1` on a genuine completion, `0` if the run was already
    /// terminal (late completion, guard), `-1` on a type violation.
    pub fn complete_task(
        &self,
        resolved: &ResolvedWorkflow,
        run_id: Uuid,
        step_slug: &str,
        task_index: i64,
        output: Value,
        queue: &dyn Queue,
    ) -> EngineResult<i32> {
        let (code, pending) = self.with_tx(|tx, now| complete_task_tx(tx, resolved, run_id, step_slug, task_index, output, now))?;
        self.flush(queue, &resolved.slug, pending)?;
        Ok(code)
    }

    /// Worker-claim boundary (§4.6 step 2b): if the task exists and is
    /// `queued` or `started`, marks it `started` under this worker and
    /// returns `true`. Returns `false` when the task is already terminal or
    /// the run itself is terminal — the caller should delete the MQ message
    /// and move on, handling at-least-once duplicate delivery.
    pub fn claim_task(&self, run_id: Uuid, step_slug: &str, task_index: i64, worker_id: &str) -> EngineResult<bool> {
        self.with_tx(|tx, now| {
            let run_status = fetch_run_status(tx, run_id)?;
            if run_status.map(|s| s.is_terminal()).unwrap_or(true) {
                return Ok(false);
            }
            let task = fetch_task(tx, run_id, step_slug, task_index)?;
            let task = match task {
                Some(t) => t,
                None => return Ok(false),
            };
            match task.status {
                TaskStatus::Completed | TaskStatus::Failed => Ok(false),
                TaskStatus::Queued => {
                    tx.execute(
                        "UPDATE step_tasks SET status = 'started', last_worker_id = ?1, started_at = ?2
                         WHERE run_id = ?3 AND step_slug = ?4 AND task_index = ?5",
                        params![worker_id, now.to_rfc3339(), run_id.to_string(), step_slug, task_index],
                    )?;
                    Ok(true)
                }
                TaskStatus::Started => {
                    tx.execute(
                        "UPDATE step_tasks SET last_worker_id = ?1 WHERE run_id = ?2 AND step_slug = ?3 AND task_index = ?4",
                        params![worker_id, run_id.to_string(), step_slug, task_index],
                    )?;
                    Ok(true)
                }
            }
        })
    }

    pub fn fail_task(
        &self,
        resolved: &ResolvedWorkflow,
        run_id: Uuid,
        step_slug: &str,
        task_index: i64,
        error_text: &str,
        queue: &dyn Queue,
    ) -> EngineResult<()> {
        let pending = self.with_tx(|tx, now| fail_task_tx(tx, resolved, run_id, step_slug, task_index, error_text, now))?;
        self.flush(queue, &resolved.slug, pending)
    }

    // ---- Reads --------------------------------------------------------------

    pub fn get_run(&self, run_id: Uuid) -> EngineResult<Option<Run>> {
        let conn = self.conn.lock().map_err(|_| EngineError::TransientStore("store connection poisoned".into()))?;
        conn.query_row(
            "SELECT workflow_slug, status, input, output, error, remaining_steps FROM runs WHERE id = ?1",
            params![run_id.to_string()],
            |row| {
                let input_json: String = row.get(2)?;
                let output_json: Option<String> = row.get(3)?;
                let status: String = row.get(1)?;
                Ok(Run {
                    id: run_id,
                    workflow_slug: row.get(0)?,
                    status: RunStatus::from_str(&status).unwrap_or(RunStatus::Started),
                    input: serde_json::from_str(&input_json).unwrap_or(Value::Null),
                    output: output_json.and_then(|s| serde_json::from_str(&s).ok()),
                    error: row.get(4)?,
                    remaining_steps: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(EngineError::from)
    }

    pub fn get_step_state(&self, run_id: Uuid, step_slug: &str) -> EngineResult<Option<StepState>> {
        let conn = self.conn.lock().map_err(|_| EngineError::TransientStore("store connection poisoned".into()))?;
        fetch_step_state(&conn, run_id, step_slug)
    }

    pub fn get_task(&self, run_id: Uuid, step_slug: &str, task_index: i64) -> EngineResult<Option<StepTask>> {
        let conn = self.conn.lock().map_err(|_| EngineError::TransientStore("store connection poisoned".into()))?;
        fetch_task(&conn, run_id, step_slug, task_index)
    }

    pub fn get_completed_tasks(&self, run_id: Uuid, step_slug: &str) -> EngineResult<Vec<StepTask>> {
        let conn = self.conn.lock().map_err(|_| EngineError::TransientStore("store connection poisoned".into()))?;
        let mut stmt = conn.prepare(
            "SELECT task_index, status, attempts, output, error_message, idempotency_key, last_worker_id
             FROM step_tasks WHERE run_id = ?1 AND step_slug = ?2 AND status = 'completed' ORDER BY task_index ASC",
        )?;
        let rows = stmt
            .query_map(params![run_id.to_string(), step_slug], |row| row_to_task(row, run_id, step_slug))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(EngineError::from)?;
        Ok(rows)
    }
}

fn row_to_task(row: &rusqlite::Row, run_id: Uuid, step_slug: &str) -> rusqlite::Result<StepTask> {
    let task_index: i64 = row.get(0)?;
    let status: String = row.get(1)?;
    let output_json: Option<String> = row.get(3)?;
    Ok(StepTask {
        run_id,
        step_slug: step_slug.to_string(),
        task_index,
        status: TaskStatus::from_str(&status).unwrap_or(TaskStatus::Queued),
        attempts: row.get(2)?,
        output: output_json.and_then(|s| serde_json::from_str(&s).ok()),
        error_message: row.get(4)?,
        idempotency_key: row.get(5)?,
        last_worker_id: row.get(6)?,
    })
}

fn fetch_step_state(conn: &Connection, run_id: Uuid, step_slug: &str) -> EngineResult<Option<StepState>> {
    conn.query_row(
        "SELECT status, remaining_deps, initial_tasks, remaining_tasks, attempts_count, error_message
         FROM step_states WHERE run_id = ?1 AND step_slug = ?2",
        params![run_id.to_string(), step_slug],
        |row| {
            let status: String = row.get(0)?;
            Ok(StepState {
                run_id,
                step_slug: step_slug.to_string(),
                status: StepStatus::from_str(&status).unwrap_or(StepStatus::Created),
                remaining_deps: row.get(1)?,
                initial_tasks: row.get(2)?,
                remaining_tasks: row.get(3)?,
                attempts_count: row.get(4)?,
                error_message: row.get(5)?,
            })
        },
    )
    .optional()
    .map_err(EngineError::from)
}

fn fetch_task(conn: &Connection, run_id: Uuid, step_slug: &str, task_index: i64) -> EngineResult<Option<StepTask>> {
    conn.query_row(
        "SELECT task_index, status, attempts, output, error_message, idempotency_key, last_worker_id
         FROM step_tasks WHERE run_id = ?1 AND step_slug = ?2 AND task_index = ?3",
        params![run_id.to_string(), step_slug, task_index],
        |row| row_to_task(row, run_id, step_slug),
    )
    .optional()
    .map_err(EngineError::from)
}

fn fetch_run_status(tx: &Transaction, run_id: Uuid) -> EngineResult<Option<RunStatus>> {
    tx.query_row("SELECT status FROM runs WHERE id = ?1", params![run_id.to_string()], |row| {
        row.get::<_, String>(0)
    })
    .optional()
    .map_err(EngineError::from)?
    .map(|s| RunStatus::from_str(&s))
    .transpose()
}

fn clamp_decrement(tx: &Transaction, table: &str, column: &str, where_clause: &str, params_vec: &[&dyn rusqlite::ToSql]) -> EngineResult<()> {
    let sql = format!("UPDATE {table} SET {column} = MAX({column} - 1, 0) WHERE {where_clause}");
    tx.execute(&sql, params_vec).map_err(EngineError::from)?;
    Ok(())
}

/// Inserts the task rows and returns the messages to enqueue once committed.
/// Idempotent: skips any `(run_id, step_slug, task_index)` whose idempotency
/// key already exists (§4.5 `start_tasks`).
fn start_tasks_tx(
    tx: &Transaction,
    resolved: &ResolvedWorkflow,
    run_id: Uuid,
    step_slug: &str,
    count: i64,
    now: DateTime<Utc>,
) -> EngineResult<Vec<PendingEnqueue>> {
    let mut pending = Vec::new();
    let timeout_s = resolved.effective_timeout_s(step_slug);
    for task_index in 0..count {
        let key = idempotency_key(&resolved.slug, step_slug, &run_id, task_index);
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO step_tasks
                    (run_id, step_slug, task_index, status, attempts, idempotency_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)",
                params![run_id.to_string(), step_slug, task_index, TaskStatus::Queued.as_str(), key, now.to_rfc3339()],
            )
            .map_err(EngineError::from)?;
        if inserted > 0 {
            pending.push(PendingEnqueue {
                message: TaskMessage {
                    run_id,
                    step_slug: step_slug.to_string(),
                    task_index,
                    is_map_task: count > 1 || resolved.steps.get(step_slug).map(|s| matches!(s.kind, crate::models::StepKind::Map)).unwrap_or(false),
                },
                visibility_timeout_s: timeout_s,
            });
        }
    }
    Ok(pending)
}

fn start_ready_steps_tx(
    tx: &Transaction,
    resolved: &ResolvedWorkflow,
    run_id: Uuid,
    now: DateTime<Utc>,
) -> EngineResult<Vec<PendingEnqueue>> {
    let mut ready_slugs: Vec<String> = {
        let mut stmt = tx.prepare(
            "SELECT step_slug FROM step_states WHERE run_id = ?1 AND status = 'created' AND remaining_deps = 0 ORDER BY step_slug ASC",
        )?;
        let rows = stmt
            .query_map(params![run_id.to_string()], |row| row.get(0))?
            .collect::<Result<_, _>>()
            .map_err(EngineError::from)?;
        rows
    };
    ready_slugs.sort_by_key(|slug| resolved.steps.get(slug).map(|s| s.step_index).unwrap_or(i64::MAX));

    let mut pending = Vec::new();
    for step_slug in ready_slugs {
        let step = match resolved.steps.get(&step_slug) {
            Some(s) => s,
            None => continue,
        };

        // A dynamic map's fan-out is unknown at definition time but may
        // already be known here: its single producing upstream can only
        // have driven `remaining_deps` to 0 (making this step "ready")
        // after `complete_task_tx` recorded the learned count in
        // `step_states.initial_tasks`. Static kinds never need this.
        let known_fanout = match step.known_fanout() {
            Some(n) => Some(n),
            None => tx.query_row(
                "SELECT initial_tasks FROM step_states WHERE run_id = ?1 AND step_slug = ?2",
                params![run_id.to_string(), step_slug],
                |row| row.get::<_, Option<i64>>(0),
            )?,
        };

        tx.execute(
            "UPDATE step_states SET status = 'started', started_at = ?1 WHERE run_id = ?2 AND step_slug = ?3",
            params![now.to_rfc3339(), run_id.to_string(), step_slug],
        )?;

        match known_fanout {
            Some(0) => {
                // No tasks; cascade_complete_taskless_steps finishes this step.
            }
            Some(n) => {
                pending.extend(start_tasks_tx(tx, resolved, run_id, &step_slug, n, now)?);
            }
            None => {
                // Dynamic map whose producing upstream has not completed yet.
            }
        }
    }
    Ok(pending)
}

fn cascade_complete_taskless_steps_tx(
    tx: &Transaction,
    resolved: &ResolvedWorkflow,
    run_id: Uuid,
    now: DateTime<Utc>,
) -> EngineResult<Vec<PendingEnqueue>> {
    let mut pending = Vec::new();
    loop {
        let candidates: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT step_slug FROM step_states
                 WHERE run_id = ?1 AND status != 'completed' AND status != 'failed'
                   AND remaining_deps = 0 AND remaining_tasks = 0
                   AND (initial_tasks IS NULL OR initial_tasks = 0)
                 ORDER BY step_slug ASC",
            )?;
            let rows = stmt
                .query_map(params![run_id.to_string()], |row| row.get(0))?
                .collect::<Result<_, _>>()
                .map_err(EngineError::from)?;
            rows
        };
        if candidates.is_empty() {
            break;
        }

        for step_slug in &candidates {
            complete_step_tx(tx, resolved, run_id, step_slug, now)?;
        }
        pending.extend(start_ready_steps_tx(tx, resolved, run_id, now)?);
    }
    Ok(pending)
}

/// Marks a step completed and propagates `remaining_deps` to its downstream
/// successors and `remaining_steps` on the run. Shared by `complete_task_tx`
/// (a step whose last task just finished) and the taskless cascade.
fn complete_step_tx(tx: &Transaction, resolved: &ResolvedWorkflow, run_id: Uuid, step_slug: &str, now: DateTime<Utc>) -> EngineResult<()> {
    tx.execute(
        "UPDATE step_states SET status = 'completed', completed_at = ?1 WHERE run_id = ?2 AND step_slug = ?3",
        params![now.to_rfc3339(), run_id.to_string(), step_slug],
    )?;
    clamp_decrement(tx, "runs", "remaining_steps", "id = ?1", &[&run_id.to_string()])?;

    for downstream in resolved.downstream_of(step_slug) {
        clamp_decrement(
            tx,
            "step_states",
            "remaining_deps",
            "run_id = ?1 AND step_slug = ?2",
            &[&run_id.to_string(), &downstream],
        )?;
    }
    Ok(())
}

fn maybe_complete_run_tx(tx: &Transaction, resolved: &ResolvedWorkflow, run_id: Uuid, now: DateTime<Utc>) -> EngineResult<()> {
    let status = fetch_run_status(tx, run_id)?;
    if status != Some(RunStatus::Started) {
        return Ok(());
    }
    let remaining_steps: i64 = tx.query_row("SELECT remaining_steps FROM runs WHERE id = ?1", params![run_id.to_string()], |row| row.get(0))?;
    if remaining_steps != 0 {
        return Ok(());
    }

    let mut output = serde_json::Map::new();
    for step_slug in resolved.steps.keys() {
        let step = &resolved.steps[step_slug];
        match step.kind {
            crate::models::StepKind::Single => {
                if let Some(task) = fetch_task(tx, run_id, step_slug, 0)? {
                    output.insert(step_slug.clone(), task.output.unwrap_or(Value::Null));
                }
            }
            crate::models::StepKind::Map => {
                let mut stmt = tx.prepare(
                    "SELECT output FROM step_tasks WHERE run_id = ?1 AND step_slug = ?2 AND status = 'completed' ORDER BY task_index ASC",
                )?;
                let outs: Vec<Value> = stmt
                    .query_map(params![run_id.to_string(), step_slug], |row| row.get::<_, Option<String>>(0))?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(EngineError::from)?
                    .into_iter()
                    .map(|s| s.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or(Value::Null))
                    .collect();
                output.insert(step_slug.clone(), Value::Array(outs));
            }
        }
    }

    tx.execute(
        "UPDATE runs SET status = 'completed', output = ?1, completed_at = ?2 WHERE id = ?3",
        params![serde_json::to_string(&Value::Object(output))?, now.to_rfc3339(), run_id.to_string()],
    )?;
    Ok(())
}

fn complete_task_tx(
    tx: &Transaction,
    resolved: &ResolvedWorkflow,
    run_id: Uuid,
    step_slug: &str,
    task_index: i64,
    output: Value,
    now: DateTime<Utc>,
) -> EngineResult<(i32, Vec<PendingEnqueue>)> {
    let run_status = fetch_run_status(tx, run_id)?;
    if run_status != Some(RunStatus::Started) {
        return Ok((0, Vec::new()));
    }

    let task = fetch_task(tx, run_id, step_slug, task_index)?
        .ok_or_else(|| EngineError::Internal(format!("no such task {run_id}/{step_slug}/{task_index}")))?;
    if task.status != TaskStatus::Started {
        return Ok((0, Vec::new()));
    }

    tx.execute(
        "UPDATE step_tasks SET status = 'completed', output = ?1, completed_at = ?2 WHERE run_id = ?3 AND step_slug = ?4 AND task_index = ?5",
        params![serde_json::to_string(&output)?, now.to_rfc3339(), run_id.to_string(), step_slug, task_index],
    )?;
    clamp_decrement(
        tx,
        "step_states",
        "remaining_tasks",
        "run_id = ?1 AND step_slug = ?2",
        &[&run_id.to_string(), &step_slug.to_string()],
    )?;

    let mut pending = Vec::new();

    // A downstream dynamic map fed by this single producing upstream learns
    // its fan-out here.
    for downstream in resolved.downstream_of(step_slug) {
        let downstream_def = match resolved.steps.get(&downstream) {
            Some(d) if matches!(d.kind, crate::models::StepKind::Map) && d.initial_tasks.is_none() => d,
            _ => continue,
        };
        let producers: Vec<&String> = resolved.deps.get(&downstream).map(|s| s.iter().collect()).unwrap_or_default();
        if producers.len() != 1 || producers[0] != step_slug {
            continue;
        }
        let _ = downstream_def;
        match &output {
            Value::Array(items) => {
                let m = items.len() as i64;
                tx.execute(
                    "UPDATE step_states SET initial_tasks = ?1, remaining_tasks = ?1 WHERE run_id = ?2 AND step_slug = ?3",
                    params![m, run_id.to_string(), downstream],
                )?;
            }
            _ => {
                tx.execute(
                    "UPDATE runs SET status = 'failed', error = ?1, failed_at = ?2 WHERE id = ?3",
                    params!["type_violation", now.to_rfc3339(), run_id.to_string()],
                )?;
                return Ok((-1, Vec::new()));
            }
        }
    }

    let remaining_tasks: i64 = tx.query_row(
        "SELECT remaining_tasks FROM step_states WHERE run_id = ?1 AND step_slug = ?2",
        params![run_id.to_string(), step_slug],
        |row| row.get(0),
    )?;
    if remaining_tasks == 0 {
        complete_step_tx(tx, resolved, run_id, step_slug, now)?;
        pending.extend(start_ready_steps_tx(tx, resolved, run_id, now)?);
    }

    pending.extend(cascade_complete_taskless_steps_tx(tx, resolved, run_id, now)?);
    maybe_complete_run_tx(tx, resolved, run_id, now)?;
    Ok((1, pending))
}

fn fail_task_tx(
    tx: &Transaction,
    resolved: &ResolvedWorkflow,
    run_id: Uuid,
    step_slug: &str,
    task_index: i64,
    error_text: &str,
    now: DateTime<Utc>,
) -> EngineResult<Vec<PendingEnqueue>> {
    let task = fetch_task(tx, run_id, step_slug, task_index)?
        .ok_or_else(|| EngineError::Internal(format!("no such task {run_id}/{step_slug}/{task_index}")))?;
    if task.status != TaskStatus::Started {
        return Ok(Vec::new());
    }

    let attempts = task.attempts + 1;
    let max_attempts = resolved.effective_max_attempts(step_slug) as i64;
    tx.execute(
        "UPDATE step_tasks SET attempts = ?1 WHERE run_id = ?2 AND step_slug = ?3 AND task_index = ?4",
        params![attempts, run_id.to_string(), step_slug, task_index],
    )?;

    if attempts < max_attempts {
        tx.execute(
            "UPDATE step_tasks SET status = 'queued', last_worker_id = NULL WHERE run_id = ?1 AND step_slug = ?2 AND task_index = ?3",
            params![run_id.to_string(), step_slug, task_index],
        )?;
        Ok(vec![PendingEnqueue {
            message: TaskMessage {
                run_id,
                step_slug: step_slug.to_string(),
                task_index,
                is_map_task: matches!(resolved.steps.get(step_slug).map(|s| s.kind), Some(crate::models::StepKind::Map)),
            },
            visibility_timeout_s: resolved.effective_timeout_s(step_slug),
        }])
    } else {
        tx.execute(
            "UPDATE step_tasks SET status = 'failed', failed_at = ?1, error_message = ?2 WHERE run_id = ?3 AND step_slug = ?4 AND task_index = ?5",
            params![now.to_rfc3339(), error_text, run_id.to_string(), step_slug, task_index],
        )?;
        tx.execute(
            "UPDATE step_states SET status = 'failed', error_message = ?1, failed_at = ?2 WHERE run_id = ?3 AND step_slug = ?4",
            params![error_text, now.to_rfc3339(), run_id.to_string(), step_slug],
        )?;
        tx.execute(
            "UPDATE runs SET status = 'failed', error = ?1, failed_at = ?2 WHERE id = ?3 AND status = 'started'",
            params![error_text, now.to_rfc3339(), run_id.to_string()],
        )?;
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::models::{StepDefinition, StepKind};
    use std::collections::{HashMap, HashSet};

    fn single(slug: &str, index: i64) -> StepDefinition {
        StepDefinition {
            slug: slug.to_string(),
            step_index: index,
            kind: StepKind::Single,
            initial_tasks: None,
            max_attempts_override: None,
            timeout_s_override: None,
            callable_ref: slug.to_string(),
        }
    }

    fn linear_two_step() -> ResolvedWorkflow {
        let mut steps = HashMap::new();
        steps.insert("a".to_string(), single("a", 0));
        steps.insert("b".to_string(), single("b", 1));
        let mut deps = HashMap::new();
        deps.insert("a".to_string(), HashSet::new());
        deps.insert("b".to_string(), HashSet::from(["a".to_string()]));
        ResolvedWorkflow {
            slug: "pipe".to_string(),
            max_attempts: 3,
            timeout_s: 60,
            steps,
            deps,
            roots: vec!["a".to_string()],
        }
    }

    #[test]
    fn insert_run_starts_root_steps_only() {
        let store = Store::in_memory(Arc::new(SystemClock)).unwrap();
        let queue = store.embedded_queue();
        let wf = linear_two_step();
        let run_id = store.insert_run(&wf, &queue, serde_json::json!({"x": 1})).unwrap();

        let a = store.get_step_state(run_id, "a").unwrap().unwrap();
        assert_eq!(a.status, StepStatus::Started);
        let b = store.get_step_state(run_id, "b").unwrap().unwrap();
        assert_eq!(b.status, StepStatus::Created);
        assert_eq!(b.remaining_deps, 1);

        let batch = queue.read_with_poll("pipe", 10, 30, 0).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload.step_slug, "a");
    }

    #[test]
    fn complete_task_cascades_to_successor() {
        let store = Store::in_memory(Arc::new(SystemClock)).unwrap();
        let queue = store.embedded_queue();
        let wf = linear_two_step();
        let run_id = store.insert_run(&wf, &queue, serde_json::json!({})).unwrap();

        let msg = queue.read_with_poll("pipe", 10, 30, 0).unwrap().remove(0);
        let code = store.complete_task(&wf, run_id, "a", 0, serde_json::json!({"y": 2}), &queue).unwrap();
        assert_eq!(code, 1);
        queue.delete("pipe", &msg.msg_id).unwrap();

        let b = store.get_step_state(run_id, "b").unwrap().unwrap();
        assert_eq!(b.status, StepStatus::Started);
        assert_eq!(b.remaining_deps, 0);

        let batch = queue.read_with_poll("pipe", 10, 30, 0).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload.step_slug, "b");
    }

    #[test]
    fn late_completion_after_run_failed_is_a_noop() {
        let store = Store::in_memory(Arc::new(SystemClock)).unwrap();
        let queue = store.embedded_queue();
        let mut wf = linear_two_step();
        wf.max_attempts = 1;
        let run_id = store.insert_run(&wf, &queue, serde_json::json!({})).unwrap();

        // Claim a's task so it is `started`, then exhaust its single retry.
        queue.read_with_poll("pipe", 10, 30, 0).unwrap();
        let task = store.get_task(run_id, "a", 0).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);

        // Directly drive `started` via a manual claim simulation, then fail it.
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "UPDATE step_tasks SET status = 'started' WHERE run_id = ?1 AND step_slug = 'a'",
                params![run_id.to_string()],
            )
            .unwrap();
        }
        store.fail_task(&wf, run_id, "a", 0, "boom", &queue).unwrap();

        let run = store.get_run(run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);

        // A completion for the now-terminal run is ignored.
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "UPDATE step_tasks SET status = 'started' WHERE run_id = ?1 AND step_slug = 'a'",
                params![run_id.to_string()],
            )
            .unwrap();
        }
        let code = store.complete_task(&wf, run_id, "a", 0, serde_json::json!({"y": 1}), &queue).unwrap();
        assert_eq!(code, 0);
    }
}
