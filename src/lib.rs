//! Workflow coordination engine
//!
//! Runs directed acyclic graphs of steps to completion with at-least-once
//! semantics: a counter-based advancement protocol over a relational Store,
//! a visibility-timeout work Queue, and a Worker Loop that invokes
//! user-supplied step callables.

pub mod clock;
pub mod config;
pub mod error;
pub mod models;
pub mod queue;
pub mod resolver;
pub mod store;
pub mod worker;

/// Engine version.
pub const VERSION: &str = "0.1.0";

/// Initialize ambient logging. Call once at process startup.
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    log::info!("workflow coordination engine v{VERSION} initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::{QueueConfig, WorkerConfig};
    use crate::models::{Callable, CallableOutcome, ResolvedWorkflow, RunStatus, StepDefinition, StepKind, StepStatus};
    use crate::queue::Queue;
    use crate::resolver::{resolve, WorkflowSource};
    use crate::store::Store;
    use crate::worker::Worker;
    use serde_json::{json, Value};
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn it_works() {
        assert_eq!(2 + 2, 4);
    }

    #[test]
    fn test_init() {
        assert!(init().is_ok());
    }

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

    fn dynamic_map(slug: &str, index: i64) -> StepDefinition {
        StepDefinition {
            kind: StepKind::Map,
            initial_tasks: None,
            ..single(slug, index)
        }
    }

    fn ok_callable(output: Value) -> Callable {
        Box::new(move |_| CallableOutcome::Ok(output.clone()))
    }

    /// Drives `worker.run_once()` until the run is terminal or `max_rounds`
    /// is exhausted, returning the final run status. Mirrors how a real
    /// process would keep polling; used by the end-to-end tests below since
    /// they run a single in-process worker against an in-memory Store.
    fn drive_to_completion(store: &Store, worker: &Worker, run_id: uuid::Uuid, max_rounds: usize) -> RunStatus {
        for _ in 0..max_rounds {
            let run = store.get_run(run_id).unwrap().unwrap();
            if run.status != RunStatus::Started {
                return run.status;
            }
            let processed = worker.run_once().unwrap();
            if processed == 0 {
                break;
            }
        }
        store.get_run(run_id).unwrap().unwrap().status
    }

    fn setup(
        source: WorkflowSource,
        callables: HashMap<String, Callable>,
    ) -> (Arc<Store>, Arc<dyn Queue>, Worker, ResolvedWorkflow) {
        let store = Arc::new(Store::in_memory(Arc::new(SystemClock)).unwrap());
        let queue: Arc<dyn Queue> = Arc::new(store.embedded_queue());
        let (resolved, bound) = resolve(source, callables).unwrap();
        let resolved_arc = Arc::new(resolved.clone());
        let worker = Worker::new(
            "w1".to_string(),
            store.clone(),
            queue.clone(),
            resolved_arc,
            Arc::new(bound),
            WorkerConfig::default(),
            QueueConfig::default(),
        );
        (store, queue, worker, resolved)
    }

    // E1 — Linear two-step
    #[test]
    fn e1_linear_two_step() {
        let mut deps = HashMap::new();
        deps.insert("a".to_string(), HashSet::new());
        deps.insert("b".to_string(), HashSet::from(["a".to_string()]));
        let source = WorkflowSource {
            slug: "pipe".to_string(),
            max_attempts: 3,
            timeout_s: 60,
            steps: vec![single("a", 0), single("b", 1)],
            deps,
        };
        let mut callables: HashMap<String, Callable> = HashMap::new();
        callables.insert("a".to_string(), ok_callable(json!({"y": 2})));
        callables.insert("b".to_string(), ok_callable(json!({"z": 3})));

        let (store, queue, worker, resolved) = setup(source, callables);
        let run_id = store.insert_run(&resolved, queue.as_ref(), json!({"x": 1})).unwrap();

        let status = drive_to_completion(&store, &worker, run_id, 10);
        assert_eq!(status, RunStatus::Completed);

        let run = store.get_run(run_id).unwrap().unwrap();
        assert_eq!(run.output.unwrap(), json!({"a": {"y": 2}, "b": {"z": 3}}));

        let a_task = store.get_task(run_id, "a", 0).unwrap().unwrap();
        let b_task = store.get_task(run_id, "b", 0).unwrap().unwrap();
        assert_eq!(a_task.attempts, 0); // never failed, so attempts counter untouched
        assert_eq!(b_task.attempts, 0);
    }

    // E2 — Diamond DAG
    #[test]
    fn e2_diamond_dag() {
        let mut deps = HashMap::new();
        deps.insert("root".to_string(), HashSet::new());
        deps.insert("left".to_string(), HashSet::from(["root".to_string()]));
        deps.insert("right".to_string(), HashSet::from(["root".to_string()]));
        deps.insert("merge".to_string(), HashSet::from(["left".to_string(), "right".to_string()]));
        let source = WorkflowSource {
            slug: "diamond".to_string(),
            max_attempts: 3,
            timeout_s: 60,
            steps: vec![single("root", 0), single("left", 1), single("right", 2), single("merge", 3)],
            deps,
        };
        let merge_input_seen = Arc::new(std::sync::Mutex::new(None));
        let merge_input_seen_clone = merge_input_seen.clone();
        let mut callables: HashMap<String, Callable> = HashMap::new();
        callables.insert("root".to_string(), ok_callable(json!({"v": 10})));
        callables.insert("left".to_string(), ok_callable(json!({"L": 1})));
        callables.insert("right".to_string(), ok_callable(json!({"R": 2})));
        callables.insert(
            "merge".to_string(),
            Box::new(move |input: Value| {
                *merge_input_seen_clone.lock().unwrap() = Some(input);
                CallableOutcome::Ok(json!({"sum": 3}))
            }),
        );

        let (store, queue, worker, resolved) = setup(source, callables);
        let run_id = store.insert_run(&resolved, queue.as_ref(), json!({"x": 1})).unwrap();

        let merge_before = store.get_step_state(run_id, "merge").unwrap().unwrap();
        assert_eq!(merge_before.status, StepStatus::Created);

        let status = drive_to_completion(&store, &worker, run_id, 20);
        assert_eq!(status, RunStatus::Completed);

        // Merged input carries run.input plus merge's *direct* dependencies
        // (left, right) only. SPEC_FULL.md §6.3 defines "each upstream U" as
        // the direct dependency set, and this run's own diamond shape makes
        // that explicit: `root` is not a direct dependency of `merge`
        // (deps[merge] = {left, right}), so its output does not appear here,
        // even though some prose describing this exact scenario lists it
        // alongside left/right — see DESIGN.md's resolution of that
        // spec-internal inconsistency.
        let merge_input = merge_input_seen.lock().unwrap().take().unwrap();
        assert_eq!(merge_input["x"], json!(1));
        assert_eq!(merge_input["left"], json!({"L": 1}));
        assert_eq!(merge_input["right"], json!({"R": 2}));
        assert!(merge_input.get("root").is_none());

        for slug in ["root", "left", "right", "merge"] {
            let task = store.get_task(run_id, slug, 0).unwrap().unwrap();
            assert_eq!(task.status, crate::models::TaskStatus::Completed);
        }
    }

    // E3 — Map fan-out
    #[test]
    fn e3_map_fan_out() {
        let mut deps = HashMap::new();
        deps.insert("fetch".to_string(), HashSet::new());
        deps.insert("process".to_string(), HashSet::from(["fetch".to_string()]));
        deps.insert("reduce".to_string(), HashSet::from(["process".to_string()]));
        let source = WorkflowSource {
            slug: "mapflow".to_string(),
            max_attempts: 3,
            timeout_s: 60,
            steps: vec![single("fetch", 0), dynamic_map("process", 1), single("reduce", 2)],
            deps,
        };
        let mut callables: HashMap<String, Callable> = HashMap::new();
        callables.insert("fetch".to_string(), ok_callable(json!([10, 20, 30])));
        callables.insert(
            "process".to_string(),
            Box::new(|input: Value| {
                let item = input.get("item").and_then(Value::as_i64).unwrap_or(0);
                CallableOutcome::Ok(json!({"doubled": item * 2}))
            }),
        );
        callables.insert(
            "reduce".to_string(),
            Box::new(|input: Value| {
                let total: i64 = input["process"]
                    .as_array()
                    .unwrap()
                    .iter()
                    .map(|v| v["doubled"].as_i64().unwrap())
                    .sum();
                CallableOutcome::Ok(json!({"total": total}))
            }),
        );

        let (store, queue, worker, resolved) = setup(source, callables);
        let run_id = store.insert_run(&resolved, queue.as_ref(), json!({})).unwrap();

        let status = drive_to_completion(&store, &worker, run_id, 30);
        assert_eq!(status, RunStatus::Completed);

        let run = store.get_run(run_id).unwrap().unwrap();
        assert_eq!(run.output.unwrap()["reduce"]["total"], json!(120));
    }

    // E4 — Empty map
    #[test]
    fn e4_empty_map() {
        let mut deps = HashMap::new();
        deps.insert("fetch".to_string(), HashSet::new());
        deps.insert("process".to_string(), HashSet::from(["fetch".to_string()]));
        deps.insert("reduce".to_string(), HashSet::from(["process".to_string()]));
        let source = WorkflowSource {
            slug: "mapflow_empty".to_string(),
            max_attempts: 3,
            timeout_s: 60,
            steps: vec![single("fetch", 0), dynamic_map("process", 1), single("reduce", 2)],
            deps,
        };
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let mut callables: HashMap<String, Callable> = HashMap::new();
        callables.insert("fetch".to_string(), ok_callable(json!([])));
        callables.insert(
            "process".to_string(),
            Box::new(move |_| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                CallableOutcome::Ok(Value::Null)
            }),
        );
        callables.insert(
            "reduce".to_string(),
            Box::new(|input: Value| CallableOutcome::Ok(json!({"count": input["process"].as_array().unwrap().len()}))),
        );

        let (store, queue, worker, resolved) = setup(source, callables);
        let run_id = store.insert_run(&resolved, queue.as_ref(), json!({})).unwrap();

        let status = drive_to_completion(&store, &worker, run_id, 10);
        assert_eq!(status, RunStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 0, "process callable must never run for an empty map");

        let run = store.get_run(run_id).unwrap().unwrap();
        assert_eq!(run.output.unwrap()["reduce"]["count"], json!(0));
    }

    // E5 — Retry then success
    #[test]
    fn e5_retry_then_success() {
        let mut deps = HashMap::new();
        deps.insert("a".to_string(), HashSet::new());
        let source = WorkflowSource {
            slug: "flaky".to_string(),
            max_attempts: 3,
            timeout_s: 60,
            steps: vec![single("a", 0)],
            deps,
        };
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let mut callables: HashMap<String, Callable> = HashMap::new();
        callables.insert(
            "a".to_string(),
            Box::new(move |_| {
                let n = attempts_clone.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    CallableOutcome::Err("boom".to_string())
                } else {
                    CallableOutcome::Ok(json!({"ok": true}))
                }
            }),
        );

        let (store, queue, worker, resolved) = setup(source, callables);
        let run_id = store.insert_run(&resolved, queue.as_ref(), json!({})).unwrap();

        let status = drive_to_completion(&store, &worker, run_id, 10);
        assert_eq!(status, RunStatus::Completed);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let task = store.get_task(run_id, "a", 0).unwrap().unwrap();
        assert_eq!(task.attempts, 2); // incremented on each of the two failures
        assert_eq!(task.status, crate::models::TaskStatus::Completed);
    }

    // E6 — Type violation
    #[test]
    fn e6_type_violation() {
        let mut deps = HashMap::new();
        deps.insert("a".to_string(), HashSet::new());
        deps.insert("b".to_string(), HashSet::from(["a".to_string()]));
        let source = WorkflowSource {
            slug: "typeviolation".to_string(),
            max_attempts: 3,
            timeout_s: 60,
            steps: vec![single("a", 0), dynamic_map("b", 1)],
            deps,
        };
        let mut callables: HashMap<String, Callable> = HashMap::new();
        callables.insert("a".to_string(), ok_callable(json!({"not": "array"})));
        callables.insert("b".to_string(), ok_callable(Value::Null));

        let (store, queue, worker, resolved) = setup(source, callables);
        let run_id = store.insert_run(&resolved, queue.as_ref(), json!({})).unwrap();

        let status = drive_to_completion(&store, &worker, run_id, 5);
        assert_eq!(status, RunStatus::Failed);

        let run = store.get_run(run_id).unwrap().unwrap();
        assert_eq!(run.error.unwrap(), "type_violation");

        let b_state = store.get_step_state(run_id, "b").unwrap().unwrap();
        assert_eq!(b_state.status, StepStatus::Created, "b must never start");
    }
}
