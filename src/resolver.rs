//! The Definition Resolver (§4.3): produces a `ResolvedWorkflow` from a
//! workflow's definition-time shape plus a user-supplied `step_slug ->
//! callable` map. Never mutates the Store.

use crate::error::{EngineError, EngineResult};
use crate::models::{validate_slug, Callable, ResolvedWorkflow, StepDefinition};
use std::collections::{HashMap, HashSet};

/// The workflow shape as loaded from wherever workflow definitions live
/// (§1: the definition source is an external collaborator; the core only
/// consumes this already-loaded shape).
pub struct WorkflowSource {
    pub slug: String,
    pub max_attempts: u32,
    pub timeout_s: u64,
    pub steps: Vec<StepDefinition>,
    /// step_slug -> its declared upstream dependencies
    pub deps: HashMap<String, HashSet<String>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Resolves `source` against `callables`, binding each step's callable,
/// detecting cycles via DFS white/gray/black coloring, and validating that
/// every dependency edge names a step that actually exists.
pub fn resolve(source: WorkflowSource, mut callables: HashMap<String, Callable>) -> EngineResult<(ResolvedWorkflow, HashMap<String, Callable>)> {
    if source.steps.is_empty() {
        return Err(EngineError::Validation("no_root_steps".to_string()));
    }

    let mut steps = HashMap::new();
    let mut bound_callables = HashMap::new();
    for step in source.steps {
        validate_slug(&step.slug)?;
        let callable = callables
            .remove(&step.slug)
            .ok_or_else(|| EngineError::DefinitionMissing(format!("missing_callable({})", step.slug)))?;
        bound_callables.insert(step.slug.clone(), callable);
        steps.insert(step.slug.clone(), step);
    }

    for (slug, ups) in &source.deps {
        if !steps.contains_key(slug) {
            return Err(EngineError::Validation(format!("unknown_dependency({slug}, <self>)")));
        }
        for dep in ups {
            if !steps.contains_key(dep) {
                return Err(EngineError::Validation(format!("unknown_dependency({slug}, {dep})")));
            }
        }
    }

    detect_cycle(&steps, &source.deps)?;

    let roots: Vec<String> = steps
        .keys()
        .filter(|slug| source.deps.get(*slug).map(|d| d.is_empty()).unwrap_or(true))
        .cloned()
        .collect();
    if roots.is_empty() {
        return Err(EngineError::Validation("no_root_steps".to_string()));
    }

    let resolved = ResolvedWorkflow {
        slug: source.slug,
        max_attempts: source.max_attempts,
        timeout_s: source.timeout_s,
        steps,
        deps: source.deps,
        roots,
    };
    Ok((resolved, bound_callables))
}

fn detect_cycle(steps: &HashMap<String, StepDefinition>, deps: &HashMap<String, HashSet<String>>) -> EngineResult<()> {
    let mut color: HashMap<&str, Color> = steps.keys().map(|s| (s.as_str(), Color::White)).collect();
    let mut path: Vec<String> = Vec::new();

    for slug in steps.keys() {
        if color[slug.as_str()] == Color::White {
            visit(slug, deps, &mut color, &mut path)?;
        }
    }
    Ok(())
}

fn visit<'a>(
    slug: &'a str,
    deps: &'a HashMap<String, HashSet<String>>,
    color: &mut HashMap<&'a str, Color>,
    path: &mut Vec<String>,
) -> EngineResult<()> {
    color.insert(slug, Color::Gray);
    path.push(slug.to_string());

    if let Some(ups) = deps.get(slug) {
        for dep in ups {
            match color.get(dep.as_str()) {
                Some(Color::White) => visit(dep, deps, color, path)?,
                Some(Color::Gray) => {
                    let mut cycle = path.clone();
                    cycle.push(dep.clone());
                    return Err(EngineError::Validation(format!("cycle_detected({})", cycle.join(" -> "))));
                }
                _ => {}
            }
        }
    }

    path.pop();
    color.insert(slug, Color::Black);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CallableOutcome, StepKind};

    fn noop_callable() -> Callable {
        Box::new(|_| CallableOutcome::Ok(serde_json::Value::Null))
    }

    fn step(slug: &str, index: i64) -> StepDefinition {
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

    #[test]
    fn resolves_linear_workflow() {
        let mut deps = HashMap::new();
        deps.insert("a".to_string(), HashSet::new());
        deps.insert("b".to_string(), HashSet::from(["a".to_string()]));
        let source = WorkflowSource {
            slug: "pipe".to_string(),
            max_attempts: 3,
            timeout_s: 60,
            steps: vec![step("a", 0), step("b", 1)],
            deps,
        };
        let mut callables = HashMap::new();
        callables.insert("a".to_string(), noop_callable());
        callables.insert("b".to_string(), noop_callable());

        let (resolved, _) = resolve(source, callables).unwrap();
        assert_eq!(resolved.roots, vec!["a".to_string()]);
    }

    #[test]
    fn missing_callable_is_rejected() {
        let mut deps = HashMap::new();
        deps.insert("a".to_string(), HashSet::new());
        let source = WorkflowSource {
            slug: "pipe".to_string(),
            max_attempts: 3,
            timeout_s: 60,
            steps: vec![step("a", 0)],
            deps,
        };
        let err = match resolve(source, HashMap::new()) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err, EngineError::DefinitionMissing(_)));
    }

    #[test]
    fn cycle_is_detected() {
        let mut deps = HashMap::new();
        deps.insert("a".to_string(), HashSet::from(["b".to_string()]));
        deps.insert("b".to_string(), HashSet::from(["a".to_string()]));
        let source = WorkflowSource {
            slug: "loop".to_string(),
            max_attempts: 3,
            timeout_s: 60,
            steps: vec![step("a", 0), step("b", 1)],
            deps,
        };
        let mut callables = HashMap::new();
        callables.insert("a".to_string(), noop_callable());
        callables.insert("b".to_string(), noop_callable());

        let err = match resolve(source, callables) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err, EngineError::Validation(msg) if msg.starts_with("cycle_detected")));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let mut deps = HashMap::new();
        deps.insert("a".to_string(), HashSet::from(["ghost".to_string()]));
        let source = WorkflowSource {
            slug: "pipe".to_string(),
            max_attempts: 3,
            timeout_s: 60,
            steps: vec![step("a", 0)],
            deps,
        };
        let mut callables = HashMap::new();
        callables.insert("a".to_string(), noop_callable());
        let err = match resolve(source, callables) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err, EngineError::Validation(msg) if msg.starts_with("unknown_dependency")));
    }
}
