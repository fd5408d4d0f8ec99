//! Step graph analysis: cycle detection, waves, closures and ready sets.
//!
//! `petgraph` models the dependency relation (edge from dependency to
//! dependent). The executor does not run wave by wave; waves are only a
//! planning view. Scheduling uses `ready_steps`, which admits a step the
//! moment all of its dependencies are completed.

use std::collections::{HashMap, HashSet};

use conduit_types::workflow::StepStatus;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use super::definition::{StepDescriptor, WorkflowError};

/// Build the dependency graph and return it with a topological order.
fn sorted_graph(
    steps: &[StepDescriptor],
) -> Result<(DiGraph<&str, ()>, Vec<NodeIndex>), WorkflowError> {
    let mut graph = DiGraph::<&str, ()>::new();
    let nodes: HashMap<&str, NodeIndex> = steps
        .iter()
        .map(|s| (s.id.as_str(), graph.add_node(s.id.as_str())))
        .collect();

    for step in steps {
        let to = nodes[step.id.as_str()];
        for dep in &step.dependencies {
            let from = nodes.get(dep.as_str()).ok_or_else(|| {
                WorkflowError::UnknownDependency(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                ))
            })?;
            graph.add_edge(*from, to, ());
        }
    }

    let order = toposort(&graph, None).map_err(|cycle| {
        WorkflowError::CycleDetected(format!(
            "cycle detected involving step '{}'",
            graph[cycle.node_id()]
        ))
    })?;

    Ok((graph, order))
}

/// Validate that steps form a DAG (no cycles, every dependency exists).
pub fn validate_dag(steps: &[StepDescriptor]) -> Result<(), WorkflowError> {
    sorted_graph(steps).map(|_| ())
}

/// Group steps into depth waves: wave `n` holds steps whose longest
/// dependency chain has length `n`.
pub fn build_execution_plan(
    steps: &[StepDescriptor],
) -> Result<Vec<Vec<&StepDescriptor>>, WorkflowError> {
    if steps.is_empty() {
        return Ok(vec![]);
    }

    let (graph, order) = sorted_graph(steps)?;
    let by_id: HashMap<&str, &StepDescriptor> =
        steps.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut depths: HashMap<&str, usize> = HashMap::new();
    for node in order {
        let id = graph[node];
        let depth = by_id[id]
            .dependencies
            .iter()
            .map(|dep| depths.get(dep.as_str()).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        depths.insert(id, depth);
    }

    let max_depth = depths.values().copied().max().unwrap_or(0);
    let mut waves: Vec<Vec<&StepDescriptor>> = vec![vec![]; max_depth + 1];
    for step in steps {
        waves[depths[step.id.as_str()]].push(step);
    }
    Ok(waves)
}

/// Transitive closure of a step's dependencies. Empty for unknown ids.
pub fn get_step_dependencies<'a>(step_id: &str, steps: &'a [StepDescriptor]) -> Vec<&'a str> {
    let by_id: HashMap<&str, &StepDescriptor> =
        steps.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut visited: HashSet<&'a str> = HashSet::new();
    let mut stack = vec![step_id];
    while let Some(current) = stack.pop() {
        if let Some(step) = by_id.get(current) {
            for dep in &step.dependencies {
                if visited.insert(dep.as_str()) {
                    stack.push(dep.as_str());
                }
            }
        }
    }
    visited.into_iter().collect()
}

/// Transitive closure of the steps that depend on `step_id`.
///
/// These are the steps short-circuited when `step_id` fails permanently.
pub fn get_step_dependents<'a>(step_id: &str, steps: &'a [StepDescriptor]) -> Vec<&'a str> {
    let mut dependents: HashMap<&str, Vec<&'a str>> = HashMap::new();
    for step in steps {
        for dep in &step.dependencies {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(step.id.as_str());
        }
    }

    let mut visited: HashSet<&'a str> = HashSet::new();
    let mut stack = vec![step_id];
    while let Some(current) = stack.pop() {
        for &next in dependents.get(current).map(Vec::as_slice).unwrap_or(&[]) {
            if visited.insert(next) {
                stack.push(next);
            }
        }
    }

    // Definition order keeps the output stable.
    steps
        .iter()
        .map(|s| s.id.as_str())
        .filter(|id| visited.contains(id))
        .collect()
}

/// Steps that have not started and whose dependencies are all completed.
///
/// Steps missing from `statuses` count as not started.
pub fn ready_steps<'a>(
    steps: &'a [StepDescriptor],
    statuses: &HashMap<String, StepStatus>,
) -> Vec<&'a StepDescriptor> {
    let status_of = |id: &str| {
        statuses
            .get(id)
            .copied()
            .unwrap_or(StepStatus::NotStarted)
    };

    steps
        .iter()
        .filter(|s| status_of(&s.id) == StepStatus::NotStarted)
        .filter(|s| {
            s.dependencies
                .iter()
                .all(|d| status_of(d) == StepStatus::Completed)
        })
        .collect()
}

/// Sink steps: no other step depends on them.
pub fn final_steps(steps: &[StepDescriptor]) -> Vec<&str> {
    let depended_on: HashSet<&str> = steps
        .iter()
        .flat_map(|s| s.dependencies.iter().map(String::as_str))
        .collect();
    steps
        .iter()
        .map(|s| s.id.as_str())
        .filter(|id| !depended_on.contains(id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::context::StepContext;
    use crate::workflow::worker::{BoxStepWorker, StepFailure};
    use serde_json::{Value, json};

    fn step(id: &str, deps: Vec<&str>) -> StepDescriptor {
        let worker = BoxStepWorker::from_fn(|_ctx: StepContext| async {
            Ok::<Value, StepFailure>(json!(null))
        });
        StepDescriptor::from_box(id, worker).depends_on(deps)
    }

    fn diamond() -> Vec<StepDescriptor> {
        // A -> {B, C} -> D
        vec![
            step("a", vec![]),
            step("b", vec!["a"]),
            step("c", vec!["a"]),
            step("d", vec!["b", "c"]),
        ]
    }

    #[test]
    fn test_linear_chain_n_waves() {
        let steps = vec![step("a", vec![]), step("b", vec!["a"]), step("c", vec!["b"])];
        let waves = build_execution_plan(&steps).unwrap();
        let ids: Vec<Vec<&str>> = waves
            .iter()
            .map(|w| w.iter().map(|s| s.id.as_str()).collect())
            .collect();
        assert_eq!(ids, vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn test_diamond_three_waves() {
        let steps = diamond();
        let waves = build_execution_plan(&steps).unwrap();
        assert_eq!(waves.len(), 3);
        assert_eq!(waves[1].len(), 2, "B and C share a wave");
        assert_eq!(waves[2][0].id, "d");
    }

    #[test]
    fn test_empty_steps() {
        assert!(build_execution_plan(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_validate_dag_cycle() {
        let steps = vec![step("a", vec!["c"]), step("b", vec!["a"]), step("c", vec!["b"])];
        let err = validate_dag(&steps).unwrap_err();
        assert!(err.to_string().contains("cycle detected"));
    }

    #[test]
    fn test_validate_dag_unknown_dep() {
        let steps = vec![step("a", vec!["missing"])];
        let err = validate_dag(&steps).unwrap_err();
        assert!(err.to_string().contains("unknown step 'missing'"));
    }

    #[test]
    fn test_transitive_dependencies() {
        let steps = diamond();
        let mut deps = get_step_dependencies("d", &steps);
        deps.sort();
        assert_eq!(deps, vec!["a", "b", "c"]);
        assert!(get_step_dependencies("a", &steps).is_empty());
        assert!(get_step_dependencies("ghost", &steps).is_empty());
    }

    #[test]
    fn test_transitive_dependents() {
        let steps = diamond();
        assert_eq!(get_step_dependents("a", &steps), vec!["b", "c", "d"]);
        assert_eq!(get_step_dependents("b", &steps), vec!["d"]);
        assert!(get_step_dependents("d", &steps).is_empty());
    }

    #[test]
    fn test_ready_steps_without_wave_barrier() {
        // a -> c, b (slow, independent). c is ready as soon as a completes.
        let steps = vec![step("a", vec![]), step("b", vec![]), step("c", vec!["a"])];
        let mut statuses = HashMap::new();

        let ready: Vec<&str> = ready_steps(&steps, &statuses).into_iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ready, vec!["a", "b"]);

        statuses.insert("a".to_string(), StepStatus::Completed);
        statuses.insert("b".to_string(), StepStatus::Running);
        let ready: Vec<&str> = ready_steps(&steps, &statuses).into_iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ready, vec!["c"]);
    }

    #[test]
    fn test_ready_steps_blocked_by_failure() {
        let steps = diamond();
        let statuses = HashMap::from([
            ("a".to_string(), StepStatus::Completed),
            ("b".to_string(), StepStatus::Failed),
            ("c".to_string(), StepStatus::Completed),
        ]);
        assert!(ready_steps(&steps, &statuses).is_empty());
    }

    #[test]
    fn test_final_steps() {
        assert_eq!(final_steps(&diamond()), vec!["d"]);

        let fan_out = vec![step("a", vec![]), step("b", vec!["a"]), step("c", vec!["a"])];
        assert_eq!(final_steps(&fan_out), vec!["b", "c"]);
    }
}
