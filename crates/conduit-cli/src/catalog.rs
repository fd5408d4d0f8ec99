//! Workflow definitions the worker ships with.
//!
//! Steps carry code, so definitions are registered at startup rather than
//! loaded from storage. `echo` and `diamond` exist for smoke-testing a
//! deployment; `consensus_review` is the adaptive review pipeline.

use std::time::Duration;

use conduit_core::consensus::{BoxSpecialist, consensus_definition};
use conduit_core::workflow::{
    BoxStepWorker, StepContext, StepDescriptor, StepFailure, WorkflowDefinition, WorkflowError,
    WorkflowRegistry,
};
use conduit_types::config::ExecutorConfig;
use conduit_types::workflow::RetryPolicy;
use serde_json::{Map, Value, json};

pub const ECHO_WORKFLOW_TYPE: &str = "echo";
pub const DIAMOND_WORKFLOW_TYPE: &str = "diamond";

pub fn register_builtin(
    registry: &WorkflowRegistry,
    config: &ExecutorConfig,
) -> Result<(), WorkflowError> {
    registry.register(echo_definition(config)?);
    registry.register(diamond_definition(config)?);
    registry.register(consensus_definition(BoxSpecialist::default())?);
    Ok(())
}

/// Step with the configured default timeout and retry budget.
fn configured(id: &str, worker: BoxStepWorker, config: &ExecutorConfig) -> StepDescriptor {
    StepDescriptor::from_box(id, worker)
        .timeout(Duration::from_secs(config.default_step_timeout_secs.max(1)))
        .retry(RetryPolicy::with_max_attempts(config.default_max_attempts.max(1)))
}

/// One step that returns the submitted payload.
fn echo_definition(config: &ExecutorConfig) -> Result<WorkflowDefinition, WorkflowError> {
    let echo = BoxStepWorker::from_fn(|ctx: StepContext| async move {
        Ok::<Value, StepFailure>(ctx.input().clone())
    });
    WorkflowDefinition::builder(ECHO_WORKFLOW_TYPE, "1")
        .step(configured("echo", echo, config))
        .build()
}

/// `start -> {left, right} -> join`. Each step records which upstream
/// results it saw, so the output shows the dependency order.
fn diamond_definition(config: &ExecutorConfig) -> Result<WorkflowDefinition, WorkflowError> {
    let node = |deps: &'static [&'static str]| {
        BoxStepWorker::from_fn(move |ctx: StepContext| async move {
            let mut seen = Map::new();
            for dep in deps {
                let upstream = ctx
                    .step_result(dep)
                    .cloned()
                    .ok_or_else(|| StepFailure::new(format!("missing result of '{dep}'")))?;
                seen.insert((*dep).to_string(), upstream);
            }
            Ok::<Value, StepFailure>(json!({
                "step": ctx.step_id(),
                "attempt": ctx.attempt(),
                "upstream": seen,
            }))
        })
    };

    WorkflowDefinition::builder(DIAMOND_WORKFLOW_TYPE, "1")
        .step(configured("start", node(&[]), config))
        .step(configured("left", node(&["start"]), config).depends_on(["start"]))
        .step(configured("right", node(&["start"]), config).depends_on(["start"]))
        .step(configured("join", node(&["left", "right"]), config).depends_on(["left", "right"]))
        .concurrency(2)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::consensus::CONSENSUS_WORKFLOW_TYPE;

    #[test]
    fn registers_every_builtin() {
        let registry = WorkflowRegistry::new();
        register_builtin(&registry, &ExecutorConfig::default()).unwrap();
        assert_eq!(
            registry.list(),
            vec![CONSENSUS_WORKFLOW_TYPE, DIAMOND_WORKFLOW_TYPE, ECHO_WORKFLOW_TYPE]
        );
    }

    #[test]
    fn diamond_joins_both_branches() {
        let def = diamond_definition(&ExecutorConfig::default()).unwrap();
        assert_eq!(def.final_steps(), vec!["join"]);
        assert_eq!(def.concurrency, 2);
        assert_eq!(def.step("join").unwrap().dependencies, vec!["left", "right"]);
    }

    #[test]
    fn config_defaults_apply_to_steps() {
        let config = ExecutorConfig {
            default_step_timeout_secs: 7,
            default_max_attempts: 2,
            event_capacity: 16,
            run_lease_secs: 30,
        };
        let def = echo_definition(&config).unwrap();
        let step = def.step("echo").unwrap();
        assert_eq!(step.timeout, Duration::from_secs(7));
        assert_eq!(step.retry.max_attempts, 2);
    }
}
