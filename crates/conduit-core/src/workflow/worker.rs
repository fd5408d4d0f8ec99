//! Step worker port and its object-safe wrapper.
//!
//! `StepWorker` uses RPITIT, so it cannot be a trait object directly.
//! `BoxStepWorker` erases it behind `StepWorkerDyn`:
//! 1. `StepWorkerDyn` is the object-safe variant with boxed futures
//! 2. Blanket impl of `StepWorkerDyn` for all `T: StepWorker`
//! 3. `BoxStepWorker` holds `Arc<dyn StepWorkerDyn>` so it can be cloned into tasks

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use super::context::StepContext;

/// Explicit failure reported by a step worker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct StepFailure(pub String);

impl StepFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for StepFailure {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for StepFailure {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

/// The unit of work behind a workflow step.
///
/// A worker is a function of the accumulated payload snapshot. It returns
/// the step result or an explicit failure, and must tolerate being dropped
/// mid-flight when its timeout fires.
pub trait StepWorker: Send + Sync {
    fn run(
        &self,
        ctx: StepContext,
    ) -> impl Future<Output = Result<Value, StepFailure>> + Send;
}

/// Object-safe version of [`StepWorker`] with boxed futures.
pub trait StepWorkerDyn: Send + Sync {
    fn run_boxed(
        &self,
        ctx: StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<Value, StepFailure>> + Send + '_>>;
}

impl<T: StepWorker> StepWorkerDyn for T {
    fn run_boxed(
        &self,
        ctx: StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<Value, StepFailure>> + Send + '_>> {
        Box::pin(self.run(ctx))
    }
}

/// Type-erased, cheaply clonable step worker.
#[derive(Clone)]
pub struct BoxStepWorker {
    inner: Arc<dyn StepWorkerDyn>,
}

impl BoxStepWorker {
    pub fn new<T: StepWorker + 'static>(worker: T) -> Self {
        Self {
            inner: Arc::new(worker),
        }
    }

    /// Wrap an async closure.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StepFailure>> + Send + 'static,
    {
        Self::new(FnWorker(f))
    }

    pub async fn run(&self, ctx: StepContext) -> Result<Value, StepFailure> {
        self.inner.run_boxed(ctx).await
    }
}

impl std::fmt::Debug for BoxStepWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BoxStepWorker")
    }
}

/// Adapter turning an async closure into a [`StepWorker`].
pub struct FnWorker<F>(pub F);

impl<F, Fut> StepWorker for FnWorker<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, StepFailure>> + Send,
{
    fn run(
        &self,
        ctx: StepContext,
    ) -> impl Future<Output = Result<Value, StepFailure>> + Send {
        (self.0)(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::context::WorkflowPayload;
    use serde_json::json;
    use uuid::Uuid;

    struct Echo;

    impl StepWorker for Echo {
        async fn run(&self, ctx: StepContext) -> Result<Value, StepFailure> {
            Ok(json!({ "step": ctx.step_id() }))
        }
    }

    fn ctx(step: &str) -> StepContext {
        StepContext::new(
            Uuid::now_v7(),
            "test",
            step,
            1,
            Arc::new(WorkflowPayload::new(json!({}))),
        )
    }

    #[tokio::test]
    async fn boxed_struct_worker_delegates() {
        let worker = BoxStepWorker::new(Echo);
        let out = worker.run(ctx("a")).await.unwrap();
        assert_eq!(out, json!({ "step": "a" }));
    }

    #[tokio::test]
    async fn boxed_closure_worker_delegates() {
        let worker = BoxStepWorker::from_fn(|ctx: StepContext| async move {
            if ctx.attempt() == 1 {
                Err(StepFailure::new("first attempt always fails"))
            } else {
                Ok(json!("ok"))
            }
        });
        let err = worker.run(ctx("b")).await.unwrap_err();
        assert_eq!(err.to_string(), "first attempt always fails");
    }

    #[test]
    fn clone_shares_worker() {
        let worker = BoxStepWorker::new(Echo);
        let cloned = worker.clone();
        assert_eq!(format!("{cloned:?}"), "BoxStepWorker");
    }
}
