//! Message routing: the multi-queue consumer and the handlers it dispatches to.

pub mod consumer;
pub mod handler;
pub mod metrics;
pub mod workflow_handler;

pub use consumer::{Disposition, MultiQueueConsumer, RouterError};
pub use handler::{
    BoxMessageHandler, HandlerError, HandlerOutput, HandlerRegistry, MessageHandler, PingHandler,
};
pub use metrics::{ConsumerMetrics, MetricsSnapshot};
pub use workflow_handler::{ConsensusMessageHandler, WorkflowMessageHandler};
