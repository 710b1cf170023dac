pub mod config;
pub mod dag;
pub mod errors;
pub mod logging;
pub mod queue;

pub use config::{LoggingConfig, TaskweaveToml};
pub use dag::{ControllerConfig, ExecutionController, RunSummary, Scheduler, TaskNode};
pub use errors::{ConfigError, ControllerError, GraphError, QueueError};
pub use queue::{ConcurrentTaskQueue, QueuePermit};
