//! # Background Task Execution
//!
//! Priority-ordered background work with bounded concurrency.
//!
//! ```rust
//! use riskwatch_core::config::TaskProcessorConfig;
//! use riskwatch_core::execution::{AsyncTask, TaskExecutionError, TaskProcessor};
//! use serde_json::{json, Value};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let processor = TaskProcessor::new(TaskProcessorConfig::default())?;
//! processor.start()?;
//!
//! let task = AsyncTask::from_fn("refresh_watchlist", |args: Value| async move {
//!     Ok::<_, TaskExecutionError>(json!({ "refreshed": args["list"] }))
//! })
//! .with_args(json!({ "list": "sanctions" }))
//! .with_priority(1);
//!
//! match processor.submit(task) {
//!     Ok(id) => println!("queued {id}"),
//!     Err(rejected) => println!("try later: {}", rejected.reason),
//! }
//! # Ok(())
//! # }
//! ```

pub mod processor;
pub mod queue;
pub mod task;

pub use processor::{
    RejectionReason, TaskProcessor, TaskProcessorStats, TaskRejected, TaskStatsSource,
};
pub use queue::TaskQueue;
pub use task::{AsyncTask, TaskExecutionError, TaskHandler, TaskId, TaskRecord, TaskStatus};
