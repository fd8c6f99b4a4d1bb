//! Tasks and the handlers that execute them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub type TaskId = Uuid;

/// Why a single task attempt failed
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskExecutionError {
    #[error("task failed: {0}")]
    Failed(String),

    #[error("task timed out after {0:?}")]
    TimedOut(Duration),

    #[error("task panicked: {0}")]
    Panicked(String),
}

impl TaskExecutionError {
    pub fn failed(message: impl Into<String>) -> Self {
        TaskExecutionError::Failed(message.into())
    }
}

/// Unit of work run by the task processor
///
/// Implemented for any `Fn(Value) -> impl Future<Output = Result<Value, TaskExecutionError>>`,
/// so closures can be submitted directly.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, args: Value) -> Result<Value, TaskExecutionError>;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskExecutionError>> + Send + 'static,
{
    async fn handle(&self, args: Value) -> Result<Value, TaskExecutionError> {
        (self)(args).await
    }
}

/// A prioritized unit of background work
///
/// Lower `priority` values are more urgent.
#[derive(Clone)]
pub struct AsyncTask {
    pub id: TaskId,
    pub name: String,
    pub handler: Arc<dyn TaskHandler>,
    pub args: Value,
    pub priority: i32,

    /// Failed attempts so far
    pub retry_count: u32,

    /// Retries allowed after the first attempt; the processor default applies when unset
    pub max_retries: Option<u32>,

    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl AsyncTask {
    pub fn new(name: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            handler,
            args: Value::Null,
            priority: 0,
            retry_count: 0,
            max_retries: None,
            created_at: Utc::now(),
            scheduled_at: None,
        }
    }

    /// Build a task from a closure handler
    pub fn from_fn<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskExecutionError>> + Send + 'static,
    {
        Self::new(name, Arc::new(handler))
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Total attempts made so far, counting the one in progress
    pub fn attempts(&self) -> u32 {
        self.retry_count + 1
    }
}

impl fmt::Debug for AsyncTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncTask")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("retry_count", &self.retry_count)
            .field("max_retries", &self.max_retries)
            .field("created_at", &self.created_at)
            .field("scheduled_at", &self.scheduled_at)
            .finish_non_exhaustive()
    }
}

/// Where a task is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Scheduled,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final outcome of a task, kept in the processor's history or failed record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub name: String,
    pub priority: i32,
    pub status: TaskStatus,

    /// Attempts actually executed
    pub attempts: u32,

    pub result: Option<Value>,
    pub error: Option<String>,
    pub args: Value,
    pub created_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// Duration of the last attempt
    pub last_duration: Duration,
}

impl TaskRecord {
    pub(crate) fn from_task(
        task: &AsyncTask,
        status: TaskStatus,
        attempts: u32,
        result: Option<Value>,
        error: Option<String>,
        last_duration: Duration,
    ) -> Self {
        Self {
            id: task.id,
            name: task.name.clone(),
            priority: task.priority,
            status,
            attempts,
            result,
            error,
            args: task.args.clone(),
            created_at: task.created_at,
            finished_at: Utc::now(),
            last_duration,
        }
    }
}
