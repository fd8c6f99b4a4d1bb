//! # Task Processor
//!
//! Prioritized background execution with bounded concurrency, delayed
//! scheduling and retry.
//!
//! ## Architecture
//!
//! - **Queue**: bounded [`TaskQueue`]; `submit` rejects instead of waiting when full
//! - **Dispatcher loop**: pops up to `batch_size` tasks per pass, each only
//!   once a worker permit is free, so at most `worker_count` tasks run at once
//! - **Scheduler loop**: promotes delayed tasks into the queue when due
//! - **Worker boundary**: each attempt runs in its own tokio task under the
//!   per-task timeout. Errors, panics and timeouts all become a failed attempt.
//!
//! A failed attempt increments `retry_count`. While `retry_count <= max_retries`
//! the task is resubmitted at its original priority, immediately or through the
//! scheduler when `retry_backoff` is configured. After that it lands in the
//! failed record, which is never truncated.

use crate::config::TaskProcessorConfig;
use crate::error::{RiskwatchError, RiskwatchResult};
use crate::execution::{
    AsyncTask, TaskExecutionError, TaskId, TaskQueue, TaskRecord, TaskStatus,
};
use crate::lifecycle::ShutdownSignal;
use crate::logging::{log_error, log_task_operation};
use crate::metrics;
use futures::future::join_all;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Due time used when `now + delay` does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Why a task was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    QueueFull { capacity: usize },
    ShuttingDown,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::QueueFull { capacity } => write!(f, "queue full ({capacity} tasks)"),
            RejectionReason::ShuttingDown => f.write_str("processor is shutting down"),
        }
    }
}

/// A task the processor refused; the task is handed back to the caller
#[derive(Debug, thiserror::Error)]
#[error("task {} rejected: {reason}", .task.id)]
pub struct TaskRejected {
    pub task: Box<AsyncTask>,
    pub reason: RejectionReason,
}

/// Snapshot of processor counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskProcessorStats {
    /// Tasks accepted through `submit` or `schedule`
    pub total_submitted: u64,
    pub completed: u64,

    /// Tasks that exhausted their retries
    pub failed: u64,
    pub retried: u64,
    pub rejected: u64,
    pub cancelled: u64,

    pub queued: usize,
    pub scheduled: usize,
    pub processing: usize,

    /// Mean duration of every finished attempt
    pub average_processing_time: Duration,

    pub worker_count: usize,
    pub queue_capacity: usize,
}

impl TaskProcessorStats {
    /// Queued tasks as a share of queue capacity (0.0 to 1.0)
    pub fn queue_utilization(&self) -> f64 {
        if self.queue_capacity == 0 {
            return 0.0;
        }
        self.queued as f64 / self.queue_capacity as f64
    }
}

/// Anything that can report task processor statistics
pub trait TaskStatsSource: Send + Sync {
    fn task_stats(&self) -> TaskProcessorStats;
}

struct ScheduledTask {
    due: Instant,
    task: AsyncTask,
}

#[derive(Default)]
struct ProcessorState {
    /// Non-terminal tasks only
    live: HashMap<TaskId, TaskStatus>,
    history: VecDeque<TaskRecord>,
    failed: Vec<TaskRecord>,

    total_submitted: u64,
    completed: u64,
    failed_count: u64,
    retried: u64,
    rejected: u64,
    cancelled: u64,
    processing: usize,
    finished_attempts: u64,
    total_processing_time: Duration,
}

struct ProcessorInner {
    config: TaskProcessorConfig,
    queue: Mutex<TaskQueue>,
    scheduled: Mutex<HashMap<TaskId, ScheduledTask>>,
    state: Mutex<ProcessorState>,
    workers: Arc<Semaphore>,
    work_available: Notify,
    accepting: AtomicBool,
    started: AtomicBool,
    shutdown: Arc<ShutdownSignal>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

/// Priority task processor with a fixed worker pool
///
/// Cloning is cheap; clones share the same queue and workers.
#[derive(Clone)]
pub struct TaskProcessor {
    inner: Arc<ProcessorInner>,
}

impl fmt::Debug for TaskProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskProcessor")
            .field("stats", &self.stats())
            .finish()
    }
}

impl TaskProcessor {
    pub fn new(config: TaskProcessorConfig) -> RiskwatchResult<Self> {
        config.validate()?;

        info!(
            worker_count = config.worker_count,
            queue_size = config.queue_size,
            batch_size = config.batch_size,
            retry_backoff = config.retry_backoff.is_some(),
            "Task processor created"
        );

        Ok(Self {
            inner: Arc::new(ProcessorInner {
                queue: Mutex::new(TaskQueue::new(config.queue_size)),
                scheduled: Mutex::new(HashMap::new()),
                state: Mutex::new(ProcessorState::default()),
                workers: Arc::new(Semaphore::new(config.worker_count)),
                work_available: Notify::new(),
                accepting: AtomicBool::new(true),
                started: AtomicBool::new(false),
                shutdown: ShutdownSignal::new(),
                loops: Mutex::new(Vec::new()),
                config,
            }),
        })
    }

    pub fn config(&self) -> &TaskProcessorConfig {
        &self.inner.config
    }

    /// Spawn the dispatcher and scheduler loops
    pub fn start(&self) -> RiskwatchResult<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(RiskwatchError::InvalidState(
                "Task processor is already running".to_string(),
            ));
        }
        if self.inner.shutdown.is_triggered() {
            return Err(RiskwatchError::InvalidState(
                "Task processor has been shut down".to_string(),
            ));
        }

        let dispatcher = tokio::spawn(self.clone().run_dispatcher());
        let scheduler = tokio::spawn(self.clone().run_scheduler());
        self.inner.loops.lock().extend([dispatcher, scheduler]);

        info!("Task processor started");
        Ok(())
    }

    /// Enqueue a task without waiting
    ///
    /// When the queue is at capacity the task is returned inside the error.
    pub fn submit(&self, task: AsyncTask) -> Result<TaskId, TaskRejected> {
        if !self.inner.accepting.load(Ordering::Acquire) {
            return Err(self.reject(task, RejectionReason::ShuttingDown));
        }
        let id = self.enqueue(task, false)?;
        metrics::tasks_submitted_total().add(1, &[]);
        Ok(id)
    }

    /// Hold a task until `now + delay`, then hand it to the queue
    ///
    /// During shutdown the task is recorded as cancelled instead.
    pub fn schedule(&self, mut task: AsyncTask, delay: Duration) -> TaskId {
        let id = task.id;
        if !self.inner.accepting.load(Ordering::Acquire) {
            warn!(task_id = %id, "Schedule requested during shutdown; cancelling task");
            self.record_cancelled(&task, "processor is shutting down");
            return id;
        }

        task.max_retries.get_or_insert(self.inner.config.default_max_retries);
        task.scheduled_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| chrono::Utc::now().checked_add_signed(delay));

        {
            let mut state = self.inner.state.lock();
            state.total_submitted += 1;
            state.live.insert(id, TaskStatus::Scheduled);
        }
        if let Err(task) = self.park_scheduled(task, delay) {
            self.record_cancelled(&task, "processor is shutting down");
            return id;
        }
        metrics::tasks_submitted_total().add(1, &[]);
        id
    }

    /// Remove a task that is still waiting in the scheduler
    pub fn cancel_scheduled(&self, id: TaskId) -> bool {
        let Some(scheduled) = self.inner.scheduled.lock().remove(&id) else {
            return false;
        };
        self.record_cancelled(&scheduled.task, "cancelled before it was due");
        true
    }

    /// Current lifecycle state, if the task is known
    ///
    /// Completed tasks are only found while they remain in the bounded history.
    pub fn task_status(&self, id: TaskId) -> Option<TaskStatus> {
        let state = self.inner.state.lock();
        if let Some(status) = state.live.get(&id) {
            return Some(*status);
        }
        state
            .failed
            .iter()
            .chain(state.history.iter())
            .find(|record| record.id == id)
            .map(|record| record.status)
    }

    /// Most recent completed and cancelled tasks, oldest first
    pub fn recent_tasks(&self) -> Vec<TaskRecord> {
        self.inner.state.lock().history.iter().cloned().collect()
    }

    /// Every task that exhausted its retries or could not be requeued
    pub fn failed_tasks(&self) -> Vec<TaskRecord> {
        self.inner.state.lock().failed.clone()
    }

    pub fn stats(&self) -> TaskProcessorStats {
        let queued = self.inner.queue.lock().len();
        let scheduled = self.inner.scheduled.lock().len();
        let state = self.inner.state.lock();

        let average_processing_time = if state.finished_attempts == 0 {
            Duration::ZERO
        } else {
            state
                .total_processing_time
                .div_f64(state.finished_attempts as f64)
        };

        TaskProcessorStats {
            total_submitted: state.total_submitted,
            completed: state.completed,
            failed: state.failed_count,
            retried: state.retried,
            rejected: state.rejected,
            cancelled: state.cancelled,
            queued,
            scheduled,
            processing: state.processing,
            average_processing_time,
            worker_count: self.inner.config.worker_count,
            queue_capacity: self.inner.config.queue_size,
        }
    }

    /// Move every due task to the queue. Returns how many were promoted.
    ///
    /// Tasks that don't fit stay scheduled and are retried on the next pass.
    pub fn promote_due(&self) -> usize {
        let now = Instant::now();
        let mut due: Vec<ScheduledTask> = {
            let mut scheduled = self.inner.scheduled.lock();
            let ready: Vec<TaskId> = scheduled
                .iter()
                .filter(|(_, entry)| entry.due <= now)
                .map(|(id, _)| *id)
                .collect();
            ready
                .into_iter()
                .filter_map(|id| scheduled.remove(&id))
                .collect()
        };

        if due.is_empty() {
            return 0;
        }
        due.sort_by_key(|entry| entry.due);

        let mut promoted = 0;
        for entry in due {
            match self.enqueue(entry.task, true) {
                Ok(_) => promoted += 1,
                Err(rejected) if rejected.reason == RejectionReason::ShuttingDown => {
                    self.record_abandoned(&rejected.task);
                }
                Err(rejected) => {
                    warn!(
                        task_id = %rejected.task.id,
                        reason = %rejected.reason,
                        "Due task could not be queued; keeping it scheduled"
                    );
                    let mut scheduled = self.inner.scheduled.lock();
                    scheduled.insert(
                        rejected.task.id,
                        ScheduledTask {
                            due: entry.due,
                            task: *rejected.task,
                        },
                    );
                }
            }
        }

        debug!(promoted = promoted, "Promoted scheduled tasks");
        promoted
    }

    /// Stop intake, stop both loops and wait for running tasks
    ///
    /// Tasks still queued or scheduled are moved to the failed record as
    /// cancelled. Returns `Timeout` if running tasks outlast `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> RiskwatchResult<()> {
        if !self.inner.accepting.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Task processor shutting down");

        self.inner.shutdown.trigger();
        let loops: Vec<JoinHandle<()>> = self.inner.loops.lock().drain(..).collect();
        for result in join_all(loops).await {
            if let Err(e) = result {
                warn!(error = %e, "Task processor loop ended abnormally");
            }
        }

        let drained = self.inner.queue.lock().drain_ordered();
        let unscheduled: Vec<AsyncTask> = self
            .inner
            .scheduled
            .lock()
            .drain()
            .map(|(_, entry)| entry.task)
            .collect();
        for task in drained.iter().chain(unscheduled.iter()) {
            self.record_abandoned(task);
        }

        let waited = tokio::time::timeout(timeout, async {
            while self.processing() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;

        let stats = self.stats();
        info!(
            completed = stats.completed,
            failed = stats.failed,
            still_processing = stats.processing,
            "Task processor stopped"
        );

        waited.map_err(|_| {
            RiskwatchError::Timeout(format!(
                "{} tasks still running after {:?}",
                stats.processing, timeout
            ))
        })
    }

    async fn run_dispatcher(self) {
        let shutdown = Arc::clone(&self.inner.shutdown);
        let batch_size = self.inner.config.batch_size;
        let poll_interval = self.inner.config.dispatch_poll_interval();

        debug!("Task dispatcher started");
        loop {
            let permit = tokio::select! {
                _ = shutdown.wait() => break,
                permit = Arc::clone(&self.inner.workers).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let dispatched = self.dispatch_batch(permit, batch_size);
            if dispatched == 0 {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = self.inner.work_available.notified() => {}
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            } else if dispatched == batch_size {
                tokio::task::yield_now().await;
            }
        }
        debug!("Task dispatcher stopped");
    }

    /// Start up to `batch_size` tasks, one worker permit each
    fn dispatch_batch(&self, first_permit: OwnedSemaphorePermit, batch_size: usize) -> usize {
        let mut permit = Some(first_permit);
        let mut dispatched = 0;

        while dispatched < batch_size {
            let worker = match permit.take() {
                Some(worker) => worker,
                None => match Arc::clone(&self.inner.workers).try_acquire_owned() {
                    Ok(worker) => worker,
                    Err(_) => break,
                },
            };

            let Some(task) = self.inner.queue.lock().pop() else {
                break;
            };

            self.spawn_attempt(task, worker);
            dispatched += 1;
        }

        dispatched
    }

    async fn run_scheduler(self) {
        let shutdown = Arc::clone(&self.inner.shutdown);
        let mut interval = tokio::time::interval(self.inner.config.scheduler_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!("Task scheduler started");
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = interval.tick() => {
                    self.promote_due();
                }
            }
        }
        debug!("Task scheduler stopped");
    }

    fn spawn_attempt(&self, task: AsyncTask, worker: OwnedSemaphorePermit) {
        {
            let mut state = self.inner.state.lock();
            state.processing += 1;
            state.live.insert(task.id, TaskStatus::Running);
        }
        log_task_operation(
            "start",
            &task.id.to_string(),
            &task.name,
            task.priority,
            TaskStatus::Running.as_str(),
            None,
        );

        let processor = self.clone();
        let timeout = self.inner.config.task_timeout();
        tokio::spawn(async move {
            let started = Instant::now();

            let handler = Arc::clone(&task.handler);
            let args = task.args.clone();
            // The worker permit lives as long as the handler does, even past a timeout
            let mut attempt = tokio::spawn(async move {
                let _worker = worker;
                handler.handle(args).await
            });

            // On timeout the attempt is detached, not aborted; its result is discarded
            let outcome = match tokio::time::timeout(timeout, &mut attempt).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_error)) if join_error.is_panic() => Err(TaskExecutionError::Panicked(
                    panic_message(join_error.into_panic()),
                )),
                Ok(Err(join_error)) => Err(TaskExecutionError::failed(join_error.to_string())),
                Err(_) => Err(TaskExecutionError::TimedOut(timeout)),
            };

            processor.finish_attempt(task, outcome, started.elapsed());
        });
    }

    fn finish_attempt(
        &self,
        mut task: AsyncTask,
        outcome: Result<Value, TaskExecutionError>,
        duration: Duration,
    ) {
        metrics::task_duration().record(duration.as_secs_f64() * 1000.0, &[]);
        {
            let mut state = self.inner.state.lock();
            state.processing = state.processing.saturating_sub(1);
            state.finished_attempts += 1;
            state.total_processing_time += duration;
        }

        let error = match outcome {
            Ok(value) => {
                let record = TaskRecord::from_task(
                    &task,
                    TaskStatus::Completed,
                    task.attempts(),
                    Some(value),
                    None,
                    duration,
                );
                {
                    let mut state = self.inner.state.lock();
                    state.completed += 1;
                    state.live.remove(&task.id);
                    self.push_history(&mut state, record);
                }
                metrics::tasks_completed_total().add(1, &[]);
                log_task_operation(
                    "complete",
                    &task.id.to_string(),
                    &task.name,
                    task.priority,
                    TaskStatus::Completed.as_str(),
                    None,
                );
                return;
            }
            Err(error) => error,
        };

        let attempts = task.attempts();
        task.retry_count += 1;
        let max_retries = task
            .max_retries
            .unwrap_or(self.inner.config.default_max_retries);

        if task.retry_count <= max_retries && self.inner.accepting.load(Ordering::Acquire) {
            self.inner.state.lock().retried += 1;
            metrics::tasks_retried_total().add(1, &[KeyValue::new("task", task.name.clone())]);
            log_task_operation(
                "retry",
                &task.id.to_string(),
                &task.name,
                task.priority,
                "retrying",
                Some(&format!(
                    "attempt {attempts} failed: {error}; retry {}/{max_retries}",
                    task.retry_count
                )),
            );

            match &self.inner.config.retry_backoff {
                Some(backoff) => {
                    let delay = backoff.delay_for_retry(task.retry_count);
                    self.inner
                        .state
                        .lock()
                        .live
                        .insert(task.id, TaskStatus::Scheduled);
                    if let Err(task) = self.park_scheduled(task, delay) {
                        let reason =
                            format!("{error}; retry not scheduled: processor is shutting down");
                        self.record_failed(&task, attempts, reason, duration);
                    }
                }
                None => {
                    if let Err(rejected) = self.enqueue(task, true) {
                        let reason = format!("{error}; retry not queued: {}", rejected.reason);
                        self.record_failed(&rejected.task, attempts, reason, duration);
                    }
                }
            }
            return;
        }

        self.record_failed(&task, attempts, error.to_string(), duration);
    }

    fn enqueue(&self, mut task: AsyncTask, is_retry: bool) -> Result<TaskId, TaskRejected> {
        let id = task.id;
        task.max_retries.get_or_insert(self.inner.config.default_max_retries);

        // Status first, so a dispatcher that pops the task right away isn't overwritten
        let previous = self.inner.state.lock().live.insert(id, TaskStatus::Queued);

        // Intake is checked under the queue lock so shutdown's drain sees every push
        let pushed = {
            let mut queue = self.inner.queue.lock();
            if self.inner.accepting.load(Ordering::Acquire) {
                let capacity = self.inner.config.queue_size;
                queue
                    .push(task)
                    .map_err(|task| (task, RejectionReason::QueueFull { capacity }))
            } else {
                Err((task, RejectionReason::ShuttingDown))
            }
        };
        if let Err((task, reason)) = pushed {
            {
                let mut state = self.inner.state.lock();
                match previous {
                    Some(status) => state.live.insert(id, status),
                    None => state.live.remove(&id),
                };
            }
            return Err(self.reject(task, reason));
        }

        if !is_retry {
            self.inner.state.lock().total_submitted += 1;
        }
        self.inner.work_available.notify_one();
        Ok(id)
    }

    fn processing(&self) -> usize {
        self.inner.state.lock().processing
    }

    /// Hand a task to the scheduler. Gives it back once shutdown has begun.
    fn park_scheduled(&self, task: AsyncTask, delay: Duration) -> Result<(), AsyncTask> {
        let now = Instant::now();
        let due = now.checked_add(delay).unwrap_or(now + FAR_FUTURE);

        let mut scheduled = self.inner.scheduled.lock();
        if !self.inner.accepting.load(Ordering::Acquire) {
            return Err(task);
        }
        scheduled.insert(task.id, ScheduledTask { due, task });
        Ok(())
    }

    fn reject(&self, task: AsyncTask, reason: RejectionReason) -> TaskRejected {
        self.inner.state.lock().rejected += 1;
        metrics::tasks_rejected_total().add(1, &[]);
        warn!(task_id = %task.id, task_name = %task.name, reason = %reason, "Task rejected");
        TaskRejected {
            task: Box::new(task),
            reason,
        }
    }

    fn record_failed(&self, task: &AsyncTask, attempts: u32, error: String, duration: Duration) {
        log_error(
            "task_processor",
            &task.name,
            &error,
            Some(&format!("task {} failed permanently after {attempts} attempts", task.id)),
        );
        let record = TaskRecord::from_task(
            task,
            TaskStatus::Failed,
            attempts,
            None,
            Some(error),
            duration,
        );
        {
            let mut state = self.inner.state.lock();
            state.failed_count += 1;
            state.live.remove(&task.id);
            state.failed.push(record);
        }
        metrics::tasks_failed_total().add(1, &[KeyValue::new("task", task.name.clone())]);
    }

    /// Pending work dropped by shutdown is kept in the failed record
    fn record_abandoned(&self, task: &AsyncTask) {
        let record = TaskRecord::from_task(
            task,
            TaskStatus::Cancelled,
            task.retry_count,
            None,
            Some("processor shut down before the task ran".to_string()),
            Duration::ZERO,
        );
        let mut state = self.inner.state.lock();
        state.cancelled += 1;
        state.live.remove(&task.id);
        state.failed.push(record);
    }

    fn record_cancelled(&self, task: &AsyncTask, reason: &str) {
        log_task_operation(
            "cancel",
            &task.id.to_string(),
            &task.name,
            task.priority,
            TaskStatus::Cancelled.as_str(),
            Some(reason),
        );
        let record = TaskRecord::from_task(
            task,
            TaskStatus::Cancelled,
            task.retry_count,
            None,
            Some(reason.to_string()),
            Duration::ZERO,
        );
        let mut state = self.inner.state.lock();
        state.cancelled += 1;
        state.live.remove(&task.id);
        self.push_history(&mut state, record);
    }

    fn push_history(&self, state: &mut ProcessorState, record: TaskRecord) {
        let limit = self.inner.config.completed_history_limit;
        if limit == 0 {
            return;
        }
        while state.history.len() >= limit {
            state.history.pop_front();
        }
        state.history.push_back(record);
    }
}

impl TaskStatsSource for TaskProcessor {
    fn task_stats(&self) -> TaskProcessorStats {
        self.stats()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn config(worker_count: usize, queue_size: usize) -> TaskProcessorConfig {
        TaskProcessorConfig {
            worker_count,
            queue_size,
            dispatch_poll_interval_ms: 5,
            scheduler_interval_ms: 10,
            task_timeout_ms: 1_000,
            ..Default::default()
        }
    }

    fn ok_task(name: &str) -> AsyncTask {
        AsyncTask::from_fn(name, |_| async { Ok::<_, TaskExecutionError>(json!("ok")) })
    }

    async fn wait_until(processor: &TaskProcessor, done: impl Fn(&TaskProcessorStats) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if done(&processor.stats()) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("processor did not reach expected state");
    }

    #[tokio::test]
    async fn test_submit_rejects_when_full() {
        let processor = TaskProcessor::new(config(1, 2)).unwrap();
        processor.submit(ok_task("a")).unwrap();
        processor.submit(ok_task("b")).unwrap();

        let rejected = processor.submit(ok_task("c")).unwrap_err();
        assert_eq!(rejected.reason, RejectionReason::QueueFull { capacity: 2 });
        assert_eq!(rejected.task.name, "c");

        let stats = processor.stats();
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.total_submitted, 2);
    }

    #[tokio::test]
    async fn test_tasks_complete() {
        let processor = TaskProcessor::new(config(2, 10)).unwrap();
        let id = processor.submit(ok_task("screen")).unwrap();
        assert_eq!(processor.task_status(id), Some(TaskStatus::Queued));

        processor.start().unwrap();
        wait_until(&processor, |s| s.completed == 1).await;

        assert_eq!(processor.task_status(id), Some(TaskStatus::Completed));
        let record = &processor.recent_tasks()[0];
        assert_eq!(record.result, Some(json!("ok")));
        assert_eq!(record.attempts, 1);

        processor.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let processor = TaskProcessor::new(config(1, 10)).unwrap();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let task = AsyncTask::from_fn("always_fails", move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<Value, _>(TaskExecutionError::failed("upstream down"))
            }
        })
        .with_max_retries(2);
        let id = processor.submit(task).unwrap();

        processor.start().unwrap();
        wait_until(&processor, |s| s.failed == 1).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let failed = processor.failed_tasks();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 3);
        assert_eq!(processor.task_status(id), Some(TaskStatus::Failed));
        assert_eq!(processor.stats().retried, 2);

        processor.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let processor = TaskProcessor::new(config(1, 10)).unwrap();
        let task = AsyncTask::from_fn("panics", |_| async {
            if true {
                panic!("handler bug");
            }
            Ok::<_, TaskExecutionError>(Value::Null)
        })
        .with_max_retries(0);
        processor.submit(task).unwrap();
        processor.submit(ok_task("after")).unwrap();

        processor.start().unwrap();
        wait_until(&processor, |s| s.failed == 1 && s.completed == 1).await;

        let failed = processor.failed_tasks();
        assert!(failed[0].error.as_deref().unwrap_or_default().contains("handler bug"));

        processor.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let mut cfg = config(1, 10);
        cfg.task_timeout_ms = 20;
        let processor = TaskProcessor::new(cfg).unwrap();

        let task = AsyncTask::from_fn("slow", |_| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, TaskExecutionError>(Value::Null)
        })
        .with_max_retries(0);
        processor.submit(task).unwrap();

        processor.start().unwrap();
        wait_until(&processor, |s| s.failed == 1).await;
        assert!(processor.failed_tasks()[0]
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("timed out"));

        processor.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_scheduled_task_runs_after_delay() {
        let processor = TaskProcessor::new(config(1, 10)).unwrap();
        let id = processor.schedule(ok_task("later"), Duration::from_millis(30));
        assert_eq!(processor.task_status(id), Some(TaskStatus::Scheduled));
        assert_eq!(processor.promote_due(), 0);

        processor.start().unwrap();
        wait_until(&processor, |s| s.completed == 1).await;
        assert_eq!(processor.stats().scheduled, 0);

        processor.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_scheduled() {
        let processor = TaskProcessor::new(config(1, 10)).unwrap();
        let id = processor.schedule(ok_task("later"), Duration::from_secs(60));

        assert!(processor.cancel_scheduled(id));
        assert!(!processor.cancel_scheduled(id));
        assert_eq!(processor.task_status(id), Some(TaskStatus::Cancelled));
        assert_eq!(processor.stats().cancelled, 1);
    }

    #[tokio::test]
    async fn test_retry_backoff_goes_through_scheduler() {
        let mut cfg = config(1, 10);
        cfg.retry_backoff = Some(crate::config::RetryBackoffConfig {
            base_delay_ms: 60_000,
            multiplier: 2.0,
            max_delay_ms: 120_000,
        });
        let processor = TaskProcessor::new(cfg).unwrap();

        let task = AsyncTask::from_fn("flaky", |_| async {
            Err::<Value, _>(TaskExecutionError::failed("nope"))
        })
        .with_max_retries(1);
        let id = processor.submit(task).unwrap();

        processor.start().unwrap();
        wait_until(&processor, |s| s.retried == 1).await;
        assert_eq!(processor.task_status(id), Some(TaskStatus::Scheduled));
        assert_eq!(processor.stats().scheduled, 1);

        processor.shutdown(Duration::from_secs(1)).await.unwrap();
        // Pending retry is kept as cancelled, not dropped
        let failed = processor.failed_tasks();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_timed_out_handler_keeps_its_worker() {
        let mut cfg = config(1, 10);
        cfg.task_timeout_ms = 20;
        let processor = TaskProcessor::new(cfg).unwrap();

        let running = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        for i in 0..4 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let task = AsyncTask::from_fn(format!("hang-{i}"), move |_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, TaskExecutionError>(Value::Null)
                }
            })
            .with_max_retries(0);
            processor.submit(task).unwrap();
        }

        processor.start().unwrap();
        wait_until(&processor, |s| s.failed == 4).await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);

        processor.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_unrepresentable_schedule_delay_is_parked() {
        let processor = TaskProcessor::new(config(1, 10)).unwrap();
        let id = processor.schedule(ok_task("someday"), Duration::MAX);

        assert_eq!(processor.task_status(id), Some(TaskStatus::Scheduled));
        assert_eq!(processor.promote_due(), 0);
        assert!(processor.cancel_scheduled(id));
    }

    #[tokio::test]
    async fn test_requeue_after_intake_stops_is_refused() {
        let processor = TaskProcessor::new(config(1, 10)).unwrap();
        processor.inner.accepting.store(false, Ordering::Release);

        let rejected = processor.enqueue(ok_task("retry"), true).unwrap_err();
        assert_eq!(rejected.reason, RejectionReason::ShuttingDown);
        assert!(processor.park_scheduled(ok_task("later"), Duration::from_secs(1)).is_err());

        let stats = processor.stats();
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.scheduled, 0);
    }

    #[tokio::test]
    async fn test_failure_during_shutdown_is_recorded() {
        let processor = TaskProcessor::new(config(1, 10)).unwrap();
        let task = AsyncTask::from_fn("late-failure", |_| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err::<Value, _>(TaskExecutionError::failed("store gone"))
        })
        .with_max_retries(3);
        let id = processor.submit(task).unwrap();

        processor.start().unwrap();
        wait_until(&processor, |s| s.processing == 1).await;
        processor.shutdown(Duration::from_secs(1)).await.unwrap();

        assert_eq!(processor.task_status(id), Some(TaskStatus::Failed));
        assert_eq!(processor.stats().queued, 0);
        assert_eq!(processor.failed_tasks().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_intake() {
        let processor = TaskProcessor::new(config(1, 10)).unwrap();
        processor.start().unwrap();
        assert!(processor.start().is_err());

        processor.shutdown(Duration::from_secs(1)).await.unwrap();
        let rejected = processor.submit(ok_task("late")).unwrap_err();
        assert_eq!(rejected.reason, RejectionReason::ShuttingDown);
    }
}
