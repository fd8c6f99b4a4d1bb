//! Dispatch order, retry placement and bounded concurrency of the task processor

mod common;

use common::{eventually, logging_task, processor_config};
use parking_lot::Mutex;
use riskwatch_core::execution::{AsyncTask, RejectionReason, TaskExecutionError, TaskProcessor};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn lower_priority_values_run_first_fifo_within_band() {
    common::init_test_logging();
    let processor = TaskProcessor::new(processor_config(1, 16)).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    for (label, priority) in [("a", 3), ("b", 1), ("c", 2), ("d", 1), ("e", 3)] {
        processor
            .submit(logging_task(label, priority, Arc::clone(&log)))
            .unwrap();
    }

    processor.start().unwrap();
    eventually(Duration::from_secs(5), || processor.stats().completed == 5).await;

    assert_eq!(*log.lock(), vec!["b", "d", "c", "a", "e"]);
    processor.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn retried_task_queues_behind_its_priority_band() {
    let processor = TaskProcessor::new(processor_config(1, 16)).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let attempts = Arc::new(AtomicU32::new(0));

    let flaky = {
        let log = Arc::clone(&log);
        let attempts = Arc::clone(&attempts);
        AsyncTask::from_fn("flaky", move |_args: Value| {
            let log = Arc::clone(&log);
            let attempts = Arc::clone(&attempts);
            async move {
                log.lock().push("flaky".to_string());
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(TaskExecutionError::failed("transient"))
                } else {
                    Ok(json!("recovered"))
                }
            }
        })
        .with_priority(1)
        .with_max_retries(1)
    };

    processor.submit(flaky).unwrap();
    processor
        .submit(logging_task("steady", 1, Arc::clone(&log)))
        .unwrap();
    processor
        .submit(logging_task("low", 5, Arc::clone(&log)))
        .unwrap();

    processor.start().unwrap();
    eventually(Duration::from_secs(5), || processor.stats().completed == 3).await;

    assert_eq!(*log.lock(), vec!["flaky", "steady", "flaky", "low"]);
    let stats = processor.stats();
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.failed, 0);
    processor.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn exhausted_retries_land_in_failed_record() {
    let processor = TaskProcessor::new(processor_config(2, 16)).unwrap();
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);

    let task = AsyncTask::from_fn("alert_dispatch", move |_args: Value| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<Value, _>(TaskExecutionError::failed("smtp unreachable"))
        }
    })
    .with_args(json!({"case": 42}))
    .with_max_retries(3);
    processor.submit(task).unwrap();

    processor.start().unwrap();
    eventually(Duration::from_secs(5), || processor.stats().failed == 1).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    let failed = processor.failed_tasks();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempts, 4);
    assert_eq!(failed[0].args, json!({"case": 42}));
    assert!(failed[0].error.as_deref().unwrap_or_default().contains("smtp unreachable"));

    // Give the dispatcher a chance to run anything that was wrongly requeued
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    processor.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn full_queue_rejects_without_blocking() {
    let processor = TaskProcessor::new(processor_config(1, 3)).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    for i in 0..3 {
        processor
            .submit(logging_task(&format!("t{i}"), 0, Arc::clone(&log)))
            .unwrap();
    }
    let rejected = processor
        .submit(logging_task("overflow", 0, Arc::clone(&log)))
        .unwrap_err();
    assert_eq!(rejected.reason, RejectionReason::QueueFull { capacity: 3 });
    assert_eq!(rejected.task.name, "overflow");
    assert_eq!(processor.stats().queued, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_never_exceeds_worker_count() {
    let workers = 3;
    let processor = TaskProcessor::new(processor_config(workers, 64)).unwrap();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    for i in 0..20 {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        let task = AsyncTask::from_fn(format!("scan_{i}"), move |_args: Value| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, TaskExecutionError>(Value::Null)
            }
        });
        processor.submit(task).unwrap();
    }

    processor.start().unwrap();
    eventually(Duration::from_secs(10), || processor.stats().completed == 20).await;

    assert!(peak.load(Ordering::SeqCst) <= workers);
    assert!(peak.load(Ordering::SeqCst) >= 1);
    processor.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn shutdown_keeps_pending_work_as_cancelled() {
    let processor = TaskProcessor::new(processor_config(1, 16)).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    let queued = processor
        .submit(logging_task("never_started", 2, Arc::clone(&log)))
        .unwrap();
    let scheduled = processor.schedule(
        logging_task("far_future", 2, Arc::clone(&log)),
        Duration::from_secs(3_600),
    );

    processor.shutdown(Duration::from_secs(1)).await.unwrap();

    let failed = processor.failed_tasks();
    let ids: Vec<_> = failed.iter().map(|record| record.id).collect();
    assert!(ids.contains(&queued));
    assert!(ids.contains(&scheduled));
    assert!(log.lock().is_empty());
}
