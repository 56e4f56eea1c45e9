mod common;

use common::wait_until;
use semvault_core::worker::HandlerError;
use semvault_core::{SharedDb, StopSignal, Task, TaskQueue, TaskStatus, TaskType, WorkerPool};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL: Duration = Duration::from_millis(10);
const WAIT: Duration = Duration::from_secs(10);

fn pool(max_attempts: u32) -> (TaskQueue, WorkerPool) {
    let queue = TaskQueue::new(SharedDb::open_in_memory().unwrap(), max_attempts);
    let pool = WorkerPool::new(queue.clone(), StopSignal::new(), POLL);
    (queue, pool)
}

#[test]
fn queue_worker_drains_pending_tasks() {
    let (queue, mut pool) = pool(3);
    for n in 0..5 {
        queue
            .enqueue(TaskType::EmbedStatement, &json!({ "n": n }), 0)
            .unwrap();
    }

    let handled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&handled);
    pool.spawn_queue_worker(
        TaskType::EmbedStatement,
        Arc::new(move |_task: &Task| -> Result<(), HandlerError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    )
    .unwrap();

    assert!(wait_until(WAIT, || queue.counts().unwrap().completed == 5));
    assert_eq!(handled.load(Ordering::SeqCst), 5);

    let report = pool.shutdown(Duration::from_secs(2));
    assert!(report.is_clean());
    assert_eq!(report.joined, vec!["worker-embed_statement".to_string()]);
}

#[test]
fn failing_handler_exhausts_attempts() {
    let (queue, mut pool) = pool(2);
    let id = queue
        .enqueue(TaskType::RefreshSummary, &json!({}), 0)
        .unwrap();
    pool.spawn_queue_worker(
        TaskType::RefreshSummary,
        Arc::new(|_task: &Task| -> Result<(), HandlerError> {
            Err(HandlerError::failed("boom"))
        }),
    )
    .unwrap();

    assert!(wait_until(WAIT, || queue.counts().unwrap().failed == 1));
    pool.shutdown(Duration::from_secs(2));

    let task = queue.get_task(id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 2);
    assert_eq!(task.last_error.as_deref(), Some("boom"));
}

#[test]
fn undecodable_payload_is_recorded_as_failure() {
    let (queue, mut pool) = pool(1);
    let id = queue
        .enqueue(TaskType::ClassifyNote, &json!({"unexpected": true}), 0)
        .unwrap();
    pool.spawn_queue_worker(
        TaskType::ClassifyNote,
        Arc::new(|task: &Task| -> Result<(), HandlerError> {
            let _payload: semvault_core::model::task::ClassifyNotePayload = task.decode_payload()?;
            Ok(())
        }),
    )
    .unwrap();

    assert!(wait_until(WAIT, || queue.counts().unwrap().failed == 1));
    pool.shutdown(Duration::from_secs(2));
    let error = queue.get_task(id).unwrap().last_error.unwrap();
    assert!(error.starts_with("invalid task payload"), "{error}");
}

#[test]
fn handler_panic_is_contained() {
    let (queue, mut pool) = pool(1);
    let panicking = queue
        .enqueue(TaskType::EmbedStatement, &json!({"n": 0}), 5)
        .unwrap();
    let healthy = queue
        .enqueue(TaskType::EmbedStatement, &json!({"n": 1}), 0)
        .unwrap();
    pool.spawn_queue_worker(
        TaskType::EmbedStatement,
        Arc::new(|task: &Task| -> Result<(), HandlerError> {
            if task.payload["n"] == 0 {
                panic!("scripted handler panic");
            }
            Ok(())
        }),
    )
    .unwrap();

    assert!(wait_until(WAIT, || {
        queue.get_task(healthy).unwrap().status == TaskStatus::Completed
    }));
    let report = pool.shutdown(Duration::from_secs(2));
    assert!(report.is_clean());

    let task = queue.get_task(panicking).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task
        .last_error
        .unwrap()
        .contains("handler panicked: scripted handler panic"));
}

#[test]
fn sweeper_reruns_while_it_reports_work() {
    let (_queue, mut pool) = pool(1);
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    pool.spawn_sweeper("countdown", move || -> Result<bool, HandlerError> {
        let previous = counter.fetch_add(1, Ordering::SeqCst);
        Ok(previous < 3)
    })
    .unwrap();

    assert!(wait_until(WAIT, || runs.load(Ordering::SeqCst) >= 4));
    let report = pool.shutdown(Duration::from_secs(2));
    assert_eq!(report.joined, vec!["sweeper-countdown".to_string()]);
}

#[test]
fn shutdown_stops_idle_loops_within_grace() {
    let queue = TaskQueue::new(SharedDb::open_in_memory().unwrap(), 1);
    let mut pool = WorkerPool::new(queue, StopSignal::new(), Duration::from_secs(60));
    for task_type in TaskType::ALL {
        pool.spawn_queue_worker(
            task_type,
            Arc::new(|_task: &Task| -> Result<(), HandlerError> { Ok(()) }),
        )
        .unwrap();
    }
    assert_eq!(pool.loop_names().len(), 3);

    let report = pool.shutdown(Duration::from_secs(2));
    assert!(report.is_clean());
    assert_eq!(report.joined.len(), 3);
}

#[test]
fn shutdown_abandons_a_handler_that_outlives_grace() {
    let (queue, mut pool) = pool(1);
    queue
        .enqueue(TaskType::ClassifyNote, &json!({}), 0)
        .unwrap();
    let started = Arc::new(AtomicUsize::new(0));
    let flag = Arc::clone(&started);
    pool.spawn_queue_worker(
        TaskType::ClassifyNote,
        Arc::new(move |_task: &Task| -> Result<(), HandlerError> {
            flag.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_secs(3));
            Ok(())
        }),
    )
    .unwrap();
    assert!(wait_until(WAIT, || started.load(Ordering::SeqCst) == 1));

    let began = Instant::now();
    let report = pool.shutdown(Duration::from_millis(200));
    let elapsed = began.elapsed();

    assert!(!report.is_clean());
    assert!(report.joined.is_empty());
    assert_eq!(report.abandoned, vec!["worker-classify_note".to_string()]);
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(1500), "shutdown took {elapsed:?}");
}

#[test]
fn stopped_pool_refuses_new_loops() {
    let (_queue, mut pool) = pool(1);
    pool.stop_signal().stop();
    let err = pool
        .spawn_queue_worker(
            TaskType::EmbedStatement,
            Arc::new(|_task: &Task| -> Result<(), HandlerError> { Ok(()) }),
        )
        .unwrap_err();
    assert!(matches!(err, semvault_core::worker::WorkerError::Stopped));
}
