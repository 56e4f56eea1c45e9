//! Worker pool lifecycle.

use super::{HandlerError, StopSignal, Sweeper, TaskHandler};
use crate::model::task::{Task, TaskStatus, TaskType};
use crate::queue::TaskQueue;
use log::{error, info, warn};
use std::any::Any;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const JOIN_POLL: Duration = Duration::from_millis(10);
const MAX_PANIC_PAYLOAD_CHARS: usize = 160;

#[derive(Debug)]
pub enum WorkerError {
    /// OS refused to spawn a loop thread.
    Spawn { name: String, source: std::io::Error },
    /// The pool was already shut down.
    Stopped,
}

impl Display for WorkerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn { name, source } => write!(f, "failed to spawn worker `{name}`: {source}"),
            Self::Stopped => write!(f, "worker pool is stopped"),
        }
    }
}

impl Error for WorkerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Spawn { source, .. } => Some(source),
            Self::Stopped => None,
        }
    }
}

/// Outcome of `WorkerPool::shutdown`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Loops that exited within the grace period.
    pub joined: Vec<String>,
    /// Loops still running when the grace period ran out.
    pub abandoned: Vec<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.abandoned.is_empty()
    }
}

struct LoopHandle {
    name: String,
    handle: JoinHandle<()>,
}

/// Owns the background loops of one engine.
pub struct WorkerPool {
    queue: TaskQueue,
    stop: StopSignal,
    poll_interval: Duration,
    loops: Vec<LoopHandle>,
}

impl WorkerPool {
    /// Creates an empty pool driven by `stop`.
    pub fn new(queue: TaskQueue, stop: StopSignal, poll_interval: Duration) -> Self {
        Self {
            queue,
            stop,
            poll_interval,
            loops: Vec::new(),
        }
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Names of the loops spawned so far.
    pub fn loop_names(&self) -> Vec<String> {
        self.loops.iter().map(|entry| entry.name.clone()).collect()
    }

    /// Starts one loop draining `task_type`.
    pub fn spawn_queue_worker(
        &mut self,
        task_type: TaskType,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), WorkerError> {
        let name = format!("worker-{}", task_type.as_str());
        let queue = self.queue.clone();
        let stop = self.stop.clone();
        let poll_interval = self.poll_interval;
        let loop_name = name.clone();
        self.spawn_loop(name, move || {
            run_queue_loop(&loop_name, task_type, &queue, handler.as_ref(), &stop, poll_interval)
        })
    }

    /// Starts one periodic maintenance loop.
    ///
    /// A sweep that did work runs again immediately; an idle or failed sweep
    /// sleeps for the poll interval.
    pub fn spawn_sweeper(
        &mut self,
        name: &str,
        sweeper: impl Sweeper,
    ) -> Result<(), WorkerError> {
        let name = format!("sweeper-{name}");
        let stop = self.stop.clone();
        let poll_interval = self.poll_interval;
        let loop_name = name.clone();
        self.spawn_loop(name, move || {
            run_sweep_loop(&loop_name, sweeper, &stop, poll_interval)
        })
    }

    /// Signals every loop to stop and waits up to `grace` for them to exit.
    ///
    /// Loops still running after `grace` are detached and reported.
    pub fn shutdown(&mut self, grace: Duration) -> ShutdownReport {
        self.stop.stop();
        let deadline = Instant::now() + grace;
        let mut report = ShutdownReport::default();
        let mut remaining = std::mem::take(&mut self.loops);

        loop {
            let (finished, running): (Vec<_>, Vec<_>) = remaining
                .into_iter()
                .partition(|entry| entry.handle.is_finished());
            for entry in finished {
                if entry.handle.join().is_err() {
                    warn!(
                        "event=worker_shutdown module=worker status=panicked loop={}",
                        entry.name
                    );
                }
                report.joined.push(entry.name);
            }
            remaining = running;
            if remaining.is_empty() || Instant::now() >= deadline {
                break;
            }
            thread::sleep(JOIN_POLL);
        }

        report.abandoned = remaining.into_iter().map(|entry| entry.name).collect();
        if report.is_clean() {
            info!(
                "event=worker_shutdown module=worker status=ok joined={}",
                report.joined.len()
            );
        } else {
            warn!(
                "event=worker_shutdown module=worker status=timeout joined={} abandoned={}",
                report.joined.len(),
                report.abandoned.join(",")
            );
        }
        report
    }

    fn spawn_loop(
        &mut self,
        name: String,
        body: impl FnOnce() + Send + 'static,
    ) -> Result<(), WorkerError> {
        if self.stop.is_stopped() {
            return Err(WorkerError::Stopped);
        }
        let handle = thread::Builder::new()
            .name(format!("semvault-{name}"))
            .spawn(body)
            .map_err(|source| WorkerError::Spawn {
                name: name.clone(),
                source,
            })?;
        self.loops.push(LoopHandle { name, handle });
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.loops.is_empty() {
            self.stop.stop();
        }
    }
}

fn run_queue_loop(
    name: &str,
    task_type: TaskType,
    queue: &TaskQueue,
    handler: &dyn TaskHandler,
    stop: &StopSignal,
    poll_interval: Duration,
) {
    info!("event=worker_start module=worker status=ok loop={name}");
    while !stop.is_stopped() {
        match queue.dequeue(task_type) {
            Ok(Some(task)) => run_task(name, queue, handler, &task),
            Ok(None) => {
                if stop.wait_timeout(poll_interval) {
                    break;
                }
            }
            Err(err) => {
                error!(
                    "event=task_claim module=worker status=error loop={name} error_code=claim_failed error={err}"
                );
                if stop.wait_timeout(poll_interval) {
                    break;
                }
            }
        }
    }
    info!("event=worker_stop module=worker status=ok loop={name}");
}

fn run_task(name: &str, queue: &TaskQueue, handler: &dyn TaskHandler, task: &Task) {
    let started_at = Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(task)))
        .unwrap_or_else(|payload| Err(HandlerError::Failed(panic_message(payload.as_ref()))));

    match outcome {
        Ok(()) => {
            if let Err(err) = queue.complete_task(task.id) {
                error!(
                    "event=task_complete module=worker status=error loop={name} task_id={} error={err}",
                    task.id
                );
                return;
            }
            info!(
                "event=task_run module=worker status=ok loop={name} task_id={} attempt={} duration_ms={}",
                task.id,
                task.attempts,
                started_at.elapsed().as_millis()
            );
        }
        Err(handler_err) => match queue.fail_task(task.id, &handler_err.to_string()) {
            Ok(next) => warn!(
                "event=task_run module=worker status=error loop={name} task_id={} attempt={} next_status={} retry={} error={handler_err}",
                task.id,
                task.attempts,
                next.as_str(),
                next == TaskStatus::Pending
            ),
            Err(err) => error!(
                "event=task_fail module=worker status=error loop={name} task_id={} error={err}",
                task.id
            ),
        },
    }
}

fn run_sweep_loop(
    name: &str,
    mut sweeper: impl Sweeper,
    stop: &StopSignal,
    poll_interval: Duration,
) {
    info!("event=worker_start module=worker status=ok loop={name}");
    while !stop.is_stopped() {
        let outcome = catch_unwind(AssertUnwindSafe(|| sweeper.sweep()))
            .unwrap_or_else(|payload| Err(HandlerError::Failed(panic_message(payload.as_ref()))));
        let did_work = match outcome {
            Ok(did_work) => did_work,
            Err(err) => {
                warn!("event=sweep_run module=worker status=error loop={name} error={err}");
                false
            }
        };
        if !did_work && stop.wait_timeout(poll_interval) {
            break;
        }
    }
    info!("event=worker_stop module=worker status=ok loop={name}");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let text = if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    };
    let text: String = text.chars().take(MAX_PANIC_PAYLOAD_CHARS).collect();
    format!("handler panicked: {text}")
}
