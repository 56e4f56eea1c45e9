//! Background worker loops.
//!
//! # Responsibility
//! - Run one long-lived loop per task type that drains the shared queue.
//! - Run periodic sweep loops for maintenance not bound to a task type.
//! - Stop cooperatively within a bounded grace period.
//!
//! # Invariants
//! - Loops check the stop signal before every dequeue and during every sleep.
//! - A handler panic is contained and recorded as a task failure.

mod pool;
mod signal;

pub use pool::{ShutdownReport, WorkerError, WorkerPool};
pub use signal::StopSignal;

use crate::model::task::Task;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Failure reported by a task handler or sweep.
#[derive(Debug)]
pub enum HandlerError {
    /// Task payload does not decode into the handler's payload type.
    InvalidPayload(serde_json::Error),
    /// Work failed; the task is retried while attempts remain.
    Failed(String),
}

impl HandlerError {
    pub fn failed(err: impl Display) -> Self {
        Self::Failed(err.to_string())
    }
}

impl Display for HandlerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPayload(err) => write!(f, "invalid task payload: {err}"),
            Self::Failed(message) => write!(f, "{message}"),
        }
    }
}

impl Error for HandlerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidPayload(err) => Some(err),
            Self::Failed(_) => None,
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(value: serde_json::Error) -> Self {
        Self::InvalidPayload(value)
    }
}

/// Executes one claimed task.
pub trait TaskHandler: Send + Sync + 'static {
    fn handle(&self, task: &Task) -> Result<(), HandlerError>;
}

impl<F> TaskHandler for F
where
    F: Fn(&Task) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, task: &Task) -> Result<(), HandlerError> {
        self(task)
    }
}

/// One periodic maintenance step.
pub trait Sweeper: Send + 'static {
    /// Runs one sweep step. Returns whether any work was done.
    fn sweep(&mut self) -> Result<bool, HandlerError>;
}

impl<F> Sweeper for F
where
    F: FnMut() -> Result<bool, HandlerError> + Send + 'static,
{
    fn sweep(&mut self) -> Result<bool, HandlerError> {
        self()
    }
}
