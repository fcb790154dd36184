// src/core/parallel.rs

//! Bounded fan-out over an indexed set of work items with first-error
//! semantics. Both the repair orchestrator and the backup pipeline schedule
//! their per-host and per-shard work through this primitive.

use crate::core::errors::ManagerError;
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;

/// No bound on the number of tasks in flight.
pub const NO_LIMIT: usize = 0;

/// Failure mode of a single task in a parallel group.
#[derive(Debug)]
pub enum TaskError {
    /// Regular failure. The first one is reported; tasks that have not
    /// started yet are skipped while in-flight tasks run to completion.
    Fail(ManagerError),
    /// Cancels the whole group immediately. In-flight tasks are dropped and
    /// the wrapped error surfaces even if every other task would succeed.
    Abort(ManagerError),
}

impl From<ManagerError> for TaskError {
    fn from(e: ManagerError) -> Self {
        TaskError::Fail(e)
    }
}

/// Wraps an error so that it short-circuits the parallel group.
pub fn abort(err: ManagerError) -> TaskError {
    TaskError::Abort(err)
}

/// Executes `f(0)..f(n-1)` with at most `limit` tasks in flight
/// (`limit == NO_LIMIT` runs everything at once). Tasks start in index order
/// and may complete in any order. Returns the first error.
pub async fn run<F, Fut>(n: usize, limit: usize, f: F) -> Result<(), ManagerError>
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = Result<(), TaskError>>,
{
    let window = if limit == NO_LIMIT { n } else { limit.min(n) };

    let mut in_flight = FuturesUnordered::new();
    let mut next = 0usize;
    let mut first_err: Option<ManagerError> = None;

    while next < window {
        in_flight.push(f(next));
        next += 1;
    }

    while let Some(res) = in_flight.next().await {
        match res {
            Ok(()) => {}
            Err(TaskError::Abort(err)) => return Err(err),
            Err(TaskError::Fail(err)) => {
                if first_err.is_none() {
                    first_err = Some(err);
                }
                // Drain in-flight tasks but do not start new ones.
                next = n;
            }
        }
        if next < n {
            in_flight.push(f(next));
            next += 1;
        }
    }

    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
