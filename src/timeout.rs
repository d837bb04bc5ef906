//! Deadline race for a single task
//!
//! [`race_with_deadline`] spawns a task and a timer; whichever resolves first
//! decides the outcome. When the timer wins, the task is cancelled and its
//! termination (including any children it spawned) is awaited before the
//! timeout error is returned.
//!
//! The raced task is a child of the caller's scope. If the caller itself is
//! cancelled mid-race, its own cancellation waits for the raced task too.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::task::TaskContext;
use crate::{Error, Result};

/// Run the task produced by `f` against `deadline`
///
/// Returns the task's own result if it finishes first, or
/// [`Error::AttemptTimedOut`] once the deadline elapses and the task has
/// been confirmed stopped.
pub async fn race_with_deadline<F, Fut, T>(
    parent: &TaskContext,
    name: &str,
    deadline: Duration,
    f: F,
) -> Result<T>
where
    F: FnOnce(TaskContext) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let started = Instant::now();
    let mut handle = parent.spawn(name, f);

    let finished = tokio::select! {
        biased;
        outcome = handle.wait() => Some(outcome),
        _ = tokio::time::sleep(deadline) => None,
    };

    match finished {
        Some(outcome) => {
            debug!(task = %name, elapsed = ?started.elapsed(), "Task finished before deadline");
            outcome.into_result(name)
        }
        None => {
            warn!(task = %name, deadline = ?deadline, "Deadline elapsed, cancelling task");
            let stopped = handle.cancel().await;
            debug!(
                task = %name,
                cancelled = stopped.is_cancelled(),
                "Timed out task has stopped"
            );
            Err(Error::AttemptTimedOut {
                task: name.to_string(),
                deadline,
            })
        }
    }
}
