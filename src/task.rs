//! Cancellable task unit
//!
//! Every unit of background work in the bring-up runs as a tokio task that is
//! owned by whoever spawned it. A [`TaskHandle`] supports both waiting for
//! natural completion and cooperative cancellation; cancellation only returns
//! once the task has actually stopped.
//!
//! Tasks form a tree. The closure passed to [`spawn_task`] receives a
//! [`TaskContext`] through which it can spawn attached children. A task's
//! outcome is not published until all of its children have stopped, so a
//! confirmed cancel of the parent is also a confirmed cancel of the subtree.
//! Dropping a handle cancels its task; nothing spawned here can be abandoned.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

use crate::error::TASK_FAULT_CONTEXT;
use crate::{Error, Result};

/// Terminal outcome of a task
#[derive(Debug)]
pub enum TaskOutcome<T> {
    /// The task ran to completion and produced a value
    Completed(T),
    /// The task returned an error (or panicked)
    Failed(Error),
    /// The task was cancelled before it finished
    Cancelled,
}

impl<T> TaskOutcome<T> {
    /// Whether the task was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskOutcome::Cancelled)
    }

    /// Convert into a `Result`, treating cancellation as an internal error
    pub fn into_result(self, task: &str) -> Result<T> {
        match self {
            TaskOutcome::Completed(value) => Ok(value),
            TaskOutcome::Failed(err) => Err(err),
            TaskOutcome::Cancelled => Err(Error::internal_with_context(
                TASK_FAULT_CONTEXT,
                format!("task {} was cancelled", task),
            )),
        }
    }
}

/// Scope handed to a running task
///
/// Cloning is cheap; all clones refer to the same scope.
#[derive(Clone, Debug)]
pub struct TaskContext {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl TaskContext {
    /// Token that fires when this task is cancelled or finishes
    pub fn cancellation(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether this task has been asked to stop
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawn an attached child task
    ///
    /// The child is cancelled when this task is cancelled or completes, and
    /// this task's outcome waits for the child to stop.
    pub fn spawn<F, Fut, T>(&self, name: impl Into<String>, f: F) -> TaskHandle<T>
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        launch(name.into(), self.token.child_token(), Some(&self.tracker), f)
    }
}

/// Spawn a root task on the current tokio runtime
pub fn spawn_task<F, Fut, T>(name: impl Into<String>, f: F) -> TaskHandle<T>
where
    F: FnOnce(TaskContext) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    launch(name.into(), CancellationToken::new(), None, f)
}

fn launch<F, Fut, T>(
    name: String,
    token: CancellationToken,
    tracker: Option<&TaskTracker>,
    f: F,
) -> TaskHandle<T>
where
    F: FnOnce(TaskContext) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let scope = TaskContext {
        token: token.child_token(),
        tracker: TaskTracker::new(),
    };
    let work = AssertUnwindSafe(f(scope.clone())).catch_unwind();
    let stop = token.clone();
    let task_name = name.clone();

    let body = async move {
        let outcome = tokio::select! {
            biased;
            _ = stop.cancelled() => TaskOutcome::Cancelled,
            result = work => match result {
                Ok(Ok(value)) => TaskOutcome::Completed(value),
                Ok(Err(err)) => TaskOutcome::Failed(err),
                Err(panic) => TaskOutcome::Failed(Error::internal_with_context(
                    TASK_FAULT_CONTEXT,
                    format!("task {} panicked: {}", task_name, panic_message(&*panic)),
                )),
            },
        };

        // Children never outlive their parent
        scope.token.cancel();
        scope.tracker.close();
        scope.tracker.wait().await;

        trace!(task = %task_name, cancelled = outcome.is_cancelled(), "Task stopped");
        outcome
    };

    let join = match tracker {
        Some(tracker) => tracker.spawn(body),
        None => tokio::spawn(body),
    };

    TaskHandle { name, token, join }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Owning handle to a spawned task
#[must_use = "dropping a TaskHandle cancels the task"]
pub struct TaskHandle<T> {
    name: String,
    token: CancellationToken,
    join: JoinHandle<TaskOutcome<T>>,
}

impl<T> TaskHandle<T> {
    /// Name given at spawn time
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the task (including its children) has stopped
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the task to finish on its own
    pub async fn join(mut self) -> TaskOutcome<T> {
        self.wait().await
    }

    /// Request cancellation and wait until the task has stopped
    pub async fn cancel(mut self) -> TaskOutcome<T> {
        debug!(task = %self.name, "Cancelling task");
        self.token.cancel();
        self.wait().await
    }

    /// Wait on the join handle without consuming the handle.
    ///
    /// Must not be called again after it has returned.
    pub(crate) async fn wait(&mut self) -> TaskOutcome<T> {
        match (&mut self.join).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => TaskOutcome::Cancelled,
            Err(e) => TaskOutcome::Failed(Error::internal_with_context(
                TASK_FAULT_CONTEXT,
                format!("task {} failed to join: {}", self.name, e),
            )),
        }
    }
}

impl<T> Drop for TaskHandle<T> {
    fn drop(&mut self) {
        if !self.join.is_finished() {
            trace!(task = %self.name, "Task handle dropped, cancelling");
            self.token.cancel();
        }
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.name)
            .field("finished", &self.join.is_finished())
            .finish()
    }
}
