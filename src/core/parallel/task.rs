//! Task definitions and the handle callbacks use to grow the tree.
//!
//! A task is a unit of work, basically a glorified function call. It
//! consists of a *process* function that may run on a worker thread and
//! produce an output value, and an *output* function that runs on the
//! foreground thread in strict tree order. Either function may add
//! further sub-tasks through the [`TaskHandle`] it receives.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::Result;
use crate::error::TaskTreeError;

use super::scheduler::Shared;
use super::tree::TaskId;

/// Process function: performs the bulk of a task's work.
///
/// Receives the task handle (for adding sub-tasks), the worker's thread
/// context, the task's process baton by value, and a cancellation
/// check. Returning `Ok(None)` skips the output phase for this task and
/// releases its results immediately.
pub type ProcessFn<B, O, X, A> = dyn Fn(&TaskHandle<'_, B, O, X, A>, &mut X, B, &Cancel<'_>) -> Result<Option<O>>
    + Send
    + Sync;

/// Output function: consumes a task's output on the foreground thread,
/// in strict tree order, accumulating into the output baton. May add
/// further sub-tasks through the handle.
pub type OutputFn<B, O, X, A> = dyn Fn(&TaskHandle<'_, B, O, X, A>, &mut A, O, &Cancel<'_>) -> Result<()> + Send + Sync;

/// Thread context constructor, run once per worker thread.
pub type ContextFn<X> = dyn Fn() -> Result<X> + Send + Sync;

/// Caller-supplied cancellation function. Returning an error aborts the
/// run; [`TaskTreeError::Cancelled`] is the conventional choice.
pub type CancelFn = dyn Fn() -> Result<()>;

/// Cancellation check handed to task callbacks.
///
/// Worker threads check the engine's terminate flag, so that an error
/// or cancellation observed by the foreground thread stops outstanding
/// work as soon as possible. The foreground thread polls the
/// caller-supplied cancel function instead.
pub struct Cancel<'a> {
    user: Option<&'a CancelFn>,
    terminate: Option<&'a AtomicBool>,
}

impl<'a> Cancel<'a> {
    pub(crate) fn for_user(user: Option<&'a CancelFn>) -> Self {
        Self {
            user,
            terminate: None,
        }
    }

    pub(crate) fn for_terminate(terminate: &'a AtomicBool) -> Self {
        Self {
            user: None,
            terminate: Some(terminate),
        }
    }

    /// Return [`TaskTreeError::Cancelled`] when the run is being torn
    /// down, or whatever the caller-supplied cancel function reports.
    pub fn check(&self) -> Result<()> {
        if let Some(terminate) = self.terminate {
            if terminate.load(Ordering::Acquire) {
                return Err(TaskTreeError::Cancelled);
            }
        }
        if let Some(user) = self.user {
            user()?;
        }
        Ok(())
    }
}

/// A task's callback pair.
///
/// Kept separate from the task itself so that it can be shared between
/// a task and its "similar" sub-tasks, the common case for recursion.
/// `B` is the process baton type, `O` the output type, `X` the thread
/// context type, and `A` the output accumulator type.
pub struct Callbacks<B, O, X, A> {
    pub(crate) process: Option<Arc<ProcessFn<B, O, X, A>>>,
    pub(crate) output: Option<Arc<OutputFn<B, O, X, A>>>,
}

impl<B, O, X, A> Callbacks<B, O, X, A> {
    /// Callbacks with no process and no output function. Legal but
    /// pointless on its own; useful as a starting point.
    pub fn new() -> Self {
        Self {
            process: None,
            output: None,
        }
    }

    /// Set the process function.
    pub fn with_process<F>(mut self, process: F) -> Self
    where
        F: Fn(&TaskHandle<'_, B, O, X, A>, &mut X, B, &Cancel<'_>) -> Result<Option<O>>
            + Send
            + Sync
            + 'static,
    {
        self.process = Some(Arc::new(process));
        self
    }

    /// Set the output function.
    pub fn with_output<F>(mut self, output: F) -> Self
    where
        F: Fn(&TaskHandle<'_, B, O, X, A>, &mut A, O, &Cancel<'_>) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.output = Some(Arc::new(output));
        self
    }
}

impl<B, O, X, A> Default for Callbacks<B, O, X, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B, O, X, A> Clone for Callbacks<B, O, X, A> {
    fn clone(&self) -> Self {
        Self {
            process: self.process.clone(),
            output: self.output.clone(),
        }
    }
}

/// Handle to the task currently being processed or output.
///
/// Passed into the task callbacks; its only purpose is to append
/// sub-tasks to the current task.
pub struct TaskHandle<'a, B, O, X, A> {
    pub(crate) shared: &'a Shared<B, O, X, A>,
    pub(crate) id: TaskId,
}

impl<B, O, X, A> TaskHandle<'_, B, O, X, A> {
    /// Append a sub-task with its own callbacks.
    ///
    /// `partial_output` is the output the current task produced since
    /// adding the previous sub-task (or leading up to the first one).
    /// It is emitted through the *current* task's output function just
    /// before the new sub-task's own output. Pass `None` when there is
    /// nothing to flush.
    pub fn add(
        &self,
        partial_output: Option<O>,
        callbacks: Callbacks<B, O, X, A>,
        process_baton: B,
    ) -> Result<()> {
        self.shared
            .add_task(self.id, partial_output, Some(Arc::new(callbacks)), process_baton)
    }

    /// Append a sub-task sharing the current task's callbacks. This is
    /// the simplified variant of [`TaskHandle::add`] for recursive
    /// tasks.
    pub fn add_similar(&self, partial_output: Option<O>, process_baton: B) -> Result<()> {
        self.shared
            .add_task(self.id, partial_output, None, process_baton)
    }
}
