//! Background worker: pick, process, pick again.
use std::sync::Arc;
use std::sync::atomic::Ordering;

use log::debug;

use crate::Result;

use super::scheduler::Shared;
use super::task::{Callbacks, Cancel, ContextFn, TaskHandle};
use super::tree::TaskId;

/// Construct a thread context, falling back to the default value when
/// the caller did not supply a constructor.
pub(crate) fn make_context<X>(constructor: &Option<Arc<ContextFn<X>>>) -> Result<X>
where
    X: Default,
{
    match constructor {
        Some(f) => f(),
        None => Ok(X::default()),
    }
}

/// Run a task's process function, if it has one. The returned value is
/// the user outcome to be recorded; `None` means there was nothing to
/// run.
pub(crate) fn run_process_fn<B, O, X, A>(
    shared: &Shared<B, O, X, A>,
    id: TaskId,
    baton: Option<B>,
    callbacks: &Callbacks<B, O, X, A>,
    context: &mut X,
    cancel: &Cancel<'_>,
) -> Option<Result<Option<O>>> {
    let process = callbacks.process.as_ref()?;
    let baton = baton?;
    let handle = TaskHandle { shared, id };
    Some(process(&handle, context, baton, cancel))
}

// Everything a worker needs to process one task without the tree
// mutex.
type Picked<B, O, X, A> = (TaskId, Option<B>, Arc<Callbacks<B, O, X, A>>);

// Find the first task needing processing in tree order, mark it as
// picked, and take its baton. Sleeps until a task is available or
// termination is signalled, in which case `None` is returned.
//
// If the foreground thread is waiting on a task, this implicitly picks
// that one first: by default, workers start on the tasks that are
// immediately useful for the output phase. Contention detection later
// bounces most of them off to other subtrees.
fn next_task<B, O, X, A>(shared: &Shared<B, O, X, A>) -> Result<Option<Picked<B, O, X, A>>> {
    let mut tree = shared.tree.lock()?;
    loop {
        // Spurious wakeups are handled implicitly: check the
        // conditions and go back to sleep.
        if shared.terminate.load(Ordering::Acquire) {
            return Ok(None);
        }

        let root = tree.root;
        if let Some(ready) = tree.node(root).first_ready {
            tree.unready_task(ready);
            let (baton, callbacks) = tree.take_for_processing(ready);
            return Ok(Some((ready, baton, callbacks)));
        }

        // No task, no termination. Wait for either to happen.
        tree = shared.worker_wakeup.wait(tree)?;
    }
}

/// Worker thread body: process tasks until termination is signalled.
pub(crate) fn worker_main<B, O, X, A>(shared: &Shared<B, O, X, A>) -> Result<()>
where
    X: Default,
{
    let mut context = make_context(&shared.context_constructor)?;
    let cancel = Cancel::for_terminate(&shared.terminate);

    let mut picked: Option<Picked<B, O, X, A>> = None;

    while !shared.terminate.load(Ordering::Acquire) {
        let (id, baton, callbacks) = match picked.take() {
            Some(p) => p,
            None => {
                // We did not pick a suitable task to continue with.
                // Make sure the foreground thread is not sleeping - a
                // large subtree may have been processed without it
                // hearing anything - then queue up for new work.
                shared.task_processed.signal();

                match next_task(shared)? {
                    Some(p) => p,
                    // Woken up with nothing to do: termination.
                    None => break,
                }
            }
        };

        let outcome = run_process_fn(shared, id, baton, &callbacks, &mut context, &cancel);

        // Record the results and atomically pick the next task to keep
        // this worker inside its warm subtree when possible.
        let mut tree = shared.tree.lock()?;
        tree.record_outcome(id, outcome);
        picked = tree.set_processed_and_pick(id).map(|next| {
            let (baton, callbacks) = tree.take_for_processing(next);
            (next, baton, callbacks)
        });
        drop(tree);
    }

    debug!("worker: terminating");
    Ok(())
}
