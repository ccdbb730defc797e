//! The task runner: serial and concurrent execution models.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering, fence};
use std::thread;

use log::debug;

use crate::Result;
use crate::core::sync::{Condvar, Mutex};
use crate::error::TaskTreeError;

use super::task::{Callbacks, Cancel, CancelFn, ContextFn, TaskHandle};
use super::tree::{TaskId, TreeState};
use super::worker::{make_context, run_process_fn, worker_main};

/// Top of the task tree: the tree state behind the global mutex, the
/// signalling between foreground and workers, and the terminate flag.
pub(crate) struct Shared<B, O, X, A> {
    /// Any modification of the tree structure or task state is
    /// serialized through this mutex. A light-weight shell in
    /// single-threaded execution.
    pub(crate) tree: Mutex<TreeState<B, O, X, A>>,

    /// Signals sleeping workers that new tasks are available or that
    /// the runner is about to terminate.
    pub(crate) worker_wakeup: Condvar,

    /// Signals the foreground thread that some task may have been
    /// processed. No guarantee that it is the one whose output comes
    /// next.
    pub(crate) task_processed: Condvar,

    /// Set to end task processing: on error, cancellation, or simply
    /// when all work is done. Readable without the mutex.
    pub(crate) terminate: AtomicBool,

    pub(crate) context_constructor: Option<Arc<ContextFn<X>>>,

    pub(crate) threaded: bool,
}

impl<B, O, X, A> Shared<B, O, X, A> {
    /// Allocate a sub-task under `parent` and schedule it. `callbacks`
    /// of `None` shares the parent's callbacks object.
    pub(crate) fn add_task(
        &self,
        parent: TaskId,
        partial_output: Option<O>,
        callbacks: Option<Arc<Callbacks<B, O, X, A>>>,
        process_baton: B,
    ) -> Result<()> {
        let mut tree = self.tree.lock()?;

        let callbacks = callbacks.unwrap_or_else(|| Arc::clone(&tree.node(parent).callbacks));
        let id = tree.alloc(parent, callbacks, process_baton);

        // Partial output is only worth keeping when the parent can
        // still emit it.
        if partial_output.is_some() && tree.node(parent).callbacks.output.is_some() {
            tree.ensure_results(parent).has_partial_results = true;
            tree.ensure_results(id).prior_parent_output = partial_output;
        }

        tree.link_new_task(id);
        drop(tree);

        // Wake all waiting workers: there is work to do. If there is
        // not enough work for all of them, some will go back to sleep.
        if self.threaded {
            self.worker_wakeup.broadcast();
        }
        Ok(())
    }
}

/// Run a task tree to completion.
///
/// Constructs the root task from `callbacks` and `process_baton`, then
/// executes the growing tree with up to `thread_count` worker threads
/// (`thread_count <= 1` processes everything on the calling thread).
/// Output functions run on the calling thread in strict tree order,
/// accumulating into `output_baton`.
///
/// `context_constructor` runs once per worker thread (or once up front
/// in serial execution) and produces the thread context handed to every
/// process function on that thread. `cancel` is polled by the output
/// phase; worker threads are cancelled through the engine itself.
///
/// Exactly one task error is returned: the first one in tree order,
/// which is not necessarily the first one that occurred in time.
///
/// # Examples
///
/// ```rust
/// use tasktree::core::parallel::{Callbacks, run};
///
/// let callbacks = Callbacks::<u64, u64, (), u64>::new()
///     .with_process(|_task, _ctx, n, _cancel| Ok(Some(n * 2)))
///     .with_output(|_task, acc, n, _cancel| {
///         *acc += n;
///         Ok(())
///     });
///
/// let mut total = 0;
/// run(1, callbacks, 21, &mut total, None, None).unwrap();
/// assert_eq!(total, 42);
/// ```
pub fn run<B, O, X, A>(
    thread_count: usize,
    callbacks: Callbacks<B, O, X, A>,
    process_baton: B,
    output_baton: &mut A,
    context_constructor: Option<Arc<ContextFn<X>>>,
    cancel: Option<Arc<CancelFn>>,
) -> Result<()>
where
    B: Send,
    O: Send,
    X: Default,
{
    // Multi-threading comes with significant overheads; keep it off
    // unless actually requested.
    let threaded = thread_count > 1;

    let tree = TreeState::new(Arc::new(callbacks), process_baton);
    let shared = Shared {
        tree: Mutex::new(threaded, false, tree),
        worker_wakeup: Condvar::new(),
        task_processed: Condvar::new(),
        terminate: AtomicBool::new(false),
        context_constructor,
        threaded,
    };

    let cancel = cancel.as_deref();
    if threaded {
        execute_concurrently(&shared, thread_count, output_baton, cancel)
    } else {
        execute_serially(&shared, output_baton, cancel)
    }
}

/// Output task results in tree order until a task that has not been
/// processed yet is encountered, which becomes the new `*current`.
///
/// A task's retained output is emitted once its sub-tasks are gone;
/// output produced before or in between sub-tasks travels with the
/// respective sub-task as prior parent output and is emitted when
/// descending into it.
fn output_processed<B, O, X, A>(
    shared: &Shared<B, O, X, A>,
    current: &mut Option<TaskId>,
    output_baton: &mut A,
    cancel: Option<&CancelFn>,
) -> Result<()> {
    let cancel = Cancel::for_user(cancel);

    loop {
        let Some(cur) = *current else { break };

        let mut tree = shared.tree.lock()?;
        if !tree.is_processed(cur) {
            break;
        }

        // The workers commit all task state under the mutex before the
        // processed flag. Keep the reads below from being reordered
        // ahead of that observation.
        fence(Ordering::Acquire);

        if let Some(child) = tree.node(cur).first_sub {
            // Descend. The sub-task itself is handled in the next
            // iteration, but output produced before it was created
            // goes through the current task's output function first.
            let prior = tree
                .node_mut(child)
                .results
                .as_mut()
                .and_then(|results| results.prior_parent_output.take());
            let callbacks = Arc::clone(&tree.node(cur).callbacks);
            drop(tree);

            if let Some(value) = prior {
                if let Some(output_fn) = &callbacks.output {
                    let handle = TaskHandle { shared, id: cur };
                    output_fn(&handle, output_baton, value, &cancel)?;
                }
            }
            *current = Some(child);
        } else {
            // No deeper sub-task: handle the results of the current
            // task itself. Detach errors before returning them so the
            // tree teardown cannot touch them again.
            let error = tree
                .node_mut(cur)
                .results
                .as_mut()
                .and_then(|results| results.error.take());
            if let Some(error) = error {
                return Err(error);
            }

            let output = tree
                .node_mut(cur)
                .results
                .as_mut()
                .and_then(|results| results.output.take());
            let callbacks = Arc::clone(&tree.node(cur).callbacks);
            drop(tree);

            if let Some(value) = output {
                if let Some(output_fn) = &callbacks.output {
                    let handle = TaskHandle { shared, id: cur };
                    output_fn(&handle, output_baton, value, &cancel)?;
                }
            }

            // The output function may have added further sub-tasks;
            // those are handled in the next iteration. Otherwise the
            // task is complete: unlink it and continue at the parent,
            // whose next sub-task is visited in the next iteration.
            let mut tree = shared.tree.lock()?;
            if tree.node(cur).first_sub.is_none() {
                let parent = tree.node(cur).parent;
                tree.remove_task(cur);
                *current = parent;
            }
        }
    }

    Ok(())
}

/// Process one task at a time on the calling thread, interleaving the
/// output phase.
fn execute_serially<B, O, X, A>(
    shared: &Shared<B, O, X, A>,
    output_baton: &mut A,
    cancel: Option<&CancelFn>,
) -> Result<()>
where
    X: Default,
{
    let mut context = make_context(&shared.context_constructor)?;
    let process_cancel = Cancel::for_user(cancel);

    let root = shared.tree.lock()?.root;
    let mut current = Some(root);
    let mut task_err = None;

    // `current` is always the first unprocessed task in tree order.
    while let Some(cur) = current {
        let mut tree = shared.tree.lock()?;
        tree.unready_task(cur);
        let (baton, callbacks) = tree.take_for_processing(cur);
        drop(tree);

        // "Would-be background" processing of the current task.
        let outcome = run_process_fn(shared, cur, baton, &callbacks, &mut context, &process_cancel);

        let mut tree = shared.tree.lock()?;
        tree.record_outcome(cur, outcome);
        tree.set_processed(cur);
        drop(tree);

        // Output results in the "foreground" and move on to the next
        // task needing processing.
        if let Err(e) = output_processed(shared, &mut current, output_baton, cancel) {
            task_err = Some(e);
            break;
        }
    }

    // Release the remaining task errors; only the first one in tree
    // order gets reported.
    let mut tree = shared.tree.lock()?;
    tree.clear_errors(root);
    drop(tree);

    match task_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Process tasks with a pool of lazily spawned worker threads while the
/// calling thread drains outputs.
fn execute_concurrently<B, O, X, A>(
    shared: &Shared<B, O, X, A>,
    thread_count: usize,
    output_baton: &mut A,
    cancel: Option<&CancelFn>,
) -> Result<()>
where
    B: Send,
    O: Send,
    X: Default,
{
    let root = shared.tree.lock()?.root;

    let (task_result, join_errors) = thread::scope(|scope| {
        let mut workers: Vec<thread::ScopedJoinHandle<'_, Result<()>>> = Vec::new();

        let task_result = foreground_loop(
            shared,
            scope,
            &mut workers,
            thread_count,
            root,
            output_baton,
            cancel,
        );

        // Tell all worker threads to terminate. They do not stop by
        // themselves when the work runs out.
        shared.terminate.store(true, Ordering::SeqCst);
        shared.worker_wakeup.broadcast();

        let mut join_errors: Vec<TaskTreeError> = Vec::new();
        for worker in workers {
            match worker.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!("scheduler: worker thread returned error: {}", e);
                    join_errors.push(e);
                }
                Err(_) => {
                    join_errors.push(TaskTreeError::thread_join("worker thread panicked"));
                }
            }
        }

        (task_result, join_errors)
    });

    // Release the remaining task errors. Skip that if a worker went
    // down abnormally; its tasks are in an unknown state and the join
    // failures are about to be reported anyway.
    if join_errors.is_empty() {
        let mut tree = shared.tree.lock()?;
        tree.clear_errors(root);
    }

    // Compose the join failures into the returned error instead of
    // dropping them; the task error takes precedence when both occur.
    match task_result {
        Err(task_err) => Err(TaskTreeError::compose(task_err, join_errors)),
        Ok(()) => {
            let mut join_errors = join_errors.into_iter();
            match join_errors.next() {
                None => Ok(()),
                Some(first) => Err(TaskTreeError::compose(first, join_errors.collect())),
            }
        }
    }
}

// The foreground side of concurrent execution: wait for the current
// task to be processed - spawning workers lazily while waiting - then
// drain outputs in tree order.
fn foreground_loop<'env, 'scope, B, O, X, A>(
    shared: &'env Shared<B, O, X, A>,
    scope: &'scope thread::Scope<'scope, 'env>,
    workers: &mut Vec<thread::ScopedJoinHandle<'scope, Result<()>>>,
    thread_count: usize,
    root: TaskId,
    output_baton: &mut A,
    cancel: Option<&CancelFn>,
) -> Result<()>
where
    B: Send,
    O: Send,
    X: Default,
{
    let mut current = Some(root);

    while let Some(cur) = current {
        let mut tree = shared.tree.lock()?;
        while !tree.is_processed(cur) {
            // There is at least one waiting task, so another worker
            // may help - spawn them as the need shows up rather than
            // all up front.
            if workers.len() < thread_count {
                debug!("scheduler: spawning worker thread {}", workers.len());
                workers.push(scope.spawn(move || worker_main(shared)));
            }

            // Efficiently wait for tasks to (maybe) be completed.
            tree = shared.task_processed.wait(tree)?;
        }
        drop(tree);

        output_processed(shared, &mut current, output_baton, cancel)?;
    }

    Ok(())
}
