//! The task tree and the pointer maintenance that drives scheduling.
//!
//! Tasks live in a slab owned by the tree; all links between them are
//! slab indices. The tree tracks two optimization pointers per task:
//! `first_ready` leads to the next task needing processing in tree
//! order, `first_unprocessed` helps workers escape to distant subtrees
//! when they contend.
use std::sync::Arc;

use crate::error::TaskTreeError;

use super::task::Callbacks;

/// Index of a task in the tree's slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TaskId(usize);

/// Processing results of a task.
pub(crate) struct Results<O> {
    /// (Last part of the) output produced by the task, if any.
    pub(crate) output: Option<O>,
    /// Error returned by the process function.
    pub(crate) error: Option<TaskTreeError>,
    /// Parent task's output produced before this task was created; to
    /// be emitted through the parent's output function first.
    pub(crate) prior_parent_output: Option<O>,
    /// Whether parts of this task's output are attached to sub-tasks.
    /// The results must then outlive all sub-task outputs.
    pub(crate) has_partial_results: bool,
}

impl<O> Default for Results<O> {
    fn default() -> Self {
        Self {
            output: None,
            error: None,
            prior_parent_output: None,
            has_partial_results: false,
        }
    }
}

/// A node in the task tree.
pub(crate) struct TaskNode<B, O, X, A> {
    pub(crate) parent: Option<TaskId>,
    pub(crate) first_sub: Option<TaskId>,
    pub(crate) last_sub: Option<TaskId>,
    pub(crate) next: Option<TaskId>,

    /// Number of siblings created before this one. Not adjusted when
    /// prior siblings are removed, so it always orders siblings.
    pub(crate) sub_task_idx: usize,

    /// First task in this subtree, in tree order, whose processing has
    /// not started. `Some(self)` means this task itself waits and has
    /// no sub-tasks; `None` means everything here at least started.
    pub(crate) first_ready: Option<TaskId>,

    /// First immediate sub-task that has not finished processing.
    pub(crate) first_unprocessed: Option<TaskId>,

    pub(crate) callbacks: Arc<Callbacks<B, O, X, A>>,

    /// Process baton, taken when processing starts.
    pub(crate) baton: Option<B>,

    /// Set until the process function has been marked complete;
    /// sub-tasks may still be pending.
    pub(crate) process_alive: bool,

    /// Allocated on demand, just before the process function runs or
    /// when partial output is attached.
    pub(crate) results: Option<Box<Results<O>>>,
}

pub(crate) struct TreeState<B, O, X, A> {
    nodes: Vec<TaskNode<B, O, X, A>>,
    pub(crate) root: TaskId,
}

impl<B, O, X, A> TreeState<B, O, X, A> {
    /// Create the tree with its root task, ready for processing.
    pub(crate) fn new(callbacks: Arc<Callbacks<B, O, X, A>>, process_baton: B) -> Self {
        let root = TaskId(0);
        let mut node = TaskNode {
            parent: None,
            first_sub: None,
            last_sub: None,
            next: None,
            sub_task_idx: 0,
            first_ready: None,
            first_unprocessed: None,
            callbacks,
            baton: Some(process_baton),
            process_alive: true,
            results: None,
        };
        node.first_ready = Some(root);
        Self {
            nodes: vec![node],
            root,
        }
    }

    pub(crate) fn node(&self, id: TaskId) -> &TaskNode<B, O, X, A> {
        &self.nodes[id.0]
    }

    pub(crate) fn node_mut(&mut self, id: TaskId) -> &mut TaskNode<B, O, X, A> {
        &mut self.nodes[id.0]
    }

    /// Allocate a new unlinked task under `parent`.
    pub(crate) fn alloc(
        &mut self,
        parent: TaskId,
        callbacks: Arc<Callbacks<B, O, X, A>>,
        process_baton: B,
    ) -> TaskId {
        let id = TaskId(self.nodes.len());
        self.nodes.push(TaskNode {
            parent: Some(parent),
            first_sub: None,
            last_sub: None,
            next: None,
            sub_task_idx: 0,
            // Ready for execution as soon as it is linked up.
            first_ready: Some(id),
            first_unprocessed: None,
            callbacks,
            baton: Some(process_baton),
            process_alive: true,
            results: None,
        });
        id
    }

    pub(crate) fn ensure_results(&mut self, id: TaskId) -> &mut Results<O> {
        let node = self.node_mut(id);
        node.results.get_or_insert_with(Box::default)
    }

    // The index of the immediate sub-task of `task` through which
    // `task.first_ready` is reachable. `task` must have a ready task in
    // a proper subtree.
    fn first_ready_sub_task_idx(&self, task: TaskId) -> usize {
        let mut sub_task = match self.node(task).first_ready {
            Some(t) => t,
            None => unreachable!("caller checked for a ready sub-task"),
        };
        debug_assert_ne!(sub_task, task);

        while self.node(sub_task).parent != Some(task) {
            sub_task = match self.node(sub_task).parent {
                Some(p) => p,
                None => unreachable!("first_ready always stays within the subtree"),
            };
        }

        self.node(sub_task).sub_task_idx
    }

    /// Link `task` up with its parent and propagate readiness.
    pub(crate) fn link_new_task(&mut self, task: TaskId) {
        let parent = match self.node(task).parent {
            Some(p) => p,
            None => unreachable!("the root has its own construction path"),
        };

        // Insert into the parent's sub-task list.
        if let Some(last) = self.node(parent).last_sub {
            self.node_mut(last).next = Some(task);
            self.node_mut(task).sub_task_idx = self.node(last).sub_task_idx + 1;
        }
        self.node_mut(parent).last_sub = Some(task);
        if self.node(parent).first_sub.is_none() {
            self.node_mut(parent).first_sub = Some(task);
        }

        // The new task may be the first ready one in tree order. Update
        // parents until one already has a "first ready" in a subtree
        // before the one containing this task.
        let mut current = task;
        let mut ancestor = Some(parent);
        while let Some(a) = ancestor {
            let supersede = match self.node(a).first_ready {
                None => true,
                Some(_) => {
                    self.first_ready_sub_task_idx(a) >= self.node(current).sub_task_idx
                }
            };
            if !supersede {
                break;
            }
            self.node_mut(a).first_ready = Some(task);
            current = a;
            ancestor = self.node(a).parent;
        }

        if self.node(parent).first_unprocessed.is_none() {
            self.node_mut(parent).first_unprocessed = Some(task);
        }

        // New-task invariants, checked while the tree mutex is still
        // held; background processing may start right after.
        debug_assert!(self.node(task).first_sub.is_none());
        debug_assert!(self.node(task).last_sub.is_none());
        debug_assert!(self.node(task).next.is_none());
        debug_assert_eq!(self.node(task).first_ready, Some(task));
        debug_assert!(self.node(task).first_unprocessed.is_none());
        debug_assert!(self.node(task).baton.is_some());
    }

    // First task in the sibling chain from `from` with *some* ready
    // task in its subtree.
    fn next_ready(&self, mut from: Option<TaskId>) -> Option<TaskId> {
        while let Some(t) = from {
            if self.node(t).first_ready.is_some() {
                return Some(t);
            }
            from = self.node(t).next;
        }
        None
    }

    // First task in the sibling chain from `from` that is itself
    // unprocessed.
    fn next_unprocessed(&self, mut from: Option<TaskId>) -> Option<TaskId> {
        while let Some(t) = from {
            if self.node(t).first_ready == Some(t) {
                return Some(t);
            }
            from = self.node(t).next;
        }
        None
    }

    /// Mark `task` as no longer waiting for processing and update the
    /// readiness pointers up the ancestry.
    pub(crate) fn unready_task(&mut self, task: TaskId) {
        // Processing must not have started, and sub-tasks can only be
        // added by processing the task itself.
        debug_assert_eq!(self.node(task).first_ready, Some(task));
        debug_assert!(self.node(task).first_sub.is_none());

        self.node_mut(task).first_ready = None;

        // Bubble up while `task` was the first ready one, replacing it
        // with the next ready task. A suitable one cannot be before the
        // current path, or the ancestor would not have pointed at
        // `task`.
        let mut replacement: Option<TaskId> = None;
        let mut current = task;
        let mut ancestor = self.node(task).parent;
        while let Some(a) = ancestor {
            if self.node(a).first_ready != Some(task) {
                break;
            }
            if replacement.is_none() {
                replacement = self
                    .next_ready(self.node(current).next)
                    .and_then(|t| self.node(t).first_ready);
            }
            self.node_mut(a).first_ready = replacement;
            current = a;
            ancestor = self.node(a).parent;
        }

        // No bubble-up for this one; it only links parent to immediate
        // sub-task.
        if let Some(parent) = self.node(task).parent {
            if self.node(parent).first_unprocessed == Some(task) {
                let next = self.next_unprocessed(self.node(task).next);
                self.node_mut(parent).first_unprocessed = next;
            }
        }
    }

    /// Take what a worker needs to process `task`: the process baton
    /// and the callbacks.
    pub(crate) fn take_for_processing(
        &mut self,
        task: TaskId,
    ) -> (Option<B>, Arc<Callbacks<B, O, X, A>>) {
        let node = self.node_mut(task);
        (node.baton.take(), Arc::clone(&node.callbacks))
    }

    pub(crate) fn set_processed(&mut self, task: TaskId) {
        self.node_mut(task).process_alive = false;
    }

    pub(crate) fn is_processed(&self, task: TaskId) -> bool {
        !self.node(task).process_alive
    }

    /// Store the outcome of a task's process function. `None` means
    /// there was no process function to run.
    pub(crate) fn record_outcome(
        &mut self,
        task: TaskId,
        outcome: Option<Result<Option<O>, TaskTreeError>>,
    ) {
        if let Some(outcome) = outcome {
            match outcome {
                Ok(output) => {
                    // Without an output function the results would
                    // never be consumed; drop them right away.
                    if output.is_some() && self.node(task).callbacks.output.is_some() {
                        self.ensure_results(task).output = output;
                    }
                }
                Err(error) => {
                    self.ensure_results(task).error = Some(error);
                }
            }
        }

        // Nothing left to report? Release the results immediately; the
        // output phase can then skip this task quickly.
        if let Some(results) = &self.node(task).results {
            if results.error.is_none()
                && results.output.is_none()
                && results.prior_parent_output.is_none()
                && !results.has_partial_results
            {
                self.node_mut(task).results = None;
            }
        }
    }

    // Signs that another worker is active in `task`'s subtree or on its
    // next sibling. Detection does not need to be perfect; it is just a
    // hint to the scheduling strategy.
    fn is_contended(&self, task: TaskId) -> bool {
        // Right after processing `task`, its first sub-task should be
        // the next ready one. If the pointers differ, some other worker
        // already picked a sub-task up.
        let node = self.node(task);
        if node.first_sub != node.first_ready {
            return true;
        }

        // A completed subtree would let us continue with the next
        // sibling; if that one is already being processed, we would
        // step on somebody else's toes.
        if node.first_ready.is_none() {
            if let Some(next) = node.next {
                if self.node(next).first_ready == Some(next) {
                    return true;
                }
            }
        }

        false
    }

    /// Mark `task` as processed and pick the next task for the same
    /// worker, marking it as picked. Returns `None` when no good
    /// candidate exists.
    ///
    /// Locality is the point: in tree order, process functions benefit
    /// from parent context their predecessors warmed up. When another
    /// worker interferes, escape instead to the most distant
    /// unprocessed task up the ancestry. That walk only inspects
    /// immediate children of ancestors, so an unprocessed "cousin"
    /// subtree can be missed and processing may briefly serialize; the
    /// trade-off is deliberate.
    pub(crate) fn set_processed_and_pick(&mut self, task: TaskId) -> Option<TaskId> {
        self.set_processed(task);

        let picked = if self.is_contended(task) {
            let mut t = task;
            while let Some(parent) = self.node(t).parent {
                if self.node(parent).first_unprocessed.is_some() {
                    t = parent;
                } else {
                    break;
                }
            }
            self.node(t).first_unprocessed
        } else {
            let mut t = task;
            while self.node(t).first_ready.is_none() {
                match self.node(t).parent {
                    Some(parent) => t = parent,
                    None => break,
                }
            }
            self.node(t).first_ready
        };

        // Marking the pick must be atomic with the pick itself; the
        // caller holds the tree mutex across both.
        if let Some(next) = picked {
            self.unready_task(next);
        }
        picked
    }

    /// Unlink a fully output task from its parent and drop its results.
    pub(crate) fn remove_task(&mut self, task: TaskId) {
        debug_assert!(self.node(task).first_ready.is_none());
        debug_assert!(self.node(task).first_sub.is_none());

        if let Some(parent) = self.node(task).parent {
            if self.node(parent).first_sub == Some(task) {
                let next = self.node(task).next;
                self.node_mut(parent).first_sub = next;
            }
            if self.node(parent).last_sub == Some(task) {
                self.node_mut(parent).last_sub = None;
            }
        }

        self.node_mut(task).results = None;
    }

    /// Recursively drop all stored errors in `task`'s subtree.
    pub(crate) fn clear_errors(&mut self, task: TaskId) {
        let mut sub_task = self.node(task).first_sub;
        while let Some(sub) = sub_task {
            self.clear_errors(sub);
            sub_task = self.node(sub).next;
        }

        if let Some(results) = &mut self.node_mut(task).results {
            results.error = None;
        }
    }
}
