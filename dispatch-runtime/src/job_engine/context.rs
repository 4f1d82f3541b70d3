// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! The dispatcher a thread is currently running, and the operations that act on it.
//!
//! A thread has a context only while it executes a dispatcher loop. The context is installed on
//! loop entry and removed on loop exit (also when a job panics). The run queues live in here, so
//! only the owning thread can ever reach them.

use std::cell::RefCell;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::job_engine::dispatch_pool::DispatchPool;
use crate::job_engine::dispatcher::{Dispatcher, RunQueues};
use crate::job_engine::handle::DispatcherHandle;
use crate::job_engine::job::{Job, TaskPriority};

struct LoopContext {
    /// The dispatcher whose loop runs on this thread.
    queue: Arc<Dispatcher>,
    /// The pool of a worker. Weak, so dropping the last pool handle still stops the workers.
    pool: Option<Weak<DispatchPool>>,
    queues: RunQueues,
}

thread_local! {
    static CONTEXT: RefCell<Option<LoopContext>> = const { RefCell::new(None) };
}

/// Removes the context when the loop ends.
pub(crate) struct ContextGuard {
    _private: (),
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        // Queued jobs are dropped outside of the borrow, their captures may touch the context.
        let leftover = CONTEXT.with(|ctx| ctx.borrow_mut().take());
        drop(leftover);
    }
}

pub(crate) fn is_inside_loop() -> bool {
    CONTEXT.with(|ctx| ctx.borrow().is_some())
}

#[track_caller]
pub(crate) fn enter(queue: Arc<Dispatcher>) -> ContextGuard {
    CONTEXT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        if let Some(current) = ctx.as_ref() {
            panic!(
                "cannot enter dispatcher {:?}: this thread already runs dispatcher {:?}",
                queue.name(),
                current.queue.name()
            );
        }
        *ctx = Some(LoopContext {
            pool: queue.pool_weak(),
            queue,
            queues: RunQueues::default(),
        });
    });
    ContextGuard { _private: () }
}

/// Runs `f` on the run queues of `dispatcher`, if this thread is running its loop.
pub(crate) fn with_own_queues<R>(
    dispatcher: &Dispatcher,
    f: impl FnOnce(&mut RunQueues) -> R,
) -> Option<R> {
    CONTEXT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        match ctx.as_mut() {
            Some(current) if std::ptr::eq(Arc::as_ptr(&current.queue), dispatcher) => {
                Some(f(&mut current.queues))
            }
            _ => None,
        }
    })
}

/// Same-thread fast path. Hands the job back if this thread is not running `dispatcher`.
pub(crate) fn push_local(dispatcher: &Dispatcher, job: Job) -> Result<(), Job> {
    CONTEXT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        match ctx.as_mut() {
            Some(current) if std::ptr::eq(Arc::as_ptr(&current.queue), dispatcher) => {
                current.queues.push(job);
                Ok(())
            }
            _ => Err(job),
        }
    })
}

/// The dispatcher whose loop runs on this thread (a pool worker, not the pool).
pub fn current_queue() -> Option<Arc<Dispatcher>> {
    CONTEXT.with(|ctx| ctx.borrow().as_ref().map(|current| current.queue.clone()))
}

// The pool is upgraded outside of the borrow. Its last handle may drop here, and dropping a
// pool posts stop requests to its workers.
fn current_queue_and_pool() -> Option<(Arc<Dispatcher>, Option<Weak<DispatchPool>>)> {
    CONTEXT.with(|ctx| {
        ctx.borrow()
            .as_ref()
            .map(|current| (current.queue.clone(), current.pool.clone()))
    })
}

/// The logical dispatcher of this thread: the pool for pool workers, otherwise the dispatcher
/// itself. A worker whose pool is gone is its own logical dispatcher.
pub fn current_dispatcher() -> Option<DispatcherHandle> {
    let (queue, pool) = current_queue_and_pool()?;
    match pool.and_then(|pool| pool.upgrade()) {
        Some(pool) => Some(DispatcherHandle::Pool(pool)),
        None => Some(DispatcherHandle::Single(queue)),
    }
}

/// True if the calling thread runs the dispatcher named `name`, or a worker of the pool named
/// `name`.
pub fn on_dispatcher(name: &str) -> bool {
    match current_dispatcher() {
        Some(logical) => {
            logical.name() == name || current_queue().is_some_and(|queue| queue.name() == name)
        }
        None => false,
    }
}

#[track_caller]
fn expect_current_queue() -> Arc<Dispatcher> {
    match current_queue() {
        Some(queue) => queue,
        None => panic!("not running on a dispatcher thread"),
    }
}

#[track_caller]
fn expect_current_dispatcher() -> DispatcherHandle {
    match current_dispatcher() {
        Some(dispatcher) => dispatcher,
        None => panic!("not running on a dispatcher thread"),
    }
}

/// Posts to the current logical dispatcher.
///
/// # Panics
/// If the calling thread is not running a dispatcher.
#[track_caller]
pub fn post_task(task: impl FnOnce() + Send + 'static) {
    expect_current_dispatcher().post_task(task);
}

/// # Panics
/// If the calling thread is not running a dispatcher.
#[track_caller]
pub fn post_task_with_priority(task: impl FnOnce() + Send + 'static, priority: TaskPriority) {
    expect_current_dispatcher().post_task_with_priority(task, priority);
}

/// # Panics
/// If the calling thread is not running a dispatcher.
#[track_caller]
pub fn post_delayed_task(task: impl FnOnce() + Send + 'static, delay: Duration) {
    expect_current_dispatcher().post_delayed_task(task, delay);
}

/// Posts to the dispatcher running on this thread, bypassing pool routing.
///
/// # Panics
/// If the calling thread is not running a dispatcher.
#[track_caller]
pub fn post_task_to_current_queue(task: impl FnOnce() + Send + 'static) {
    expect_current_queue().post_task(task);
}

/// Sets keep-alive of the dispatcher running on this thread. With `false` it exits as soon as
/// its queues drain, provided it ran at least one task.
///
/// # Panics
/// If the calling thread is not running a dispatcher.
#[track_caller]
pub fn keep_alive(keep_alive: bool) {
    expect_current_queue().set_keep_alive(keep_alive);
}

/// Requests termination of the dispatcher running on this thread.
///
/// # Panics
/// If the calling thread is not running a dispatcher.
#[track_caller]
pub fn end() {
    expect_current_queue().stop();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_thread_has_no_context() {
        assert!(!is_inside_loop());
        assert!(current_queue().is_none());
        assert!(current_dispatcher().is_none());
        assert!(!on_dispatcher("primary"));
    }

    #[test]
    #[should_panic(expected = "not running on a dispatcher thread")]
    fn test_end_outside_of_dispatcher_panics() {
        end();
    }

    #[test]
    #[should_panic(expected = "not running on a dispatcher thread")]
    fn test_post_outside_of_dispatcher_panics() {
        post_task(|| {});
    }
}
