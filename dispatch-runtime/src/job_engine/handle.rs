// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::sync::Arc;
use std::time::Duration;

use crate::job_engine::dispatch_pool::DispatchPool;
use crate::job_engine::dispatcher::{Dispatcher, DispatcherId};
use crate::job_engine::error::DispatchError;
use crate::job_engine::job::TaskPriority;

/// Anything jobs can be posted to: a single dispatcher or a pool of them.
#[derive(Debug, Clone)]
pub enum DispatcherHandle {
    Single(Arc<Dispatcher>),
    Pool(Arc<DispatchPool>),
}

impl DispatcherHandle {
    pub fn id(&self) -> DispatcherId {
        match self {
            DispatcherHandle::Single(dispatcher) => dispatcher.id(),
            DispatcherHandle::Pool(pool) => pool.id(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            DispatcherHandle::Single(dispatcher) => dispatcher.name(),
            DispatcherHandle::Pool(pool) => pool.name(),
        }
    }

    pub fn is_completed(&self) -> bool {
        match self {
            DispatcherHandle::Single(dispatcher) => dispatcher.is_completed(),
            DispatcherHandle::Pool(pool) => pool.is_completed(),
        }
    }

    /// Identity comparison.
    pub fn same_as(&self, other: &DispatcherHandle) -> bool {
        self.id() == other.id()
    }

    pub fn as_dispatcher(&self) -> Option<&Arc<Dispatcher>> {
        match self {
            DispatcherHandle::Single(dispatcher) => Some(dispatcher),
            DispatcherHandle::Pool(_) => None,
        }
    }

    pub fn as_pool(&self) -> Option<&Arc<DispatchPool>> {
        match self {
            DispatcherHandle::Single(_) => None,
            DispatcherHandle::Pool(pool) => Some(pool),
        }
    }

    /// Starts a single dispatcher. Pools start their workers on construction, so this is a
    /// no-op for them.
    pub fn run(&self) -> Result<(), DispatchError> {
        match self {
            DispatcherHandle::Single(dispatcher) => dispatcher.run(),
            DispatcherHandle::Pool(_) => Ok(()),
        }
    }

    pub fn post_task(&self, task: impl FnOnce() + Send + 'static) {
        match self {
            DispatcherHandle::Single(dispatcher) => dispatcher.post_task(task),
            DispatcherHandle::Pool(pool) => pool.post_task(task),
        }
    }

    pub fn post_task_with_priority(
        &self,
        task: impl FnOnce() + Send + 'static,
        priority: TaskPriority,
    ) {
        match self {
            DispatcherHandle::Single(dispatcher) => {
                dispatcher.post_task_with_priority(task, priority)
            }
            DispatcherHandle::Pool(pool) => pool.post_task_with_priority(task, priority),
        }
    }

    pub fn post_delayed_task(&self, task: impl FnOnce() + Send + 'static, delay: Duration) {
        match self {
            DispatcherHandle::Single(dispatcher) => dispatcher.post_delayed_task(task, delay),
            DispatcherHandle::Pool(pool) => pool.post_delayed_task(task, delay),
        }
    }

    /// # Panics
    /// If the calling thread is not running a dispatcher.
    #[track_caller]
    pub fn post_task_and_reply(
        &self,
        task: impl FnOnce() + Send + 'static,
        reply: impl FnOnce() + Send + 'static,
    ) {
        self.post_task_and_reply_with_priority(task, reply, TaskPriority::Normal);
    }

    /// # Panics
    /// If the calling thread is not running a dispatcher.
    #[track_caller]
    pub fn post_task_and_reply_with_priority(
        &self,
        task: impl FnOnce() + Send + 'static,
        reply: impl FnOnce() + Send + 'static,
        priority: TaskPriority,
    ) {
        match self {
            DispatcherHandle::Single(dispatcher) => {
                dispatcher.post_task_and_reply_with_priority(task, reply, priority)
            }
            DispatcherHandle::Pool(pool) => {
                pool.post_task_and_reply_with_priority(task, reply, priority)
            }
        }
    }

    pub fn stop(&self) {
        match self {
            DispatcherHandle::Single(dispatcher) => dispatcher.stop(),
            DispatcherHandle::Pool(pool) => pool.stop(),
        }
    }

    pub fn stop_with_priority(&self, priority: TaskPriority) {
        match self {
            DispatcherHandle::Single(dispatcher) => dispatcher.stop_with_priority(priority),
            DispatcherHandle::Pool(pool) => pool.stop_with_priority(priority),
        }
    }

    pub fn wait(&self) -> bool {
        match self {
            DispatcherHandle::Single(dispatcher) => dispatcher.wait(),
            DispatcherHandle::Pool(pool) => pool.wait(),
        }
    }

    /// Runs `handler` once the dispatcher (or every worker of the pool) has exited.
    pub(crate) fn on_destroyed(&self, handler: impl FnOnce() + Send + 'static) {
        match self {
            DispatcherHandle::Single(dispatcher) => {
                dispatcher.set_destruction_handler(move |_| handler())
            }
            DispatcherHandle::Pool(pool) => pool.set_destruction_handler(move |_| handler()),
        }
    }
}

impl From<Arc<Dispatcher>> for DispatcherHandle {
    fn from(dispatcher: Arc<Dispatcher>) -> Self {
        DispatcherHandle::Single(dispatcher)
    }
}

impl From<Arc<DispatchPool>> for DispatcherHandle {
    fn from(pool: Arc<DispatchPool>) -> Self {
        DispatcherHandle::Pool(pool)
    }
}
