// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use log::{debug, info};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::job_engine::context;
use crate::job_engine::dispatcher::{Dispatcher, DispatcherId, OnceNotifier};
use crate::job_engine::error::DispatchError;
use crate::job_engine::job::TaskPriority;
use crate::job_engine::lock;

/// Several dispatchers behind one posting contract.
///
/// The pool never runs work itself. Each posted task goes to one worker, picked in this order:
/// a worker that reported itself idle, the worker the caller is running on (if it belongs to
/// this pool), then the next worker in round-robin order.
pub struct DispatchPool {
    id: DispatcherId,
    name: String,
    workers: Vec<Arc<Dispatcher>>,
    idle: Mutex<VecDeque<usize>>,
    cursor: AtomicUsize,
    active: AtomicUsize,
    dispatched: AtomicUsize,
    on_destroyed: OnceNotifier<DispatchPool>,
}

impl DispatchPool {
    /// Creates and starts `size` workers named `<name>[i]`. A size of zero is raised to one.
    pub fn new(name: impl Into<String>, size: usize) -> Result<Arc<Self>, DispatchError> {
        Self::create(name, size, TaskPriority::Critical)
    }

    pub(crate) fn create(
        name: impl Into<String>,
        size: usize,
        stop_priority: TaskPriority,
    ) -> Result<Arc<Self>, DispatchError> {
        let name = name.into();
        let size = size.max(1);

        let pool = Arc::new_cyclic(|me: &Weak<DispatchPool>| {
            let workers = (0..size)
                .map(|index| {
                    let worker =
                        Dispatcher::create(format!("{name}[{index}]"), true, stop_priority);
                    worker.attach_to_pool(me.clone());

                    let pool = me.clone();
                    worker.set_completion_handler(move |_| {
                        if let Some(pool) = pool.upgrade() {
                            pool.mark_idle(index);
                        }
                    });

                    let pool = me.clone();
                    worker.set_destruction_handler(move |_| {
                        if let Some(pool) = pool.upgrade() {
                            pool.worker_terminated();
                        }
                    });
                    worker
                })
                .collect();

            DispatchPool {
                id: DispatcherId::next(),
                name: name.clone(),
                workers,
                idle: Mutex::new(VecDeque::with_capacity(size)),
                cursor: AtomicUsize::new(0),
                active: AtomicUsize::new(size),
                dispatched: AtomicUsize::new(0),
                on_destroyed: OnceNotifier::new(),
            }
        });

        for (started, worker) in pool.workers.iter().enumerate() {
            if let Err(err) = worker.run() {
                for running in &pool.workers[..started] {
                    running.stop();
                    running.wait();
                }
                return Err(err);
            }
        }

        info!("Dispatch pool {} started with {} workers", pool.name, size);
        Ok(pool)
    }

    pub fn id(&self) -> DispatcherId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workers(&self) -> &[Arc<Dispatcher>] {
        &self.workers
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Workers whose loop has not exited yet.
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Total number of tasks forwarded to workers.
    pub fn tasks_dispatched(&self) -> usize {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn is_completed(&self) -> bool {
        self.active_workers() == 0
    }

    /// Fires once, on the thread of the last worker to exit. If all workers already exited,
    /// `handler` runs immediately on the calling thread. Handlers accumulate.
    pub fn set_destruction_handler(&self, handler: impl FnOnce(&DispatchPool) + Send + 'static) {
        self.on_destroyed.subscribe(self, Box::new(handler));
    }

    fn mark_idle(&self, index: usize) {
        let mut idle = lock(&self.idle);
        if !idle.contains(&index) {
            idle.push_back(index);
        }
    }

    fn worker_terminated(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            info!("Dispatch pool {} finished", self.name);
            self.on_destroyed.fire(self);
        }
    }

    /// The worker the next task goes to.
    ///
    /// A picked worker leaves the idle list whichever rule picked it. Entries of workers that
    /// got work some other way since they reported idle are skipped.
    pub fn next(&self) -> &Arc<Dispatcher> {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        let mut idle = lock(&self.idle);

        while let Some(index) = idle.pop_front() {
            if self.workers[index].is_idle() {
                return &self.workers[index];
            }
        }

        let index = context::current_queue()
            .and_then(|current| self.workers.iter().position(|w| Arc::ptr_eq(w, &current)))
            .unwrap_or_else(|| self.cursor.fetch_add(1, Ordering::Relaxed) % self.workers.len());
        &self.workers[index]
    }

    pub fn post_task(&self, task: impl FnOnce() + Send + 'static) {
        self.next().post_task(task);
    }

    pub fn post_task_with_priority(
        &self,
        task: impl FnOnce() + Send + 'static,
        priority: TaskPriority,
    ) {
        self.next().post_task_with_priority(task, priority);
    }

    pub fn post_delayed_task(&self, task: impl FnOnce() + Send + 'static, delay: Duration) {
        self.next().post_delayed_task(task, delay);
    }

    /// # Panics
    /// If the calling thread is not running a dispatcher.
    #[track_caller]
    pub fn post_task_and_reply(
        &self,
        task: impl FnOnce() + Send + 'static,
        reply: impl FnOnce() + Send + 'static,
    ) {
        self.next().post_task_and_reply(task, reply);
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
        self.next()
            .post_task_and_reply_with_priority(task, reply, priority);
    }

    pub fn stop(&self) {
        debug!("Stopping all workers of pool {}", self.name);
        for worker in &self.workers {
            worker.stop();
        }
    }

    pub fn stop_with_priority(&self, priority: TaskPriority) {
        for worker in &self.workers {
            worker.stop_with_priority(priority);
        }
    }

    /// Waits for every worker. Returns `true` if this call waited for at least one of them.
    pub fn wait(&self) -> bool {
        let mut waited = false;
        for worker in &self.workers {
            waited |= worker.wait();
        }
        waited
    }
}

impl Drop for DispatchPool {
    fn drop(&mut self) {
        // Workers hold the pool weakly, so this runs once the last outside handle is gone.
        for worker in &self.workers {
            if !worker.is_completed() {
                worker.stop();
            }
        }
    }
}

impl fmt::Debug for DispatchPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchPool")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("size", &self.workers.len())
            .field("active", &self.active_workers())
            .finish()
    }
}
