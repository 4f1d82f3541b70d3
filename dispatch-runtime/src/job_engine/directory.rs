// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::job_engine::context;
use crate::job_engine::dispatch_pool::DispatchPool;
use crate::job_engine::dispatcher::{Dispatcher, DispatcherId};
use crate::job_engine::error::DispatchError;
use crate::job_engine::handle::DispatcherHandle;
use crate::job_engine::job::{Task, TaskPriority};
use crate::job_engine::{lock, wait, wait_timeout};
use crate::runtime_config::RuntimeConfig;

/// Describes a dispatcher before the directory creates it.
#[derive(Default)]
pub struct DispatcherBuilder {
    name: Option<String>,
    entry: Option<Task>,
    keep_alive: Option<bool>,
    stop_priority: Option<TaskPriority>,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Without a name the dispatcher is registered under a generated anonymous name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The first job the dispatcher runs.
    pub fn entry(mut self, entry: impl FnOnce() + Send + 'static) -> Self {
        self.entry = Some(Box::new(entry));
        self
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = Some(keep_alive);
        self
    }

    pub fn stop_priority(mut self, priority: TaskPriority) -> Self {
        self.stop_priority = Some(priority);
        self
    }
}

#[derive(Default)]
struct Registry {
    entries: HashMap<String, DispatcherHandle>,
    active: usize,
    anonymous: usize,
}

/// Name to dispatcher registry plus the barrier that waits for all of them.
///
/// Every dispatcher and pool created through a directory is tracked until its loop (or its last
/// worker) has exited. Names are unique among live dispatchers.
pub struct Directory {
    me: Weak<Directory>,
    config: RuntimeConfig,
    registry: Mutex<Registry>,
    quiescent: Condvar,
}

impl Directory {
    pub fn new() -> Arc<Self> {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            registry: Mutex::new(Registry::default()),
            quiescent: Condvar::new(),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Creates, registers and starts a dispatcher on a new thread.
    pub fn spawn(&self, builder: DispatcherBuilder) -> Result<Arc<Dispatcher>, DispatchError> {
        let dispatcher = self.prepare(builder)?;
        if let Err(err) = dispatcher.run() {
            self.release(dispatcher.name(), dispatcher.id());
            return Err(err);
        }
        Ok(dispatcher)
    }

    /// Creates and registers a dispatcher, then runs it on the calling thread until it
    /// completes.
    ///
    /// # Panics
    /// If the calling thread already runs a dispatcher loop.
    #[track_caller]
    pub fn enter(&self, builder: DispatcherBuilder) -> Result<(), DispatchError> {
        // Checked before registering, a rejected dispatcher would otherwise block `wait_all`.
        if context::is_inside_loop() {
            panic!("cannot enter a dispatcher from inside another dispatcher");
        }
        let dispatcher = self.prepare(builder)?;
        dispatcher.enter()
    }

    pub fn create_dispatcher(&self, name: &str) -> Result<Arc<Dispatcher>, DispatchError> {
        self.spawn(DispatcherBuilder::new().name(name))
    }

    pub fn create_anonymous_dispatcher(&self) -> Result<Arc<Dispatcher>, DispatchError> {
        self.spawn(DispatcherBuilder::new())
    }

    pub fn create_dispatcher_with_entry(
        &self,
        name: &str,
        entry: impl FnOnce() + Send + 'static,
    ) -> Result<Arc<Dispatcher>, DispatchError> {
        self.spawn(DispatcherBuilder::new().name(name).entry(entry))
    }

    /// Blocks the calling thread, which becomes the dispatcher's thread until it completes.
    #[track_caller]
    pub fn create_and_enter_dispatcher(
        &self,
        name: &str,
        entry: impl FnOnce() + Send + 'static,
    ) -> Result<(), DispatchError> {
        self.enter(DispatcherBuilder::new().name(name).entry(entry))
    }

    /// Creates a pool of `size` workers, or of the configured/hardware default if `None`.
    pub fn create_pool(
        &self,
        name: &str,
        size: Option<usize>,
    ) -> Result<Arc<DispatchPool>, DispatchError> {
        if self.contains(name) {
            return Err(DispatchError::NameInUse {
                name: name.to_string(),
            });
        }

        let size = self.config.pool_size_for(size);
        let pool = DispatchPool::create(name, size, self.config.stop_priority)?;
        if let Err(err) = self.register(name, DispatcherHandle::Pool(pool.clone())) {
            pool.stop();
            pool.wait();
            return Err(err);
        }
        Ok(pool)
    }

    fn prepare(&self, builder: DispatcherBuilder) -> Result<Arc<Dispatcher>, DispatchError> {
        let name = match builder.name {
            Some(name) => name,
            None => self.anonymous_name(),
        };
        let dispatcher = Dispatcher::create(
            name.as_str(),
            builder.keep_alive.unwrap_or(self.config.keep_alive),
            builder.stop_priority.unwrap_or(self.config.stop_priority),
        );
        if let Some(entry) = builder.entry {
            dispatcher.post_task(entry);
        }
        self.register(&name, DispatcherHandle::Single(dispatcher.clone()))?;
        Ok(dispatcher)
    }

    fn anonymous_name(&self) -> String {
        let mut registry = lock(&self.registry);
        loop {
            let name = format!("{}{}", self.config.anonymous_prefix, registry.anonymous);
            registry.anonymous += 1;
            if !registry.entries.contains_key(&name) {
                return name;
            }
        }
    }

    fn register(&self, name: &str, handle: DispatcherHandle) -> Result<(), DispatchError> {
        {
            let mut registry = lock(&self.registry);
            if registry.entries.contains_key(name) {
                return Err(DispatchError::NameInUse {
                    name: name.to_string(),
                });
            }
            registry.entries.insert(name.to_string(), handle.clone());
            registry.active += 1;
        }
        info!("Registered dispatcher {name} ({})", handle.id());

        let directory = self.me.clone();
        let key = name.to_string();
        let id = handle.id();
        handle.on_destroyed(move || {
            if let Some(directory) = directory.upgrade() {
                directory.release(&key, id);
            }
        });
        Ok(())
    }

    fn release(&self, name: &str, id: DispatcherId) {
        let (removed, remaining) = {
            let mut registry = lock(&self.registry);
            let mut removed = None;
            if registry.entries.get(name).is_some_and(|handle| handle.id() == id) {
                removed = registry.entries.remove(name);
                registry.active -= 1;
            }
            (removed, registry.active)
        };
        // May be the last reference, so it is dropped outside of the lock.
        drop(removed);
        debug!("Dispatcher {name} left the directory, {remaining} still active");
        self.quiescent.notify_all();
    }

    /// Looks up a dispatcher or pool. A miss is `None`, never an error.
    pub fn get(&self, name: &str) -> Option<DispatcherHandle> {
        lock(&self.registry).entries.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        lock(&self.registry).entries.contains_key(name)
    }

    /// Names of all live dispatchers and pools, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.registry).entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn active_count(&self) -> usize {
        lock(&self.registry).active
    }

    fn lookup(&self, name: &str) -> Result<DispatcherHandle, DispatchError> {
        self.get(name).ok_or_else(|| {
            warn!("Dispatcher {name} not found");
            DispatchError::NotFound {
                name: name.to_string(),
            }
        })
    }

    /// Posts to a named dispatcher. A missing name is reported and the task dropped.
    pub fn post_task_to(
        &self,
        name: &str,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), DispatchError> {
        self.lookup(name)?.post_task(task);
        Ok(())
    }

    pub fn post_task_with_priority_to(
        &self,
        name: &str,
        task: impl FnOnce() + Send + 'static,
        priority: TaskPriority,
    ) -> Result<(), DispatchError> {
        self.lookup(name)?.post_task_with_priority(task, priority);
        Ok(())
    }

    pub fn post_delayed_task_to(
        &self,
        name: &str,
        task: impl FnOnce() + Send + 'static,
        delay: Duration,
    ) -> Result<(), DispatchError> {
        self.lookup(name)?.post_delayed_task(task, delay);
        Ok(())
    }

    /// Runs `task` on the named dispatcher, then `reply` on the caller's dispatcher.
    ///
    /// # Panics
    /// If the calling thread is not running a dispatcher.
    #[track_caller]
    pub fn post_task_and_reply_to(
        &self,
        name: &str,
        task: impl FnOnce() + Send + 'static,
        reply: impl FnOnce() + Send + 'static,
    ) -> Result<(), DispatchError> {
        self.lookup(name)?.post_task_and_reply(task, reply);
        Ok(())
    }

    /// Requests termination of a named dispatcher or pool.
    pub fn stop(&self, name: &str) -> Result<(), DispatchError> {
        self.lookup(name)?.stop();
        Ok(())
    }

    /// Blocks until every dispatcher and pool created through this directory has completed.
    /// Dispatchers created while waiting are waited for as well.
    pub fn wait_all(&self) {
        let mut registry = lock(&self.registry);
        while registry.active > 0 {
            registry = wait(&self.quiescent, registry);
        }
        info!("All dispatchers have completed");
    }

    /// Like [`wait_all`](Self::wait_all) with an upper bound. Returns `false` on timeout.
    pub fn wait_all_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut registry = lock(&self.registry);
        while registry.active > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            registry = wait_timeout(&self.quiescent, registry, deadline - now);
        }
        true
    }
}
