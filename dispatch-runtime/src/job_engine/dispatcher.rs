// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use log::{debug, error, info, warn};
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crate::job_engine::context;
use crate::job_engine::dispatch_pool::DispatchPool;
use crate::job_engine::error::DispatchError;
use crate::job_engine::job::{Job, TaskPriority};
use crate::job_engine::{lock, wait, wait_timeout};

/// Called every time the dispatcher runs out of work.
pub type CompletionHandler = Arc<dyn Fn(&Dispatcher) + Send + Sync>;

/// Process-unique identity of a dispatcher or pool.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DispatcherId(u64);

impl DispatcherId {
    pub(crate) fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        DispatcherId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for DispatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Debug, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DispatcherState {
    Created,
    Running,
    Draining,
    Completed,
}

/// Handlers that fire exactly once. Subscribing after the event already happened fires the
/// handler right away.
pub(crate) struct OnceNotifier<A: ?Sized> {
    slot: Mutex<NotifierSlot<A>>,
}

type OnceHandler<A> = Box<dyn FnOnce(&A) + Send>;

struct NotifierSlot<A: ?Sized> {
    handlers: Vec<OnceHandler<A>>,
    fired: bool,
}

impl<A: ?Sized> OnceNotifier<A> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(NotifierSlot {
                handlers: Vec::new(),
                fired: false,
            }),
        }
    }

    pub(crate) fn subscribe(&self, target: &A, handler: OnceHandler<A>) {
        let mut slot = lock(&self.slot);
        if slot.fired {
            drop(slot);
            handler(target);
        } else {
            slot.handlers.push(handler);
        }
    }

    pub(crate) fn fire(&self, target: &A) {
        let handlers = {
            let mut slot = lock(&self.slot);
            slot.fired = true;
            std::mem::take(&mut slot.handlers)
        };
        for handler in handlers {
            handler(target);
        }
    }
}

/// The queues only the dispatcher's own thread touches.
#[derive(Default)]
pub(crate) struct RunQueues {
    run: VecDeque<Job>,
    delayed: VecDeque<Job>,
    stop_requested: bool,
    ran_task: bool,
}

pub(crate) enum Step {
    Run(Job),
    Idle {
        next_trigger: Option<Instant>,
        drained: bool,
    },
    /// Jobs a stop left behind. The caller drops them once the queues are released, their
    /// captures may touch the context.
    Exit {
        discarded: Vec<Job>,
    },
}

impl RunQueues {
    /// Immediate jobs go behind every queued job of equal or higher precedence. Delayed jobs go
    /// behind every delayed job due no later.
    pub(crate) fn push(&mut self, job: Job) {
        match job.trigger() {
            Some(trigger) => {
                let at = self
                    .delayed
                    .iter()
                    .rposition(|queued| queued.trigger() <= Some(trigger))
                    .map_or(0, |i| i + 1);
                self.delayed.insert(at, job);
            }
            None => {
                let at = self
                    .run
                    .iter()
                    .rposition(|queued| !job.precedes(queued))
                    .map_or(0, |i| i + 1);
                self.run.insert(at, job);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.run.len() + self.delayed.len()
    }

    fn promote_due(&mut self, now: Instant) {
        if self
            .delayed
            .front()
            .is_some_and(|job| job.should_run_at(now))
        {
            if let Some(job) = self.delayed.pop_front() {
                self.run.push_front(job.into_due());
            }
        }
    }

    fn discard(&mut self) -> Vec<Job> {
        self.run.drain(..).chain(self.delayed.drain(..)).collect()
    }

    pub(crate) fn next_step(&mut self, keep_alive: bool, now: Instant) -> Step {
        self.promote_due(now);

        if self.stop_requested {
            return Step::Exit {
                discarded: self.discard(),
            };
        }

        match self.run.pop_front() {
            Some(job) => {
                self.ran_task = true;
                Step::Run(job)
            }
            None if !keep_alive && self.ran_task && self.delayed.is_empty() => Step::Exit {
                discarded: Vec::new(),
            },
            None => Step::Idle {
                next_trigger: self.delayed.front().and_then(Job::trigger),
                drained: self.delayed.is_empty(),
            },
        }
    }
}

#[derive(Default)]
struct Inbox {
    jobs: VecDeque<Job>,
    wake: bool,
}

/// A single-threaded execution context with a private task queue.
///
/// All jobs run in order on the dispatcher's own thread. Posting never blocks beyond a short
/// mutex hold and never waits for the job to run.
///
/// Posting to a dispatcher that has completed drops the job with a warning. This check is
/// best-effort: a caller must know the dispatcher is still alive for its job to run.
pub struct Dispatcher {
    id: DispatcherId,
    name: String,
    me: Weak<Dispatcher>,
    inbox: Mutex<Inbox>,
    task_available: Condvar,
    thread_id: OnceLock<ThreadId>,
    thread: Mutex<Option<JoinHandle<()>>>,
    state: Mutex<DispatcherState>,
    state_changed: Condvar,
    completed: AtomicBool,
    keep_alive: AtomicBool,
    waiting: AtomicBool,
    idle: AtomicBool,
    stop_priority: TaskPriority,
    tasks_completed: AtomicUsize,
    keep_alive_cycles: AtomicUsize,
    parent: OnceLock<Weak<DispatchPool>>,
    completion_handler: Mutex<Option<CompletionHandler>>,
    on_destroyed: OnceNotifier<Dispatcher>,
}

impl Dispatcher {
    /// A keep-alive dispatcher that is not yet running.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::create(name, true, TaskPriority::Critical)
    }

    /// A dispatcher pre-seeded with `entry`, which will be its first job.
    pub fn with_entry(name: impl Into<String>, entry: impl FnOnce() + Send + 'static) -> Arc<Self> {
        let dispatcher = Self::new(name);
        dispatcher.post_task(entry);
        dispatcher
    }

    pub(crate) fn create(
        name: impl Into<String>,
        keep_alive: bool,
        stop_priority: TaskPriority,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id: DispatcherId::next(),
            name: name.into(),
            me: me.clone(),
            inbox: Mutex::new(Inbox::default()),
            task_available: Condvar::new(),
            thread_id: OnceLock::new(),
            thread: Mutex::new(None),
            state: Mutex::new(DispatcherState::Created),
            state_changed: Condvar::new(),
            completed: AtomicBool::new(false),
            keep_alive: AtomicBool::new(keep_alive),
            waiting: AtomicBool::new(false),
            idle: AtomicBool::new(false),
            stop_priority,
            tasks_completed: AtomicUsize::new(0),
            keep_alive_cycles: AtomicUsize::new(0),
            parent: OnceLock::new(),
            completion_handler: Mutex::new(None),
            on_destroyed: OnceNotifier::new(),
        })
    }

    pub fn id(&self) -> DispatcherId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> DispatcherState {
        *lock(&self.state)
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// The thread running the loop, once the loop has started.
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.thread_id.get().copied()
    }

    pub fn is_current_thread(&self) -> bool {
        self.thread_id() == Some(thread::current().id())
    }

    pub fn tasks_completed(&self) -> usize {
        self.tasks_completed.load(Ordering::Relaxed)
    }

    pub fn keep_alive_cycles(&self) -> usize {
        self.keep_alive_cycles.load(Ordering::Relaxed)
    }

    /// True between running out of work and picking up the next job.
    pub(crate) fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive.load(Ordering::Acquire)
    }

    pub fn set_keep_alive(&self, keep_alive: bool) {
        self.keep_alive.store(keep_alive, Ordering::Release);
        if !self.is_current_thread() {
            // An idle loop must re-check its exit condition.
            lock(&self.inbox).wake = true;
            self.task_available.notify_one();
        }
    }

    /// The pool this dispatcher works for, if any.
    pub fn pool(&self) -> Option<Arc<DispatchPool>> {
        self.parent.get().and_then(Weak::upgrade)
    }

    pub(crate) fn pool_weak(&self) -> Option<Weak<DispatchPool>> {
        self.parent.get().cloned()
    }

    pub(crate) fn attach_to_pool(&self, pool: Weak<DispatchPool>) {
        let _ = self.parent.set(pool);
    }

    pub fn set_completion_handler(&self, handler: impl Fn(&Dispatcher) + Send + Sync + 'static) {
        *lock(&self.completion_handler) = Some(Arc::new(handler));
    }

    /// Fires once, from the dispatcher's thread, when its loop has exited. If that already
    /// happened, `handler` runs immediately on the calling thread.
    ///
    /// Handlers accumulate. Installing one never replaces the handler the directory or a pool
    /// relies on.
    pub fn set_destruction_handler(&self, handler: impl FnOnce(&Dispatcher) + Send + 'static) {
        self.on_destroyed.subscribe(self, Box::new(handler));
    }

    fn weak(&self) -> Weak<Dispatcher> {
        self.me.clone()
    }

    pub fn post_task(&self, task: impl FnOnce() + Send + 'static) {
        self.post_task_with_priority(task, TaskPriority::Normal);
    }

    pub fn post_task_with_priority(
        &self,
        task: impl FnOnce() + Send + 'static,
        priority: TaskPriority,
    ) {
        self.post_job(Job::new(Box::new(task), priority, self.weak()));
    }

    /// The task becomes eligible once `delay` has elapsed. Delayed tasks run in trigger order at
    /// normal priority.
    pub fn post_delayed_task(&self, task: impl FnOnce() + Send + 'static, delay: Duration) {
        let trigger = Instant::now() + delay;
        self.post_job(Job::delayed(Box::new(task), self.weak(), trigger));
    }

    /// Runs `task` here, then `reply` on the dispatcher the caller is running on.
    ///
    /// # Panics
    /// If the calling thread is not running a dispatcher, since the reply would have nowhere
    /// to go.
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
        let Some(origin) = context::current_queue() else {
            panic!(
                "post_task_and_reply to {:?} from a thread without a dispatcher: no reply destination",
                self.name
            );
        };
        let reply = Job::new(Box::new(reply), priority, Arc::downgrade(&origin));
        self.post_job(Job::with_reply(Box::new(task), priority, self.weak(), reply));
    }

    pub(crate) fn post_job(&self, job: Job) {
        if let Err(err) = self.try_post_job(job) {
            warn!("Dropping job posted to {}: {err}", self.name);
        }
    }

    pub(crate) fn try_post_job(&self, job: Job) -> Result<(), DispatchError> {
        let job = match context::push_local(self, job) {
            Ok(()) => return Ok(()),
            Err(job) => job,
        };

        if self.is_completed() {
            return Err(DispatchError::Completed {
                name: self.name.clone(),
            });
        }

        lock(&self.inbox).jobs.push_back(job);
        self.task_available.notify_one();
        Ok(())
    }

    /// Requests termination with the configured stop priority (critical by default).
    ///
    /// Jobs queued ahead of the request still run. Whatever is queued once it ran is discarded.
    pub fn stop(&self) {
        self.stop_with_priority(self.stop_priority);
    }

    /// Like [`stop`](Self::stop), but queues the request at `priority`. With
    /// [`TaskPriority::Low`] every job of higher priority queued so far runs first.
    pub fn stop_with_priority(&self, priority: TaskPriority) {
        debug!("Stop requested for {} at {:?} priority", self.name, priority);
        let me = self.weak();
        let request = move || {
            if let Some(dispatcher) = me.upgrade() {
                context::with_own_queues(&dispatcher, |queues| queues.stop_requested = true);
            }
        };
        self.post_job(Job::new(Box::new(request), priority, self.weak()));
    }

    fn begin(&self) -> Result<(), DispatchError> {
        let mut state = lock(&self.state);
        if *state != DispatcherState::Created {
            return Err(DispatchError::AlreadyStarted {
                name: self.name.clone(),
            });
        }
        *state = DispatcherState::Running;
        Ok(())
    }

    fn set_state(&self, new_state: DispatcherState) {
        let mut state = lock(&self.state);
        *state = new_state;
        self.state_changed.notify_all();
    }

    fn wait_for_state(&self, target: DispatcherState) {
        let mut state = lock(&self.state);
        while *state < target {
            state = wait(&self.state_changed, state);
        }
    }

    /// Spawns the dispatcher thread.
    pub fn run(&self) -> Result<(), DispatchError> {
        let Some(this) = self.me.upgrade() else {
            return Err(DispatchError::DestinationGone {
                name: self.name.clone(),
            });
        };
        self.begin()?;

        let spawned = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || this.dispatch_loop());

        match spawned {
            Ok(handle) => {
                *lock(&self.thread) = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.set_state(DispatcherState::Created);
                Err(err.into())
            }
        }
    }

    /// Runs the loop on the calling thread until the dispatcher completes.
    ///
    /// # Panics
    /// If the calling thread already runs a dispatcher loop. A panicking job propagates out of
    /// this call.
    #[track_caller]
    pub fn enter(&self) -> Result<(), DispatchError> {
        if context::is_inside_loop() {
            panic!(
                "cannot enter dispatcher {:?} from inside another dispatcher",
                self.name
            );
        }
        let Some(this) = self.me.upgrade() else {
            return Err(DispatchError::DestinationGone {
                name: self.name.clone(),
            });
        };
        self.begin()?;
        this.dispatch_loop();
        Ok(())
    }

    /// Blocks until the dispatcher loop has exited.
    ///
    /// Only the first call waits and returns `true`. Later calls, and calls from the
    /// dispatcher's own thread, return `false` right away.
    pub fn wait(&self) -> bool {
        if self.is_current_thread() {
            warn!("Dispatcher {} cannot wait for itself", self.name);
            return false;
        }
        if self.waiting.swap(true, Ordering::AcqRel) {
            debug!("Dispatcher {} is already being waited for", self.name);
            return false;
        }

        let handle = lock(&self.thread).take();
        match handle {
            Some(handle) => {
                if let Err(panic) = handle.join() {
                    error!(
                        "Dispatcher {} terminated by a panicking job: {}",
                        self.name,
                        panic_message(panic.as_ref())
                    );
                }
            }
            None => self.wait_for_state(DispatcherState::Completed),
        }
        true
    }

    fn dispatch_loop(self: Arc<Self>) {
        let _ = self.thread_id.set(thread::current().id());
        let _lifecycle = Lifecycle(&self);
        let _context = context::enter(self.clone());
        info!("Dispatcher {} started", self.name);

        loop {
            self.migrate_inbox();

            let keep_alive = self.keep_alive();
            let step = context::with_own_queues(&self, |queues| {
                queues.next_step(keep_alive, Instant::now())
            })
            .unwrap_or(Step::Exit {
                discarded: Vec::new(),
            });

            match step {
                Step::Run(job) => {
                    self.idle.store(false, Ordering::Release);
                    if let Some(reply) = job.run() {
                        self.deliver_reply(reply);
                    }
                    self.tasks_completed.fetch_add(1, Ordering::Relaxed);
                }
                Step::Idle {
                    next_trigger,
                    drained,
                } => {
                    if drained {
                        self.idle.store(true, Ordering::Release);
                        self.notify_completion();
                    }
                    self.idle(next_trigger);
                }
                Step::Exit { discarded } => {
                    if !discarded.is_empty() {
                        debug!(
                            "Dispatcher {} stopped, discarding {} queued jobs",
                            self.name,
                            discarded.len()
                        );
                    }
                    drop(discarded);
                    break;
                }
            }
        }

        self.set_state(DispatcherState::Draining);
    }

    fn migrate_inbox(&self) {
        let pending = std::mem::take(&mut lock(&self.inbox).jobs);
        if pending.is_empty() {
            return;
        }
        debug!("Dispatcher {} picked up {} posted jobs", self.name, pending.len());
        context::with_own_queues(self, |queues| {
            for job in pending {
                queues.push(job);
            }
        });
    }

    fn deliver_reply(&self, reply: Job) {
        match reply.owner() {
            Some(destination) => destination.post_job(reply),
            None => warn!(
                "Dropping reply of a job run on {}: its destination no longer exists",
                self.name
            ),
        }
    }

    fn notify_completion(&self) {
        let handler = lock(&self.completion_handler).clone();
        if let Some(handler) = handler {
            debug!("Dispatcher {} ran out of work", self.name);
            handler(self);
        }
    }

    /// Blocks until cross-thread work arrives, a wake-up is requested, or `next_trigger` passes.
    fn idle(&self, next_trigger: Option<Instant>) {
        self.keep_alive_cycles.fetch_add(1, Ordering::Relaxed);
        let mut inbox = lock(&self.inbox);
        loop {
            if !inbox.jobs.is_empty() {
                return;
            }
            if inbox.wake {
                inbox.wake = false;
                return;
            }
            match next_trigger {
                None => inbox = wait(&self.task_available, inbox),
                Some(trigger) => {
                    let now = Instant::now();
                    if now >= trigger {
                        return;
                    }
                    inbox = wait_timeout(&self.task_available, inbox, trigger - now);
                }
            }
        }
    }
}

/// Marks the dispatcher completed when the loop ends, also when a job panicked.
struct Lifecycle<'a>(&'a Dispatcher);

impl Drop for Lifecycle<'_> {
    fn drop(&mut self) {
        let dispatcher = self.0;
        if thread::panicking() {
            warn!("Dispatcher {} is unwinding from a panicking job", dispatcher.name);
        }
        dispatcher.completed.store(true, Ordering::Release);
        dispatcher.set_state(DispatcherState::Completed);
        info!(
            "Dispatcher {} finished after {} tasks and {} keep-alive cycles",
            dispatcher.name,
            dispatcher.tasks_completed(),
            dispatcher.keep_alive_cycles()
        );
        dispatcher.on_destroyed.fire(dispatcher);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("keep_alive", &self.keep_alive())
            .field("tasks_completed", &self.tasks_completed())
            .finish()
    }
}
