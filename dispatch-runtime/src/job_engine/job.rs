// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::job_engine::dispatcher::Dispatcher;

/// The body of a job. The runtime treats it as an opaque zero-argument invocable.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Queue precedence of a job. Lower value runs first.
///
/// Priority only decides where a job is inserted into the run queue. A running job is never
/// preempted.
#[derive(
    Debug,
    Default,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    ValueEnum,
    Serialize,
    Deserialize,
)]
#[clap(rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum TaskPriority {
    /// Used for stop requests unless overridden.
    Critical = 0,
    High = 1,
    #[default]
    Normal = 2,
    Low = 3,
}

/// A unit of posted work together with its scheduling metadata.
///
/// A job is moved through the queues, never copied. Running it consumes it, so the body is
/// invoked at most once and the reply (if any) is handed back exactly once.
pub struct Job {
    body: Task,
    priority: TaskPriority,
    owner: Weak<Dispatcher>,
    trigger: Option<Instant>,
    reply: Option<Box<Job>>,
}

impl Job {
    /// A job that is eligible as soon as it is queued.
    pub fn new(body: Task, priority: TaskPriority, owner: Weak<Dispatcher>) -> Self {
        Self {
            body,
            priority,
            owner,
            trigger: None,
            reply: None,
        }
    }

    /// A job that becomes eligible at `trigger`. Delayed jobs always carry normal priority.
    pub fn delayed(body: Task, owner: Weak<Dispatcher>, trigger: Instant) -> Self {
        Self {
            body,
            priority: TaskPriority::Normal,
            owner,
            trigger: Some(trigger),
            reply: None,
        }
    }

    /// A job that hands `reply` back to the dispatcher recorded as the reply's owner once it ran.
    pub fn with_reply(
        body: Task,
        priority: TaskPriority,
        owner: Weak<Dispatcher>,
        reply: Job,
    ) -> Self {
        Self {
            body,
            priority,
            owner,
            trigger: None,
            reply: Some(Box::new(reply)),
        }
    }

    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    /// The dispatcher this job was addressed to, if it still exists.
    pub fn owner(&self) -> Option<Arc<Dispatcher>> {
        self.owner.upgrade()
    }

    /// Identity comparison against a dispatcher. Never dereferences the owner.
    pub fn is_owned_by(&self, dispatcher: &Dispatcher) -> bool {
        std::ptr::eq(self.owner.as_ptr(), dispatcher)
    }

    pub fn is_delayed(&self) -> bool {
        self.trigger.is_some()
    }

    pub fn trigger(&self) -> Option<Instant> {
        self.trigger
    }

    pub fn has_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// True if the job is not delayed or its trigger time has passed.
    pub fn should_run_now(&self) -> bool {
        self.should_run_at(Instant::now())
    }

    pub fn should_run_at(&self, now: Instant) -> bool {
        match self.trigger {
            None => true,
            Some(trigger) => now >= trigger,
        }
    }

    /// True if `self` belongs strictly ahead of `other` in a run queue.
    /// Equal priorities keep arrival order, so this is never true for them.
    pub fn precedes(&self, other: &Job) -> bool {
        self.priority < other.priority
    }

    /// Invokes the body and returns the reply job, if one was attached.
    pub fn run(self) -> Option<Job> {
        let Job { body, reply, .. } = self;
        body();
        reply.map(|reply| *reply)
    }

    /// Clears the delay so a promoted job is not mistaken for a pending one.
    pub(crate) fn into_due(mut self) -> Self {
        self.trigger = None;
        self
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("priority", &self.priority)
            .field("owner", &self.owner.upgrade().map(|d| d.name().to_string()))
            .field("trigger", &self.trigger)
            .field("has_reply", &self.reply.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_task(counter: &Arc<AtomicUsize>) -> Task {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_immediate_job_runs_now() {
        let job = Job::new(Box::new(|| {}), TaskPriority::High, Weak::new());
        assert!(!job.is_delayed());
        assert!(job.should_run_now());
        assert_eq!(job.priority(), TaskPriority::High);
        assert!(job.owner().is_none());
    }

    #[test]
    fn test_delayed_job_waits_for_trigger() {
        let now = Instant::now();
        let job = Job::delayed(Box::new(|| {}), Weak::new(), now + Duration::from_secs(60));
        assert!(job.is_delayed());
        assert_eq!(job.priority(), TaskPriority::Normal);
        assert!(!job.should_run_at(now));
        assert!(job.should_run_at(now + Duration::from_secs(60)));
        assert!(job.into_due().should_run_at(now));
    }

    #[test]
    fn test_run_returns_reply_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let reply = Job::new(counting_task(&counter), TaskPriority::Normal, Weak::new());
        let job = Job::with_reply(
            counting_task(&counter),
            TaskPriority::Normal,
            Weak::new(),
            reply,
        );
        assert!(job.has_reply());

        let reply = job.run().expect("reply must be handed back");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(reply.run().is_none());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_priority_ordering() {
        let high = Job::new(Box::new(|| {}), TaskPriority::High, Weak::new());
        let normal = Job::new(Box::new(|| {}), TaskPriority::Normal, Weak::new());
        let other_normal = Job::new(Box::new(|| {}), TaskPriority::Normal, Weak::new());
        assert!(high.precedes(&normal));
        assert!(!normal.precedes(&high));
        assert!(!normal.precedes(&other_normal));
        assert!(TaskPriority::Critical < TaskPriority::Low);
    }

    #[test]
    fn test_owner_identity_survives_owner_drop() {
        let owner = Dispatcher::new("owner");
        let other = Dispatcher::new("other");
        let job = Job::new(Box::new(|| {}), TaskPriority::Normal, Arc::downgrade(&owner));
        assert!(job.is_owned_by(&owner));
        assert!(!job.is_owned_by(&other));

        drop(owner);
        assert!(job.owner().is_none());
        assert!(!job.is_owned_by(&other));
    }
}
