// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>
//! # Design: Thread-Backed Dispatchers
//!
//! ## Overview
//! Every dispatcher owns one OS thread and runs its jobs strictly in order on it.
//!
//! - Jobs posted from the dispatcher's own thread go straight into its run queue, without locking.
//! - Jobs posted from any other thread land in a mutex-guarded inbox and wake the dispatcher.
//! - The loop migrates the inbox, promotes due delayed jobs, and runs the next job by priority
//!   (arrival order within a priority).
//! - A job may carry a reply. The reply is posted back to the dispatcher the request came from.
//! - An idle dispatcher blocks on a condition variable until new work arrives or the next delayed
//!   job is due.
//! - A pool fronts several dispatchers and forwards each job to one of them.
//! - The directory maps names to dispatchers and lets a caller wait until all of them completed.
//!
//! ## Stop policy
//! `stop` is a job of its own (critical priority unless overridden). Jobs queued ahead of it run;
//! everything still queued when it has run is discarded, not executed.
//!
//! ## Panics in jobs
//! Jobs are not isolated from each other. A panicking job unwinds the dispatcher thread. The
//! dispatcher still reaches `Completed` and notifies its destruction handler.
//!
//! ```text
//!                 +-------------------------------+
//!   any thread -> |           Directory           | <- wait_all()
//!                 +------+----------------+-------+
//!                        |                |
//!                        v                v
//!              +---------+------+   +-----+--------------+
//!              |   Dispatcher   |   |    DispatchPool    |
//!              | inbox -> queue |   |  next() -> worker  |
//!              +---------+------+   +--+------+-------+--+
//!                        |             |      |       |
//!                        v             v      v       v
//!                     loop()         [0]     [1]     [n]
//! ```

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub mod context;
pub mod directory;
pub mod dispatch_pool;
pub mod dispatcher;
pub mod error;
pub mod handle;
pub mod job;


// No job runs while one of the runtime's locks is held, so a poisoned lock still guards
// consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn wait<'a, T>(condvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    condvar.wait(guard).unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn wait_timeout<'a, T>(
    condvar: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
) -> MutexGuard<'a, T> {
    match condvar.wait_timeout(guard, timeout) {
        Ok((guard, _)) => guard,
        Err(poisoned) => poisoned.into_inner().0,
    }
}
