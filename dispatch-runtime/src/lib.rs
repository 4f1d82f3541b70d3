// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Thread-backed task dispatch.
//!
//! A [`Dispatcher`] owns one OS thread and runs posted closures on it, ordered by priority.
//! A [`DispatchPool`] spreads work over several dispatchers. A [`Directory`] names them and
//! waits until all of them have completed. [`refptr`] provides reference-counted pointers for
//! handing payloads between dispatchers.

pub mod job_engine;
pub mod refptr;
pub mod runtime_config;

pub use job_engine::context;
pub use job_engine::directory::{Directory, DispatcherBuilder};
pub use job_engine::dispatch_pool::DispatchPool;
pub use job_engine::dispatcher::{Dispatcher, DispatcherId, DispatcherState};
pub use job_engine::error::DispatchError;
pub use job_engine::handle::DispatcherHandle;
pub use job_engine::job::{Task, TaskPriority};
pub use refptr::{BoundRefPtr, SharedRefPtr};
pub use runtime_config::RuntimeConfig;
