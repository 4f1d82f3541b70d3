// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use serde::{Deserialize, Serialize};

use crate::job_engine::error::DispatchError;
use crate::job_engine::job::TaskPriority;

/// Defaults a [`Directory`](crate::job_engine::directory::Directory) applies to everything it
/// creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RuntimeConfig {
    /// Worker count of pools created without an explicit size. `None` uses the hardware
    /// concurrency.
    pub pool_size: Option<usize>,
    /// Whether new dispatchers idle once their queue drains (`true`) or exit.
    pub keep_alive: bool,
    /// Anonymous dispatchers are registered as `<prefix><n>`.
    pub anonymous_prefix: String,
    /// Priority `stop` requests are posted with.
    pub stop_priority: TaskPriority,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pool_size: None,
            keep_alive: true,
            anonymous_prefix: "anonymous".to_string(),
            stop_priority: TaskPriority::Critical,
        }
    }
}

impl RuntimeConfig {
    /// Parses a JSON document. Missing fields take their default.
    pub fn from_json(json: &str) -> Result<Self, DispatchError> {
        Ok(serde_json::from_str(json)?)
    }

    /// The worker count for a pool: the request if given, then the configured size, then the
    /// hardware concurrency. Never zero.
    pub fn pool_size_for(&self, requested: Option<usize>) -> usize {
        requested
            .or(self.pool_size)
            .unwrap_or_else(hardware_concurrency)
            .max(1)
    }
}

pub fn hardware_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
