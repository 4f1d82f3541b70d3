// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use thiserror::Error;

/// Recoverable failures of the dispatch runtime.
///
/// Programmer errors (thread-affinity violations, a reply without a destination, acting on the
/// current dispatcher from a plain thread) are not represented here. They panic.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum DispatchError {
    /// No dispatcher is registered under this name.
    #[error("dispatcher {name:?} not found")]
    NotFound { name: String },

    /// The name is already taken by a live dispatcher.
    #[error("dispatcher name {name:?} is already in use")]
    NameInUse { name: String },

    /// The dispatcher has already been started or entered.
    #[error("dispatcher {name:?} has already been started")]
    AlreadyStarted { name: String },

    /// The dispatcher has completed and will not run further work.
    #[error("dispatcher {name:?} has completed")]
    Completed { name: String },

    /// The destination of a reply no longer exists.
    #[error("reply destination of {name:?} no longer exists")]
    DestinationGone { name: String },

    /// The OS refused to spawn the dispatcher thread.
    #[error("failed to spawn dispatcher thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// The runtime configuration could not be parsed.
    #[error("invalid runtime configuration: {0}")]
    Config(#[from] serde_json::Error),
}

impl DispatchError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            DispatchError::NotFound { .. } => "dispatch_not_found",
            DispatchError::NameInUse { .. } => "dispatch_name_in_use",
            DispatchError::AlreadyStarted { .. } => "dispatch_already_started",
            DispatchError::Completed { .. } => "dispatch_completed",
            DispatchError::DestinationGone { .. } => "dispatch_destination_gone",
            DispatchError::Spawn(_) => "dispatch_spawn_failed",
            DispatchError::Config(_) => "dispatch_config_invalid",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_and_messages() {
        let err = DispatchError::NotFound {
            name: "secondary".into(),
        };
        assert_eq!(err.as_label(), "dispatch_not_found");
        assert_eq!(err.to_string(), "dispatcher \"secondary\" not found");

        let err = DispatchError::from(std::io::Error::other("no threads left"));
        assert_eq!(err.as_label(), "dispatch_spawn_failed");
    }
}
