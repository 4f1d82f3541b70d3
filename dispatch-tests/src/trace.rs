// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use dispatch_runtime::context;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TraceEvent {
    pub label: String,

    /// Name of the dispatcher queue the event was recorded on, if any.
    pub dispatcher: Option<String>,

    pub thread: String,

    pub elapsed_usec: u64,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct TraceLog {
    pub events: Vec<TraceEvent>,
}

/// Records which task ran where and when. Shared between dispatchers through an `Arc`.
#[derive(Debug)]
pub struct ExecutionTrace {
    start: Instant,
    events: Mutex<Vec<TraceEvent>>,
}

impl ExecutionTrace {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start: Instant::now(),
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn record(&self, label: impl Into<String>) {
        let event = TraceEvent {
            label: label.into(),
            dispatcher: context::current_queue().map(|queue| queue.name().to_string()),
            thread: format!("{:?}", thread::current().id()),
            elapsed_usec: self.start.elapsed().as_micros() as u64,
        };
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn labels(&self) -> Vec<String> {
        self.events().into_iter().map(|event| event.label).collect()
    }

    pub fn find(&self, label: &str) -> Option<TraceEvent> {
        self.events().into_iter().find(|event| event.label == label)
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_log(&self) -> TraceLog {
        TraceLog {
            events: self.events(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.to_log())
    }
}
