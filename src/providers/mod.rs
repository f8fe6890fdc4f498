use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ErrorDetails, Event};

pub mod error;
/// Filesystem-backed provider for local development and restart tests.
pub mod fs;
/// In-memory provider for tests.
pub mod in_memory;

pub use error::StoreError;

/// The two peek-lock queues every provider hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueKind {
    /// Messages that wake an instance: starts, completions, terminations.
    Orchestrator,
    /// Activity invocations waiting for a worker.
    Worker,
}

/// Queue message. Equality is used for idempotent enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkItem {
    StartOrchestration { instance: String },
    ActivityExecute { instance: String, id: u64, name: String, input: String },
    ActivityCompleted { instance: String, id: u64, result: String },
    ActivityFailed { instance: String, id: u64, details: ErrorDetails },
    TerminateInstance { instance: String, reason: String },
}

impl WorkItem {
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartOrchestration { instance }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TerminateInstance { instance, .. } => instance,
        }
    }
}

/// A message handed out under a peek-lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDelivery {
    pub item: WorkItem,
    pub lock_token: String,
    /// 1 on first delivery, incremented every time an expired lock makes the
    /// message visible again.
    pub delivery_count: u32,
}

/// Storage abstraction: append-only history per instance plus the two
/// work queues the runtime coordinates through.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Create a new, empty instance.
    async fn create_instance(&self, instance: &str) -> Result<(), StoreError>;

    /// Full, order-preserving snapshot of an instance's history.
    async fn read(&self, instance: &str) -> Result<Vec<Event>, StoreError>;

    /// Atomically append events and return the committed history length.
    ///
    /// Appends are idempotent for outcomes: a second outcome for the same
    /// sequence id is dropped, and nothing is appended after a terminal event.
    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<u64, StoreError>;

    /// Enumerate known instances.
    async fn list_instances(&self) -> Result<Vec<String>, StoreError>;

    /// Remove an instance and its history.
    async fn remove_instance(&self, instance: &str) -> Result<(), StoreError>;

    /// Enqueue a message. A message equal to one already visible or locked is
    /// not enqueued twice.
    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), StoreError>;

    /// Hand out the oldest visible message and hide it for `visibility`.
    /// Messages whose lock expired become visible again first.
    async fn dequeue_peek_lock(&self, kind: QueueKind, visibility: Duration)
    -> Result<Option<QueueDelivery>, StoreError>;

    /// Settle a message for good.
    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), StoreError>;

    /// Release a lock early; the message goes to the back of the queue.
    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), StoreError>;
}

/// Filter `new_events` down to the ones that may follow `existing`.
pub(crate) fn appendable(existing: &[Event], new_events: Vec<Event>) -> Vec<Event> {
    let mut terminal = existing.iter().any(Event::is_terminal);
    let mut resolved: HashSet<u64> = existing
        .iter()
        .filter_map(|e| match e {
            Event::ActivityCompleted { id, .. } | Event::ActivityFailed { id, .. } => Some(*id),
            _ => None,
        })
        .collect();
    let mut out = Vec::with_capacity(new_events.len());
    for ev in new_events {
        if terminal {
            break;
        }
        match &ev {
            Event::ActivityCompleted { id, .. } | Event::ActivityFailed { id, .. } => {
                if !resolved.insert(*id) {
                    continue;
                }
            }
            e if e.is_terminal() => terminal = true,
            _ => {}
        }
        out.push(ev);
    }
    out
}
