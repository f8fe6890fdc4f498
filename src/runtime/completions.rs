use std::collections::HashSet;

use tracing::warn;

use crate::Event;
use crate::providers::WorkItem;

/// Activities scheduled in `history` that have no outcome yet, in schedule order.
pub fn outstanding(history: &[Event]) -> Vec<(u64, String, String)> {
    let resolved: HashSet<u64> = history
        .iter()
        .filter_map(|e| match e {
            Event::ActivityCompleted { id, .. } | Event::ActivityFailed { id, .. } => Some(*id),
            _ => None,
        })
        .collect();
    history
        .iter()
        .filter_map(|e| match e {
            Event::ActivityScheduled { id, name, input } if !resolved.contains(id) => {
                Some((*id, name.clone(), input.clone()))
            }
            _ => None,
        })
        .collect()
}

/// Turn a completion message into the history event it should append, or
/// `None` when the message is stale: unknown id, or an id that already has an
/// outcome (a redelivered activity finishing twice).
pub(crate) fn outcome_event(instance: &str, history: &[Event], item: &WorkItem) -> Option<Event> {
    let (id, ev) = match item {
        WorkItem::ActivityCompleted { id, result, .. } => (
            *id,
            Event::ActivityCompleted {
                id: *id,
                result: result.clone(),
            },
        ),
        WorkItem::ActivityFailed { id, details, .. } => (
            *id,
            Event::ActivityFailed {
                id: *id,
                details: details.clone(),
            },
        ),
        _ => return None,
    };
    let scheduled = history
        .iter()
        .any(|e| matches!(e, Event::ActivityScheduled { id: sid, .. } if *sid == id));
    if !scheduled {
        warn!(instance, id, "completion for an activity that was never scheduled; dropping");
        return None;
    }
    if !outstanding(history).iter().any(|(oid, _, _)| *oid == id) {
        tracing::debug!(instance, id, "duplicate completion; dropping");
        return None;
    }
    Some(ev)
}
