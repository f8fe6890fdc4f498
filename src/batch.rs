//! Fan-out/fan-in in fixed-size batches.
//!
//! The plan is recomputed from the replayed item list on every pass and never
//! stored. Each batch schedules all of its call sites in one pass, then joins;
//! batch `k + 1` is not reached until every call site of batch `k` has an
//! outcome in history.

use serde::Serialize;

use crate::{OrchestrationContext, ReplaySafeLogger, durable_info, durable_warn};

/// Left-to-right partition of a list into slices of `batch_size`; the last
/// slice may be shorter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan<T> {
    batch_size: usize,
    batches: Vec<Vec<T>>,
}

impl<T: Clone> BatchPlan<T> {
    pub fn new(items: &[T], batch_size: usize) -> Result<Self, String> {
        if batch_size == 0 {
            return Err("batch size must be greater than zero".to_string());
        }
        Ok(Self {
            batch_size,
            batches: items.chunks(batch_size).map(<[T]>::to_vec).collect(),
        })
    }
}

impl<T> BatchPlan<T> {
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of join points, `ceil(items / batch_size)`.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn sizes(&self) -> Vec<usize> {
        self.batches.iter().map(Vec::len).collect()
    }

    pub fn batches(&self) -> &[Vec<T>] {
        &self.batches
    }
}

/// Run `activity` once per item, one batch at a time.
///
/// Results come back in item order. If any item of a batch fails, the whole
/// batch join is awaited and then the first failure is returned; later
/// batches are never scheduled.
pub async fn run_in_batches<T: Serialize + Clone>(
    ctx: &OrchestrationContext,
    log: &ReplaySafeLogger,
    activity: &str,
    items: &[T],
    batch_size: usize,
) -> Result<Vec<String>, String> {
    let plan = BatchPlan::new(items, batch_size)?;
    let total = plan.len();
    let mut results = Vec::with_capacity(items.len());
    for (idx, batch) in plan.batches().iter().enumerate() {
        let k = idx + 1;
        durable_info!(log, "Processing batch {k} of {total}.");
        let calls = batch
            .iter()
            .map(|item| ctx.schedule_activity_typed(activity, item))
            .collect();
        let outcomes = ctx.join(calls).await;

        let first_failure = outcomes
            .iter()
            .enumerate()
            .find_map(|(pos, out)| out.as_ref().err().map(|e| (idx * plan.batch_size() + pos, e.clone())));
        if let Some((item_idx, err)) = first_failure {
            durable_warn!(log, "Batch {k} of {total} failed at item {}: {err}", item_idx + 1);
            return Err(format!("batch {k} of {total} failed: item {}: {err}", item_idx + 1));
        }
        results.extend(outcomes.into_iter().flatten());
        durable_info!(log, "Finished processing batch {k} of {total}.");
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Action, ErrorDetails, Event, Executor};

    fn docs(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("doc-{i:05}")).collect()
    }

    #[test]
    fn plan_keeps_order_with_short_tail() {
        let plan = BatchPlan::new(&docs(23), 5).unwrap();
        assert_eq!(plan.len(), 5);
        assert_eq!(plan.sizes(), vec![5, 5, 5, 5, 3]);
        assert_eq!(plan.batches()[4], vec!["doc-00021", "doc-00022", "doc-00023"]);

        let exact = BatchPlan::new(&docs(10), 5).unwrap();
        assert_eq!(exact.sizes(), vec![5, 5]);
        let empty = BatchPlan::<String>::new(&[], 5).unwrap();
        assert!(empty.is_empty());
        assert!(BatchPlan::new(&docs(3), 0).is_err());
    }

    #[test]
    fn each_turn_schedules_one_whole_batch() {
        let items = docs(23);
        let mut per_turn = Vec::new();
        let (history, out) = Executor::drive_to_completion(
            Vec::new(),
            |ctx| {
                let items = items.clone();
                async move {
                    let log = ctx.logger("test");
                    run_in_batches(&ctx, &log, "ProcessItem", &items, 5).await
                }
            },
            |actions: Vec<Action>, h: &mut Vec<Event>| {
                per_turn.push(actions.len());
                for a in actions {
                    let Action::CallActivity { id, input, .. } = a;
                    h.push(Event::ActivityCompleted {
                        id,
                        result: format!("done:{input}"),
                    });
                }
            },
        )
        .unwrap();
        assert_eq!(per_turn, vec![5, 5, 5, 5, 3]);
        let out = out.unwrap();
        assert_eq!(out.len(), 23);
        assert_eq!(out[11], "done:doc-00012");
        let scheduled = history
            .iter()
            .filter(|e| matches!(e, Event::ActivityScheduled { .. }))
            .count();
        assert_eq!(scheduled, 23);
    }

    #[test]
    fn failed_item_fails_the_batch_and_stops() {
        let items = docs(23);
        let (history, out) = Executor::drive_to_completion(
            Vec::new(),
            |ctx| {
                let items = items.clone();
                async move {
                    let log = ctx.logger("test");
                    run_in_batches(&ctx, &log, "ProcessItem", &items, 5).await
                }
            },
            |actions: Vec<Action>, h: &mut Vec<Event>| {
                for a in actions {
                    let Action::CallActivity { id, input, .. } = a;
                    if input == "doc-00012" {
                        h.push(Event::ActivityFailed {
                            id,
                            details: ErrorDetails::DispatchTimeout { attempts: 4 },
                        });
                    } else {
                        h.push(Event::ActivityCompleted { id, result: "ok".into() });
                    }
                }
            },
        )
        .unwrap();
        let err = out.unwrap_err();
        assert!(err.starts_with("batch 3 of 5 failed: item 12"), "{err}");
        assert!(err.contains("dispatch timeout"));
        let inputs: Vec<&str> = history
            .iter()
            .filter_map(|e| match e {
                Event::ActivityScheduled { input, .. } => Some(input.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(inputs.len(), 15);
        assert!(!inputs.contains(&"doc-00016"));
    }

    #[test]
    fn batch_logs_are_emitted_once_across_passes() {
        let items = docs(7);
        let orch = |ctx: OrchestrationContext| {
            let items = items.clone();
            async move {
                let log = ctx.logger("test");
                run_in_batches(&ctx, &log, "P", &items, 5).await
            }
        };
        let mut fresh = Vec::new();
        let mut history = Vec::new();
        loop {
            let turn = crate::run_turn_with(history, 0, &orch);
            fresh.extend(turn.logs.into_iter().filter(|r| !r.replaying).map(|r| r.message));
            history = turn.history;
            if turn.output.is_some() {
                break;
            }
            for a in turn.actions {
                let Action::CallActivity { id, .. } = a;
                history.push(Event::ActivityCompleted { id, result: "ok".into() });
            }
        }
        assert_eq!(
            fresh,
            vec![
                "Processing batch 1 of 2.",
                "Finished processing batch 1 of 2.",
                "Processing batch 2 of 2.",
                "Finished processing batch 2 of 2.",
            ]
        );
    }
}
