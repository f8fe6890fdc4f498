use dtf_batch::providers::HistoryStore;
use dtf_batch::providers::fs::FsHistoryStore;
use dtf_batch::runtime::{ActivityRegistry, OrchestrationStatus, Runtime};
use dtf_batch::{Event, OrchestrationContext, OrchestrationRegistry, run_turn};
use futures::future::{Either, join_all, select};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc as StdArc;
use std::time::Duration;

mod common;

fn scheduled(id: u64, name: &str, input: &str) -> Event {
    Event::ActivityScheduled {
        id,
        name: name.into(),
        input: input.into(),
    }
}

fn completed(id: u64, result: &str) -> Event {
    Event::ActivityCompleted {
        id,
        result: result.into(),
    }
}

#[test]
fn sequence_ids_follow_call_site_order() {
    let (_h, actions, _logs, out) = run_turn(Vec::new(), |ctx: OrchestrationContext| async move {
        let a = ctx.schedule_activity("A", "1");
        let b = ctx.schedule_activity("B", "2");
        let c = ctx.schedule_activity("A", "3");
        (a.sequence_id(), b.sequence_id(), c.sequence_id())
    });
    assert_eq!(out, Some((Some(1), Some(2), Some(3))));
    assert_eq!(actions.len(), 3);
}

#[test]
fn join_waits_for_every_member() {
    let history = vec![
        scheduled(1, "P", "a"),
        scheduled(2, "P", "b"),
        scheduled(3, "P", "c"),
        completed(3, "rc"),
        completed(1, "ra"),
    ];
    let orch = |ctx: OrchestrationContext| async move {
        let fs = ["a", "b", "c"].iter().map(|i| ctx.schedule_activity("P", *i)).collect();
        ctx.join(fs).await
    };
    let (_h, actions, _logs, out) = run_turn(history.clone(), orch);
    assert!(actions.is_empty());
    assert!(out.is_none(), "join must stay pending while b is outstanding");

    let mut history = history;
    history.push(Event::ActivityFailed {
        id: 2,
        details: dtf_batch::ErrorDetails::application("b broke"),
    });
    let (_h, _actions, _logs, out) = run_turn(history, orch);
    assert_eq!(
        out.unwrap(),
        vec![Ok("ra".to_string()), Err("b broke".to_string()), Ok("rc".to_string())]
    );
}

#[test]
fn select_resolves_by_poll_order_not_arrival() {
    // Both recorded; the first operand wins on every replay
    let history = vec![
        scheduled(1, "A", ""),
        scheduled(2, "B", ""),
        completed(2, "b"),
        completed(1, "a"),
    ];
    let (_h, _actions, _logs, out) = run_turn(history, |ctx: OrchestrationContext| async move {
        let a = ctx.schedule_activity("A", "");
        let b = ctx.schedule_activity("B", "");
        match select(a, b).await {
            Either::Left((v, _)) => format!("A:{}", v.unwrap()),
            Either::Right((v, _)) => format!("B:{}", v.unwrap()),
        }
    });
    assert_eq!(out.unwrap(), "A:a");
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Sum {
    total: i64,
}

#[test]
fn typed_calls_encode_and_decode() {
    let history = vec![scheduled(1, "Add", "[2,3]"), completed(1, r#"{"total":5}"#)];
    let (_h, actions, _logs, out) = run_turn(history, |ctx: OrchestrationContext| async move {
        ctx.call_activity_typed::<_, Sum>("Add", &vec![2, 3]).await
    });
    assert!(actions.is_empty());
    assert_eq!(out.unwrap(), Ok(Sum { total: 5 }));
}

#[test]
fn unencodable_input_fails_without_taking_a_call_site() {
    let (hist, actions, _logs, out) = run_turn(Vec::new(), |ctx: OrchestrationContext| async move {
        // Maps with non-string keys cannot be JSON encoded
        let bad: HashMap<(u8, u8), u8> = HashMap::from([((1, 2), 3)]);
        let err = ctx.schedule_activity_typed("Bad", &bad).await.unwrap_err();
        let next = ctx.schedule_activity("Good", "x");
        (err, next.sequence_id())
    });
    let (err, next_id) = out.unwrap();
    assert!(err.starts_with("input encode failed"), "{err}");
    assert_eq!(next_id, Some(1));
    assert_eq!(actions.len(), 1);
    assert_eq!(hist.len(), 1);
}

#[tokio::test]
async fn join_all_fan_out_runs_on_runtime_fs() {
    let td = tempfile::tempdir().unwrap();
    let store = StdArc::new(FsHistoryStore::new(td.path(), true)) as StdArc<dyn HistoryStore>;

    let activities = ActivityRegistry::builder()
        .register("Square", |input: String| async move {
            let n: u64 = input.parse().map_err(|e| format!("bad input: {e}"))?;
            // Later inputs finish first
            tokio::time::sleep(Duration::from_millis(60 - n * 10)).await;
            Ok((n * n).to_string())
        })
        .build();
    let orchestration = |ctx: OrchestrationContext, _input: String| async move {
        let calls: Vec<_> = (1..=5).map(|n| ctx.schedule_activity("Square", n.to_string())).collect();
        let results = join_all(calls).await;
        let squares: Result<Vec<String>, String> = results.into_iter().collect();
        Ok(squares?.join(","))
    };
    let orchestrations = OrchestrationRegistry::builder()
        .register("Squares", orchestration)
        .build();
    let rt = Runtime::start_with_options(
        store.clone(),
        StdArc::new(activities),
        orchestrations,
        common::fast_options(),
    )
    .await;

    rt.start_orchestration("inst-squares", "Squares", "").await.unwrap();
    let status = rt
        .wait_for_orchestration("inst-squares", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: "1,4,9,16,25".into()
        }
    );
    rt.shutdown().await;
}
