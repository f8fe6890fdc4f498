//! Replay-driven durable orchestration with a fan-out/fan-in batch controller.
//!
//! Orchestrations are plain `async` functions over an [`OrchestrationContext`].
//! Every pass replays the function against the instance's append-only
//! [`Event`] history: call sites that already have a recorded result resolve
//! immediately, and the first call sites without one become new [`Action`]s.
//! The crate provides:
//!
//! - Public data model: `Event`, `Action`, `ErrorDetails`
//! - Pure turn driver: `run_turn`, `run_turn_with`, and `Executor`
//! - Durable futures (`DurableFuture`, `JoinFuture`) correlated by sequence id
//! - A runtime with a history store, activity dispatcher and scheduler
//! - The batch controller and the document re-ingestion workflow built on it
use std::collections::HashMap;
use std::future::Future;
use std::pin::pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

pub mod batch;
pub mod client;
pub mod error;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod reingest;
pub mod runtime;

pub use crate::error::ErrorDetails;
pub use crate::futures::{DurableFuture, JoinFuture};
pub use crate::logging::{LogLevel, LogRecord, ReplaySafeLogger};
pub use runtime::{OrchestrationHandler, OrchestrationRegistry, OrchestrationRegistryBuilder, OrchestrationStatus};

use crate::_typed_codec::Codec;
use serde::{Deserialize, Serialize};

// Internal codec utilities for typed I/O
pub(crate) mod _typed_codec {
    use serde::{Serialize, de::DeserializeOwned};
    use serde_json::Value;
    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }
    pub struct Json;
    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            // Plain strings travel unquoted
            match serde_json::to_value(v) {
                Ok(Value::String(s)) => Ok(s),
                Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                Err(_) => {
                    let val = Value::String(s.to_string());
                    serde_json::from_value(val).map_err(|e| e.to_string())
                }
            }
        }
    }
}

/// Append-only orchestration history entries persisted by a provider and
/// consumed during replay. `id` is the sequence number assigned when the
/// activity was first scheduled; it pairs a scheduling event with its outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Event {
    /// Instance was created for the named orchestration at a pinned version.
    OrchestratorStarted { name: String, version: String, input: String },
    /// Activity call site recorded with its sequence id and input.
    ActivityScheduled { id: u64, name: String, input: String },
    /// Activity completed successfully with a result.
    ActivityCompleted { id: u64, result: String },
    /// Activity failed, either in its body or because the dispatcher gave up.
    ActivityFailed { id: u64, details: ErrorDetails },
    /// Orchestrator function returned normally.
    OrchestratorCompleted { output: String },
    /// Orchestrator function failed or could not be replayed.
    OrchestrationFailed { details: ErrorDetails },
    /// Instance was cancelled from outside.
    OrchestrationTerminated { reason: String },
}

impl Event {
    /// Sequence id carried by activity events.
    pub fn correlation_id(&self) -> Option<u64> {
        match self {
            Event::ActivityScheduled { id, .. }
            | Event::ActivityCompleted { id, .. }
            | Event::ActivityFailed { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// True for events that end an instance. Nothing may follow them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::OrchestratorCompleted { .. }
                | Event::OrchestrationFailed { .. }
                | Event::OrchestrationTerminated { .. }
        )
    }
}

/// Declarative decisions produced by an orchestration turn. The host is
/// responsible for dispatching them; the matching `ActivityScheduled` event is
/// already part of the turn's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Schedule an activity invocation.
    CallActivity { id: u64, name: String, input: String },
}

/// A call site recovered from history.
#[derive(Debug, Clone)]
struct RecordedCall {
    id: u64,
    name: String,
    input: String,
}

#[derive(Debug)]
struct CtxInner {
    history: Vec<Event>,
    actions: Vec<Action>,

    // Call sites recorded by earlier passes, in the order they were reached
    recorded: Vec<RecordedCall>,
    // Replay cursor into `recorded`; only moves forward
    cursor: usize,
    // Outcomes keyed by sequence id
    resolved: HashMap<u64, Result<String, String>>,
    next_correlation_id: u64,

    turn_index: u64,
    log_buffer: Vec<LogRecord>,
    nondeterminism: Option<String>,
}

impl CtxInner {
    fn new(history: Vec<Event>) -> Self {
        let mut recorded = Vec::new();
        let mut resolved = HashMap::new();
        let mut max_id = 0u64;
        for ev in &history {
            match ev {
                Event::ActivityScheduled { id, name, input } => {
                    recorded.push(RecordedCall {
                        id: *id,
                        name: name.clone(),
                        input: input.clone(),
                    });
                }
                Event::ActivityCompleted { id, result } => {
                    resolved.entry(*id).or_insert_with(|| Ok(result.clone()));
                }
                Event::ActivityFailed { id, details } => {
                    resolved.entry(*id).or_insert_with(|| Err(details.display_message()));
                }
                _ => {}
            }
            if let Some(id) = ev.correlation_id() {
                max_id = max_id.max(id);
            }
        }
        Self {
            history,
            actions: Vec::new(),
            recorded,
            cursor: 0,
            resolved,
            next_correlation_id: max_id.saturating_add(1),
            turn_index: 0,
            log_buffer: Vec::new(),
            nondeterminism: None,
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_correlation_id;
        self.next_correlation_id += 1;
        id
    }

    fn is_replaying(&self) -> bool {
        self.cursor < self.recorded.len()
    }

    /// Bind a call site to a sequence id: adopt the recorded one at the cursor,
    /// or record a brand new decision once history is exhausted. Returns `None`
    /// when the call site contradicts history.
    fn bind_call_site(&mut self, name: String, input: String) -> Option<u64> {
        if self.nondeterminism.is_some() {
            return None;
        }
        if let Some(rec) = self.recorded.get(self.cursor) {
            if rec.name != name || rec.input != input {
                self.nondeterminism = Some(format!(
                    "call site #{} (id {}) was recorded as {}({}) but the orchestrator requested {}({})",
                    self.cursor, rec.id, rec.name, rec.input, name, input
                ));
                return None;
            }
            let id = rec.id;
            self.cursor += 1;
            return Some(id);
        }
        let id = self.next_id();
        self.history.push(Event::ActivityScheduled {
            id,
            name: name.clone(),
            input: input.clone(),
        });
        self.actions.push(Action::CallActivity { id, name, input });
        Some(id)
    }
}

/// User-facing orchestration context for scheduling and replay-safe helpers.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Construct a new context from an existing history vector.
    pub fn new(history: Vec<Event>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(history))),
        }
    }

    /// The zero-based turn counter assigned by the host for diagnostics.
    pub fn turn_index(&self) -> u64 {
        self.inner.lock().unwrap().turn_index
    }
    pub(crate) fn set_turn_index(&self, idx: u64) {
        self.inner.lock().unwrap().turn_index = idx;
    }

    /// True while the orchestrator is still re-walking call sites that an
    /// earlier pass already recorded.
    pub fn is_replaying(&self) -> bool {
        self.inner.lock().unwrap().is_replaying()
    }

    /// Replay-safe logger tagged with `category`.
    pub fn logger(&self, category: impl Into<String>) -> ReplaySafeLogger {
        ReplaySafeLogger::new(self.clone(), category.into())
    }

    pub(crate) fn push_log(&self, level: LogLevel, category: &str, message: String) {
        let mut inner = self.inner.lock().unwrap();
        let replaying = inner.is_replaying();
        inner.log_buffer.push(LogRecord {
            level,
            category: category.to_string(),
            message,
            replaying,
        });
    }

    /// Schedule an activity and return a `DurableFuture` correlated to it.
    ///
    /// Call sites are matched to history purely by the order in which they are
    /// reached. A call site that disagrees with the recorded one marks the pass
    /// nondeterministic and never resolves.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        let bound = self.inner.lock().unwrap().bind_call_site(name.into(), input.into());
        match bound {
            Some(id) => DurableFuture::bound(id, self.clone()),
            None => DurableFuture::stalled(self.clone()),
        }
    }

    /// Await an activity result as a raw String.
    pub fn call_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        self.schedule_activity(name, input)
    }

    /// Typed helper: serializes input now, decodes the output when awaited.
    pub fn schedule_activity_typed<In: Serialize>(&self, name: impl Into<String>, input: &In) -> DurableFuture {
        match crate::_typed_codec::Json::encode(input) {
            Ok(payload) => self.schedule_activity(name, payload),
            Err(e) => DurableFuture::rejected(format!("input encode failed: {e}"), self.clone()),
        }
    }

    /// Typed call: `schedule_activity_typed` followed by `into_activity_typed`.
    pub fn call_activity_typed<In: Serialize, Out: serde::de::DeserializeOwned>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> impl Future<Output = Result<Out, String>> {
        self.schedule_activity_typed(name, input).into_activity_typed::<Out>()
    }

    /// All-or-nothing join; outputs come back in the order given.
    pub fn join(&self, futures: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture::new(futures)
    }

    pub(crate) fn outcome(&self, id: u64) -> Option<Result<String, String>> {
        self.inner.lock().unwrap().resolved.get(&id).cloned()
    }

    fn finish(&self) -> (Vec<Event>, Vec<Action>, Vec<LogRecord>, Option<String>, usize, usize) {
        let mut inner = self.inner.lock().unwrap();
        let actions = std::mem::take(&mut inner.actions);
        let logs = std::mem::take(&mut inner.log_buffer);
        let history = inner.history.clone();
        (
            history,
            actions,
            logs,
            inner.nondeterminism.take(),
            inner.cursor,
            inner.recorded.len(),
        )
    }
}

fn poll_once<F: Future>(fut: F) -> Poll<F::Output> {
    let mut cx = Context::from_waker(Waker::noop());
    let fut = pin!(fut);
    fut.poll(&mut cx)
}

/// Everything one replay pass produced.
#[derive(Debug)]
pub struct TurnOutcome<O> {
    /// Input history plus the `ActivityScheduled` events of new decisions.
    pub history: Vec<Event>,
    /// New decisions, in call-site order.
    pub actions: Vec<Action>,
    /// Buffered logger records, replayed ones included.
    pub logs: Vec<LogRecord>,
    /// Set when the orchestrator function returned.
    pub output: Option<O>,
    /// Set when the pass diverged from recorded history.
    pub nondeterminism: Option<String>,
}

/// Tuple returned by `run_turn`: updated history, new actions, buffered logs
/// and an optional output.
pub type TurnResult<O> = (Vec<Event>, Vec<Action>, Vec<LogRecord>, Option<O>);

/// Poll the orchestrator once against `history`.
pub fn run_turn<O, F>(history: Vec<Event>, orchestrator: impl Fn(OrchestrationContext) -> F) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    let t = run_turn_with(history, 0, orchestrator);
    (t.history, t.actions, t.logs, t.output)
}

/// Same as `run_turn` but annotates the context with a caller-supplied turn
/// index and reports divergence from history.
pub fn run_turn_with<O, F>(
    history: Vec<Event>,
    turn_index: u64,
    orchestrator: impl Fn(OrchestrationContext) -> F,
) -> TurnOutcome<O>
where
    F: Future<Output = O>,
{
    let ctx = OrchestrationContext::new(history);
    ctx.set_turn_index(turn_index);
    let polled = poll_once(orchestrator(ctx.clone()));
    let (history, actions, logs, mut nondeterminism, cursor, recorded) = ctx.finish();
    if nondeterminism.is_none() && cursor < recorded {
        nondeterminism = Some(format!(
            "orchestrator reached {cursor} of {recorded} recorded call sites before {}",
            if polled.is_ready() { "returning" } else { "suspending" }
        ));
    }
    let output = match polled {
        Poll::Ready(out) if nondeterminism.is_none() => Some(out),
        _ => None,
    };
    TurnOutcome {
        history,
        actions,
        logs,
        output,
        nondeterminism,
    }
}

/// Helper for single-threaded, host-driven execution in tests.
pub struct Executor;

impl Executor {
    /// Drives an orchestrator by alternately replaying one turn and invoking
    /// `execute_actions` to materialize requested actions into history, until
    /// the orchestrator completes. Returns `Err` on nondeterminism.
    pub fn drive_to_completion<O, F, X>(
        mut history: Vec<Event>,
        orchestrator: impl Fn(OrchestrationContext) -> F,
        mut execute_actions: X,
    ) -> Result<(Vec<Event>, O), String>
    where
        F: Future<Output = O>,
        X: FnMut(Vec<Action>, &mut Vec<Event>),
    {
        loop {
            let turn = run_turn_with(history, 0, &orchestrator);
            if let Some(msg) = turn.nondeterminism {
                return Err(msg);
            }
            history = turn.history;
            if let Some(out) = turn.output {
                return Ok((history, out));
            }
            if turn.actions.is_empty() {
                return Err("orchestrator is waiting but requested no new work".to_string());
            }
            execute_actions(turn.actions, &mut history);
        }
    }
}
