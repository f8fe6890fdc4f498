use crate::_typed_codec::{Codec, Json};
use crate::logging;
use crate::providers::in_memory::InMemoryHistoryStore;
use crate::providers::{HistoryStore, QueueDelivery, QueueKind, StoreError, WorkItem};
use crate::{ErrorDetails, Event, OrchestrationContext};
use async_trait::async_trait;
use semver::Version;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub mod completions;
pub mod dispatch;
pub mod registry;
pub mod replay;
pub mod retry;
pub mod status;

pub use dispatch::ActivityDispatcher;
pub use registry::{ActivityRegistry, OrchestrationRegistry, OrchestrationRegistryBuilder, VersionPolicy};
pub use retry::RetryPolicy;
pub use status::{InstanceState, OrchestrationStatus, derive_status};

use replay::{DefaultReplayEngine, ReplayEngine};

/// Error type returned by orchestration wait helpers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("timed out waiting for orchestration")]
    Timeout,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0}")]
    Other(String),
}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Runtime tuning knobs.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Orchestrator dispatcher loops. Different instances run in parallel;
    /// one instance never has two passes at once.
    pub orchestrator_concurrency: usize,
    /// Activity worker loops.
    pub worker_concurrency: usize,
    /// Sleep when a queue is empty.
    pub dispatcher_idle_sleep_ms: u64,
    /// Sleep after abandoning a message because its instance was busy.
    pub instance_busy_backoff_ms: u64,
    /// How long an orchestrator message stays hidden while a pass runs.
    pub orchestrator_lock_timeout: Duration,
    /// Visibility timeout for activity invocations.
    pub activity_visibility_timeout: Duration,
    /// Redeliveries allowed after the first delivery before an activity is
    /// failed with `DispatchTimeout`.
    pub max_activity_redeliveries: u32,
    pub storage_retry: RetryPolicy,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            orchestrator_concurrency: 2,
            worker_concurrency: 4,
            dispatcher_idle_sleep_ms: 10,
            instance_busy_backoff_ms: 5,
            orchestrator_lock_timeout: Duration::from_secs(30),
            activity_visibility_timeout: Duration::from_secs(30),
            max_activity_redeliveries: 3,
            storage_retry: RetryPolicy::default(),
        }
    }
}

/// How a pass settles the message that triggered it.
enum Settle {
    Ack,
    Abandon,
}

/// In-process runtime: orchestrator dispatchers that run replay passes and a
/// worker pool that executes activities, coordinated only through a
/// `HistoryStore`.
pub struct Runtime {
    joins: Mutex<Vec<JoinHandle<()>>>,
    history_store: Arc<dyn HistoryStore>,
    orchestration_registry: OrchestrationRegistry,
    dispatcher: ActivityDispatcher,
    engine: Box<dyn ReplayEngine>,
    options: RuntimeOptions,
    // Instances with a pass in flight (single writer per instance)
    active_instances: Mutex<HashSet<String>>,
    // Instances whose outstanding activities this process has dispatched
    dispatched_instances: Mutex<HashSet<String>>,
    transitions: Mutex<HashMap<String, Vec<InstanceState>>>,
    turn_counters: Mutex<HashMap<String, u64>>,
    shutdown_flag: Arc<AtomicBool>,
}

fn started_info(history: &[Event]) -> Option<(String, String, String)> {
    history.iter().find_map(|e| match e {
        Event::OrchestratorStarted { name, version, input } => Some((name.clone(), version.clone(), input.clone())),
        _ => None,
    })
}

impl Runtime {
    /// Start a new runtime using the in-memory history store.
    pub async fn start(
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        let history_store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
        Self::start_with_store(history_store, activity_registry, orchestration_registry).await
    }

    /// Start a new runtime with a custom `HistoryStore` implementation.
    pub async fn start_with_store(
        history_store: Arc<dyn HistoryStore>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(
            history_store,
            activity_registry,
            orchestration_registry,
            RuntimeOptions::default(),
        )
        .await
    }

    pub async fn start_with_options(
        history_store: Arc<dyn HistoryStore>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
            .try_init();

        let runtime = Arc::new(Self {
            joins: Mutex::new(Vec::new()),
            dispatcher: ActivityDispatcher::new(history_store.clone()),
            history_store,
            orchestration_registry,
            engine: Box::new(DefaultReplayEngine::new()),
            options,
            active_instances: Mutex::new(HashSet::new()),
            dispatched_instances: Mutex::new(HashSet::new()),
            transitions: Mutex::new(HashMap::new()),
            turn_counters: Mutex::new(HashMap::new()),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
        });

        let mut joins = Vec::new();
        for idx in 0..runtime.options.orchestrator_concurrency.max(1) {
            joins.push(runtime.clone().start_orchestration_dispatcher(idx));
        }
        joins.extend(runtime.dispatcher.spawn_workers(
            activity_registry,
            dispatch::WorkerSettings {
                concurrency: runtime.options.worker_concurrency,
                visibility_timeout: runtime.options.activity_visibility_timeout,
                max_redeliveries: runtime.options.max_activity_redeliveries,
                idle_sleep: Duration::from_millis(runtime.options.dispatcher_idle_sleep_ms),
            },
            runtime.shutdown_flag.clone(),
        ));
        runtime.joins.lock().await.extend(joins);
        runtime
    }

    pub fn history_store(&self) -> Arc<dyn HistoryStore> {
        self.history_store.clone()
    }

    /// Stop all dispatcher and worker loops. In-flight passes and activities
    /// are cut off; their messages become visible again once their locks expire.
    pub async fn shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
        let joins: Vec<JoinHandle<()>> = self.joins.lock().await.drain(..).collect();
        for j in &joins {
            j.abort();
        }
        for j in joins {
            let _ = j.await;
        }
        info!("runtime stopped");
    }

    /// Create the instance, write `OrchestratorStarted` with the version the
    /// registry picks, and wake the scheduler.
    pub async fn start_orchestration(
        &self,
        instance: &str,
        orchestration_name: &str,
        input: impl Into<String>,
    ) -> Result<(), String> {
        let (version, _) = self
            .orchestration_registry
            .resolve_for_start(orchestration_name)
            .ok_or_else(|| format!("unregistered orchestration: {orchestration_name}"))?;
        self.create_and_enqueue(instance, orchestration_name, version, input.into())
            .await
    }

    /// Start on an explicit version (semver string).
    pub async fn start_orchestration_versioned(
        &self,
        instance: &str,
        orchestration_name: &str,
        version: impl AsRef<str>,
        input: impl Into<String>,
    ) -> Result<(), String> {
        let v = Version::parse(version.as_ref()).map_err(|e| e.to_string())?;
        if self
            .orchestration_registry
            .resolve_exact(orchestration_name, &v)
            .is_none()
        {
            return Err(format!("unregistered orchestration: {orchestration_name}@{v}"));
        }
        self.create_and_enqueue(instance, orchestration_name, v, input.into())
            .await
    }

    /// Start a typed orchestration; input is serialized internally.
    pub async fn start_orchestration_typed<In: Serialize>(
        &self,
        instance: &str,
        orchestration_name: &str,
        input: &In,
    ) -> Result<(), String> {
        let payload = Json::encode(input).map_err(|e| format!("encode: {e}"))?;
        self.start_orchestration(instance, orchestration_name, payload).await
    }

    async fn create_and_enqueue(&self, instance: &str, name: &str, version: Version, input: String) -> Result<(), String> {
        let retry = &self.options.storage_retry;
        let store = &self.history_store;
        retry
            .run("create_instance", || store.create_instance(instance))
            .await
            .map_err(|e| e.to_string())?;
        let started = Event::OrchestratorStarted {
            name: name.to_string(),
            version: version.to_string(),
            input,
        };
        retry
            .run("append", || store.append(instance, vec![started.clone()]))
            .await
            .map_err(|e| format!("failed to append OrchestratorStarted: {e}"))?;
        self.record_transition(instance, InstanceState::Created).await;
        retry
            .run("enqueue", || {
                store.enqueue_work(
                    QueueKind::Orchestrator,
                    WorkItem::StartOrchestration {
                        instance: instance.to_string(),
                    },
                )
            })
            .await
            .map_err(|e| e.to_string())?;
        info!(instance, orchestration = name, version = %version, "orchestration started");
        Ok(())
    }

    /// Request termination. The next pass for the instance appends
    /// `OrchestrationTerminated` and runs no orchestrator code.
    pub async fn terminate_instance(&self, instance: &str, reason: impl Into<String>) -> Result<(), StoreError> {
        let reason = reason.into();
        let store = &self.history_store;
        self.options
            .storage_retry
            .run("enqueue", || {
                store.enqueue_work(
                    QueueKind::Orchestrator,
                    WorkItem::TerminateInstance {
                        instance: instance.to_string(),
                        reason: reason.clone(),
                    },
                )
            })
            .await?;
        info!(instance, reason = %reason, "termination requested");
        Ok(())
    }

    /// Status derived from history, reported as `Running` while a pass is in flight.
    pub async fn get_orchestration_status(&self, instance: &str) -> Result<OrchestrationStatus, StoreError> {
        let store = &self.history_store;
        let history = match self.options.storage_retry.run("read", || store.read(instance)).await {
            Ok(h) => h,
            Err(StoreError::InstanceNotFound(_)) => return Ok(OrchestrationStatus::NotFound),
            Err(e) => return Err(e),
        };
        let status = derive_status(&history);
        if !status.is_terminal()
            && status != OrchestrationStatus::NotFound
            && self.active_instances.lock().await.contains(instance)
        {
            return Ok(OrchestrationStatus::Running);
        }
        Ok(status)
    }

    /// Wait until the orchestration reaches a terminal state or the timeout elapses.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        let deadline = std::time::Instant::now() + timeout;
        let mut delay_ms: u64 = 5;
        loop {
            let status = self.get_orchestration_status(instance).await?;
            // The pass that wrote the terminal event may still be settling
            if status.is_terminal() && !self.active_instances.lock().await.contains(instance) {
                return Ok(status);
            }
            if std::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            delay_ms = (delay_ms.saturating_mul(2)).min(100);
        }
    }

    /// State changes this process observed for an instance, oldest first.
    pub async fn transitions(&self, instance: &str) -> Vec<InstanceState> {
        self.transitions
            .lock()
            .await
            .get(instance)
            .cloned()
            .unwrap_or_default()
    }

    async fn record_transition(&self, instance: &str, next: InstanceState) {
        let mut g = self.transitions.lock().await;
        let trail = g.entry(instance.to_string()).or_default();
        match trail.last().copied() {
            Some(prev) if prev == next => {}
            Some(prev) if !prev.can_transition_to(next) => {
                warn!(instance, from = prev.as_str(), to = next.as_str(), "ignoring invalid state transition");
            }
            _ => trail.push(next),
        }
    }

    async fn next_turn(&self, instance: &str) -> u64 {
        let mut g = self.turn_counters.lock().await;
        let counter = g.entry(instance.to_string()).or_insert(0);
        let turn = *counter;
        *counter += 1;
        turn
    }

    fn start_orchestration_dispatcher(self: Arc<Self>, idx: usize) -> JoinHandle<()> {
        tokio::spawn(async move {
            let idle = Duration::from_millis(self.options.dispatcher_idle_sleep_ms);
            loop {
                if self.shutdown_flag.load(Ordering::Relaxed) {
                    debug!(dispatcher = idx, "orchestrator dispatcher exiting");
                    break;
                }
                match self
                    .history_store
                    .dequeue_peek_lock(QueueKind::Orchestrator, self.options.orchestrator_lock_timeout)
                    .await
                {
                    Ok(Some(delivery)) => self.process_orchestrator_delivery(delivery).await,
                    Ok(None) => tokio::time::sleep(idle).await,
                    Err(e) => {
                        warn!(dispatcher = idx, error = %e, "orchestrator dequeue failed");
                        tokio::time::sleep(idle).await;
                    }
                }
            }
        })
    }

    async fn process_orchestrator_delivery(&self, delivery: QueueDelivery) {
        let instance = delivery.item.instance().to_string();
        let token = delivery.lock_token;
        if !self.active_instances.lock().await.insert(instance.clone()) {
            // Another pass owns the instance; let the message come back later
            debug!(instance = %instance, "instance busy; abandoning message");
            let _ = self.history_store.abandon(QueueKind::Orchestrator, &token).await;
            tokio::time::sleep(Duration::from_millis(self.options.instance_busy_backoff_ms)).await;
            return;
        }
        let settle = self.run_pass(&instance, delivery.item).await;
        let settled = match settle {
            Settle::Ack => self.history_store.ack(QueueKind::Orchestrator, &token).await,
            Settle::Abandon => self.history_store.abandon(QueueKind::Orchestrator, &token).await,
        };
        if let Err(e) = settled {
            warn!(instance = %instance, error = %e, "could not settle orchestrator message");
        }
        self.active_instances.lock().await.remove(&instance);
    }

    /// One scheduler pass: fold the message into history, replay, persist the
    /// new decisions and dispatch them.
    async fn run_pass(&self, instance: &str, item: WorkItem) -> Settle {
        let retry = &self.options.storage_retry;
        let store = &self.history_store;
        let mut history = match retry.run("read", || store.read(instance)).await {
            Ok(h) => h,
            Err(StoreError::InstanceNotFound(_)) => {
                warn!(instance, "message for unknown instance; dropping");
                return Settle::Ack;
            }
            Err(e) => {
                error!(instance, error = %e, "history read failed; message will be redelivered");
                return Settle::Abandon;
            }
        };
        if history.iter().any(Event::is_terminal) {
            debug!(instance, item = ?item, "instance is terminal; dropping message");
            return Settle::Ack;
        }
        let Some((name, version, input)) = started_info(&history) else {
            error!(instance, "history has no OrchestratorStarted; dropping message");
            return Settle::Ack;
        };

        let incoming = match &item {
            WorkItem::StartOrchestration { .. } => None,
            // A stale outcome still gets a pass: an earlier pass may have
            // recorded it and then failed before persisting its decisions
            WorkItem::ActivityCompleted { .. } | WorkItem::ActivityFailed { .. } => {
                completions::outcome_event(instance, &history, &item)
            }
            WorkItem::TerminateInstance { reason, .. } => {
                let ev = Event::OrchestrationTerminated { reason: reason.clone() };
                if let Err(e) = retry.run("append", || store.append(instance, vec![ev.clone()])).await {
                    error!(instance, error = %e, "failed to append OrchestrationTerminated");
                    return Settle::Abandon;
                }
                self.record_transition(instance, InstanceState::Terminated).await;
                info!(instance, reason = %reason, "orchestration terminated");
                return Settle::Ack;
            }
            WorkItem::ActivityExecute { .. } => {
                error!(instance, "activity message on orchestrator queue; dropping");
                return Settle::Ack;
            }
        };
        if let Some(ev) = incoming {
            if let Err(e) = retry.run("append", || store.append(instance, vec![ev.clone()])).await {
                error!(instance, error = %e, "failed to append completion");
                return Settle::Abandon;
            }
            history.push(ev);
        }

        let handler = Version::parse(&version)
            .ok()
            .and_then(|v| self.orchestration_registry.resolve_exact(&name, &v));
        let Some(handler) = handler else {
            let message = format!("orchestration {name}@{version} is not registered");
            error!(instance, %message, "cannot run pass");
            return self
                .finish(
                    instance,
                    Vec::new(),
                    Event::OrchestrationFailed {
                        details: ErrorDetails::Configuration { message },
                    },
                    InstanceState::Failed,
                )
                .await;
        };

        let turn_index = self.next_turn(instance).await;
        let baseline = history.len();
        let outcome = self.engine.replay(history, turn_index, handler, input);
        logging::emit(instance, turn_index, &outcome.logs);

        if let Some(message) = outcome.nondeterminism {
            error!(instance, turn_index, %message, "nondeterministic replay");
            return self
                .finish(
                    instance,
                    Vec::new(),
                    Event::OrchestrationFailed {
                        details: ErrorDetails::DeterminismViolation { message },
                    },
                    InstanceState::Failed,
                )
                .await;
        }

        let deltas = outcome.history[baseline..].to_vec();
        if let Some(result) = outcome.output {
            let (terminal, state) = match result {
                Ok(output) => (Event::OrchestratorCompleted { output }, InstanceState::Completed),
                Err(message) => (
                    Event::OrchestrationFailed {
                        details: ErrorDetails::Orchestration { message },
                    },
                    InstanceState::Failed,
                ),
            };
            return self.finish(instance, deltas, terminal, state).await;
        }

        if !deltas.is_empty()
            && let Err(e) = retry.run("append", || store.append(instance, deltas.clone())).await
        {
            error!(instance, turn_index, error = %e, "failed to persist new decisions");
            return Settle::Abandon;
        }

        // First pass in this process dispatches everything outstanding, which
        // covers work lost between a crash and the previous enqueue.
        let first_in_process = self.dispatched_instances.lock().await.insert(instance.to_string());
        let to_dispatch: Vec<(u64, String, String)> = if first_in_process {
            completions::outstanding(&outcome.history)
        } else {
            outcome
                .actions
                .iter()
                .map(|a| match a {
                    crate::Action::CallActivity { id, name, input } => (*id, name.clone(), input.clone()),
                })
                .collect()
        };
        for (id, name, input) in &to_dispatch {
            if let Err(e) = retry
                .run("enqueue", || self.dispatcher.schedule(instance, *id, name, input))
                .await
            {
                error!(instance, id, error = %e, "failed to dispatch activity");
                self.dispatched_instances.lock().await.remove(instance);
                return Settle::Abandon;
            }
        }

        if !outcome.actions.is_empty() {
            self.record_transition(instance, InstanceState::Running).await;
            self.record_transition(instance, InstanceState::Suspended).await;
            debug!(
                instance,
                turn_index,
                scheduled = outcome.actions.len(),
                dispatched = to_dispatch.len(),
                "instance suspended"
            );
        }
        Settle::Ack
    }

    async fn finish(&self, instance: &str, mut events: Vec<Event>, terminal: Event, state: InstanceState) -> Settle {
        events.push(terminal);
        let store = &self.history_store;
        if let Err(e) = self
            .options
            .storage_retry
            .run("append", || store.append(instance, events.clone()))
            .await
        {
            error!(instance, error = %e, "failed to append terminal event");
            return Settle::Abandon;
        }
        self.record_transition(instance, InstanceState::Running).await;
        self.record_transition(instance, state).await;
        match state {
            InstanceState::Completed => info!(instance, "orchestration completed"),
            _ => warn!(instance, state = state.as_str(), "orchestration ended without completing"),
        }
        Settle::Ack
    }
}
