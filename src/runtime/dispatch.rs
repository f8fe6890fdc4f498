//! Activity dispatcher and worker pool.
//!
//! Scheduling is fire-and-forget: the dispatcher only enqueues an
//! `ActivityExecute` message. Workers take messages under a peek-lock whose
//! visibility window is the activity timeout; a worker that dies or hangs
//! simply never acks, the lock expires and another worker gets the message
//! with a higher delivery count. Once the count passes the redelivery budget
//! the message is settled as `ActivityFailed { DispatchTimeout }` instead of
//! being run again.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::registry::ActivityRegistry;
use crate::ErrorDetails;
use crate::providers::{HistoryStore, QueueDelivery, QueueKind, StoreError, WorkItem};

/// Worker pool settings, taken from `RuntimeOptions`.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub visibility_timeout: Duration,
    pub max_redeliveries: u32,
    pub idle_sleep: Duration,
}

#[derive(Clone)]
pub struct ActivityDispatcher {
    store: Arc<dyn HistoryStore>,
}

impl ActivityDispatcher {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    /// Enqueue one invocation. The invocation id is the call site's sequence
    /// id, so scheduling the same call site twice enqueues it once.
    pub async fn schedule(&self, instance: &str, id: u64, name: &str, input: &str) -> Result<u64, StoreError> {
        self.store
            .enqueue_work(
                QueueKind::Worker,
                WorkItem::ActivityExecute {
                    instance: instance.to_string(),
                    id,
                    name: name.to_string(),
                    input: input.to_string(),
                },
            )
            .await?;
        debug!(instance, id, name, "activity scheduled");
        Ok(id)
    }

    /// Report a successful invocation back to the owning instance.
    pub async fn complete(&self, instance: &str, id: u64, result: String) -> Result<(), StoreError> {
        self.store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::ActivityCompleted {
                    instance: instance.to_string(),
                    id,
                    result,
                },
            )
            .await
    }

    /// Report a failed invocation back to the owning instance.
    pub async fn fail(&self, instance: &str, id: u64, details: ErrorDetails) -> Result<(), StoreError> {
        self.store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::ActivityFailed {
                    instance: instance.to_string(),
                    id,
                    details,
                },
            )
            .await
    }

    pub(crate) fn spawn_workers(
        &self,
        activities: Arc<ActivityRegistry>,
        settings: WorkerSettings,
        shutdown: Arc<AtomicBool>,
    ) -> Vec<JoinHandle<()>> {
        (0..settings.concurrency.max(1))
            .map(|worker_idx| {
                let worker = Worker {
                    id: format!("work-{worker_idx}"),
                    dispatcher: self.clone(),
                    activities: activities.clone(),
                    settings: settings.clone(),
                    shutdown: shutdown.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect()
    }
}

struct Worker {
    id: String,
    dispatcher: ActivityDispatcher,
    activities: Arc<ActivityRegistry>,
    settings: WorkerSettings,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    async fn run(self) {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                debug!(worker_id = %self.id, "worker exiting");
                break;
            }
            match self
                .dispatcher
                .store
                .dequeue_peek_lock(QueueKind::Worker, self.settings.visibility_timeout)
                .await
            {
                Ok(Some(delivery)) => self.handle(delivery).await,
                Ok(None) => tokio::time::sleep(self.settings.idle_sleep).await,
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "worker dequeue failed");
                    tokio::time::sleep(self.settings.idle_sleep).await;
                }
            }
        }
    }

    async fn handle(&self, delivery: QueueDelivery) {
        let store = &self.dispatcher.store;
        let token = delivery.lock_token;
        let (instance, id, name, input) = match delivery.item {
            WorkItem::ActivityExecute { instance, id, name, input } => (instance, id, name, input),
            other => {
                error!(worker_id = %self.id, item = ?other, "unexpected message on worker queue; dropping");
                let _ = store.ack(QueueKind::Worker, &token).await;
                return;
            }
        };

        // Deliveries that actually ran the activity
        let attempts = delivery.delivery_count.saturating_sub(1);
        if attempts > self.settings.max_redeliveries {
            warn!(
                instance_id = %instance,
                activity_name = %name,
                activity_id = id,
                attempts,
                "activity never reported back; giving up"
            );
            let sent = self
                .dispatcher
                .fail(&instance, id, ErrorDetails::DispatchTimeout { attempts })
                .await;
            self.settle(sent, &token).await;
            return;
        }
        if delivery.delivery_count > 1 {
            info!(
                instance_id = %instance,
                activity_name = %name,
                activity_id = id,
                delivery = delivery.delivery_count,
                "redelivering activity after visibility timeout"
            );
        }

        // Results for terminated instances would be dropped anyway
        if let Ok(history) = store.read(&instance).await
            && history.iter().any(crate::Event::is_terminal)
        {
            debug!(instance_id = %instance, activity_id = id, "instance already finished; skipping activity");
            let _ = store.ack(QueueKind::Worker, &token).await;
            return;
        }

        debug!(
            instance_id = %instance,
            activity_name = %name,
            activity_id = id,
            worker_id = %self.id,
            "Activity started"
        );
        let started = Instant::now();
        let sent = match self.activities.get(&name) {
            Some(handler) => match handler.invoke(input).await {
                Ok(result) => {
                    debug!(
                        instance_id = %instance,
                        activity_name = %name,
                        activity_id = id,
                        worker_id = %self.id,
                        outcome = "success",
                        duration_ms = started.elapsed().as_millis() as u64,
                        "Activity completed"
                    );
                    self.dispatcher.complete(&instance, id, result).await
                }
                Err(message) => {
                    warn!(
                        instance_id = %instance,
                        activity_name = %name,
                        activity_id = id,
                        worker_id = %self.id,
                        outcome = "app_error",
                        duration_ms = started.elapsed().as_millis() as u64,
                        error = %message,
                        "Activity failed"
                    );
                    self.dispatcher
                        .fail(&instance, id, ErrorDetails::Application { message })
                        .await
                }
            },
            None => {
                error!(instance_id = %instance, activity_name = %name, activity_id = id, "activity not registered");
                self.dispatcher
                    .fail(
                        &instance,
                        id,
                        ErrorDetails::Configuration {
                            message: format!("unregistered activity: {name}"),
                        },
                    )
                    .await
            }
        };
        self.settle(sent, &token).await;
    }

    /// Ack once the outcome is on the orchestrator queue; otherwise release the
    /// lock so the invocation is retried.
    async fn settle(&self, sent: Result<(), StoreError>, token: &str) {
        let store = &self.dispatcher.store;
        match sent {
            Ok(()) => match store.ack(QueueKind::Worker, token).await {
                Ok(()) => {}
                Err(StoreError::LockLost(_)) => {
                    // Redelivered meanwhile; history keeps only the first outcome
                    debug!(worker_id = %self.id, "lock expired before ack");
                }
                Err(e) => warn!(worker_id = %self.id, error = %e, "ack failed"),
            },
            Err(e) => {
                warn!(worker_id = %self.id, error = %e, "could not report activity outcome; abandoning");
                let _ = store.abandon(QueueKind::Worker, token).await;
            }
        }
    }
}
