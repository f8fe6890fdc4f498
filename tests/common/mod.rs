#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dtf_batch::Event;
use dtf_batch::providers::{HistoryStore, QueueDelivery, QueueKind, StoreError, WorkItem};
use dtf_batch::reingest::document::generate_catalog;
use dtf_batch::reingest::{
    Collaborators, CompletionNotifier, Document, DocumentProcessor, DocumentSource, NotificationReceipt,
};
use dtf_batch::runtime::{RetryPolicy, RuntimeOptions};

/// Poll `store` until `pred` holds for the instance history or `timeout_ms` elapses.
pub async fn wait_for_history<F>(store: Arc<dyn HistoryStore>, instance: &str, pred: F, timeout_ms: u64) -> bool
where
    F: Fn(&Vec<Event>) -> bool,
{
    let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if let Ok(hist) = store.read(instance).await
            && pred(&hist)
        {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Inputs of every `ActivityScheduled` for `name`, in history order.
pub fn scheduled_inputs(history: &[Event], name: &str) -> Vec<String> {
    history
        .iter()
        .filter_map(|e| match e {
            Event::ActivityScheduled { name: n, input, .. } if n == name => Some(input.clone()),
            _ => None,
        })
        .collect()
}

pub fn completed_count(history: &[Event]) -> usize {
    history
        .iter()
        .filter(|e| matches!(e, Event::ActivityCompleted { .. }))
        .count()
}

/// Document id carried by a `ProcessItem` input.
pub fn doc_id(input: &str) -> String {
    serde_json::from_str::<Document>(input)
        .map(|d| d.id)
        .unwrap_or_default()
}

/// Short timeouts so redelivery and recovery happen within a test.
pub fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        worker_concurrency: 8,
        dispatcher_idle_sleep_ms: 2,
        orchestrator_lock_timeout: Duration::from_millis(500),
        activity_visibility_timeout: Duration::from_millis(300),
        max_activity_redeliveries: 2,
        storage_retry: RetryPolicy {
            max_attempts: 6,
            initial_backoff: Duration::from_millis(2),
            max_backoff: Duration::from_millis(20),
        },
        ..Default::default()
    }
}

/// Fixed catalog of `count` documents.
pub struct FixedSource(pub Vec<Document>);

impl FixedSource {
    pub fn new(count: usize) -> Self {
        Self(generate_catalog(count))
    }
}

#[async_trait]
impl DocumentSource for FixedSource {
    async fn list_pending(&self) -> Result<Vec<Document>, String> {
        Ok(self.0.clone())
    }
}

/// Records every call; documents in `hang` never finish.
#[derive(Default)]
pub struct RecordingProcessor {
    pub delay: Duration,
    pub hang: HashSet<String>,
    pub calls: Mutex<HashMap<String, u32>>,
}

impl RecordingProcessor {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn calls_for(&self, id: &str) -> u32 {
        self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl DocumentProcessor for RecordingProcessor {
    async fn process(&self, document: &Document) -> Result<(), String> {
        *self.calls.lock().unwrap().entry(document.id.clone()).or_insert(0) += 1;
        if self.hang.contains(&document.id) {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub counts: Mutex<Vec<usize>>,
}

#[async_trait]
impl CompletionNotifier for RecordingNotifier {
    async fn notify(&self, processed_count: usize) -> Result<NotificationReceipt, String> {
        self.counts.lock().unwrap().push(processed_count);
        Ok(NotificationReceipt {
            processed_count,
            message: format!("All {processed_count} documents have been processed successfully"),
        })
    }
}

pub fn collaborators(
    source: Arc<FixedSource>,
    processor: Arc<RecordingProcessor>,
    notifier: Arc<RecordingNotifier>,
) -> Collaborators {
    Collaborators {
        source,
        processor,
        notifier,
    }
}

type AppendFilter = Box<dyn Fn(&[Event]) -> bool + Send + Sync>;

/// Wraps a store and fails the first `failing_appends` matching appends and
/// the first `failing_reads` reads with a transient error.
pub struct FaultInjectingStore {
    inner: Arc<dyn HistoryStore>,
    failing_appends: AtomicU32,
    failing_reads: AtomicU32,
    append_filter: Option<AppendFilter>,
    pub injected: AtomicU32,
}

impl FaultInjectingStore {
    pub fn new(inner: Arc<dyn HistoryStore>, failing_appends: u32, failing_reads: u32) -> Self {
        Self {
            inner,
            failing_appends: AtomicU32::new(failing_appends),
            failing_reads: AtomicU32::new(failing_reads),
            append_filter: None,
            injected: AtomicU32::new(0),
        }
    }

    /// Only appends whose events satisfy `filter` draw from the append faults.
    pub fn failing_appends_matching(
        inner: Arc<dyn HistoryStore>,
        failing_appends: u32,
        filter: impl Fn(&[Event]) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            append_filter: Some(Box::new(filter)),
            ..Self::new(inner, failing_appends, 0)
        }
    }

    fn trip(&self, budget: &AtomicU32, operation: &str) -> Result<(), StoreError> {
        let tripped = budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::unavailable(operation, "injected fault"));
        }
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for FaultInjectingStore {
    async fn create_instance(&self, instance: &str) -> Result<(), StoreError> {
        self.inner.create_instance(instance).await
    }
    async fn read(&self, instance: &str) -> Result<Vec<Event>, StoreError> {
        self.trip(&self.failing_reads, "read")?;
        self.inner.read(instance).await
    }
    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<u64, StoreError> {
        if self.append_filter.as_ref().is_none_or(|f| f(&new_events)) {
            self.trip(&self.failing_appends, "append")?;
        }
        self.inner.append(instance, new_events).await
    }
    async fn list_instances(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_instances().await
    }
    async fn remove_instance(&self, instance: &str) -> Result<(), StoreError> {
        self.inner.remove_instance(instance).await
    }
    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), StoreError> {
        self.inner.enqueue_work(kind, item).await
    }
    async fn dequeue_peek_lock(
        &self,
        kind: QueueKind,
        visibility: Duration,
    ) -> Result<Option<QueueDelivery>, StoreError> {
        self.inner.dequeue_peek_lock(kind, visibility).await
    }
    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), StoreError> {
        self.inner.ack(kind, token).await
    }
    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), StoreError> {
        self.inner.abandon(kind, token).await
    }
}
