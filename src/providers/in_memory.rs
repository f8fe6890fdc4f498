use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use super::{HistoryStore, QueueDelivery, QueueKind, StoreError, WorkItem, appendable};
use crate::Event;

#[derive(Debug)]
struct Locked {
    item: WorkItem,
    delivery_count: u32,
    locked_until: Instant,
}

#[derive(Debug, Default)]
struct Queue {
    // (item, deliveries so far)
    visible: VecDeque<(WorkItem, u32)>,
    locked: HashMap<String, Locked>,
}

impl Queue {
    fn contains(&self, item: &WorkItem) -> bool {
        self.visible.iter().any(|(i, _)| i == item) || self.locked.values().any(|l| &l.item == item)
    }

    fn release_expired(&mut self, now: Instant) {
        let tokens: Vec<String> = self
            .locked
            .iter()
            .filter(|(_, l)| l.locked_until <= now)
            .map(|(t, _)| t.clone())
            .collect();
        let mut expired: Vec<Locked> = tokens.iter().filter_map(|t| self.locked.remove(t)).collect();
        // Oldest lock first so redelivery keeps the original order
        expired.sort_by_key(|l| l.locked_until);
        for l in expired.into_iter().rev() {
            self.visible.push_front((l.item, l.delivery_count));
        }
    }
}

/// Process-local provider. Histories and queues live behind one async mutex,
/// which gives per-instance linearizable append/read for free.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    histories: Mutex<HashMap<String, Vec<Event>>>,
    orchestrator_q: Mutex<Queue>,
    worker_q: Mutex<Queue>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, kind: QueueKind) -> &Mutex<Queue> {
        match kind {
            QueueKind::Orchestrator => &self.orchestrator_q,
            QueueKind::Worker => &self.worker_q,
        }
    }

    /// Number of messages visible or locked in a queue (test utility).
    pub async fn queue_depth(&self, kind: QueueKind) -> usize {
        let q = self.queue(kind).lock().await;
        q.visible.len() + q.locked.len()
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn create_instance(&self, instance: &str) -> Result<(), StoreError> {
        let mut g = self.histories.lock().await;
        if g.contains_key(instance) {
            return Err(StoreError::InstanceExists(instance.to_string()));
        }
        g.insert(instance.to_string(), Vec::new());
        Ok(())
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, StoreError> {
        let g = self.histories.lock().await;
        g.get(instance)
            .cloned()
            .ok_or_else(|| StoreError::InstanceNotFound(instance.to_string()))
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<u64, StoreError> {
        let mut g = self.histories.lock().await;
        let hist = g
            .get_mut(instance)
            .ok_or_else(|| StoreError::InstanceNotFound(instance.to_string()))?;
        let accepted = appendable(hist, new_events);
        hist.extend(accepted);
        Ok(hist.len() as u64)
    }

    async fn list_instances(&self) -> Result<Vec<String>, StoreError> {
        let mut out: Vec<String> = self.histories.lock().await.keys().cloned().collect();
        out.sort();
        Ok(out)
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), StoreError> {
        let mut g = self.histories.lock().await;
        if g.remove(instance).is_none() {
            return Err(StoreError::InstanceNotFound(instance.to_string()));
        }
        Ok(())
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), StoreError> {
        let mut q = self.queue(kind).lock().await;
        if !q.contains(&item) {
            q.visible.push_back((item, 0));
        }
        Ok(())
    }

    async fn dequeue_peek_lock(
        &self,
        kind: QueueKind,
        visibility: Duration,
    ) -> Result<Option<QueueDelivery>, StoreError> {
        let mut q = self.queue(kind).lock().await;
        let now = Instant::now();
        q.release_expired(now);
        let Some((item, delivered)) = q.visible.pop_front() else {
            return Ok(None);
        };
        let token = uuid::Uuid::new_v4().to_string();
        let delivery_count = delivered + 1;
        q.locked.insert(
            token.clone(),
            Locked {
                item: item.clone(),
                delivery_count,
                locked_until: now + visibility,
            },
        );
        Ok(Some(QueueDelivery {
            item,
            lock_token: token,
            delivery_count,
        }))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), StoreError> {
        let mut q = self.queue(kind).lock().await;
        match q.locked.remove(token) {
            Some(_) => Ok(()),
            None => Err(StoreError::LockLost(token.to_string())),
        }
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), StoreError> {
        let mut q = self.queue(kind).lock().await;
        match q.locked.remove(token) {
            Some(l) => {
                q.visible.push_back((l.item, l.delivery_count));
                Ok(())
            }
            None => Err(StoreError::LockLost(token.to_string())),
        }
    }
}
