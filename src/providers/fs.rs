use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::{fs, io::AsyncWriteExt};
use tracing::warn;

use super::{HistoryStore, QueueDelivery, QueueKind, StoreError, WorkItem, appendable};
use crate::Event;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueuedRecord {
    item: WorkItem,
    delivery_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    item: WorkItem,
    delivery_count: u32,
    locked_until_ms: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Filesystem-backed store: one JSONL history file per instance, one JSONL
/// file per queue, and a sidecar file per outstanding peek-lock.
///
/// Every operation runs under a single async mutex shared by clones, so a
/// process sees appends and queue moves atomically. Locks carry a wall-clock
/// deadline, which lets a restarted process redeliver what a crashed one held.
#[derive(Clone)]
pub struct FsHistoryStore {
    root: PathBuf,
    orch_queue_file: PathBuf,
    work_queue_file: PathBuf,
    op_lock: Arc<Mutex<()>>,
}

impl FsHistoryStore {
    /// Create a new store rooted at the given directory path.
    /// If `reset_on_create` is true, delete any existing data under the root first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        let path = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&path);
        }
        // best-effort create; operations report real I/O errors later
        let _ = std::fs::create_dir_all(&path);
        Self {
            orch_queue_file: path.join("orch-queue.jsonl"),
            work_queue_file: path.join("work-queue.jsonl"),
            root: path,
            op_lock: Arc::new(Mutex::new(())),
        }
    }

    fn inst_root(&self, instance: &str) -> PathBuf {
        self.root.join(instance)
    }
    fn history_path(&self, instance: &str) -> PathBuf {
        self.inst_root(instance).join("history.jsonl")
    }
    fn lock_dir(&self, kind: QueueKind) -> PathBuf {
        match kind {
            QueueKind::Orchestrator => self.root.join(".locks/orch"),
            QueueKind::Worker => self.root.join(".locks/work"),
        }
    }
    fn lock_path(&self, kind: QueueKind, token: &str) -> PathBuf {
        self.lock_dir(kind).join(format!("{token}.lock"))
    }
    fn queue_file(&self, kind: QueueKind) -> &PathBuf {
        match kind {
            QueueKind::Orchestrator => &self.orch_queue_file,
            QueueKind::Worker => &self.work_queue_file,
        }
    }

    async fn read_history(&self, instance: &str) -> Result<Vec<Event>, StoreError> {
        let path = self.history_path(instance);
        if !fs::try_exists(&path)
            .await
            .map_err(|e| StoreError::unavailable("read", e))?
        {
            return Err(StoreError::InstanceNotFound(instance.to_string()));
        }
        let data = fs::read_to_string(&path)
            .await
            .map_err(|e| StoreError::unavailable("read", e))?;
        let mut out = Vec::new();
        for line in data.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let ev = serde_json::from_str::<Event>(line).map_err(|e| StoreError::corrupt(path.display().to_string(), e))?;
            out.push(ev);
        }
        Ok(out)
    }

    async fn read_queue(&self, kind: QueueKind) -> Result<Vec<QueuedRecord>, StoreError> {
        let qf = self.queue_file(kind);
        let content = match fs::read_to_string(qf).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(StoreError::unavailable("read_queue", e)),
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str::<QueuedRecord>(l).map_err(|e| StoreError::corrupt(qf.display().to_string(), e)))
            .collect()
    }

    /// Rewrite a queue file atomically via a temp file and rename.
    async fn write_queue(&self, kind: QueueKind, items: &[QueuedRecord]) -> Result<(), StoreError> {
        let qf = self.queue_file(kind);
        let tmp = qf.with_extension("jsonl.tmp");
        let mut buf = String::new();
        for it in items {
            let line = serde_json::to_string(it).map_err(|e| StoreError::corrupt("queue", e))?;
            buf.push_str(&line);
            buf.push('\n');
        }
        fs::write(&tmp, buf)
            .await
            .map_err(|e| StoreError::unavailable("write_queue", e))?;
        fs::rename(&tmp, qf)
            .await
            .map_err(|e| StoreError::unavailable("write_queue", e))
    }

    async fn read_locks(&self, kind: QueueKind) -> Result<Vec<(PathBuf, LockRecord)>, StoreError> {
        let mut out = Vec::new();
        let mut rd = match fs::read_dir(self.lock_dir(kind)).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(StoreError::unavailable("read_locks", e)),
        };
        while let Some(ent) = rd
            .next_entry()
            .await
            .map_err(|e| StoreError::unavailable("read_locks", e))?
        {
            let path = ent.path();
            if path.extension().and_then(|x| x.to_str()) != Some("lock") {
                continue;
            }
            let data = fs::read_to_string(&path)
                .await
                .map_err(|e| StoreError::unavailable("read_locks", e))?;
            let rec: LockRecord =
                serde_json::from_str(&data).map_err(|e| StoreError::corrupt(path.display().to_string(), e))?;
            out.push((path, rec));
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl HistoryStore for FsHistoryStore {
    async fn create_instance(&self, instance: &str) -> Result<(), StoreError> {
        let _g = self.op_lock.lock().await;
        let inst_dir = self.inst_root(instance);
        if fs::try_exists(&inst_dir)
            .await
            .map_err(|e| StoreError::unavailable("create_instance", e))?
        {
            return Err(StoreError::InstanceExists(instance.to_string()));
        }
        fs::create_dir_all(&inst_dir)
            .await
            .map_err(|e| StoreError::unavailable("create_instance", e))?;
        fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(self.history_path(instance))
            .await
            .map_err(|e| StoreError::unavailable("create_instance", e))?;
        Ok(())
    }

    /// Read the entire JSONL file for the instance and deserialize each line.
    async fn read(&self, instance: &str) -> Result<Vec<Event>, StoreError> {
        let _g = self.op_lock.lock().await;
        self.read_history(instance).await
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<u64, StoreError> {
        let _g = self.op_lock.lock().await;
        let existing = self.read_history(instance).await?;
        let accepted = appendable(&existing, new_events);
        let committed = (existing.len() + accepted.len()) as u64;
        if accepted.is_empty() {
            return Ok(committed);
        }
        let mut buf = String::new();
        for ev in &accepted {
            let line = serde_json::to_string(ev).map_err(|e| StoreError::corrupt(instance, e))?;
            buf.push_str(&line);
            buf.push('\n');
        }
        // One write call per append keeps a batch of events together
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(self.history_path(instance))
            .await
            .map_err(|e| StoreError::unavailable("append", e))?;
        file.write_all(buf.as_bytes())
            .await
            .map_err(|e| StoreError::unavailable("append", e))?;
        file.sync_data()
            .await
            .map_err(|e| StoreError::unavailable("append", e))?;
        Ok(committed)
    }

    /// List instances by scanning instance directories.
    async fn list_instances(&self) -> Result<Vec<String>, StoreError> {
        let _g = self.op_lock.lock().await;
        let mut out = Vec::new();
        let mut rd = fs::read_dir(&self.root)
            .await
            .map_err(|e| StoreError::unavailable("list_instances", e))?;
        while let Some(ent) = rd
            .next_entry()
            .await
            .map_err(|e| StoreError::unavailable("list_instances", e))?
        {
            let is_dir = ent.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if let Some(name) = ent.file_name().to_str()
                && is_dir
                && !name.starts_with('.')
            {
                out.push(name.to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), StoreError> {
        let _g = self.op_lock.lock().await;
        let inst_dir = self.inst_root(instance);
        if !fs::try_exists(&inst_dir)
            .await
            .map_err(|e| StoreError::unavailable("remove_instance", e))?
        {
            return Err(StoreError::InstanceNotFound(instance.to_string()));
        }
        fs::remove_dir_all(&inst_dir)
            .await
            .map_err(|e| StoreError::unavailable("remove_instance", e))
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), StoreError> {
        let _g = self.op_lock.lock().await;
        // Idempotent enqueue: skip if present, visible or locked
        let mut items = self.read_queue(kind).await?;
        if items.iter().any(|r| r.item == item) {
            return Ok(());
        }
        if self.read_locks(kind).await?.iter().any(|(_, l)| l.item == item) {
            return Ok(());
        }
        items.push(QueuedRecord {
            item,
            delivery_count: 0,
        });
        self.write_queue(kind, &items).await
    }

    async fn dequeue_peek_lock(
        &self,
        kind: QueueKind,
        visibility: Duration,
    ) -> Result<Option<QueueDelivery>, StoreError> {
        let _g = self.op_lock.lock().await;
        let now = now_ms();
        let mut items = self.read_queue(kind).await?;

        // Expired locks go back to the front, oldest first
        let mut expired: Vec<(PathBuf, LockRecord)> = self
            .read_locks(kind)
            .await?
            .into_iter()
            .filter(|(_, l)| l.locked_until_ms <= now)
            .collect();
        expired.sort_by_key(|(_, l)| l.locked_until_ms);
        let mut released = Vec::with_capacity(expired.len());
        for (path, rec) in expired.into_iter().rev() {
            items.insert(
                0,
                QueuedRecord {
                    item: rec.item,
                    delivery_count: rec.delivery_count,
                },
            );
            released.push(path);
        }

        if items.is_empty() {
            return Ok(None);
        }
        let first = items.remove(0);
        let token = uuid::Uuid::new_v4().simple().to_string();
        let rec = LockRecord {
            item: first.item.clone(),
            delivery_count: first.delivery_count + 1,
            locked_until_ms: now + visibility.as_millis() as u64,
        };
        fs::create_dir_all(self.lock_dir(kind))
            .await
            .map_err(|e| StoreError::unavailable("dequeue", e))?;
        let line = serde_json::to_string(&rec).map_err(|e| StoreError::corrupt("lock", e))?;
        // New sidecar, then the queue, then the expired sidecars: a failure at
        // any step leaves a message duplicated rather than lost
        fs::write(self.lock_path(kind, &token), line)
            .await
            .map_err(|e| StoreError::unavailable("dequeue", e))?;
        self.write_queue(kind, &items).await?;
        for path in released {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "could not remove expired lock"),
            }
        }
        Ok(Some(QueueDelivery {
            item: rec.item,
            lock_token: token,
            delivery_count: rec.delivery_count,
        }))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), StoreError> {
        let _g = self.op_lock.lock().await;
        let path = self.lock_path(kind, token);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::LockLost(token.to_string())),
            Err(e) => Err(StoreError::unavailable("ack", e)),
        }
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), StoreError> {
        let _g = self.op_lock.lock().await;
        let path = self.lock_path(kind, token);
        let data = match fs::read_to_string(&path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::LockLost(token.to_string()));
            }
            Err(e) => return Err(StoreError::unavailable("abandon", e)),
        };
        let rec: LockRecord = serde_json::from_str(&data).map_err(|e| StoreError::corrupt(path.display().to_string(), e))?;
        let mut items = self.read_queue(kind).await?;
        items.push(QueuedRecord {
            item: rec.item,
            delivery_count: rec.delivery_count,
        });
        self.write_queue(kind, &items).await?;
        fs::remove_file(&path)
            .await
            .map_err(|e| StoreError::unavailable("abandon", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn history_survives_reopen() {
        let td = tempfile::tempdir().unwrap();
        {
            let store = FsHistoryStore::new(td.path(), true);
            store.create_instance("inst-a").await.unwrap();
            let pos = store
                .append(
                    "inst-a",
                    vec![
                        Event::OrchestratorStarted {
                            name: "o".into(),
                            version: "1.0.0".into(),
                            input: String::new(),
                        },
                        Event::ActivityScheduled {
                            id: 1,
                            name: "A".into(),
                            input: "x".into(),
                        },
                    ],
                )
                .await
                .unwrap();
            assert_eq!(pos, 2);
        }
        let reopened = FsHistoryStore::new(td.path(), false);
        let hist = reopened.read("inst-a").await.unwrap();
        assert_eq!(hist.len(), 2);
        assert_eq!(reopened.list_instances().await.unwrap(), vec!["inst-a".to_string()]);
    }

    #[tokio::test]
    async fn failed_dequeue_keeps_expired_message() {
        let td = tempfile::tempdir().unwrap();
        let store = FsHistoryStore::new(td.path(), true);
        let item = WorkItem::ActivityCompleted {
            instance: "i".into(),
            id: 4,
            result: "ok".into(),
        };
        store.enqueue_work(QueueKind::Orchestrator, item.clone()).await.unwrap();
        store
            .dequeue_peek_lock(QueueKind::Orchestrator, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // A directory where the temp queue file goes makes the queue rewrite fail
        let blocker = td.path().join("orch-queue.jsonl.tmp");
        std::fs::create_dir_all(&blocker).unwrap();
        let err = store
            .dequeue_peek_lock(QueueKind::Orchestrator, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "{err}");
        std::fs::remove_dir_all(&blocker).unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let d = store
            .dequeue_peek_lock(QueueKind::Orchestrator, Duration::from_secs(5))
            .await
            .unwrap()
            .expect("expired message must survive a failed dequeue");
        assert_eq!(d.item, item);
    }

    #[tokio::test]
    async fn lock_held_by_dead_process_is_redelivered() {
        let td = tempfile::tempdir().unwrap();
        let item = WorkItem::StartOrchestration { instance: "i".into() };
        {
            let store = FsHistoryStore::new(td.path(), true);
            store.enqueue_work(QueueKind::Orchestrator, item.clone()).await.unwrap();
            let d = store
                .dequeue_peek_lock(QueueKind::Orchestrator, Duration::from_millis(10))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(d.delivery_count, 1);
            // dropped without ack
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        let store = FsHistoryStore::new(td.path(), false);
        let d = store
            .dequeue_peek_lock(QueueKind::Orchestrator, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(d.item, item);
        assert_eq!(d.delivery_count, 2);
        store.ack(QueueKind::Orchestrator, &d.lock_token).await.unwrap();
        assert!(matches!(
            store.ack(QueueKind::Orchestrator, &d.lock_token).await,
            Err(StoreError::LockLost(_))
        ));
    }
}
