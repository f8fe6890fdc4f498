//! Pluggable collaborators behind the re-ingestion activities, plus the
//! simulated implementations used by the demo binary.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::document::{Document, generate_catalog};

/// Supplies the documents to process. Called once per run, as the first activity.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn list_pending(&self) -> Result<Vec<Document>, String>;
}

/// Processes one document. Must tolerate being called again for the same
/// document, since invocations are redelivered after a visibility timeout.
#[async_trait]
pub trait DocumentProcessor: Send + Sync {
    async fn process(&self, document: &Document) -> Result<(), String>;
}

/// Told once, at the end, how many documents were processed.
#[async_trait]
pub trait CompletionNotifier: Send + Sync {
    async fn notify(&self, processed_count: usize) -> Result<NotificationReceipt, String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationReceipt {
    pub processed_count: usize,
    pub message: String,
}

/// Randomized in-memory catalog.
#[derive(Debug, Clone)]
pub struct SampleCatalog {
    count: usize,
}

impl SampleCatalog {
    pub const DEFAULT_COUNT: usize = 23;

    pub fn new(count: usize) -> Self {
        Self { count }
    }
}

impl Default for SampleCatalog {
    fn default() -> Self {
        Self::new(Self::DEFAULT_COUNT)
    }
}

#[async_trait]
impl DocumentSource for SampleCatalog {
    async fn list_pending(&self) -> Result<Vec<Document>, String> {
        debug!("Getting document list");
        let docs = generate_catalog(self.count);
        debug!(count = docs.len(), "Retrieved documents");
        Ok(docs)
    }
}

/// Sleeps `base + page_count * per_page` per document.
#[derive(Debug, Clone)]
pub struct SimulatedProcessor {
    base: Duration,
    per_page: Duration,
}

impl SimulatedProcessor {
    pub fn new(base: Duration, per_page: Duration) -> Self {
        Self { base, per_page }
    }

    pub fn processing_time(&self, document: &Document) -> Duration {
        self.base + self.per_page * document.page_count
    }
}

impl Default for SimulatedProcessor {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_millis(10))
    }
}

#[async_trait]
impl DocumentProcessor for SimulatedProcessor {
    async fn process(&self, document: &Document) -> Result<(), String> {
        debug!(
            document = %document.id,
            title = %document.title,
            content_type = %document.content_type,
            "Processing document"
        );
        tokio::time::sleep(self.processing_time(document)).await;
        debug!(document = %document.id, "Completed processing document");
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl CompletionNotifier for LoggingNotifier {
    async fn notify(&self, processed_count: usize) -> Result<NotificationReceipt, String> {
        let message = format!("All {processed_count} documents have been processed successfully");
        info!(processed_count, "{message}");
        Ok(NotificationReceipt {
            processed_count,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processing_time_scales_with_pages() {
        let p = SimulatedProcessor::default();
        let mut doc = generate_catalog(1).remove(0);
        doc.page_count = 50;
        assert_eq!(p.processing_time(&doc), Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn notifier_reports_count() {
        let receipt = LoggingNotifier.notify(23).await.unwrap();
        assert_eq!(receipt.processed_count, 23);
        assert_eq!(receipt.message, "All 23 documents have been processed successfully");
    }
}
