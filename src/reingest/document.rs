use chrono::{DateTime, Duration as ChronoDuration, SubsecRound, Utc};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// A catalog entry waiting to be re-ingested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub title: String,
    pub content_type: String,
    pub created_date: DateTime<Utc>,
    pub author: String,
    pub page_count: u32,
}

pub const CONTENT_TYPES: [&str; 5] = ["pdf", "docx", "txt", "xlsx", "html"];

/// `doc-00001` style ids.
pub fn document_id(index: usize) -> String {
    format!("doc-{index:05}")
}

/// Random catalog of `count` documents with ids `doc-00001..`.
///
/// Metadata is random, so this only ever runs inside an activity; the
/// orchestrator sees the list through history.
pub fn generate_catalog(count: usize) -> Vec<Document> {
    let mut rng = rand::thread_rng();
    // Whole seconds keep the timestamp stable through a JSON round trip
    let now = Utc::now().trunc_subsecs(0);
    (1..=count)
        .map(|index| Document {
            id: document_id(index),
            title: format!("Document {index}"),
            content_type: CONTENT_TYPES.choose(&mut rng).copied().unwrap_or("pdf").to_string(),
            created_date: now - ChronoDuration::days(rng.gen_range(0..30)),
            author: format!("Author {}", rng.gen_range(1..10)),
            page_count: rng.gen_range(1..100),
        })
        .collect()
}
