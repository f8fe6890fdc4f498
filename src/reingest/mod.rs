//! Document re-ingestion: fetch the catalog, process it in batches, notify.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::_typed_codec::{Codec, Json};
use crate::batch::run_in_batches;
use crate::runtime::{ActivityRegistry, OrchestrationRegistry};
use crate::{OrchestrationContext, durable_debug, durable_error, durable_info};

pub mod collaborators;
pub mod document;

pub use collaborators::{
    CompletionNotifier, DocumentProcessor, DocumentSource, LoggingNotifier, NotificationReceipt, SampleCatalog,
    SimulatedProcessor,
};
pub use document::Document;

pub const ORCHESTRATION_NAME: &str = "ReingestOrchestration";

/// The closed set of activities the workflow calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReingestActivity {
    GetItems,
    ProcessItem,
    Notify,
}

impl ReingestActivity {
    pub const ALL: [ReingestActivity; 3] = [
        ReingestActivity::GetItems,
        ReingestActivity::ProcessItem,
        ReingestActivity::Notify,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ReingestActivity::GetItems => "GetItems",
            ReingestActivity::ProcessItem => "ProcessItem",
            ReingestActivity::Notify => "Notify",
        }
    }
}

/// Orchestration input. It lives in history, so every pass sees the same value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReingestConfig {
    pub batch_size: usize,
}

impl Default for ReingestConfig {
    fn default() -> Self {
        Self { batch_size: 5 }
    }
}

impl ReingestConfig {
    /// Empty input means defaults.
    pub fn from_input(input: &str) -> Result<Self, String> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_json::from_str(input).map_err(|e| format!("invalid reingest config: {e}"))?;
        if config.batch_size == 0 {
            return Err("invalid reingest config: batchSize must be greater than zero".to_string());
        }
        Ok(config)
    }
}

/// The collaborators the activities delegate to.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn DocumentSource>,
    pub processor: Arc<dyn DocumentProcessor>,
    pub notifier: Arc<dyn CompletionNotifier>,
}

impl Collaborators {
    pub fn simulated() -> Self {
        Self {
            source: Arc::new(SampleCatalog::default()),
            processor: Arc::new(SimulatedProcessor::default()),
            notifier: Arc::new(LoggingNotifier),
        }
    }
}

pub async fn reingest_orchestration(ctx: OrchestrationContext, input: String) -> Result<String, String> {
    let log = ctx.logger(ORCHESTRATION_NAME);
    let config = ReingestConfig::from_input(&input)?;
    durable_info!(log, "Starting reingestion orchestration.");

    let documents: Vec<Document> = ctx
        .schedule_activity(ReingestActivity::GetItems.name(), "")
        .into_activity_typed()
        .await?;
    durable_debug!(log, "Retrieved {} documents.", documents.len());

    if let Err(e) = run_in_batches(
        &ctx,
        &log,
        ReingestActivity::ProcessItem.name(),
        &documents,
        config.batch_size,
    )
    .await
    {
        durable_error!(log, "Reingestion stopped: {e}");
        return Err(e);
    }

    let receipt: NotificationReceipt = ctx
        .call_activity_typed(ReingestActivity::Notify.name(), &documents.len())
        .await?;
    durable_info!(log, "Reingestion finished: {}", receipt.message);
    Json::encode(&receipt)
}

pub fn orchestration_registry() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register(ORCHESTRATION_NAME, reingest_orchestration)
        .build()
}

/// Register the three activities against `collaborators`.
pub fn activity_registry(collaborators: &Collaborators) -> ActivityRegistry {
    let source = collaborators.source.clone();
    let processor = collaborators.processor.clone();
    let notifier = collaborators.notifier.clone();
    ActivityRegistry::builder()
        .register(ReingestActivity::GetItems.name(), move |_input: String| {
            let source = source.clone();
            async move {
                let documents = source.list_pending().await?;
                Json::encode(&documents)
            }
        })
        .register_typed(ReingestActivity::ProcessItem.name(), move |document: Document| {
            let processor = processor.clone();
            async move { processor.process(&document).await }
        })
        .register_typed(ReingestActivity::Notify.name(), move |count: usize| {
            let notifier = notifier.clone();
            async move { notifier.notify(count).await }
        })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Action, Event, Executor};

    #[test]
    fn config_defaults_and_validation() {
        assert_eq!(ReingestConfig::from_input("").unwrap().batch_size, 5);
        assert_eq!(ReingestConfig::from_input(r#"{"batchSize":3}"#).unwrap().batch_size, 3);
        assert_eq!(ReingestConfig::from_input("{}").unwrap(), ReingestConfig::default());
        assert!(ReingestConfig::from_input(r#"{"batchSize":0}"#).is_err());
        assert!(ReingestConfig::from_input("not json").is_err());
    }

    #[test]
    fn activity_names_are_distinct_and_registered() {
        let reg = activity_registry(&Collaborators::simulated());
        for a in ReingestActivity::ALL {
            assert!(reg.has(a.name()), "{} missing", a.name());
        }
    }

    #[test]
    fn workflow_schedules_get_items_batches_then_notify() {
        let catalog = Json::encode(&document::generate_catalog(23)).unwrap();
        let mut turns: Vec<Vec<String>> = Vec::new();
        let (_history, out) = Executor::drive_to_completion(
            Vec::new(),
            |ctx| reingest_orchestration(ctx, String::new()),
            |actions: Vec<Action>, h: &mut Vec<Event>| {
                let mut names = Vec::new();
                for a in actions {
                    let Action::CallActivity { id, name, input } = a;
                    let result = match name.as_str() {
                        "GetItems" => catalog.clone(),
                        "Notify" => Json::encode(&NotificationReceipt {
                            processed_count: input.parse().unwrap(),
                            message: "sent".into(),
                        })
                        .unwrap(),
                        _ => "null".to_string(),
                    };
                    names.push(name);
                    h.push(Event::ActivityCompleted { id, result });
                }
                turns.push(names);
            },
        )
        .unwrap();

        let sizes: Vec<usize> = turns.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![1, 5, 5, 5, 5, 3, 1]);
        assert_eq!(turns[0], vec!["GetItems"]);
        assert_eq!(turns[6], vec!["Notify"]);
        let receipt: NotificationReceipt = Json::decode(&out.unwrap()).unwrap();
        assert_eq!(receipt.processed_count, 23);
    }

    #[test]
    fn failed_batch_logs_error_once() {
        use crate::{ErrorDetails, LogLevel};
        let catalog = Json::encode(&document::generate_catalog(7)).unwrap();
        let mut fresh = Vec::new();
        let mut history = Vec::new();
        loop {
            let turn = crate::run_turn_with(history, 0, |ctx| reingest_orchestration(ctx, String::new()));
            fresh.extend(turn.logs.into_iter().filter(|r| !r.replaying));
            history = turn.history;
            if let Some(out) = turn.output {
                assert!(out.unwrap_err().starts_with("batch 1 of 2 failed"));
                break;
            }
            for a in turn.actions {
                let Action::CallActivity { id, name, .. } = a;
                history.push(match name.as_str() {
                    "GetItems" => Event::ActivityCompleted {
                        id,
                        result: catalog.clone(),
                    },
                    _ => Event::ActivityFailed {
                        id,
                        details: ErrorDetails::application("disk full"),
                    },
                });
            }
        }
        let at = |level: LogLevel| -> Vec<&str> {
            fresh
                .iter()
                .filter(|r| r.level == level)
                .map(|r| r.message.as_str())
                .collect()
        };
        assert_eq!(at(LogLevel::Debug), vec!["Retrieved 7 documents."]);
        let errors = at(LogLevel::Error);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("Reingestion stopped: batch 1 of 2 failed"), "{}", errors[0]);
    }
}
