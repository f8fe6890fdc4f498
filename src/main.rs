//! Demo host: runs one document re-ingestion end to end.
//!
//! Environment:
//! - `DTF_STORE_DIR`: keep history and queues on disk there (in memory otherwise)
//! - `DTF_BATCH_SIZE`: documents per batch (default 5)
//! - `DTF_DOCUMENT_COUNT`: catalog size (default 23)
//! - `RUST_LOG`: tracing filter (default `info`)

use std::sync::Arc;
use std::time::Duration;

use dtf_batch::client::Client;
use dtf_batch::providers::HistoryStore;
use dtf_batch::providers::fs::FsHistoryStore;
use dtf_batch::providers::in_memory::InMemoryHistoryStore;
use dtf_batch::reingest::{self, Collaborators, ReingestConfig, SampleCatalog};
use dtf_batch::runtime::{Runtime, RuntimeOptions};

fn env_usize(key: &str, default: usize) -> Result<usize, String> {
    match std::env::var(key) {
        Ok(v) => v.parse().map_err(|e| format!("{key}={v:?}: {e}")),
        Err(_) => Ok(default),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .try_init();

    let batch_size = env_usize("DTF_BATCH_SIZE", ReingestConfig::default().batch_size)?;
    let document_count = env_usize("DTF_DOCUMENT_COUNT", SampleCatalog::DEFAULT_COUNT)?;

    let store: Arc<dyn HistoryStore> = match std::env::var("DTF_STORE_DIR") {
        Ok(dir) => Arc::new(FsHistoryStore::new(dir, false)),
        Err(_) => Arc::new(InMemoryHistoryStore::default()),
    };

    let collaborators = Collaborators {
        source: Arc::new(SampleCatalog::new(document_count)),
        ..Collaborators::simulated()
    };
    let options = RuntimeOptions {
        worker_concurrency: batch_size.max(1),
        ..Default::default()
    };
    let rt = Runtime::start_with_options(
        store,
        Arc::new(reingest::activity_registry(&collaborators)),
        reingest::orchestration_registry(),
        options,
    )
    .await;

    let client = Client::new(rt.clone(), "http://localhost:7071");
    let handle = client
        .start_orchestration_typed(reingest::ORCHESTRATION_NAME, &ReingestConfig { batch_size })
        .await?;
    println!("{} {}", handle.status_code, serde_json::to_string_pretty(&handle)?);

    client
        .wait_for_orchestration(&handle.instance_id, Duration::from_secs(600))
        .await?;
    let status = client.status_response(&handle.instance_id).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    println!("transitions: {:?}", rt.transitions(&handle.instance_id).await);

    rt.shutdown().await;
    Ok(())
}
