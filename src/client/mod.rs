//! Front door for starting and observing orchestrations.
//!
//! Starting never waits for the orchestration: it hands back an accepted
//! handle with the instance id and the URL a caller would poll for status.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::_typed_codec::{Codec, Json};
use crate::providers::StoreError;
use crate::runtime::{OrchestrationStatus, Runtime, WaitError};

/// Status code of an accepted, not yet finished, start request.
pub const ACCEPTED: u16 = 202;

/// Check-status payload returned by a start request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartHandle {
    pub instance_id: String,
    pub status_query_url: String,
    pub terminate_post_url: String,
    #[serde(skip)]
    pub status_code: u16,
}

/// Body of a status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub instance_id: String,
    pub runtime_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct Client {
    runtime: Arc<Runtime>,
    base_url: String,
}

impl Client {
    /// `base_url` prefixes the status and terminate URLs in start handles.
    pub fn new(runtime: Arc<Runtime>, base_url: impl Into<String>) -> Self {
        Self {
            runtime,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Start `orchestration` under a fresh instance id.
    pub async fn start_orchestration(&self, orchestration: &str, input: impl Into<String>) -> Result<StartHandle, String> {
        let instance = uuid::Uuid::new_v4().to_string();
        self.runtime
            .start_orchestration(&instance, orchestration, input)
            .await?;
        debug!(instance = %instance, orchestration, "start request accepted");
        Ok(self.handle_for(&instance))
    }

    pub async fn start_orchestration_typed<In: Serialize>(
        &self,
        orchestration: &str,
        input: &In,
    ) -> Result<StartHandle, String> {
        let payload = Json::encode(input).map_err(|e| format!("encode: {e}"))?;
        self.start_orchestration(orchestration, payload).await
    }

    /// Handle for an existing instance id.
    pub fn handle_for(&self, instance: &str) -> StartHandle {
        let instance_url = format!("{}/runtime/instances/{instance}", self.base_url);
        StartHandle {
            instance_id: instance.to_string(),
            terminate_post_url: format!("{instance_url}/terminate"),
            status_query_url: instance_url,
            status_code: ACCEPTED,
        }
    }

    pub async fn get_status(&self, instance: &str) -> Result<OrchestrationStatus, StoreError> {
        self.runtime.get_orchestration_status(instance).await
    }

    /// Status in the shape served to pollers.
    pub async fn status_response(&self, instance: &str) -> Result<StatusResponse, StoreError> {
        let status = self.get_status(instance).await?;
        let (output, error) = match &status {
            OrchestrationStatus::Completed { output } => (Some(output.clone()), None),
            OrchestrationStatus::Failed { details } => (None, Some(details.to_string())),
            OrchestrationStatus::Terminated { reason } => (None, Some(reason.clone())),
            _ => (None, None),
        };
        Ok(StatusResponse {
            instance_id: instance.to_string(),
            runtime_status: status.runtime_status().to_string(),
            output,
            error,
        })
    }

    pub async fn terminate(&self, instance: &str, reason: impl Into<String>) -> Result<(), StoreError> {
        self.runtime.terminate_instance(instance, reason).await
    }

    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        self.runtime.wait_for_orchestration(instance, timeout).await
    }

    /// Typed variant: `Ok(Ok(out))` on completion, `Ok(Err(msg))` when the
    /// instance failed or was terminated.
    pub async fn wait_for_orchestration_typed<Out: serde::de::DeserializeOwned>(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<Result<Out, String>, WaitError> {
        match self.wait_for_orchestration(instance, timeout).await? {
            OrchestrationStatus::Completed { output } => Json::decode::<Out>(&output)
                .map(Ok)
                .map_err(|e| WaitError::Other(format!("decode failed: {e}"))),
            OrchestrationStatus::Failed { details } => Ok(Err(details.display_message())),
            OrchestrationStatus::Terminated { reason } => Ok(Err(format!("terminated: {reason}"))),
            other => Err(WaitError::Other(format!("unexpected status {}", other.runtime_status()))),
        }
    }
}
