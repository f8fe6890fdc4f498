use serde::{Deserialize, Serialize};

/// Structured failure recorded in history.
///
/// Orchestrator code never sees this type directly: activity failures surface
/// as `Err(String)` built from [`ErrorDetails::display_message`], exactly like a
/// normal return value, so batch logic can decide whether to fail or substitute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ErrorDetails {
    /// The activity body returned an error.
    #[error("activity_failed: {message}")]
    Application { message: String },
    /// No worker reported back within the visibility window after every
    /// allowed redelivery.
    #[error("dispatch_timeout: dispatch timeout: no completion after {attempts} deliveries")]
    DispatchTimeout { attempts: u32 },
    /// Orchestrator code took a different path than the one recorded in history.
    #[error("determinism_violation: nondeterministic: {message}")]
    DeterminismViolation { message: String },
    /// The orchestrator function itself returned an error.
    #[error("orchestration_failed: {message}")]
    Orchestration { message: String },
    /// A name could not be resolved against the registries.
    #[error("configuration: configuration: {message}")]
    Configuration { message: String },
}

impl ErrorDetails {
    pub fn application(message: impl Into<String>) -> Self {
        Self::Application {
            message: message.into(),
        }
    }

    pub fn display_message(&self) -> String {
        match self {
            ErrorDetails::Application { message } => message.clone(),
            ErrorDetails::DispatchTimeout { attempts } => {
                format!("dispatch timeout: no completion after {attempts} deliveries")
            }
            ErrorDetails::DeterminismViolation { message } => format!("nondeterministic: {message}"),
            ErrorDetails::Orchestration { message } => message.clone(),
            ErrorDetails::Configuration { message } => format!("configuration: {message}"),
        }
    }

    /// Short machine-friendly category used in logs and status payloads.
    pub fn category(&self) -> &'static str {
        match self {
            ErrorDetails::Application { .. } => "activity_failed",
            ErrorDetails::DispatchTimeout { .. } => "dispatch_timeout",
            ErrorDetails::DeterminismViolation { .. } => "determinism_violation",
            ErrorDetails::Orchestration { .. } => "orchestration_failed",
            ErrorDetails::Configuration { .. } => "configuration",
        }
    }
}
