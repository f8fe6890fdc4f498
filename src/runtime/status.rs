use serde::{Deserialize, Serialize};

use crate::runtime::completions;
use crate::{ErrorDetails, Event};

/// Lifecycle state of an instance as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceState {
    Created,
    Running,
    Suspended,
    Completed,
    Failed,
    Terminated,
}

impl InstanceState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceState::Completed | InstanceState::Failed | InstanceState::Terminated
        )
    }

    /// Allowed edges of the per-instance state machine.
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        match (self, next) {
            (s, _) if s.is_terminal() => false,
            (_, Terminated) => true,
            (Created, Running) | (Suspended, Running) => true,
            (Running, Suspended) | (Running, Completed) | (Running, Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Created => "Created",
            InstanceState::Running => "Running",
            InstanceState::Suspended => "Suspended",
            InstanceState::Completed => "Completed",
            InstanceState::Failed => "Failed",
            InstanceState::Terminated => "Terminated",
        }
    }
}

/// High-level orchestration status derived from history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    NotFound,
    Created,
    Running,
    Suspended,
    Completed { output: String },
    Failed { details: ErrorDetails },
    Terminated { reason: String },
}

impl OrchestrationStatus {
    pub fn state(&self) -> Option<InstanceState> {
        match self {
            OrchestrationStatus::NotFound => None,
            OrchestrationStatus::Created => Some(InstanceState::Created),
            OrchestrationStatus::Running => Some(InstanceState::Running),
            OrchestrationStatus::Suspended => Some(InstanceState::Suspended),
            OrchestrationStatus::Completed { .. } => Some(InstanceState::Completed),
            OrchestrationStatus::Failed { .. } => Some(InstanceState::Failed),
            OrchestrationStatus::Terminated { .. } => Some(InstanceState::Terminated),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_some_and(InstanceState::is_terminal)
    }

    /// Name reported by the status endpoint.
    pub fn runtime_status(&self) -> &'static str {
        self.state().map(InstanceState::as_str).unwrap_or("NotFound")
    }
}

/// Derive status from history alone.
///
/// A started instance with no call site yet is `Created`; outstanding
/// activities mean `Suspended`; a non-terminal history with nothing
/// outstanding is waiting for its next pass and reports `Running`.
pub fn derive_status(history: &[Event]) -> OrchestrationStatus {
    for e in history.iter().rev() {
        match e {
            Event::OrchestratorCompleted { output } => {
                return OrchestrationStatus::Completed { output: output.clone() };
            }
            Event::OrchestrationFailed { details } => {
                return OrchestrationStatus::Failed {
                    details: details.clone(),
                };
            }
            Event::OrchestrationTerminated { reason } => {
                return OrchestrationStatus::Terminated { reason: reason.clone() };
            }
            _ => {}
        }
    }
    if !history.iter().any(|e| matches!(e, Event::OrchestratorStarted { .. })) {
        return OrchestrationStatus::NotFound;
    }
    if !history.iter().any(|e| matches!(e, Event::ActivityScheduled { .. })) {
        return OrchestrationStatus::Created;
    }
    if completions::outstanding(history).is_empty() {
        OrchestrationStatus::Running
    } else {
        OrchestrationStatus::Suspended
    }
}
