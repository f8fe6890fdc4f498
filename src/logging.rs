//! Replay-safe logging for orchestrator code.
//!
//! Orchestrators run many times over the same history, so a plain `tracing`
//! call inside one would repeat on every pass. The logger handed out by
//! [`crate::OrchestrationContext::logger`] buffers records tagged with whether
//! the pass was still replaying at that point; the runtime forwards only the
//! fresh ones to `tracing`. Nothing here touches history.

use serde::{Deserialize, Serialize};

use crate::OrchestrationContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One buffered logger call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub category: String,
    pub message: String,
    /// The call happened before the pass walked past its last recorded call site.
    pub replaying: bool,
}

#[derive(Clone)]
pub struct ReplaySafeLogger {
    ctx: OrchestrationContext,
    category: String,
}

impl ReplaySafeLogger {
    pub(crate) fn new(ctx: OrchestrationContext, category: String) -> Self {
        Self { ctx, category }
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.ctx.push_log(level, &self.category, message.into());
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }
    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }
    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }
    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }
}

/// Forward the non-replayed records of one pass to `tracing`.
pub fn emit(instance: &str, turn: u64, records: &[LogRecord]) -> usize {
    let mut emitted = 0;
    for r in records.iter().filter(|r| !r.replaying) {
        let (category, message) = (r.category.as_str(), r.message.as_str());
        match r.level {
            LogLevel::Debug => tracing::debug!(target: "dtf_batch::orchestration", instance, turn, category, "{message}"),
            LogLevel::Info => tracing::info!(target: "dtf_batch::orchestration", instance, turn, category, "{message}"),
            LogLevel::Warn => tracing::warn!(target: "dtf_batch::orchestration", instance, turn, category, "{message}"),
            LogLevel::Error => tracing::error!(target: "dtf_batch::orchestration", instance, turn, category, "{message}"),
        }
        emitted += 1;
    }
    emitted
}

#[macro_export]
macro_rules! durable_debug {
    ($logger:expr, $($arg:tt)+) => {{
        $logger.debug(format!($($arg)+));
    }};
}

#[macro_export]
macro_rules! durable_info {
    ($logger:expr, $($arg:tt)+) => {{
        $logger.info(format!($($arg)+));
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($logger:expr, $($arg:tt)+) => {{
        $logger.warn(format!($($arg)+));
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($logger:expr, $($arg:tt)+) => {{
        $logger.error(format!($($arg)+));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Event, run_turn};

    #[test]
    fn records_before_last_recorded_call_site_are_marked_replaying() {
        let history = vec![
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
            Event::ActivityCompleted {
                id: 1,
                result: "ok".into(),
            },
        ];
        let (_, _, logs, _) = run_turn(history, |ctx| async move {
            let log = ctx.logger("test");
            log.info("before A");
            let _ = ctx.call_activity("A", "x").await;
            durable_info!(log, "after {}", "A");
            let _ = ctx.call_activity("B", "y").await;
            "done".to_string()
        });
        assert_eq!(logs.len(), 2);
        assert!(logs[0].replaying);
        assert!(!logs[1].replaying);
        assert_eq!(logs[1].message, "after A");
        assert_eq!(emit("inst", 0, &logs), 1);
    }
}
