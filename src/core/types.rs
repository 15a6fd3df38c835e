//! Result and stage types shared across the worker.
//!
//! A [`TaskResult`] is the only thing a caller ever gets back: an ordered,
//! append-only log, an optional error string, an optional page-body snapshot
//! and the terminal [`Stage`] the session reached. The wire shape
//! (PascalCase field names) is part of the external contract: downstream
//! consumers read `result.<uid>` records straight out of the shared store.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Session progress through one job.
///
/// Transitions are monotonic: [`TaskResult::advance_stage`] ignores attempts
/// to move backwards. The only way back to `Init` is an explicit tear-down
/// reset ([`TaskResult::reset_stage`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum Stage {
    #[default]
    Init,
    ObtainedPage,
    FormFilled,
    Done,
    /// Sentinel: session is poisoned and must be rebuilt.
    Error,
}

/// Structured outcome of one job: logs, error, page snapshot, stage.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskResult {
    #[serde(rename = "Logs")]
    pub logs: Vec<String>,
    #[serde(rename = "Error", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "Body", skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(rename = "Stage")]
    pub stage: Stage,
    /// Validation errors, populated only on the soft-failure path.
    #[serde(rename = "Errors", skip_serializing_if = "Vec::is_empty", default)]
    pub validation_errors: Vec<String>,
}

fn stamp(message: &str) -> String {
    format!(
        "[{}] - {}",
        Utc::now().format("%Y-%m-%d-%H:%M:%S%.3f"),
        message
    )
}

impl TaskResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a timestamped line to the chronological log and emit it via
    /// tracing. Both sinks always see the same text.
    pub fn log(&mut self, message: &str) {
        let line = stamp(message);
        info!("{}", line);
        self.logs.push(line);
    }

    /// Like [`log`](Self::log) but also records the line as the result's
    /// error string and flips the stage to the `Error` sentinel.
    pub fn record_error(&mut self, message: &str) {
        let line = stamp(message);
        error!("{}", line);
        self.logs.push(line.clone());
        self.error = Some(line);
        self.stage = Stage::Error;
    }

    /// Advance to `next` if it is further along than the current stage.
    /// Regressions are silently ignored; `Error` is sticky.
    pub fn advance_stage(&mut self, next: Stage) {
        if self.stage == Stage::Error {
            return;
        }
        if next > self.stage {
            self.stage = next;
        }
    }

    /// Tear-down reset: the one sanctioned way back to `Init`.
    pub fn reset_stage(&mut self) {
        self.stage = Stage::Init;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_ordering_is_monotonic() {
        let mut rs = TaskResult::new();
        rs.advance_stage(Stage::FormFilled);
        assert_eq!(rs.stage, Stage::FormFilled);
        // Regression attempt is ignored.
        rs.advance_stage(Stage::ObtainedPage);
        assert_eq!(rs.stage, Stage::FormFilled);
        rs.advance_stage(Stage::Done);
        assert_eq!(rs.stage, Stage::Done);
    }

    #[test]
    fn error_stage_is_sticky_until_reset() {
        let mut rs = TaskResult::new();
        rs.record_error("boom");
        rs.advance_stage(Stage::Done);
        assert_eq!(rs.stage, Stage::Error);
        rs.reset_stage();
        assert_eq!(rs.stage, Stage::Init);
    }

    #[test]
    fn logs_are_appended_in_order() {
        let mut rs = TaskResult::new();
        rs.log("first");
        rs.log("second");
        rs.record_error("third");
        assert_eq!(rs.logs.len(), 3);
        assert!(rs.logs[0].contains("first"));
        assert!(rs.logs[2].contains("third"));
        assert!(rs.error.as_deref().unwrap().contains("third"));
    }

    #[test]
    fn wire_shape_uses_pascal_case() {
        let mut rs = TaskResult::new();
        rs.body = Some("All done successfully".into());
        rs.stage = Stage::Done;
        let json = serde_json::to_value(&rs).unwrap();
        assert!(json.get("Logs").is_some());
        assert_eq!(json["Body"], "All done successfully");
        assert_eq!(json["Stage"], "Done");
        // Empty validation list is omitted from the payload.
        assert!(json.get("Errors").is_none());
    }
}
