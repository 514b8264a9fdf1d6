//! Append-only activity log written by every stage.
//!
//! Records are immutable once appended. Each append is mirrored as a
//! `tracing` event so the audit trail shows up in ordinary logs too.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::StoreError;

/// Which stage wrote a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    AbandonmentDetector,
    ReengagementDispatcher,
    SessionRecovery,
    CreditEvaluator,
    LeadSubmitter,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AbandonmentDetector => "abandonment_detector",
            Self::ReengagementDispatcher => "reengagement_dispatcher",
            Self::SessionRecovery => "session_recovery",
            Self::CreditEvaluator => "credit_evaluator",
            Self::LeadSubmitter => "lead_submitter",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "abandonment_detector" => Ok(Self::AbandonmentDetector),
            "reengagement_dispatcher" => Ok(Self::ReengagementDispatcher),
            "session_recovery" => Ok(Self::SessionRecovery),
            "credit_evaluator" => Ok(Self::CreditEvaluator),
            "lead_submitter" => Ok(Self::LeadSubmitter),
            _ => Err(format!("Unknown stage: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    /// Ran, but intentionally did nothing (e.g. not qualified).
    Skipped,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Skipped => "skipped",
        }
    }
}

impl std::str::FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Unknown outcome: {s}")),
        }
    }
}

/// Immutable audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: Uuid,
    pub stage: Stage,
    pub action: String,
    /// Visitor, token fingerprint or lead id, depending on the action.
    pub target_id: String,
    pub outcome: Outcome,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// Durable, append-only destination for activity records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: ActivityRecord) -> Result<(), StoreError>;

    /// Records for one target, oldest first.
    async fn records_for(&self, target_id: &str) -> Result<Vec<ActivityRecord>, StoreError>;
}

/// Stage-facing handle onto the audit sink.
#[derive(Clone)]
pub struct ActivityLog {
    sink: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl ActivityLog {
    pub fn new(sink: Arc<dyn AuditSink>, clock: Arc<dyn Clock>) -> Self {
        Self { sink, clock }
    }

    /// Append a record. A sink failure is logged, never propagated: the
    /// audit trail must not take the pipeline down with it.
    pub async fn record(
        &self,
        stage: Stage,
        action: &str,
        target_id: impl Into<String>,
        outcome: Outcome,
        metadata: serde_json::Value,
    ) {
        let record = ActivityRecord {
            id: Uuid::new_v4(),
            stage,
            action: action.to_string(),
            target_id: target_id.into(),
            outcome,
            timestamp: self.clock.now(),
            metadata,
        };

        match outcome {
            Outcome::Failure => warn!(
                stage = %stage,
                action,
                target = %record.target_id,
                metadata = %record.metadata,
                "Activity failed"
            ),
            _ => info!(
                stage = %stage,
                action,
                target = %record.target_id,
                outcome = outcome.as_str(),
                "Activity"
            ),
        }

        if let Err(e) = self.sink.append(record).await {
            error!(stage = %stage, action, error = %e, "Failed to append activity record");
        }
    }

    pub async fn records_for(&self, target_id: &str) -> Result<Vec<ActivityRecord>, StoreError> {
        self.sink.records_for(target_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn records_are_appended_in_order() {
        let store = Arc::new(MemoryStore::new());
        let log = ActivityLog::new(store.clone(), Arc::new(SystemClock));

        log.record(Stage::AbandonmentDetector, "detect", "v1", Outcome::Success, serde_json::json!({})).await;
        log.record(Stage::ReengagementDispatcher, "dispatch", "v1", Outcome::Failure, serde_json::json!({"error": "smtp"})).await;
        log.record(Stage::AbandonmentDetector, "detect", "v2", Outcome::Skipped, serde_json::json!({})).await;

        let records = log.records_for("v1").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].stage, Stage::AbandonmentDetector);
        assert_eq!(records[1].outcome, Outcome::Failure);
        assert_eq!(records[1].metadata["error"], "smtp");
    }

    #[test]
    fn stage_names_roundtrip() {
        for stage in [
            Stage::AbandonmentDetector,
            Stage::ReengagementDispatcher,
            Stage::SessionRecovery,
            Stage::CreditEvaluator,
            Stage::LeadSubmitter,
        ] {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
    }
}
