use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use toml::Table;

use crate::registry::{Artifacts, UnitId};
use crate::stage::Stage;
use crate::tools::ToolFailure;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A requested status change for one unit.
#[derive(Clone, Debug, PartialEq)]
pub enum RecordUpdate {
    Pending,
    InProgress,
    Completed(Artifacts),
    Failed(ToolFailure),
}

impl RecordUpdate {
    pub fn status(&self) -> RecordStatus {
        match self {
            Self::Pending => RecordStatus::Pending,
            Self::InProgress => RecordStatus::InProgress,
            Self::Completed(_) => RecordStatus::Completed,
            Self::Failed(_) => RecordStatus::Failed,
        }
    }
}

/// A superseded attempt, kept for inspection only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriorAttempt {
    pub status: RecordStatus,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolFailure>,
}

/// The authoritative status of one unit in one stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub unit_id: UnitId,
    pub stage: Stage,
    pub status: RecordStatus,
    /// Times the unit has entered `in_progress`.
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
    /// Set only while failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolFailure>,
    /// Set only while completed.
    #[serde(default, skip_serializing_if = "Artifacts::is_empty")]
    pub output_artifacts: Artifacts,
    /// Tool parameters the latest attempt ran with.
    #[serde(default)]
    pub parameters_snapshot: Table,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<PriorAttempt>,
}

impl StageRecord {
    pub(super) fn new(unit_id: UnitId, stage: Stage) -> Self {
        Self {
            unit_id,
            stage,
            status: RecordStatus::Pending,
            attempts: 0,
            updated_at: Utc::now(),
            error: None,
            output_artifacts: Artifacts::new(),
            parameters_snapshot: Table::new(),
            history: Vec::new(),
        }
    }

    pub(super) fn archive(&mut self, reason: Option<String>) {
        self.history.push(PriorAttempt {
            status: self.status,
            attempts: self.attempts,
            updated_at: self.updated_at,
            reason,
            error: self.error.clone(),
        });
    }

    pub(super) fn apply(&mut self, update: RecordUpdate, snapshot: &Table) {
        self.status = update.status();
        self.error = None;
        self.output_artifacts.clear();
        match update {
            RecordUpdate::Pending => {}
            RecordUpdate::InProgress => self.attempts += 1,
            RecordUpdate::Completed(artifacts) => self.output_artifacts = artifacts,
            RecordUpdate::Failed(failure) => self.error = Some(failure),
        }
        self.parameters_snapshot = snapshot.clone();
        self.updated_at = Utc::now();
    }
}

/// Whether a record in `from` (`None` = no record) may move to `to`.
///
/// `completed` and `failed` are terminal; only [`StageLedger::reset`] moves
/// them back to `pending`.
///
/// [`StageLedger::reset`]: super::StageLedger::reset
pub fn transition_allowed(from: Option<RecordStatus>, to: RecordStatus) -> bool {
    use RecordStatus::*;
    matches!(
        (from, to),
        (None | Some(Pending), Pending | InProgress)
            | (Some(InProgress), InProgress | Completed | Failed)
    )
}
