//! Stage Metadata Ledger: the persisted per-unit status of one stage.

mod record;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use toml::Table;
use tracing::{debug, info};

use crate::artifact::{read_text, write_atomic};
use crate::error::{Result, TomoError};
use crate::registry::UnitId;
use crate::stage::Stage;

pub use record::{transition_allowed, PriorAttempt, RecordStatus, RecordUpdate, StageRecord};

/// Per-status record counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LedgerCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

impl LedgerCounts {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.failed
    }
}

/// All records of one stage, keyed by unit.
///
/// Only one writer may hold a ledger at a time; the runner keeps it on the
/// coordinating thread.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageLedger {
    stage: Stage,
    #[serde(default)]
    records: BTreeMap<UnitId, StageRecord>,
}

impl StageLedger {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            records: BTreeMap::new(),
        }
    }

    /// Load the ledger at `path`. A missing file is an empty ledger.
    pub fn load(path: &Path, stage: Stage) -> Result<Self> {
        let text = match read_text(path)? {
            Some(text) => text,
            None => {
                debug!(path = %path.display(), "No ledger yet, starting empty");
                return Ok(Self::new(stage));
            }
        };
        let ledger: Self = toml::from_str(&text).map_err(|e| TomoError::ledger_io(path, e))?;
        if ledger.stage != stage {
            return Err(TomoError::ledger_io(
                path,
                format!("ledger belongs to {}, expected {stage}", ledger.stage),
            ));
        }
        if let Some((id, _)) = ledger
            .records
            .iter()
            .find(|(id, r)| r.unit_id != **id || r.stage != stage)
        {
            return Err(TomoError::ledger_io(
                path,
                format!("record {id} does not match its key or stage"),
            ));
        }
        Ok(ledger)
    }

    /// Load and then demote every completed record that is stale against
    /// `snapshot` or whose artifacts are gone.
    pub fn open(path: &Path, stage: Stage, snapshot: &Table) -> Result<Self> {
        let mut ledger = Self::load(path, stage)?;
        let stale = ledger.invalidate_stale(snapshot);
        let missing = ledger.invalidate_missing_artifacts();
        if !stale.is_empty() || !missing.is_empty() {
            info!(
                stage = stage.key(),
                stale = stale.len(),
                missing_artifacts = missing.len(),
                "Completed records invalidated"
            );
        }
        Ok(ledger)
    }

    /// Apply `update` to the record of `unit`.
    pub fn record(
        &mut self,
        unit: &UnitId,
        update: RecordUpdate,
        snapshot: &Table,
    ) -> Result<&StageRecord> {
        let from = self.status_of(unit);
        let to = update.status();
        if !transition_allowed(from, to) {
            return Err(TomoError::IllegalTransition {
                unit: unit.to_string(),
                from: from.map_or_else(|| "absent".to_string(), |s| s.to_string()),
                to: to.to_string(),
            });
        }
        let stage = self.stage;
        let rec = self
            .records
            .entry(unit.clone())
            .or_insert_with(|| StageRecord::new(unit.clone(), stage));
        // Resubmission of an interrupted attempt.
        if to == RecordStatus::InProgress && from == Some(RecordStatus::InProgress) {
            rec.archive(None);
        }
        rec.apply(update, snapshot);
        Ok(rec)
    }

    /// Return the record of `unit` to pending, keeping the old one in its
    /// history. Absent records are left absent.
    pub fn reset(&mut self, unit: &UnitId, reason: &str) {
        if let Some(rec) = self.records.get_mut(unit) {
            rec.archive(Some(reason.to_string()));
            let snapshot = std::mem::take(&mut rec.parameters_snapshot);
            rec.apply(RecordUpdate::Pending, &snapshot);
        }
    }

    /// Demote completed records produced with parameters other than
    /// `snapshot`.
    pub fn invalidate_stale(&mut self, snapshot: &Table) -> Vec<UnitId> {
        let stale: Vec<UnitId> = self
            .records
            .values()
            .filter(|r| r.status == RecordStatus::Completed && r.parameters_snapshot != *snapshot)
            .map(|r| r.unit_id.clone())
            .collect();
        for id in &stale {
            debug!(stage = self.stage.key(), unit = %id, "Parameters changed, reprocessing");
            self.reset(id, "parameters changed");
        }
        stale
    }

    /// Demote completed records with an output artifact missing on disk.
    pub fn invalidate_missing_artifacts(&mut self) -> Vec<UnitId> {
        let missing: Vec<UnitId> = self
            .records
            .values()
            .filter(|r| {
                r.status == RecordStatus::Completed
                    && r.output_artifacts.values().any(|p| !p.exists())
            })
            .map(|r| r.unit_id.clone())
            .collect();
        for id in &missing {
            debug!(stage = self.stage.key(), unit = %id, "Output artifact missing, reprocessing");
            self.reset(id, "output artifact missing");
        }
        missing
    }

    /// Write the ledger atomically to `path`.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| TomoError::ledger_io(path, e))?;
        write_atomic(path, &text)
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn get(&self, unit: &UnitId) -> Option<&StageRecord> {
        self.records.get(unit)
    }

    pub fn status_of(&self, unit: &UnitId) -> Option<RecordStatus> {
        self.records.get(unit).map(|r| r.status)
    }

    pub fn records(&self) -> impl Iterator<Item = &StageRecord> {
        self.records.values()
    }

    pub fn ids_with(&self, status: RecordStatus) -> Vec<UnitId> {
        self.records
            .values()
            .filter(|r| r.status == status)
            .map(|r| r.unit_id.clone())
            .collect()
    }

    pub fn completed_ids(&self) -> Vec<UnitId> {
        self.ids_with(RecordStatus::Completed)
    }

    pub fn failed_ids(&self) -> Vec<UnitId> {
        self.ids_with(RecordStatus::Failed)
    }

    pub fn counts(&self) -> LedgerCounts {
        let mut counts = LedgerCounts::default();
        for rec in self.records.values() {
            match rec.status {
                RecordStatus::Pending => counts.pending += 1,
                RecordStatus::InProgress => counts.in_progress += 1,
                RecordStatus::Completed => counts.completed += 1,
                RecordStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table() {
        use RecordStatus::*;
        assert!(transition_allowed(None, InProgress));
        assert!(transition_allowed(None, Pending));
        assert!(!transition_allowed(None, Completed));
        assert!(transition_allowed(Some(InProgress), Failed));
        assert!(!transition_allowed(Some(Failed), InProgress));
        assert!(!transition_allowed(Some(Failed), Completed));
        assert!(transition_allowed(Some(InProgress), InProgress));
        assert!(!transition_allowed(Some(Completed), InProgress));
        assert!(!transition_allowed(Some(Completed), Pending));
    }
}
