use std::collections::HashSet;

use tracing::debug;

use crate::error::{Result, TomoError};
use crate::ledger::{RecordStatus, StageLedger};
use crate::registry::{UnitId, UnitRegistry};

/// The units to (re)submit in one stage run, in registry order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProcessList {
    pub units: Vec<UnitId>,
    /// Candidates left out because they are already completed.
    pub skipped_completed: Vec<UnitId>,
}

impl ProcessList {
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Select the units of `registry` that still need work in this stage.
///
/// `explicit` restricts the candidates; an empty slice means every unit of
/// the registry. Units with no record, or a pending, failed or interrupted
/// (`in_progress`) record are selected; completed units are not.
pub fn build(
    registry: &UnitRegistry,
    ledger: &StageLedger,
    explicit: &[UnitId],
) -> Result<ProcessList> {
    if let Some(unknown) = explicit.iter().find(|id| !registry.contains(id)) {
        return Err(TomoError::config(
            "system.process_list",
            format!("unit {unknown} is not eligible for {}", ledger.stage()),
        ));
    }
    let wanted: HashSet<&UnitId> = explicit.iter().collect();

    let mut list = ProcessList::default();
    for id in registry.ids() {
        if !wanted.is_empty() && !wanted.contains(id) {
            continue;
        }
        match ledger.status_of(id) {
            Some(RecordStatus::Completed) => list.skipped_completed.push(id.clone()),
            None
            | Some(RecordStatus::Pending)
            | Some(RecordStatus::Failed)
            | Some(RecordStatus::InProgress) => list.units.push(id.clone()),
        }
    }
    debug!(
        stage = ledger.stage().key(),
        selected = list.units.len(),
        completed = list.skipped_completed.len(),
        "Process list built"
    );
    Ok(list)
}
