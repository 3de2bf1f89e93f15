//! Unit Registry: the tilt-series known to a project and, per stage, the
//! subset eligible to run.

mod scan;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::artifact::{read_text, write_atomic};
use crate::error::{Result, TomoError};
use crate::ledger::{RecordStatus, StageLedger};
use crate::stage::Stage;

pub use scan::{parse_image_name, scan_source, ParsedName};

/// Artifact role to file, as produced by one stage for one unit.
pub type Artifacts = BTreeMap<String, PathBuf>;

/// Stable tilt-series identifier, unique within a project.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(String);

impl UnitId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UnitId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// One raw tilt image of a tilt-series.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawInput {
    pub path: PathBuf,
    pub image_index: u32,
    pub tilt_angle: f64,
}

/// One tilt-series.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub id: UnitId,
    /// Ordered by `image_index`.
    pub raw_inputs: Vec<RawInput>,
}

impl Unit {
    /// Raw inputs sorted by ascending tilt angle.
    pub fn by_tilt_angle(&self) -> Vec<&RawInput> {
        let mut inputs: Vec<&RawInput> = self.raw_inputs.iter().collect();
        inputs.sort_by(|a, b| a.tilt_angle.total_cmp(&b.tilt_angle));
        inputs
    }
}

/// Master registry artifact, written once at project initialisation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MasterRegistry {
    #[serde(default)]
    pub units: Vec<Unit>,
}

impl MasterRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let text = read_text(path)?.ok_or_else(|| {
            TomoError::ledger_io(path, "master registry not found; run `scan` first")
        })?;
        toml::from_str(&text).map_err(|e| TomoError::ledger_io(path, e))
    }

    /// Write the registry. An existing one is only replaced when `overwrite`
    /// is set, since unit identities must stay stable for a project.
    pub fn save(&self, path: &Path, overwrite: bool) -> Result<()> {
        if !overwrite && path.exists() {
            return Err(TomoError::ledger_io(
                path,
                "master registry already exists; pass --force to rescan",
            ));
        }
        let text = toml::to_string_pretty(self).map_err(|e| TomoError::ledger_io(path, e))?;
        write_atomic(path, &text)?;
        info!(units = self.units.len(), path = %path.display(), "Master registry written");
        Ok(())
    }
}

/// A unit eligible for a stage, with the outputs of its completed ancestors.
#[derive(Clone, Debug, PartialEq)]
pub struct RegistryEntry {
    pub unit: Unit,
    /// Union of the artifacts of every completed earlier stage.
    pub inputs: Artifacts,
}

impl RegistryEntry {
    pub fn id(&self) -> &UnitId {
        &self.unit.id
    }

    /// Input artifacts whose role starts with `prefix`, in role order.
    pub fn inputs_with_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a Path)> + 'a {
        self.inputs
            .iter()
            .filter(move |(role, _)| role.starts_with(prefix))
            .map(|(role, path)| (role.as_str(), path.as_path()))
    }
}

/// The units eligible for one stage, in discovery order.
#[derive(Clone, Debug, Default)]
pub struct UnitRegistry {
    entries: Vec<RegistryEntry>,
    index: HashMap<UnitId, usize>,
}

impl UnitRegistry {
    /// Registry containing every unit, for the first stage.
    pub fn from_units(units: Vec<Unit>) -> Self {
        let entries = units
            .into_iter()
            .map(|unit| RegistryEntry {
                unit,
                inputs: Artifacts::new(),
            })
            .collect();
        Self::from_entries(entries)
    }

    fn from_entries(entries: Vec<RegistryEntry>) -> Self {
        let index = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.unit.id.clone(), i))
            .collect();
        Self { entries, index }
    }

    /// Registry for `stage`: units whose predecessor record is completed.
    ///
    /// `ancestors` are the ledgers of the stages before `stage`, oldest
    /// first; the last one is the gating predecessor.
    pub fn for_stage(stage: Stage, units: &[Unit], ancestors: &[StageLedger]) -> Result<Self> {
        let predecessor = match stage.predecessor() {
            Some(p) => p,
            None => return Ok(Self::from_units(units.to_vec())),
        };
        let gate = ancestors
            .iter()
            .find(|l| l.stage() == predecessor)
            .ok_or(TomoError::StageDependency {
                stage,
                predecessor,
            })?;

        let entries: Vec<RegistryEntry> = units
            .iter()
            .filter(|u| gate.status_of(&u.id) == Some(RecordStatus::Completed))
            .map(|u| {
                let mut inputs = Artifacts::new();
                for ledger in ancestors {
                    if let Some(rec) = ledger.get(&u.id) {
                        if rec.status == RecordStatus::Completed {
                            inputs.extend(rec.output_artifacts.clone());
                        }
                    }
                }
                RegistryEntry {
                    unit: u.clone(),
                    inputs,
                }
            })
            .collect();

        debug!(
            stage = stage.key(),
            eligible = entries.len(),
            total = units.len(),
            "Registry restricted to completed predecessor units"
        );
        if entries.is_empty() {
            return Err(TomoError::StageDependency {
                stage,
                predecessor,
            });
        }
        Ok(Self::from_entries(entries))
    }

    pub fn by_id(&self, id: &UnitId) -> Result<&RegistryEntry> {
        self.index
            .get(id)
            .map(|&i| &self.entries[i])
            .ok_or_else(|| TomoError::UnknownUnit(id.to_string()))
    }

    pub fn contains(&self, id: &UnitId) -> bool {
        self.index.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &UnitId> {
        self.entries.iter().map(|e| &e.unit.id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
