use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use toml::{Table, Value};

use crate::artifact::{read_text, write_atomic};
use crate::consts::{DEFAULT_CHECKPOINT_INTERVAL, DEFAULT_PARALLELISM};
use crate::error::{Result, TomoError};
use crate::stage::Stage;

/// Project-wide settings, persisted as `<project>_proj.toml`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MasterConfig {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub system: SystemDefaults,
    #[serde(default)]
    pub tools: ToolPaths,
}

/// How raw tilt images are discovered on disk.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub source_folder: PathBuf,
    /// `""` = images directly in `source_folder`, `"*"` = any subfolder,
    /// otherwise subfolders named `<folder_prefix>_*`.
    #[serde(default)]
    pub folder_prefix: String,
    pub file_prefix: String,
    pub extension: String,
    /// Field numbers (after the file prefix) in `_`-separated file names.
    pub stack_field: usize,
    pub index_field: usize,
    pub tiltangle_field: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            source_folder: PathBuf::from("../raw"),
            folder_prefix: String::new(),
            file_prefix: String::new(),
            extension: "mrc".into(),
            stack_field: 0,
            index_field: 1,
            tiltangle_field: 2,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AcquisitionConfig {
    /// Raw image pixel size in Angstroms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pixel_size: Option<f64>,
    /// Beam voltage in keV.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spherical_aberration: Option<f64>,
    /// Tilt-axis rotation angle in degrees.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_angle: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystemDefaults {
    /// Stage output folders are created below this directory.
    pub output_root: PathBuf,
    pub parallelism: usize,
    /// Per-unit timeout in seconds; 0 disables it.
    #[serde(default)]
    pub unit_timeout_secs: u64,
    pub checkpoint_interval: usize,
}

impl Default for SystemDefaults {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("."),
            parallelism: DEFAULT_PARALLELISM,
            unit_timeout_secs: 0,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
        }
    }
}

/// Installation paths of the external tools.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolPaths {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motioncorr: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctffind: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batchruntomo: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newstack: Option<PathBuf>,
}

impl MasterConfig {
    /// Fresh master config for a new project. Tools are looked up on `PATH`.
    pub fn new(project: &str) -> Self {
        Self {
            source: SourceConfig {
                file_prefix: project.to_string(),
                ..Default::default()
            },
            acquisition: AcquisitionConfig::default(),
            system: SystemDefaults::default(),
            tools: ToolPaths {
                motioncorr: Some(PathBuf::from("MotionCor2")),
                ctffind: Some(PathBuf::from("ctffind")),
                batchruntomo: Some(PathBuf::from("batchruntomo")),
                newstack: Some(PathBuf::from("newstack")),
            },
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = read_text(path)?.ok_or_else(|| {
            TomoError::ledger_io(path, "master config not found; run `init` first")
        })?;
        toml::from_str(&text).map_err(|e| TomoError::config("master", e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text =
            toml::to_string_pretty(self).map_err(|e| TomoError::config("master", e.to_string()))?;
        write_atomic(path, &text)
    }

    /// The master fields relevant to `stage`, as a partial stage-config table.
    pub(crate) fn stage_layer(&self, stage: Stage) -> Table {
        let mut system = Table::new();
        system.insert(
            "output_path".into(),
            path_value(&self.system.output_root.join(default_output_folder(stage))),
        );
        if !self.source.file_prefix.is_empty() {
            system.insert(
                "output_prefix".into(),
                Value::from(self.source.file_prefix.clone()),
            );
        }
        system.insert(
            "parallelism".into(),
            Value::from(self.system.parallelism as i64),
        );
        system.insert(
            "unit_timeout_secs".into(),
            Value::from(self.system.unit_timeout_secs as i64),
        );
        system.insert(
            "checkpoint_interval".into(),
            Value::from(self.system.checkpoint_interval as i64),
        );

        let acq = &self.acquisition;
        let mut params = Table::new();
        match stage {
            Stage::MotionCorrection => {
                insert_path(&mut params, "exec_path", self.tools.motioncorr.as_deref());
                insert_f64(&mut params, "pixel_size", acq.pixel_size);
                let ext = self.source.extension.to_ascii_lowercase();
                params.insert(
                    "source_tiff".into(),
                    Value::from(ext == "tif" || ext == "tiff"),
                );
            }
            Stage::CtfEstimation => {
                insert_path(&mut params, "exec_path", self.tools.ctffind.as_deref());
                insert_f64(&mut params, "pixel_size", acq.pixel_size);
                insert_f64(&mut params, "voltage", acq.voltage);
                insert_f64(&mut params, "spherical_aberration", acq.spherical_aberration);
            }
            Stage::Alignment => {
                insert_path(&mut params, "exec_path", self.tools.batchruntomo.as_deref());
                insert_path(&mut params, "newstack_path", self.tools.newstack.as_deref());
                insert_f64(&mut params, "pixel_size", acq.pixel_size);
                insert_f64(&mut params, "rot_angle", acq.rotation_angle);
            }
            Stage::Reconstruction => {
                insert_path(&mut params, "exec_path", self.tools.batchruntomo.as_deref());
                insert_f64(&mut params, "pixel_size", acq.pixel_size);
                insert_f64(&mut params, "rot_angle", acq.rotation_angle);
            }
        }

        let mut layer = Table::new();
        layer.insert("system".into(), Value::Table(system));
        layer.insert(stage.key().into(), Value::Table(params));
        layer
    }
}

/// Default output folder name of each stage below `output_root`.
pub fn default_output_folder(stage: Stage) -> &'static str {
    match stage {
        Stage::MotionCorrection => "motioncor",
        Stage::CtfEstimation => "ctffind",
        Stage::Alignment | Stage::Reconstruction => "stacks",
    }
}

pub(crate) fn path_value(path: &Path) -> Value {
    Value::from(path.to_string_lossy().into_owned())
}

fn insert_path(table: &mut Table, key: &str, path: Option<&Path>) {
    if let Some(p) = path {
        table.insert(key.into(), path_value(p));
    }
}

fn insert_f64(table: &mut Table, key: &str, value: Option<f64>) {
    if let Some(v) = value {
        table.insert(key.into(), Value::from(v));
    }
}
