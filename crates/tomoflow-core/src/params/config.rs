use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use toml::{Table, Value};

use crate::consts::{COSMETIC_PARAM_KEYS, DEFAULT_CHECKPOINT_INTERVAL, DEFAULT_PARALLELISM};
use crate::error::{Result, TomoError};
use crate::registry::UnitId;
use crate::stage::Stage;

/// The `[system]` block shared by every stage config.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystemConfig {
    /// Explicit subset of units to consider; empty means every eligible unit.
    #[serde(default)]
    pub process_list: Vec<UnitId>,
    pub output_path: PathBuf,
    #[serde(default)]
    pub output_prefix: String,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Per-unit timeout in seconds; 0 disables it.
    #[serde(default)]
    pub unit_timeout_secs: u64,
    /// Finished units between two ledger checkpoints.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,
}

impl SystemConfig {
    const REQUIRED: &'static [&'static str] = &["output_path"];

    pub fn unit_timeout(&self) -> Option<std::time::Duration> {
        (self.unit_timeout_secs > 0)
            .then(|| std::time::Duration::from_secs(self.unit_timeout_secs))
    }
}

fn default_parallelism() -> usize {
    DEFAULT_PARALLELISM
}

fn default_checkpoint_interval() -> usize {
    DEFAULT_CHECKPOINT_INTERVAL
}

/// MotionCor2 parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MotionCorrectionParams {
    pub exec_path: PathBuf,
    /// Raw pixel size in Angstroms.
    pub pixel_size: f64,
    /// Super-resolution input: output is binned by 2.
    #[serde(default)]
    pub super_resolution: bool,
    #[serde(default)]
    pub source_tiff: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gain_reference: Option<PathBuf>,
    #[serde(default = "mc_tolerance")]
    pub tolerance: f64,
    #[serde(default = "mc_patch_size")]
    pub patch_size: Vec<u32>,
    #[serde(default = "mc_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "yes")]
    pub use_subgroups: bool,
    #[serde(default)]
    pub discard_frames_top: u32,
    #[serde(default)]
    pub discard_frames_bottom: u32,
    #[serde(default = "mc_gpu_ids")]
    pub gpu_ids: Vec<u32>,
    #[serde(default = "mc_gpu_memory_usage")]
    pub gpu_memory_usage: f64,
}

impl MotionCorrectionParams {
    /// Pixel size of the corrected images.
    pub fn output_pixel_size(&self) -> f64 {
        if self.super_resolution {
            self.pixel_size * 2.0
        } else {
            self.pixel_size
        }
    }

    /// MotionCor2 `-FtBin` factor.
    pub fn ft_bin(&self) -> f64 {
        self.output_pixel_size() / self.pixel_size
    }
}

fn mc_tolerance() -> f64 {
    0.5
}
fn mc_patch_size() -> Vec<u32> {
    vec![5, 5, 20]
}
fn mc_max_iterations() -> u32 {
    10
}
fn mc_gpu_ids() -> Vec<u32> {
    vec![0]
}
fn mc_gpu_memory_usage() -> f64 {
    1.0
}
fn yes() -> bool {
    true
}

/// CTFFind4 parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CtfParams {
    pub exec_path: PathBuf,
    pub pixel_size: f64,
    #[serde(default = "ctf_voltage")]
    pub voltage: f64,
    #[serde(default = "ctf_cs")]
    pub spherical_aberration: f64,
    #[serde(default = "ctf_amp_contrast")]
    pub amp_contrast: f64,
    #[serde(default = "ctf_spec_size")]
    pub amp_spec_size: u32,
    #[serde(default = "ctf_res_min")]
    pub resolution_min: f64,
    #[serde(default = "ctf_res_max")]
    pub resolution_max: f64,
    #[serde(default = "ctf_defocus_min")]
    pub defocus_min: f64,
    #[serde(default = "ctf_defocus_max")]
    pub defocus_max: f64,
    #[serde(default = "ctf_defocus_step")]
    pub defocus_step: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub astigm_type: Option<String>,
    #[serde(default)]
    pub exhaustive_search: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub astigm_restraint: Option<f64>,
    #[serde(default)]
    pub phase_shift: bool,
}

fn ctf_voltage() -> f64 {
    300.0
}
fn ctf_cs() -> f64 {
    2.7
}
fn ctf_amp_contrast() -> f64 {
    0.8
}
fn ctf_spec_size() -> u32 {
    512
}
fn ctf_res_min() -> f64 {
    30.0
}
fn ctf_res_max() -> f64 {
    5.0
}
fn ctf_defocus_min() -> f64 {
    5000.0
}
fn ctf_defocus_max() -> f64 {
    50000.0
}
fn ctf_defocus_step() -> f64 {
    500.0
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitOption {
    All,
    Group,
    One,
    Fixed,
}

impl FitOption {
    /// IMOD tiltalign option code.
    pub fn code(self) -> u8 {
        match self {
            Self::All => 2,
            Self::Group => 3,
            Self::One => 1,
            Self::Fixed => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeamTiltOption {
    Fixed,
    Search,
}

/// IMOD stack creation and batchruntomo alignment parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlignmentParams {
    /// batchruntomo executable.
    pub exec_path: PathBuf,
    #[serde(default = "newstack")]
    pub newstack_path: PathBuf,
    /// Beam rotation angle in degrees.
    pub rot_angle: f64,
    /// Pixel size of the corrected images in Angstroms.
    pub pixel_size: f64,
    #[serde(default = "yes")]
    pub use_rawtlt: bool,
    /// Gold fiducial size in nm; 0 for fiducial-less patch tracking.
    #[serde(default)]
    pub fiducial_size: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adoc_template: Option<PathBuf>,
    #[serde(default = "four")]
    pub stack_bin_factor: u32,
    #[serde(default)]
    pub delete_old_files: bool,
    #[serde(default)]
    pub remove_xrays: bool,
    #[serde(default = "four")]
    pub coarse_align_bin_factor: u32,
    #[serde(default = "al_patch_size")]
    pub patch_size: Vec<u32>,
    #[serde(default = "al_num_patches")]
    pub num_patches: Vec<u32>,
    #[serde(default = "four")]
    pub num_iter: u32,
    #[serde(default = "al_limits_on_shift")]
    pub limits_on_shift: Vec<u32>,
    #[serde(default)]
    pub adjust_tilt_angles: bool,
    #[serde(default = "one")]
    pub num_surfaces: u32,
    #[serde(default = "fit_fixed")]
    pub mag_option: FitOption,
    #[serde(default = "fit_fixed")]
    pub tilt_option: FitOption,
    #[serde(default = "fit_group")]
    pub rot_option: FitOption,
    #[serde(default = "beam_tilt_fixed")]
    pub beam_tilt_option: BeamTiltOption,
    #[serde(default = "yes")]
    pub robust_fitting: bool,
    #[serde(default = "yes")]
    pub weight_contours: bool,
}

fn newstack() -> PathBuf {
    PathBuf::from("newstack")
}
fn four() -> u32 {
    4
}
fn one() -> u32 {
    1
}
fn al_patch_size() -> Vec<u32> {
    vec![200, 200]
}
fn al_num_patches() -> Vec<u32> {
    vec![24, 24]
}
fn al_limits_on_shift() -> Vec<u32> {
    vec![2, 2]
}
fn fit_fixed() -> FitOption {
    FitOption::Fixed
}
fn fit_group() -> FitOption {
    FitOption::Group
}
fn beam_tilt_fixed() -> BeamTiltOption {
    BeamTiltOption::Fixed
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrimvolReorient {
    None,
    Flip,
    Rotate,
}

impl TrimvolReorient {
    pub fn code(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Flip => 1,
            Self::Rotate => 2,
        }
    }
}

/// batchruntomo reconstruction parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconstructionParams {
    pub exec_path: PathBuf,
    /// Reconstruction thickness in pixels.
    pub thickness: u32,
    pub pixel_size: f64,
    pub rot_angle: f64,
    #[serde(default)]
    pub gold_size: f64,
    #[serde(default)]
    pub do_positioning: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unbinned_thickness: Option<u32>,
    #[serde(default)]
    pub correct_ctf: bool,
    #[serde(default)]
    pub erase_gold: bool,
    #[serde(default)]
    pub filtering: bool,
    #[serde(default = "one")]
    pub bin_factor: u32,
    #[serde(default = "yes")]
    pub run_trimvol: bool,
    #[serde(default = "trimvol_rotate")]
    pub trimvol_reorient: TrimvolReorient,
}

fn trimvol_rotate() -> TrimvolReorient {
    TrimvolReorient::Rotate
}

/// Tool-specific parameter block, one variant per stage.
#[derive(Clone, Debug, PartialEq)]
pub enum ToolParams {
    MotionCorrection(MotionCorrectionParams),
    CtfEstimation(CtfParams),
    Alignment(AlignmentParams),
    Reconstruction(ReconstructionParams),
}

impl ToolParams {
    pub fn stage(&self) -> Stage {
        match self {
            Self::MotionCorrection(_) => Stage::MotionCorrection,
            Self::CtfEstimation(_) => Stage::CtfEstimation,
            Self::Alignment(_) => Stage::Alignment,
            Self::Reconstruction(_) => Stage::Reconstruction,
        }
    }

    fn required(stage: Stage) -> &'static [&'static str] {
        match stage {
            Stage::MotionCorrection => &["exec_path", "pixel_size"],
            Stage::CtfEstimation => &["exec_path", "pixel_size"],
            Stage::Alignment => &["exec_path", "rot_angle", "pixel_size"],
            Stage::Reconstruction => &["exec_path", "thickness", "pixel_size", "rot_angle"],
        }
    }

    fn from_value(stage: Stage, value: Value) -> Result<Self> {
        let section = stage.key();
        Ok(match stage {
            Stage::MotionCorrection => Self::MotionCorrection(decode(section, value)?),
            Stage::CtfEstimation => Self::CtfEstimation(decode(section, value)?),
            Stage::Alignment => Self::Alignment(decode(section, value)?),
            Stage::Reconstruction => Self::Reconstruction(decode(section, value)?),
        })
    }

    fn to_value(&self) -> Result<Value> {
        let section = self.stage().key();
        match self {
            Self::MotionCorrection(p) => encode(section, p),
            Self::CtfEstimation(p) => encode(section, p),
            Self::Alignment(p) => encode(section, p),
            Self::Reconstruction(p) => encode(section, p),
        }
    }

    fn validate(&self) -> Result<()> {
        let s = self.stage().key();
        match self {
            Self::MotionCorrection(p) => {
                positive(s, "pixel_size", p.pixel_size)?;
                positive(s, "tolerance", p.tolerance)?;
                if p.patch_size.len() != 3 {
                    return Err(field_err(s, "patch_size", "expected 3 values"));
                }
                if p.gpu_ids.is_empty() {
                    return Err(field_err(s, "gpu_ids", "at least one GPU is required"));
                }
            }
            Self::CtfEstimation(p) => {
                positive(s, "pixel_size", p.pixel_size)?;
                positive(s, "voltage", p.voltage)?;
                if !(p.amp_contrast > 0.0 && p.amp_contrast < 1.0) {
                    return Err(field_err(s, "amp_contrast", "must lie in (0, 1)"));
                }
                if p.resolution_min <= p.resolution_max {
                    return Err(field_err(
                        s,
                        "resolution_min",
                        "must be larger than resolution_max",
                    ));
                }
                if p.defocus_min >= p.defocus_max {
                    return Err(field_err(s, "defocus_min", "must be below defocus_max"));
                }
                positive(s, "defocus_step", p.defocus_step)?;
            }
            Self::Alignment(p) => {
                positive(s, "pixel_size", p.pixel_size)?;
                if p.mag_option == FitOption::One {
                    return Err(field_err(s, "mag_option", "`one` applies to rot_option only"));
                }
                if p.tilt_option == FitOption::One {
                    return Err(field_err(s, "tilt_option", "`one` applies to rot_option only"));
                }
                if !(1..=4).contains(&p.num_iter) {
                    return Err(field_err(s, "num_iter", "must be between 1 and 4"));
                }
                if !(1..=2).contains(&p.num_surfaces) {
                    return Err(field_err(s, "num_surfaces", "must be 1 or 2"));
                }
                for (key, v) in [
                    ("patch_size", &p.patch_size),
                    ("num_patches", &p.num_patches),
                    ("limits_on_shift", &p.limits_on_shift),
                ] {
                    if v.len() != 2 {
                        return Err(field_err(s, key, "expected 2 values"));
                    }
                }
            }
            Self::Reconstruction(p) => {
                positive(s, "pixel_size", p.pixel_size)?;
                if p.thickness == 0 {
                    return Err(field_err(s, "thickness", "must be positive"));
                }
                if p.do_positioning && p.unbinned_thickness.is_none() {
                    return Err(TomoError::config(
                        format!("{s}.unbinned_thickness"),
                        "required when do_positioning is set",
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Fully resolved configuration of one stage for one invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct StageConfig {
    pub stage: Stage,
    pub system: SystemConfig,
    pub params: ToolParams,
}

impl StageConfig {
    /// Build and validate a config from a merged document table holding a
    /// `[system]` section and a section named after the stage key.
    pub fn from_table(stage: Stage, mut table: Table) -> Result<Self> {
        let system = table
            .remove("system")
            .unwrap_or_else(|| Value::Table(Table::new()));
        let params = table
            .remove(stage.key())
            .unwrap_or_else(|| Value::Table(Table::new()));
        if let Some(unknown) = table.keys().next() {
            return Err(TomoError::config(
                unknown.clone(),
                format!("unknown section for {stage} config"),
            ));
        }

        check_required("system", &system, SystemConfig::REQUIRED)?;
        check_required(stage.key(), &params, ToolParams::required(stage))?;

        let system: SystemConfig = decode("system", system)?;
        let params = ToolParams::from_value(stage, params)?;
        let config = Self {
            stage,
            system,
            params,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn to_table(&self) -> Result<Table> {
        let mut table = Table::new();
        table.insert("system".into(), encode("system", &self.system)?);
        table.insert(self.stage.key().into(), self.params.to_value()?);
        Ok(table)
    }

    pub fn validate(&self) -> Result<()> {
        if self.params.stage() != self.stage {
            return Err(TomoError::config(
                self.stage.key(),
                format!("parameter block belongs to {}", self.params.stage()),
            ));
        }
        if self.system.parallelism == 0 {
            return Err(TomoError::config("system.parallelism", "must be at least 1"));
        }
        if self.system.checkpoint_interval == 0 {
            return Err(TomoError::config(
                "system.checkpoint_interval",
                "must be at least 1",
            ));
        }
        self.params.validate()
    }

    /// Tool parameters that determine the outputs, for staleness checks.
    pub fn snapshot(&self) -> Result<Table> {
        let mut table = match self.params.to_value()? {
            Value::Table(t) => t,
            _ => Table::new(),
        };
        for key in COSMETIC_PARAM_KEYS {
            table.remove(key);
        }
        Ok(table)
    }

    pub fn motion_correction(&self) -> Option<&MotionCorrectionParams> {
        match &self.params {
            ToolParams::MotionCorrection(p) => Some(p),
            _ => None,
        }
    }

    pub fn ctf(&self) -> Option<&CtfParams> {
        match &self.params {
            ToolParams::CtfEstimation(p) => Some(p),
            _ => None,
        }
    }

    pub fn alignment(&self) -> Option<&AlignmentParams> {
        match &self.params {
            ToolParams::Alignment(p) => Some(p),
            _ => None,
        }
    }

    pub fn reconstruction(&self) -> Option<&ReconstructionParams> {
        match &self.params {
            ToolParams::Reconstruction(p) => Some(p),
            _ => None,
        }
    }

    /// Values a downstream stage inherits from this resolved config.
    pub(crate) fn downstream_layer(&self, next: Stage) -> Table {
        let mut params = Table::new();
        match (&self.params, next) {
            (ToolParams::MotionCorrection(mc), Stage::CtfEstimation) => {
                params.insert("pixel_size".into(), Value::from(mc.output_pixel_size()));
            }
            (ToolParams::CtfEstimation(ctf), Stage::Alignment) => {
                params.insert("pixel_size".into(), Value::from(ctf.pixel_size));
            }
            (ToolParams::Alignment(al), Stage::Reconstruction) => {
                params.insert("pixel_size".into(), Value::from(al.pixel_size));
                params.insert("rot_angle".into(), Value::from(al.rot_angle));
                params.insert("gold_size".into(), Value::from(al.fiducial_size));
            }
            _ => {}
        }
        let mut layer = Table::new();
        layer.insert(next.key().into(), Value::Table(params));
        layer
    }
}

fn decode<T: DeserializeOwned>(section: &str, value: Value) -> Result<T> {
    value
        .try_into()
        .map_err(|e| TomoError::config(section, e.to_string()))
}

fn encode<T: Serialize>(section: &str, value: &T) -> Result<Value> {
    Value::try_from(value).map_err(|e| TomoError::config(section, e.to_string()))
}

fn check_required(section: &str, value: &Value, required: &[&str]) -> Result<()> {
    let table = value
        .as_table()
        .ok_or_else(|| TomoError::config(section, "expected a table"))?;
    match required.iter().find(|key| !table.contains_key(**key)) {
        Some(key) => Err(TomoError::missing(format!("{section}.{key}"))),
        None => Ok(()),
    }
}

fn field_err(section: &str, key: &str, reason: &str) -> TomoError {
    TomoError::config(format!("{section}.{key}"), reason)
}

fn positive(section: &str, key: &str, value: f64) -> Result<()> {
    if value > 0.0 {
        Ok(())
    } else {
        Err(field_err(section, key, "must be positive"))
    }
}
