//! Parameter Store: layered, validated stage configuration.

mod config;
mod master;
mod overrides;
mod store;

pub use config::{
    AlignmentParams, BeamTiltOption, CtfParams, FitOption, MotionCorrectionParams,
    ReconstructionParams, StageConfig, SystemConfig, ToolParams, TrimvolReorient,
};
pub use master::{
    default_output_folder, AcquisitionConfig, MasterConfig, SourceConfig, SystemDefaults,
    ToolPaths,
};
pub use overrides::Overrides;
pub use store::{merge_into, resolve, ConfigSources, ParameterStore};
