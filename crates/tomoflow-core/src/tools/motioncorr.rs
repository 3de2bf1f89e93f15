use std::fs;
use std::path::PathBuf;

use tracing::debug;

use crate::params::{MotionCorrectionParams, StageConfig};
use crate::registry::{Artifacts, RawInput, RegistryEntry};

use super::{
    image_role, run_invocation, wrong_params, ExecContext, ToolAdapter, ToolFailure, ToolInvocation,
};

/// Artifact role prefix of corrected images.
pub const CORRECTED_ROLE: &str = "corrected";

/// MotionCor2, one invocation per raw tilt image.
pub struct MotionCorrAdapter;

impl MotionCorrAdapter {
    fn output_for(config: &StageConfig, entry: &RegistryEntry, raw: &RawInput) -> PathBuf {
        config.system.output_path.join(format!(
            "{}_{}_{:03}_{}.mrc",
            config.system.output_prefix, entry.unit.id, raw.image_index, raw.tilt_angle
        ))
    }

    fn invocation(
        params: &MotionCorrectionParams,
        raw: &RawInput,
        output: PathBuf,
        gpu: u32,
    ) -> ToolInvocation {
        let input_flag = if params.source_tiff { "-InTiff" } else { "-InMrc" };
        let patch = params
            .patch_size
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let mut inv = ToolInvocation::new(&params.exec_path)
            .path_opt(input_flag, &raw.path)
            .path_opt("-OutMrc", &output)
            .opt("-Gpu", gpu)
            .opt("-GpuMemUsage", params.gpu_memory_usage);
        if let Some(gain) = &params.gain_reference {
            inv = inv.path_opt("-Gain", gain);
        }
        inv.opt("-Tol", params.tolerance)
            .opt("-Patch", patch)
            .opt("-Iter", params.max_iterations)
            .opt("-Group", u8::from(params.use_subgroups))
            .opt("-FtBin", params.ft_bin())
            .opt("-PixSize", params.pixel_size)
            .opt("-Throw", params.discard_frames_top)
            .opt("-Trunc", params.discard_frames_bottom)
            .expect_output(output)
    }
}

impl ToolAdapter for MotionCorrAdapter {
    fn name(&self) -> &str {
        "MotionCor2"
    }

    fn execute(
        &self,
        entry: &RegistryEntry,
        config: &StageConfig,
        ctx: &ExecContext,
    ) -> Result<Artifacts, ToolFailure> {
        let params = config
            .motion_correction()
            .ok_or_else(|| wrong_params(self.name(), config))?;
        fs::create_dir_all(&config.system.output_path).map_err(|e| {
            ToolFailure::launch(format!(
                "cannot create {}: {e}",
                config.system.output_path.display()
            ))
        })?;

        let mut artifacts = Artifacts::new();
        for (n, raw) in entry.unit.raw_inputs.iter().enumerate() {
            let output = Self::output_for(config, entry, raw);
            let gpu = params.gpu_ids[n % params.gpu_ids.len()];
            let inv = Self::invocation(params, raw, output.clone(), gpu);
            run_invocation(&inv, ctx)?;
            debug!(unit = %entry.id(), image = raw.image_index, "Image corrected");
            artifacts.insert(image_role(CORRECTED_ROLE, raw.image_index), output);
        }
        Ok(artifacts)
    }
}
