use std::fs;
use std::path::Path;

use tracing::debug;

use crate::params::{CtfParams, StageConfig};
use crate::registry::{Artifacts, RegistryEntry};

use super::motioncorr::CORRECTED_ROLE;
use super::{
    run_invocation, wrong_params, ExecContext, FailureKind, ToolAdapter, ToolFailure,
    ToolInvocation,
};

pub const CTF_ROLE: &str = "ctf";

/// CTFFind4, one invocation per corrected image. CTFFind4 is interactive,
/// so the answers to its prompts are fed through stdin.
pub struct CtffindAdapter;

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

/// The prompt answers expected by CTFFind4, one per line.
pub(crate) fn stdin_answers(params: &CtfParams, input: &Path, output: &Path) -> String {
    let mut answers = vec![
        input.to_string_lossy().into_owned(),
        output.to_string_lossy().into_owned(),
        params.pixel_size.to_string(),
        params.voltage.to_string(),
        params.spherical_aberration.to_string(),
        params.amp_contrast.to_string(),
        params.amp_spec_size.to_string(),
        params.resolution_min.to_string(),
        params.resolution_max.to_string(),
        params.defocus_min.to_string(),
        params.defocus_max.to_string(),
        params.defocus_step.to_string(),
        params.astigm_type.clone().unwrap_or_else(|| "no".into()),
        yes_no(params.exhaustive_search).into(),
        yes_no(params.astigm_restraint.is_some()).into(),
    ];
    if let Some(restraint) = params.astigm_restraint {
        answers.push(restraint.to_string());
    }
    answers.push(yes_no(params.phase_shift).into());
    // Expert options.
    answers.push("no".into());
    let mut text = answers.join("\n");
    text.push('\n');
    text
}

impl ToolAdapter for CtffindAdapter {
    fn name(&self) -> &str {
        "CTFFind4"
    }

    fn execute(
        &self,
        entry: &RegistryEntry,
        config: &StageConfig,
        ctx: &ExecContext,
    ) -> Result<Artifacts, ToolFailure> {
        let params = config.ctf().ok_or_else(|| wrong_params(self.name(), config))?;
        let out_dir = &config.system.output_path;
        fs::create_dir_all(out_dir).map_err(|e| {
            ToolFailure::launch(format!("cannot create {}: {e}", out_dir.display()))
        })?;

        let prefix = format!("{CORRECTED_ROLE}_");
        let mut artifacts = Artifacts::new();
        for (role, image) in entry.inputs_with_prefix(&prefix) {
            let index = &role[prefix.len()..];
            let output = out_dir.join(format!(
                "{}_{}_{index}_ctffind.mrc",
                config.system.output_prefix,
                entry.id()
            ));
            let inv = ToolInvocation::new(&params.exec_path)
                .stdin(stdin_answers(params, image, &output))
                .expect_output(&output);
            run_invocation(&inv, ctx)?;
            debug!(unit = %entry.id(), image = index, "CTF estimated");
            artifacts.insert(format!("{CTF_ROLE}_{index}"), output);
        }
        if artifacts.is_empty() {
            return Err(ToolFailure::new(
                FailureKind::Launch,
                format!("no corrected images recorded for unit {}", entry.id()),
            ));
        }
        Ok(artifacts)
    }
}
