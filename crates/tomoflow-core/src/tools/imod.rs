//! IMOD stack creation, alignment and reconstruction through `newstack` and
//! `batchruntomo`.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::params::{AlignmentParams, BeamTiltOption, ReconstructionParams, StageConfig};
use crate::registry::{Artifacts, RegistryEntry};

use super::motioncorr::CORRECTED_ROLE;
use super::{
    image_role, run_invocation, wrong_params, ExecContext, ToolAdapter, ToolFailure,
    ToolInvocation,
};

pub const STACK_ROLE: &str = "stack";
pub const TILT_ANGLES_ROLE: &str = "tilt_angles";
pub const TRANSFORMS_ROLE: &str = "transforms";
pub const TOMOGRAM_ROLE: &str = "tomogram";

/// batchruntomo steps covering setup through fine alignment.
const ALIGN_STEPS: (u32, u32) = (0, 6);
/// batchruntomo steps covering aligned stack creation through post-processing.
const RECON_STEPS: (u32, u32) = (8, 20);

/// Per-unit working folder and file root shared by both IMOD stages.
struct UnitFolder {
    dir: PathBuf,
    root_name: String,
}

impl UnitFolder {
    fn new(config: &StageConfig, entry: &RegistryEntry) -> Self {
        let root_name = if config.system.output_prefix.is_empty() {
            entry.id().to_string()
        } else {
            format!("{}_{}", config.system.output_prefix, entry.id())
        };
        Self {
            dir: config.system.output_path.join(&root_name),
            root_name,
        }
    }

    /// The folder an alignment stack was written to.
    fn of_stack(stack: &Path) -> Option<Self> {
        Some(Self {
            dir: stack.parent()?.to_path_buf(),
            root_name: stack.file_stem()?.to_string_lossy().into_owned(),
        })
    }

    fn file(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}{suffix}", self.root_name))
    }

    fn create(&self) -> Result<(), ToolFailure> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            ToolFailure::launch(format!("cannot create {}: {e}", self.dir.display()))
        })
    }
}

fn write_file(path: &Path, contents: &str) -> Result<(), ToolFailure> {
    fs::write(path, contents)
        .map_err(|e| ToolFailure::launch(format!("cannot write {}: {e}", path.display())))
}

fn flag(b: bool) -> u8 {
    u8::from(b)
}

fn pair(v: &[u32]) -> String {
    v.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
}

fn batchruntomo(
    exec: &Path,
    folder: &UnitFolder,
    directive: &Path,
    (start, end): (u32, u32),
) -> ToolInvocation {
    ToolInvocation::new(exec)
        .path_opt("-DirectiveFile", directive)
        .opt("-RootName", &folder.root_name)
        .path_opt("-CurrentLocation", &folder.dir)
        .opt("-StartingStep", start)
        .opt("-EndingStep", end)
        .current_dir(&folder.dir)
}

/// batchruntomo directive (`.adoc`) contents.
#[derive(Default)]
struct Directive(String);

impl Directive {
    fn set(&mut self, key: &str, value: impl std::fmt::Display) {
        let _ = writeln!(self.0, "{key} = {value}");
    }
}

/// Directive for batchruntomo alignment of one stack.
pub(crate) fn align_directive(params: &AlignmentParams) -> String {
    let mut d = Directive::default();
    d.set("setupset.currentStackExt", "st");
    d.set("setupset.copyarg.stackext", "st");
    d.set("setupset.copyarg.userawtlt", flag(params.use_rawtlt));
    // IMOD takes the pixel size in nm.
    d.set("setupset.copyarg.pixel", params.pixel_size / 10.0);
    d.set("setupset.copyarg.rotation", params.rot_angle);
    d.set("setupset.copyarg.gold", params.fiducial_size);
    if let Some(template) = &params.adoc_template {
        d.set("setupset.systemTemplate", template.display());
    }
    d.set("runtime.Preprocessing.any.removeXrays", flag(params.remove_xrays));
    d.set("runtime.Preprocessing.any.archiveOriginal", flag(!params.delete_old_files));
    d.set("comparam.prenewst.newstack.BinByFactor", params.coarse_align_bin_factor);
    // Patch tracking when no gold fiducials are present.
    let tracking = if params.fiducial_size > 0.0 { 0 } else { 1 };
    d.set("runtime.Fiducials.any.trackingMethod", tracking);
    d.set("comparam.xcorr_pt.tiltxcorr.SizeOfPatchesXandY", pair(&params.patch_size));
    d.set("comparam.xcorr_pt.tiltxcorr.NumberOfPatchesXandY", pair(&params.num_patches));
    d.set("comparam.xcorr_pt.tiltxcorr.IterateCorrelations", params.num_iter);
    d.set("comparam.xcorr_pt.tiltxcorr.ShiftLimitsXandY", pair(&params.limits_on_shift));
    d.set("runtime.PatchTracking.any.adjustTiltAngles", flag(params.adjust_tilt_angles));
    d.set("comparam.align.tiltalign.SurfacesToAnalyze", params.num_surfaces);
    d.set("comparam.align.tiltalign.MagOption", params.mag_option.code());
    d.set("comparam.align.tiltalign.TiltOption", params.tilt_option.code());
    d.set("comparam.align.tiltalign.RotOption", params.rot_option.code());
    let beam_tilt = match params.beam_tilt_option {
        BeamTiltOption::Fixed => 0,
        BeamTiltOption::Search => 2,
    };
    d.set("comparam.align.tiltalign.BeamTiltOption", beam_tilt);
    d.set("comparam.align.tiltalign.RobustFitting", flag(params.robust_fitting));
    d.set("comparam.align.tiltalign.WeightWholeTracks", flag(params.weight_contours));
    d.set("runtime.AlignedStack.any.binByFactor", params.stack_bin_factor);
    d.0
}

/// Directive for batchruntomo reconstruction of an aligned stack.
pub(crate) fn recon_directive(params: &ReconstructionParams) -> String {
    let mut d = Directive::default();
    d.set("setupset.currentStackExt", "st");
    d.set("setupset.copyarg.stackext", "st");
    d.set("setupset.copyarg.pixel", params.pixel_size / 10.0);
    d.set("setupset.copyarg.rotation", params.rot_angle);
    d.set("setupset.copyarg.gold", params.gold_size);
    d.set("runtime.Fiducials.any.trackingMethod", "1");
    d.set("runtime.Positioning.any.sampleType", flag(params.do_positioning));
    if let Some(thickness) = params.unbinned_thickness {
        d.set("runtime.Positioning.any.thickness", thickness);
    }
    d.set("runtime.AlignedStack.any.correctCTF", flag(params.correct_ctf));
    d.set("runtime.AlignedStack.any.eraseGold", flag(params.erase_gold));
    d.set("runtime.AlignedStack.any.filterStack", flag(params.filtering));
    d.set("runtime.AlignedStack.any.binByFactor", params.bin_factor);
    d.set("comparam.tilt.tilt.THICKNESS", params.thickness);
    d.set("runtime.Postprocess.any.doTrimvol", flag(params.run_trimvol));
    d.set("runtime.Trimvol.any.reorient", params.trimvol_reorient.code());
    d.0
}

/// `newstack -fileinlist` contents: the image count, then each image
/// followed by the section list `0`.
pub(crate) fn stack_file_list(images: &[&Path]) -> String {
    let mut text = format!("{}\n", images.len());
    for image in images {
        let _ = write!(text, "{}\n0\n", image.display());
    }
    text
}

/// Builds a tilt stack with `newstack` and aligns it with `batchruntomo`.
pub struct ImodAlignAdapter;

impl ToolAdapter for ImodAlignAdapter {
    fn name(&self) -> &str {
        "IMOD alignment"
    }

    fn execute(
        &self,
        entry: &RegistryEntry,
        config: &StageConfig,
        ctx: &ExecContext,
    ) -> Result<Artifacts, ToolFailure> {
        let params = config
            .alignment()
            .ok_or_else(|| wrong_params(self.name(), config))?;
        let folder = UnitFolder::new(config, entry);
        folder.create()?;

        let mut angles = Vec::new();
        let mut images = Vec::new();
        for raw in entry.unit.by_tilt_angle() {
            let role = image_role(CORRECTED_ROLE, raw.image_index);
            let image = entry.inputs.get(&role).ok_or_else(|| {
                ToolFailure::launch(format!("unit {} has no {role} input", entry.id()))
            })?;
            angles.push(raw.tilt_angle.to_string());
            images.push(image.as_path());
        }

        let rawtlt = folder.file(".rawtlt");
        write_file(&rawtlt, &(angles.join("\n") + "\n"))?;
        let sources = folder.file("_sources.txt");
        write_file(&sources, &stack_file_list(&images))?;

        let stack = folder.file(".st");
        let newstack = ToolInvocation::new(&params.newstack_path)
            .path_opt("-fileinlist", &sources)
            .path_opt("-output", &stack)
            .expect_output(&stack);
        run_invocation(&newstack, ctx)?;
        debug!(unit = %entry.id(), images = images.len(), "Tilt stack created");

        let directive = folder.file("_align.adoc");
        write_file(&directive, &align_directive(params))?;
        let transforms = folder.file(".xf");
        let brt = batchruntomo(&params.exec_path, &folder, &directive, ALIGN_STEPS)
            .expect_output(&transforms);
        run_invocation(&brt, ctx)?;

        Ok(Artifacts::from([
            (STACK_ROLE.to_string(), stack),
            (TILT_ANGLES_ROLE.to_string(), rawtlt),
            (TRANSFORMS_ROLE.to_string(), transforms),
        ]))
    }
}

/// Reconstructs an aligned stack with `batchruntomo`.
pub struct ImodReconAdapter;

impl ToolAdapter for ImodReconAdapter {
    fn name(&self) -> &str {
        "IMOD reconstruction"
    }

    fn execute(
        &self,
        entry: &RegistryEntry,
        config: &StageConfig,
        ctx: &ExecContext,
    ) -> Result<Artifacts, ToolFailure> {
        let params = config
            .reconstruction()
            .ok_or_else(|| wrong_params(self.name(), config))?;
        let folder = entry
            .inputs
            .get(STACK_ROLE)
            .and_then(|stack| UnitFolder::of_stack(stack))
            .ok_or_else(|| {
                ToolFailure::launch(format!("unit {} has no aligned stack", entry.id()))
            })?;

        let directive = folder.file("_recon.adoc");
        write_file(&directive, &recon_directive(params))?;
        let tomogram = if params.run_trimvol {
            folder.file("_rec.mrc")
        } else {
            folder.file("_full_rec.mrc")
        };
        let brt = batchruntomo(&params.exec_path, &folder, &directive, RECON_STEPS)
            .expect_output(&tomogram);
        run_invocation(&brt, ctx)?;
        debug!(unit = %entry.id(), "Tomogram reconstructed");

        Ok(Artifacts::from([(TOMOGRAM_ROLE.to_string(), tomogram)]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_list_layout() {
        let a = Path::new("/d/a.mrc");
        let b = Path::new("/d/b.mrc");
        assert_eq!(stack_file_list(&[a, b]), "2\n/d/a.mrc\n0\n/d/b.mrc\n0\n");
    }

    #[test]
    fn recon_directive_values() {
        let table: toml::Table = toml::from_str(
            r#"
            [system]
            output_path = "stacks"
            [recon]
            exec_path = "batchruntomo"
            thickness = 3000
            pixel_size = 2.2
            rot_angle = 86.0
            "#,
        )
        .unwrap();
        let config = StageConfig::from_table(crate::stage::Stage::Reconstruction, table).unwrap();
        let text = recon_directive(config.reconstruction().unwrap());
        assert!(text.contains("comparam.tilt.tilt.THICKNESS = 3000\n"));
        assert!(text.contains("runtime.Trimvol.any.reorient = 2\n"));
        assert!(text.contains("setupset.copyarg.rotation = 86\n"));
        assert!(!text.contains("Positioning.any.thickness"));
    }
}
