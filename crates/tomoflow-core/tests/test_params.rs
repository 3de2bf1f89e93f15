mod common;

use std::path::PathBuf;

use toml::{Table, Value};

use common::{ids, TestProject};
use tomoflow_core::error::TomoError;
use tomoflow_core::params::{
    resolve, ConfigSources, MasterConfig, Overrides, ParameterStore, StageConfig,
};
use tomoflow_core::stage::Stage;

fn master() -> MasterConfig {
    let mut m = MasterConfig::new("TS");
    m.acquisition.pixel_size = Some(1.1);
    m.acquisition.rotation_angle = Some(85.0);
    m
}

fn resolve_with(stage: Stage, master: &MasterConfig, overrides: &Overrides) -> StageConfig {
    resolve(
        stage,
        &ConfigSources {
            master,
            upstream: None,
            prior: None,
            overrides,
        },
    )
    .unwrap()
}

fn field_of(err: TomoError) -> String {
    match err {
        TomoError::Configuration { field, .. } => field,
        other => panic!("expected a configuration error, got {other}"),
    }
}

// ---------------------------------------------------------------------------
// Layering
// ---------------------------------------------------------------------------

#[test]
fn test_defaults_fill_unset_tool_fields() {
    let config = resolve_with(Stage::MotionCorrection, &master(), &Overrides::new());
    let mc = config.motion_correction().unwrap();
    assert_eq!(mc.pixel_size, 1.1);
    assert_eq!(mc.tolerance, 0.5);
    assert_eq!(mc.patch_size, vec![5, 5, 20]);
    assert!(!mc.source_tiff);
    assert_eq!(config.system.parallelism, 1);
    assert_eq!(config.system.output_path, PathBuf::from("./motioncor"));
    assert_eq!(config.system.output_prefix, "TS");
}

#[test]
fn test_tiff_extension_selects_tiff_input() {
    let mut m = master();
    m.source.extension = "tif".into();
    let config = resolve_with(Stage::MotionCorrection, &m, &Overrides::new());
    assert!(config.motion_correction().unwrap().source_tiff);
}

#[test]
fn test_precedence_master_upstream_prior_override() {
    let m = master();
    let mut mc_overrides = Overrides::new();
    mc_overrides.set("params.super_resolution", true);
    let upstream = resolve_with(Stage::MotionCorrection, &m, &mc_overrides);

    // Upstream beats master: super-resolution doubles the corrected pixel size.
    let ctf = resolve(
        Stage::CtfEstimation,
        &ConfigSources {
            master: &m,
            upstream: Some(&upstream),
            prior: None,
            overrides: &Overrides::new(),
        },
    )
    .unwrap();
    assert_eq!(ctf.ctf().unwrap().pixel_size, 2.2);

    // Prior beats upstream.
    let prior: Table = toml::from_str("[ctffind]\npixel_size = 3.0\nvoltage = 200.0\n").unwrap();
    let ctf = resolve(
        Stage::CtfEstimation,
        &ConfigSources {
            master: &m,
            upstream: Some(&upstream),
            prior: Some(&prior),
            overrides: &Overrides::new(),
        },
    )
    .unwrap();
    assert_eq!(ctf.ctf().unwrap().pixel_size, 3.0);
    assert_eq!(ctf.ctf().unwrap().voltage, 200.0);

    // Overrides beat everything.
    let overrides = Overrides::parse(&["params.pixel_size=4.5"]).unwrap();
    let ctf = resolve(
        Stage::CtfEstimation,
        &ConfigSources {
            master: &m,
            upstream: Some(&upstream),
            prior: Some(&prior),
            overrides: &overrides,
        },
    )
    .unwrap();
    assert_eq!(ctf.ctf().unwrap().pixel_size, 4.5);
    assert_eq!(ctf.ctf().unwrap().voltage, 200.0);
}

#[test]
fn test_alignment_inherits_rotation_and_recon_inherits_gold() {
    let m = master();
    let mut o = Overrides::new();
    o.set("align.fiducial_size", 10.0);
    let align = resolve_with(Stage::Alignment, &m, &o);
    let mut o = Overrides::new();
    o.set("recon.thickness", 400);
    let recon = resolve(
        Stage::Reconstruction,
        &ConfigSources {
            master: &m,
            upstream: Some(&align),
            prior: None,
            overrides: &o,
        },
    )
    .unwrap();
    let p = recon.reconstruction().unwrap();
    assert_eq!(p.rot_angle, 85.0);
    assert_eq!(p.gold_size, 10.0);
    assert_eq!(p.thickness, 400);
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[test]
fn test_missing_required_value_names_the_field() {
    let mut m = master();
    m.acquisition.pixel_size = None;
    let err = resolve(
        Stage::CtfEstimation,
        &ConfigSources {
            master: &m,
            upstream: None,
            prior: None,
            overrides: &Overrides::new(),
        },
    )
    .unwrap_err();
    assert_eq!(field_of(err), "ctffind.pixel_size");
}

#[test]
fn test_recon_thickness_is_required() {
    let err = resolve(
        Stage::Reconstruction,
        &ConfigSources {
            master: &master(),
            upstream: None,
            prior: None,
            overrides: &Overrides::new(),
        },
    )
    .unwrap_err();
    assert_eq!(field_of(err), "recon.thickness");
}

#[test]
fn test_range_checks() {
    let m = master();
    for (assignment, field) in [
        ("system.parallelism=0", "system.parallelism"),
        ("system.checkpoint_interval=0", "system.checkpoint_interval"),
        ("params.amp_contrast=1.5", "ctffind.amp_contrast"),
        ("params.resolution_min=4.0", "ctffind.resolution_min"),
        ("params.defocus_min=60000.0", "ctffind.defocus_min"),
    ] {
        let o = Overrides::parse(&[assignment]).unwrap();
        let err = resolve(
            Stage::CtfEstimation,
            &ConfigSources {
                master: &m,
                upstream: None,
                prior: None,
                overrides: &o,
            },
        )
        .unwrap_err();
        assert_eq!(field_of(err), field, "for {assignment}");
    }
}

#[test]
fn test_unknown_tool_key_is_rejected() {
    let o = Overrides::parse(&["params.tolerence=0.4"]).unwrap();
    let err = resolve(
        Stage::MotionCorrection,
        &ConfigSources {
            master: &master(),
            upstream: None,
            prior: None,
            overrides: &o,
        },
    )
    .unwrap_err();
    assert!(err.is_configuration());
    assert!(err.to_string().contains("tolerence"), "got: {err}");
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[test]
fn test_snapshot_ignores_cosmetic_keys() {
    let m = master();
    let a = resolve_with(Stage::MotionCorrection, &m, &Overrides::new());
    let mut o = Overrides::new();
    o.set("params.exec_path", "/opt/MotionCor2_1.6")
        .set("params.gpu_ids", Value::Array(vec![Value::Integer(1)]))
        .set("system.parallelism", 4);
    let b = resolve_with(Stage::MotionCorrection, &m, &o);
    assert_eq!(a.snapshot().unwrap(), b.snapshot().unwrap());
    assert!(!a.snapshot().unwrap().contains_key("exec_path"));

    let mut o = Overrides::new();
    o.set("params.tolerance", 0.3);
    let c = resolve_with(Stage::MotionCorrection, &m, &o);
    assert_ne!(a.snapshot().unwrap(), c.snapshot().unwrap());
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[test]
fn test_store_persists_and_reuses_prior_config() {
    let tp = TestProject::new(&["A"]);
    let store = ParameterStore::new(&tp.project, &tp.master);

    let o = Overrides::parse(&["params.tolerance=0.3"]).unwrap();
    store.resolve(Stage::MotionCorrection, &o).unwrap();
    assert!(tp.project.stage_config_path(Stage::MotionCorrection).exists());

    // The persisted value is the prior layer of the next resolution.
    let again = store.resolve(Stage::MotionCorrection, &Overrides::new()).unwrap();
    assert_eq!(again.motion_correction().unwrap().tolerance, 0.3);

    // new_config starts over from defaults and the master config.
    let fresh = store.new_config(Stage::MotionCorrection, &Overrides::new()).unwrap();
    assert_eq!(fresh.motion_correction().unwrap().tolerance, 0.5);
    let persisted = store.load_persisted(Stage::MotionCorrection).unwrap().unwrap();
    assert_eq!(persisted, fresh);
}

#[test]
fn test_run_process_list_is_not_persisted() {
    let tp = TestProject::new(&["A", "B"]);
    let store = ParameterStore::new(&tp.project, &tp.master);
    let o = Overrides::new().with_process_list(ids(&["B"]));
    let config = store.resolve(Stage::MotionCorrection, &o).unwrap();
    assert_eq!(config.system.process_list, ids(&["B"]));

    let persisted = store.load_persisted(Stage::MotionCorrection).unwrap().unwrap();
    assert!(persisted.system.process_list.is_empty());
}

#[test]
fn test_store_uses_persisted_upstream() {
    let tp = TestProject::new(&["A"]);
    let store = ParameterStore::new(&tp.project, &tp.master);
    let mut o = Overrides::new();
    o.set("motioncorr.super_resolution", true);
    store.resolve(Stage::MotionCorrection, &o).unwrap();

    let ctf = store.resolve(Stage::CtfEstimation, &Overrides::new()).unwrap();
    assert!((ctf.ctf().unwrap().pixel_size - 2.2).abs() < 1e-12);
}

#[test]
fn test_master_config_round_trip() {
    let tp = TestProject::new(&["A"]);
    let loaded = MasterConfig::load(&tp.project.master_config_path()).unwrap();
    assert_eq!(loaded.source.file_prefix, "TS");
    assert_eq!(loaded.acquisition.pixel_size, Some(1.1));
    assert_eq!(loaded.source.extension, "mrc");
}
