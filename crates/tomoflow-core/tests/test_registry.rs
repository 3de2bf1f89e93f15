mod common;

use std::fs;

use toml::Table;

use common::{ids, write_tilt_series, TestProject};
use tomoflow_core::error::TomoError;
use tomoflow_core::ledger::{RecordUpdate, StageLedger};
use tomoflow_core::params::SourceConfig;
use tomoflow_core::registry::{scan_source, Artifacts, MasterRegistry, UnitId, UnitRegistry};
use tomoflow_core::stage::Stage;
use tomoflow_core::tools::ToolFailure;

fn source(root: &std::path::Path, folder_prefix: &str) -> SourceConfig {
    SourceConfig {
        source_folder: root.to_path_buf(),
        folder_prefix: folder_prefix.into(),
        file_prefix: "TS".into(),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

#[test]
fn test_scan_groups_images_by_tilt_series() {
    let dir = tempfile::tempdir().unwrap();
    write_tilt_series(dir.path(), "TS", "02");
    write_tilt_series(dir.path(), "TS", "01");
    fs::write(dir.path().join("notes.txt"), b"x").unwrap();
    fs::write(dir.path().join("other_01_001_0.0.mrc"), b"x").unwrap();

    let units = scan_source(&source(dir.path(), ""), dir.path()).unwrap();
    let found: Vec<&str> = units.iter().map(|u| u.id.as_str()).collect();
    assert_eq!(found, vec!["01", "02"]);

    let first = &units[0];
    assert_eq!(first.raw_inputs.len(), 3);
    let indices: Vec<u32> = first.raw_inputs.iter().map(|r| r.image_index).collect();
    assert_eq!(indices, vec![1, 2, 3]);
    assert!(first.raw_inputs.iter().all(|r| r.path.is_absolute()));

    let by_angle: Vec<f64> = first.by_tilt_angle().iter().map(|r| r.tilt_angle).collect();
    assert_eq!(by_angle, vec![-3.0, 0.0, 3.0]);
}

#[test]
fn test_scan_folder_prefix_rules() {
    let dir = tempfile::tempdir().unwrap();
    for sub in ["Position_1", "Position_2", "Other"] {
        fs::create_dir_all(dir.path().join(sub)).unwrap();
    }
    write_tilt_series(&dir.path().join("Position_1"), "TS", "1");
    write_tilt_series(&dir.path().join("Position_2"), "TS", "2");
    write_tilt_series(&dir.path().join("Other"), "TS", "3");

    let named = scan_source(&source(dir.path(), "Position"), dir.path()).unwrap();
    assert_eq!(named.len(), 2);

    let any = scan_source(&source(dir.path(), "*"), dir.path()).unwrap();
    assert_eq!(any.len(), 3);

    // No images directly in the source folder.
    let err = scan_source(&source(dir.path(), ""), dir.path()).unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn test_scan_resolves_relative_source_against_base() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("raw")).unwrap();
    write_tilt_series(&dir.path().join("raw"), "TS", "9");
    let mut src = source(dir.path(), "");
    src.source_folder = "raw".into();
    let units = scan_source(&src, dir.path()).unwrap();
    assert_eq!(units[0].id, UnitId::from("9"));
}

#[test]
fn test_unparseable_name_names_the_file() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("TS_01.mrc"), b"x").unwrap();
    let err = scan_source(&source(dir.path(), ""), dir.path()).unwrap_err();
    assert!(err.to_string().contains("TS_01.mrc"), "got: {err}");
}

// ---------------------------------------------------------------------------
// Master registry
// ---------------------------------------------------------------------------

#[test]
fn test_master_registry_is_written_once() {
    let tp = TestProject::new(&["A", "B"]);
    let path = tp.project.registry_path();
    let loaded = MasterRegistry::load(&path).unwrap();
    assert_eq!(loaded.units.len(), 2);

    let err = loaded.save(&path, false).unwrap_err();
    assert!(matches!(err, TomoError::LedgerIo { .. }));
    loaded.save(&path, true).unwrap();
}

// ---------------------------------------------------------------------------
// Per-stage restriction
// ---------------------------------------------------------------------------

fn mc_ledger(outcomes: &[(&str, bool)], dir: &std::path::Path) -> StageLedger {
    let mut ledger = StageLedger::new(Stage::MotionCorrection);
    let snap = Table::new();
    for (unit, ok) in outcomes {
        let id = UnitId::from(*unit);
        ledger.record(&id, RecordUpdate::InProgress, &snap).unwrap();
        let update = if *ok {
            let path = dir.join(format!("{unit}.mrc"));
            RecordUpdate::Completed(Artifacts::from([("corrected_001".to_string(), path)]))
        } else {
            RecordUpdate::Failed(ToolFailure::launch("boom"))
        };
        ledger.record(&id, update, &snap).unwrap();
    }
    ledger
}

#[test]
fn test_first_stage_registry_holds_every_unit() {
    let tp = TestProject::new(&["A", "B"]);
    let units = MasterRegistry::load(&tp.project.registry_path()).unwrap().units;
    let registry = UnitRegistry::for_stage(Stage::MotionCorrection, &units, &[]).unwrap();
    assert_eq!(registry.ids().cloned().collect::<Vec<_>>(), ids(&["A", "B"]));
}

#[test]
fn test_later_stage_sees_only_completed_predecessors() {
    let tp = TestProject::new(&["A", "B", "C"]);
    let units = MasterRegistry::load(&tp.project.registry_path()).unwrap().units;
    let mc = mc_ledger(&[("A", true), ("B", false), ("C", true)], tp.dir.path());

    let registry = UnitRegistry::for_stage(Stage::CtfEstimation, &units, &[mc]).unwrap();
    assert_eq!(registry.ids().cloned().collect::<Vec<_>>(), ids(&["A", "C"]));

    let a = registry.by_id(&UnitId::from("A")).unwrap();
    assert_eq!(a.inputs["corrected_001"], tp.dir.path().join("A.mrc"));
    assert_eq!(a.inputs_with_prefix("corrected_").count(), 1);

    let err = registry.by_id(&UnitId::from("B")).unwrap_err();
    assert!(matches!(err, TomoError::UnknownUnit(ref id) if id == "B"));
}

#[test]
fn test_empty_registry_is_a_dependency_error() {
    let tp = TestProject::new(&["A"]);
    let units = MasterRegistry::load(&tp.project.registry_path()).unwrap().units;
    let mc = mc_ledger(&[("A", false)], tp.dir.path());

    let err = UnitRegistry::for_stage(Stage::CtfEstimation, &units, &[mc]).unwrap_err();
    assert!(matches!(
        err,
        TomoError::StageDependency {
            stage: Stage::CtfEstimation,
            predecessor: Stage::MotionCorrection
        }
    ));

    let err = UnitRegistry::for_stage(Stage::Alignment, &units, &[]).unwrap_err();
    assert!(matches!(err, TomoError::StageDependency { .. }));
}
