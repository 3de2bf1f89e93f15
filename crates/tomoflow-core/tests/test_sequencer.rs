mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::{ids, Behaviour, FakeAdapter, TestProject};
use tomoflow_core::params::Overrides;
use tomoflow_core::pipeline::{final_stage_failed, run_all, CancelToken, StageOptions, StageOutcome};
use tomoflow_core::stage::Stage;
use tomoflow_core::tools::ToolAdapter;

/// One fake adapter per stage, handed out by `run_all`.
struct Adapters(HashMap<Stage, Arc<FakeAdapter>>);

impl Adapters {
    fn new() -> Self {
        Self(
            Stage::ALL
                .into_iter()
                .map(|s| (s, FakeAdapter::new(s).shared()))
                .collect(),
        )
    }

    fn with(mut self, stage: Stage, adapter: FakeAdapter) -> Self {
        self.0.insert(stage, adapter.shared());
        self
    }

    fn get(&self, stage: Stage) -> Arc<dyn ToolAdapter> {
        self.0[&stage].clone()
    }

    fn calls(&self, stage: Stage) -> Vec<tomoflow_core::registry::UnitId> {
        self.0[&stage].calls()
    }
}

fn options() -> StageOptions {
    StageOptions {
        overrides: Overrides::parse(&["recon.thickness=300"]).unwrap(),
        ..Default::default()
    }
}

fn outcome(summaries: &[tomoflow_core::pipeline::StageSummary], stage: Stage) -> &StageOutcome {
    &summaries.iter().find(|s| s.stage == stage).unwrap().outcome
}

#[test]
fn test_full_pipeline_runs_every_stage_in_order() {
    let tp = TestProject::new(&["A", "B"]);
    let adapters = Adapters::new();
    // Requested out of order, with a duplicate.
    let stages = [
        Stage::Reconstruction,
        Stage::MotionCorrection,
        Stage::CtfEstimation,
        Stage::Alignment,
        Stage::CtfEstimation,
    ];
    let summaries = run_all(&tp.project, &stages, |s| adapters.get(s), &options()).unwrap();

    let order: Vec<Stage> = summaries.iter().map(|s| s.stage).collect();
    assert_eq!(order, Stage::ALL.to_vec());
    for stage in Stage::ALL {
        assert!(matches!(
            outcome(&summaries, stage),
            StageOutcome::Ran(r) if r.completed.len() == 2
        ));
        assert_eq!(adapters.calls(stage), ids(&["A", "B"]));
        assert_eq!(tp.ledger(stage).completed_ids(), ids(&["A", "B"]));
    }
    assert!(!final_stage_failed(&summaries));
}

#[test]
fn test_total_failure_stops_the_pipeline() {
    let tp = TestProject::new(&["A", "B"]);
    let adapters = Adapters::new().with(
        Stage::MotionCorrection,
        FakeAdapter::new(Stage::MotionCorrection)
            .with("A", Behaviour::Fail)
            .with("B", Behaviour::Fail),
    );
    let summaries = run_all(&tp.project, &Stage::ALL, |s| adapters.get(s), &options()).unwrap();

    assert!(matches!(
        outcome(&summaries, Stage::MotionCorrection),
        StageOutcome::Ran(r) if r.is_total_failure()
    ));
    for stage in &Stage::ALL[1..] {
        assert_eq!(outcome(&summaries, *stage), &StageOutcome::NotRun);
        assert!(adapters.calls(*stage).is_empty());
    }
    assert!(final_stage_failed(&summaries));
}

#[test]
fn test_partial_failure_propagates_to_later_stages() {
    let tp = TestProject::new(&["A", "B", "C"]);
    let adapters = Adapters::new().with(
        Stage::MotionCorrection,
        FakeAdapter::new(Stage::MotionCorrection).with("B", Behaviour::Fail),
    );
    let summaries = run_all(&tp.project, &Stage::ALL, |s| adapters.get(s), &options()).unwrap();

    for stage in &Stage::ALL[1..] {
        assert_eq!(adapters.calls(*stage), ids(&["A", "C"]));
    }
    // The last stage itself succeeded for every eligible unit.
    assert!(!final_stage_failed(&summaries));
}

#[test]
fn test_stage_without_eligible_units_is_skipped() {
    let tp = TestProject::new(&["A"]);
    let adapters = Adapters::new();
    let summaries =
        run_all(&tp.project, &[Stage::CtfEstimation], |s| adapters.get(s), &options()).unwrap();
    assert!(matches!(
        outcome(&summaries, Stage::CtfEstimation),
        StageOutcome::Skipped { .. }
    ));
    assert!(adapters.calls(Stage::CtfEstimation).is_empty());
    assert!(!tp.project.ledger_path(Stage::CtfEstimation).exists());
}

#[test]
fn test_failure_in_the_last_stage_is_reported() {
    let tp = TestProject::new(&["A", "B"]);
    let adapters = Adapters::new().with(
        Stage::Reconstruction,
        FakeAdapter::new(Stage::Reconstruction).with("B", Behaviour::Fail),
    );
    let summaries = run_all(&tp.project, &Stage::ALL, |s| adapters.get(s), &options()).unwrap();
    assert!(final_stage_failed(&summaries));
}

#[test]
fn test_cancelled_pipeline_runs_no_further_stages() {
    let tp = TestProject::new(&["A"]);
    let token = CancelToken::new();
    let adapters = Adapters::new().with(
        Stage::MotionCorrection,
        FakeAdapter::new(Stage::MotionCorrection)
            .with("A", Behaviour::CancelThenSucceed(token.clone())),
    );
    let opts = StageOptions {
        cancel: token,
        ..options()
    };
    let summaries = run_all(&tp.project, &Stage::ALL, |s| adapters.get(s), &opts).unwrap();
    assert!(matches!(
        outcome(&summaries, Stage::MotionCorrection),
        StageOutcome::Ran(r) if r.completed.len() == 1
    ));
    assert_eq!(outcome(&summaries, Stage::CtfEstimation), &StageOutcome::NotRun);
    assert!(adapters.calls(Stage::CtfEstimation).is_empty());
}
