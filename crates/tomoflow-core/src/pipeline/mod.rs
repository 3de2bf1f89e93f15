pub mod process_list;
pub mod runner;
pub mod sequencer;
pub mod types;

pub use process_list::{build as build_process_list, ProcessList};
pub use runner::{ancestor_ledgers, run_stage, RunReport, StageOptions, StageRunner};
pub use sequencer::{final_stage_failed, run_all, StageOutcome, StageSummary};
pub use types::{CancelToken, NoOpReporter, ProgressReporter};
