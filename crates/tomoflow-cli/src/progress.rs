use std::sync::Mutex;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use tomoflow_core::pipeline::ProgressReporter;
use tomoflow_core::registry::UnitId;
use tomoflow_core::stage::Stage;
use tomoflow_core::tools::ToolFailure;

/// One progress bar per stage run.
pub struct BarReporter {
    bar: Mutex<Option<ProgressBar>>,
    failed: Style,
}

impl BarReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
            failed: Style::new().red(),
        }
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        if let Ok(guard) = self.bar.lock() {
            if let Some(bar) = guard.as_ref() {
                f(bar);
            }
        }
    }
}

impl Default for BarReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for BarReporter {
    fn begin_stage(&self, stage: Stage, total_units: usize) {
        let bar = ProgressBar::new(total_units as u64);
        let style = ProgressStyle::with_template("{prefix:20} [{bar:40}] {pos}/{len} {msg}")
            .map(|s| s.progress_chars("=> "))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar.set_prefix(stage.to_string());
        if let Ok(mut guard) = self.bar.lock() {
            *guard = Some(bar);
        }
    }

    fn unit_finished(&self, unit: &UnitId, failure: Option<&ToolFailure>, units_done: usize) {
        self.with_bar(|bar| {
            if let Some(failure) = failure {
                bar.println(format!(
                    "  {} {unit}: {failure}",
                    self.failed.apply_to("failed")
                ));
            }
            bar.set_message(unit.to_string());
            bar.set_position(units_done as u64);
        });
    }

    fn finish_stage(&self) {
        self.with_bar(|bar| bar.finish_with_message("done"));
        if let Ok(mut guard) = self.bar.lock() {
            guard.take();
        }
    }
}
