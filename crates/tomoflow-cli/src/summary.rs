use console::Style;
use tomoflow_core::ledger::StageLedger;
use tomoflow_core::pipeline::{RunReport, StageOutcome, StageSummary};

struct Styles {
    title: Style,
    header: Style,
    label: Style,
    value: Style,
    ok: Style,
    failed: Style,
    disabled: Style,
}

impl Styles {
    fn new() -> Self {
        Self {
            title: Style::new().cyan().bold(),
            header: Style::new().cyan().bold(),
            label: Style::new().dim(),
            value: Style::new().bold().white(),
            ok: Style::new().green(),
            failed: Style::new().red().bold(),
            disabled: Style::new().dim().yellow(),
        }
    }
}

fn print_title(s: &Styles, title: &str) {
    println!();
    println!("  {}", s.title.apply_to(title));
    println!(
        "  {}",
        s.title.apply_to("\u{2550}".repeat(title.chars().count()))
    );
    println!();
}

pub fn print_stage_report(report: &RunReport) {
    let s = Styles::new();
    print_title(&s, &report.stage.to_string());
    print_report_body(&s, report);
}

fn print_report_body(s: &Styles, report: &RunReport) {
    println!(
        "    {:<14}{}",
        s.label.apply_to("Candidates"),
        s.value.apply_to(report.candidates)
    );
    println!(
        "    {:<14}{}",
        s.label.apply_to("Completed"),
        s.ok.apply_to(report.completed.len())
    );
    if report.failed.is_empty() {
        println!(
            "    {:<14}{}",
            s.label.apply_to("Failed"),
            s.value.apply_to(0)
        );
    } else {
        println!(
            "    {:<14}{}",
            s.label.apply_to("Failed"),
            s.failed.apply_to(report.failed.len())
        );
        for (unit, failure) in &report.failed {
            println!("      {} {}", s.failed.apply_to(unit), failure);
        }
    }
    if !report.skipped_completed.is_empty() {
        println!(
            "    {:<14}{}",
            s.label.apply_to("Up to date"),
            s.value.apply_to(report.skipped_completed.len())
        );
    }
    if report.cancelled {
        println!(
            "    {:<14}{}",
            s.label.apply_to("Cancelled"),
            s.disabled
                .apply_to(format!("{} not started", report.not_started.len()))
        );
    }
    println!();
}

pub fn print_pipeline_summary(summaries: &[StageSummary]) {
    let s = Styles::new();
    print_title(&s, "Pipeline");

    for summary in summaries {
        match &summary.outcome {
            StageOutcome::Ran(report) => {
                println!("  {}", s.header.apply_to(summary.stage));
                print_report_body(&s, report);
            }
            StageOutcome::Skipped { reason } => {
                println!(
                    "  {:<16}{}",
                    s.header.apply_to(summary.stage),
                    s.disabled.apply_to(format!("skipped: {reason}"))
                );
                println!();
            }
            StageOutcome::NotRun => {
                println!(
                    "  {:<16}{}",
                    s.header.apply_to(summary.stage),
                    s.disabled.apply_to("not run")
                );
                println!();
            }
        }
    }
}

pub fn print_status(project: &str, registered: usize, ledgers: &[StageLedger], show_failed: bool) {
    let s = Styles::new();
    print_title(&s, project);
    println!(
        "  {:<18}{}",
        s.label.apply_to("Tilt-series"),
        s.value.apply_to(registered)
    );
    println!();

    for ledger in ledgers {
        let stage = ledger.stage();
        if ledger.is_empty() {
            println!(
                "  {:<18}{}",
                s.header.apply_to(stage),
                s.disabled.apply_to("not started")
            );
            continue;
        }
        let c = ledger.counts();
        println!(
            "  {:<18}{} completed, {} failed, {} in progress, {} pending",
            s.header.apply_to(stage),
            s.ok.apply_to(c.completed),
            if c.failed > 0 {
                s.failed.apply_to(c.failed)
            } else {
                s.value.apply_to(c.failed)
            },
            s.value.apply_to(c.in_progress),
            s.value.apply_to(c.pending)
        );
        if show_failed {
            for rec in ledger.records() {
                if let Some(err) = &rec.error {
                    println!(
                        "    {} (attempt {}): {}",
                        s.failed.apply_to(&rec.unit_id),
                        rec.attempts,
                        err
                    );
                }
            }
        }
    }
    println!();
}
