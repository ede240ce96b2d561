//! Terminal rendering of plans, progress events and results.

use console::style;
use stagehand_core::run::{JobResult, JobStatus, PipelineResult, PipelineState};
use stagehand_runner::OutputStream;
use stagehand_scheduler::{PipelineEvent, PipelinePlan};

pub fn print_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::StateChanged { run_id, state } => {
            if *state == PipelineState::Running {
                println!("\n{} Running pipeline {}", style("▶").cyan().bold(), style(run_id.short()).dim());
            }
        }
        PipelineEvent::JobSkipped(skipped) => {
            println!(
                "  {} {} {}",
                style("○").dim(),
                skipped.job,
                style("(skipped by rules)").dim()
            );
        }
        PipelineEvent::StageStarted { stage, jobs } => {
            println!(
                "\n{} Stage: {} ({} jobs)",
                style("▶").cyan(),
                style(stage).bold(),
                jobs.len()
            );
        }
        PipelineEvent::JobStarted { job, .. } => {
            println!("  {} {}", style("→").dim(), style(job).bold());
        }
        PipelineEvent::Output(line) => {
            let prefix = style(format!("[{}]", line.job)).dim();
            match line.stream {
                OutputStream::Stdout => println!("    {} {}", prefix, line.content),
                OutputStream::Stderr => eprintln!("    {} {}", prefix, style(&line.content).red()),
            }
        }
        PipelineEvent::JobFinished(result) => print_job(result),
        PipelineEvent::StageFinished { stage, success } => {
            if !success {
                println!("  {} Stage {} failed", style("✗").red().bold(), stage);
            }
        }
    }
}

fn print_job(result: &JobResult) {
    let marker = match (result.status, result.allow_failure) {
        (JobStatus::Success, _) => style("✓").green(),
        (JobStatus::Failed, true) => style("!").yellow(),
        (JobStatus::Failed, false) => style("✗").red(),
        (JobStatus::Cancelled, _) => style("■").yellow(),
    };
    let mut line = format!(
        "  {} {} {} ({:.2}s)",
        marker,
        result.job,
        result.status,
        result.duration_ms as f64 / 1000.0
    );
    if let Some(step) = &result.failed_step {
        line.push_str(&format!(" at `{}`", step));
    }
    if result.status == JobStatus::Failed && result.allow_failure {
        line.push_str(" (allowed to fail)");
    }
    println!("{}", line);

    if let Some(artifacts) = &result.artifacts {
        println!(
            "      {} {} artifact file(s), {} bytes",
            style("↳").dim(),
            artifacts.files.len(),
            artifacts.total_size()
        );
    }
    for warning in &result.warnings {
        println!(
            "      {} {}: {}",
            style("warning").yellow(),
            warning.path,
            warning.message
        );
    }
}

pub fn print_summary(result: &PipelineResult) {
    let duration = (result.finished_at - result.started_at).num_milliseconds() as f64 / 1000.0;
    let headline = match result.state {
        PipelineState::Succeeded => style("✓ Pipeline succeeded").green().bold(),
        PipelineState::Cancelled => style("■ Pipeline cancelled").yellow().bold(),
        _ => style("✗ Pipeline failed").red().bold(),
    };
    println!("\n{} in {:.2}s", headline, duration);

    let passed = result.jobs.iter().filter(|j| j.status.is_success()).count();
    println!(
        "  Jobs: {} passed, {} failed, {} skipped, {} not run",
        passed,
        result.jobs.len() - passed,
        result.skipped.len(),
        result.not_run.len()
    );

    let tests = result.test_summary;
    if tests.tests > 0 {
        println!(
            "  Tests: {} total, {} passed, {} failed, {} errors, {} skipped",
            tests.tests,
            tests.passed(),
            tests.failures,
            tests.errors,
            tests.skipped
        );
    }
}

pub fn print_plan(plan: &PipelinePlan) {
    for stage in plan.graph.stages() {
        println!("{} {}", style("Stage").cyan(), style(&stage.name).bold());
        if stage.is_empty() {
            println!("    {}", style("(no jobs)").dim());
        }
        for job in &stage.jobs {
            let mut line = format!("    - {}", job.name);
            if let Some(image) = &job.image {
                line.push_str(&format!(" [{}]", image));
            }
            if plan.allow_failure(&job.name) {
                line.push_str(" (allow failure)");
            }
            println!("{}", line);
        }
    }
    if !plan.skipped.is_empty() {
        println!("{}", style("Skipped by rules").dim());
        for skipped in &plan.skipped {
            println!("    - {} ({})", skipped.job, skipped.stage);
        }
    }
    println!(
        "\n{} job(s) to run, {} skipped",
        plan.graph.job_count(),
        plan.skipped.len()
    );
}
