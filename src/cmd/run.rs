//! The pipeline run: `rollout` and `rollout --dry-run`.

use anyhow::{Context, Result};
use console::style;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use super::super::Cli;
use rollout::catalog::{PHASE_IDS, default_phases, select_phases};
use rollout::config::RunConfig;
use rollout::database::MySqlClient;
use rollout::gates::{AutoApproveGate, ConfirmationGate, InteractiveGate};
use rollout::orchestrator::{PipelineController, StepExecutor};
use rollout::phase::Phase;
use rollout::report::harvest::Harvester;
use rollout::runner::ProcessRunner;
use rollout::secrets::SecretVault;

/// Resolve config and the selected phases, reporting config warnings.
fn prepare(cli: &Cli, project_dir: &Path) -> Result<(RunConfig, Vec<Phase>)> {
    let config = RunConfig::load(project_dir, super::overrides(cli))?;
    let phases = select_phases(default_phases(&config)?, &config.selection)?;
    let selected: Vec<&str> = phases.iter().map(|p| p.id.as_str()).collect();
    for warning in config.validate(&PHASE_IDS, &selected) {
        eprintln!("{} {}", style("warning:").yellow().bold(), warning);
    }
    Ok((config, phases))
}

fn build_controller(config: &RunConfig, phases: Vec<Phase>) -> PipelineController {
    let runner = Arc::new(ProcessRunner::with_base_env(config.child_env()));
    let executor = StepExecutor::new(
        runner,
        Arc::new(MySqlClient::new(config.database.clone())),
        SecretVault::new(config.secrets_file(), config.project_dir.clone()),
        Harvester::new(&config.tools.terraform, &config.infrastructure_dir()),
        config.project_dir.clone(),
    )
    .with_default_timeout(config.step_timeout);

    let gate: Arc<dyn ConfirmationGate> = if config.auto_approve {
        Arc::new(AutoApproveGate)
    } else {
        Arc::new(InteractiveGate)
    };
    PipelineController::new(config, phases, gate, executor)
}

pub fn dry_run(cli: &Cli, project_dir: &Path) -> Result<ExitCode> {
    let (config, phases) = prepare(cli, project_dir)?;
    let controller = build_controller(&config, phases);

    println!();
    println!(
        "{} environment {} in {}",
        style("Dry run:").bold(),
        style(&config.environment).cyan(),
        config.region
    );
    for plan in controller.plan()? {
        println!();
        println!(
            "{} {}. {} {}",
            style("▶").green(),
            plan.ordinal,
            style(&plan.name).bold(),
            style(if plan.mandatory { "(mandatory)" } else { "(optional)" }).dim()
        );
        for (label, command) in plan.steps {
            println!("    {:<28} {}", label, style(command).dim());
        }
    }
    println!();
    Ok(ExitCode::SUCCESS)
}

pub async fn run_pipeline(cli: &Cli, project_dir: &Path) -> Result<ExitCode> {
    use rollout::audit::{AuditLogger, AuditRecord, RunStarted};
    use rollout::orchestrator::RunOutcome;
    use rollout::phase::PhaseStatus;
    use rollout::prereq::PrerequisiteChecker;
    use rollout::report::RunReport;
    use rollout::ui::DeployUI;
    use rollout::ui::icons::{REPORT, WARN};

    let (config, phases) = prepare(cli, project_dir)?;
    config.ensure_directories()?;
    let _log_guard = rollout::logging::init(&config.log_dir(), config.verbose)?;

    let audit = AuditLogger::new(&config.audit_dir());
    if let Some(previous) = audit.interrupted_run()? {
        println!(
            "{} A previous run started {} did not finish; steps are safe to re-run.",
            WARN,
            previous.started_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }

    let ids: Vec<&str> = phases.iter().map(|p| p.id.as_str()).collect();
    let checker = PrerequisiteChecker::for_phases(&config, &ids);
    audit.start_run(&RunStarted::new(
        config.summary(),
        ids.iter().map(|s| s.to_string()).collect(),
    ))?;

    let ui = Arc::new(DeployUI::new(phases.len() as u64, config.verbose));
    let controller = build_controller(&config, phases)
        .with_checker(checker)
        .with_ui(ui.clone());
    let artifacts = match controller.run().await {
        Ok(artifacts) => artifacts,
        Err(e) => {
            ui.finish(RunOutcome::Aborted);
            audit.finish_run(&AuditRecord {
                settings: config.summary(),
                run: controller.errored_run(&e),
                outputs: BTreeMap::new(),
            })?;
            return Err(e).context("Pipeline run failed");
        }
    };

    let report = RunReport::assemble(&artifacts.run, artifacts.harvest.as_ref(), &config);
    println!();
    for entry in report.entries() {
        println!(
            "  {:<4} {:<24} {}",
            entry.ordinal,
            entry.name,
            match entry.status {
                PhaseStatus::Completed => style(entry.status.to_string()).green(),
                PhaseStatus::Skipped => style(entry.status.to_string()).yellow(),
                PhaseStatus::Failed => style(entry.status.to_string()).red(),
            }
        );
    }
    if let Some(phase) = artifacts.run.declined() {
        println!("  {:<4} {:<24} {}", phase.ordinal, phase.name, style("declined").red());
    }
    for phase in artifacts.run.not_reached() {
        println!("  {:<4} {:<24} {}", phase.ordinal, phase.name, style("not reached").dim());
    }
    println!();

    // The audit record is written even when the report cannot be.
    let persisted = report
        .should_persist()
        .then(|| report.persist(&config.report_path(), &config.reports_dir()));

    let outcome = report.outcome();
    let abort_reason = artifacts.run.abort_reason().map(str::to_string);
    audit.finish_run(&AuditRecord {
        settings: config.summary(),
        outputs: artifacts
            .harvest
            .as_ref()
            .map(|h| h.display_map())
            .unwrap_or_default(),
        run: artifacts.run,
    })?;

    match persisted {
        Some(written) => {
            written?;
            println!("{}Report written to {}", REPORT, config.report_path().display());
        }
        None => {
            if let Some(reason) = abort_reason {
                println!("{} Run aborted: {}", WARN, reason);
            }
        }
    }

    Ok(ExitCode::from(outcome.exit_code()))
}
