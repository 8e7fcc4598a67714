use anyhow::Result;
use std::path::Path;
use std::process::ExitCode;

use super::super::Cli;

pub fn print_catalog(cli: &Cli, project_dir: &Path) -> Result<ExitCode> {
    use rollout::audit::AuditLogger;
    use rollout::catalog::{default_phases, describe_phase};
    use rollout::config::RunConfig;

    let config = RunConfig::load(project_dir, super::overrides(cli))?;
    let phases = default_phases(&config)?;

    println!();
    println!("Environment: {} ({})", config.environment, config.region);
    println!();
    println!("{:<4} {:<16} {:<10} Description", "#", "Phase", "Kind");
    println!("{:<4} {:<16} {:<10} -----------", "--", "-----", "----");
    for phase in &phases {
        println!(
            "{:<4} {:<16} {:<10} {}",
            phase.ordinal,
            phase.id,
            if phase.mandatory { "mandatory" } else { "optional" },
            describe_phase(&phase.id)
        );
    }
    println!();

    if let Some(last) = AuditLogger::new(&config.audit_dir()).last_run()? {
        let run = &last.run;
        println!(
            "Last run: {} ({}) {}",
            run.started_at().format("%Y-%m-%d %H:%M:%S UTC"),
            run.environment(),
            run.outcome()
                .map_or("unfinished".to_string(), |o| o.to_string())
        );
        if let Some(reason) = run.abort_reason() {
            println!("  aborted: {}", reason);
        }
        println!();
    }
    Ok(ExitCode::SUCCESS)
}
