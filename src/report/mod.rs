//! End-of-run deployment report.
//!
//! A [`RunReport`] is a projection of a finished [`PipelineRun`] plus whatever
//! infrastructure outputs were harvested. It lists every phase the run recorded
//! and calls out anything skipped, failed, or never reached, so a partial run
//! can't read as a clean one.

pub mod harvest;

use crate::config::RunConfig;
use crate::orchestrator::state::{PipelineRun, RunOutcome};
use crate::phase::PhaseStatus;
use crate::rollout_config::CostItem;
use crate::ui::progress::format_duration;
use anyhow::{Context, Result};
use harvest::Harvest;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// One row of the phase table.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportEntry {
    pub ordinal: usize,
    pub phase_id: String,
    pub name: String,
    pub mandatory: bool,
    pub status: PhaseStatus,
    pub elapsed_ms: u64,
    pub note: String,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    run_id: Uuid,
    outcome: RunOutcome,
    entries: Vec<ReportEntry>,
    markdown: String,
}

impl RunReport {
    pub fn assemble(run: &PipelineRun, harvest: Option<&Harvest>, config: &RunConfig) -> Self {
        let entries: Vec<ReportEntry> = run
            .results()
            .iter()
            .map(|r| {
                let tolerated = r.tolerated_failures().count();
                let note = match (&r.error, r.status) {
                    (Some(error), _) => error.clone(),
                    (None, PhaseStatus::Skipped) => "declined by operator".to_string(),
                    (None, _) if tolerated > 0 => {
                        format!("{} best-effort step(s) failed", tolerated)
                    }
                    _ => String::new(),
                };
                ReportEntry {
                    ordinal: r.ordinal,
                    phase_id: r.phase_id.clone(),
                    name: r.name.clone(),
                    mandatory: r.mandatory,
                    status: r.status,
                    elapsed_ms: r.elapsed_ms,
                    note,
                }
            })
            .collect();

        let outcome = run.outcome().unwrap_or(RunOutcome::Aborted);
        let markdown = render(run, outcome, &entries, harvest, config);
        Self {
            run_id: run.run_id(),
            outcome,
            entries,
            markdown,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn outcome(&self) -> RunOutcome {
        self.outcome
    }

    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    pub fn markdown(&self) -> &str {
        &self.markdown
    }

    /// Aborted runs print a summary but leave no report behind.
    pub fn should_persist(&self) -> bool {
        self.outcome != RunOutcome::Aborted
    }

    /// Atomically replace `path` with this report and archive a copy as
    /// `<archive_dir>/<run-id>.md`. Returns the archive path.
    pub fn persist(&self, path: &Path, archive_dir: &Path) -> Result<PathBuf> {
        write_atomically(path, &self.markdown)?;
        std::fs::create_dir_all(archive_dir)
            .with_context(|| format!("Failed to create {}", archive_dir.display()))?;
        let archive = archive_dir.join(format!("{}.md", self.run_id));
        write_atomically(&archive, &self.markdown)?;
        tracing::info!(path = %path.display(), archive = %archive.display(), "report written");
        Ok(archive)
    }
}

fn write_atomically(path: &Path, contents: &str) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(contents.as_bytes())
        .context("Failed to write report")?;
    tmp.persist(path)
        .with_context(|| format!("Failed to move report into place at {}", path.display()))?;
    Ok(())
}

/// Escape a value for a markdown table cell.
fn cell(s: &str) -> String {
    s.replace('|', "\\|").replace(['\n', '\r'], " ")
}

fn render(
    run: &PipelineRun,
    outcome: RunOutcome,
    entries: &[ReportEntry],
    harvest: Option<&Harvest>,
    config: &RunConfig,
) -> String {
    let mut md = String::new();
    let _ = writeln!(md, "# Deployment Report\n");

    let _ = writeln!(md, "| Field | Value |\n|---|---|");
    let _ = writeln!(md, "| Run | `{}` |", run.run_id());
    let _ = writeln!(md, "| Project | {} |", cell(&config.project_name));
    let _ = writeln!(md, "| Environment | {} |", cell(run.environment()));
    let _ = writeln!(md, "| Region | {} |", cell(&config.region));
    let _ = writeln!(
        md,
        "| Account | {} |",
        config.aws_account_id.as_deref().unwrap_or("(not set)")
    );
    let _ = writeln!(md, "| Started | {} |", run.started_at().to_rfc3339());
    if let Some(ended) = run.ended_at() {
        let _ = writeln!(md, "| Finished | {} |", ended.to_rfc3339());
    }
    if let Some(secs) = run.duration_secs() {
        let _ = writeln!(md, "| Duration | {} |", format_duration((secs * 1000.0) as u64));
    }
    let _ = writeln!(md, "| Gate mode | {} |", run.gate_mode());
    let _ = writeln!(md, "| Outcome | **{}** |\n", outcome);

    let _ = writeln!(md, "## Phases\n");
    let _ = writeln!(md, "| # | Phase | Mandatory | Status | Duration | Notes |");
    let _ = writeln!(md, "|---|---|---|---|---|---|");
    for e in entries {
        let _ = writeln!(
            md,
            "| {} | {} | {} | {} | {} | {} |",
            e.ordinal,
            cell(&e.name),
            if e.mandatory { "yes" } else { "no" },
            e.status,
            format_duration(e.elapsed_ms),
            cell(&e.note)
        );
    }
    md.push('\n');

    render_attention(&mut md, run, entries);
    render_rollbacks(&mut md, run);
    render_outputs(&mut md, harvest, &config.infrastructure.expected_outputs);
    render_costs(&mut md, &config.cost_items);

    let _ = writeln!(md, "## Prerequisites\n");
    if run.prerequisites().is_empty() {
        let _ = writeln!(md, "No prerequisite checks were run.\n");
    } else {
        let _ = writeln!(md, "| Check | Status | Detail |\n|---|---|---|");
        for check in run.prerequisites() {
            let _ = writeln!(
                md,
                "| {} | {} | {} |",
                cell(&check.name),
                if check.satisfied { "ok" } else { "missing" },
                cell(&check.detail)
            );
        }
        md.push('\n');
    }
    md
}

fn render_attention(md: &mut String, run: &PipelineRun, entries: &[ReportEntry]) {
    let _ = writeln!(md, "## Attention\n");
    let mut lines = Vec::new();
    for e in entries {
        match e.status {
            PhaseStatus::Failed => lines.push(format!("- **{}** failed: {}", e.name, e.note)),
            PhaseStatus::Skipped => lines.push(format!("- **{}** skipped: declined by operator", e.name)),
            PhaseStatus::Completed if !e.note.is_empty() => {
                lines.push(format!("- **{}** completed with warnings: {}", e.name, e.note))
            }
            PhaseStatus::Completed => {}
        }
    }
    if let Some(p) = run.declined() {
        lines.push(format!(
            "- **{}** declined: the operator refused this mandatory phase, ending the run",
            p.name
        ));
    }
    for p in run.not_reached() {
        lines.push(format!("- **{}** not reached: the run ended before this phase", p.name));
    }
    if run.continued_after_failure() {
        lines.push("- The operator chose to continue past a failed mandatory phase.".to_string());
    }
    if let Some(reason) = run.abort_reason() {
        lines.push(format!("- Run aborted: {}", reason));
    }

    if lines.is_empty() {
        let _ = writeln!(md, "Nothing needs attention.\n");
    } else {
        for line in lines {
            let _ = writeln!(md, "{}", line);
        }
        md.push('\n');
    }
}

fn render_rollbacks(md: &mut String, run: &PipelineRun) {
    let rolled: Vec<_> = run.results().iter().filter(|r| !r.rollbacks.is_empty()).collect();
    if rolled.is_empty() {
        return;
    }
    let _ = writeln!(md, "## Rollbacks\n");
    for r in rolled {
        for rb in &r.rollbacks {
            let _ = writeln!(
                md,
                "- {}: `{}` {}",
                r.name,
                rb.command,
                if rb.succeeded { "ok" } else { "failed" }
            );
        }
    }
    md.push('\n');
}

fn render_outputs(md: &mut String, harvest: Option<&Harvest>, expected: &[String]) {
    let _ = writeln!(md, "## Endpoints and Resources\n");
    let _ = writeln!(md, "| Output | Value |\n|---|---|");

    let not_harvested = "unavailable (outputs were not harvested in this run)";
    for key in expected {
        let value = match harvest.map(|h| h.lookup(key)) {
            Some(Ok(v)) => v.to_string(),
            Some(Err(reason)) => reason,
            None => not_harvested.to_string(),
        };
        let _ = writeln!(md, "| {} | {} |", cell(key), cell(&value));
    }
    if let Some(outputs) = harvest.and_then(Harvest::outputs) {
        for (key, value) in outputs {
            if !expected.contains(key) {
                let _ = writeln!(md, "| {} | {} |", cell(key), cell(value.display()));
            }
        }
    }
    md.push('\n');
}

fn render_costs(md: &mut String, items: &[CostItem]) {
    if items.is_empty() {
        return;
    }
    let _ = writeln!(md, "## Estimated Monthly Cost\n");
    let _ = writeln!(md, "| Item | USD / month |\n|---|---|");
    for item in items {
        let _ = writeln!(md, "| {} | {:.2} |", cell(&item.item), item.monthly_usd);
    }
    let total: f64 = items.iter().map(|i| i.monthly_usd).sum();
    let _ = writeln!(md, "| **Total** | **{:.2}** |\n", total);
}
