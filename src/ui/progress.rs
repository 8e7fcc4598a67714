use crate::orchestrator::state::RunOutcome;
use crate::phase::StepRecord;
use crate::prereq::PrerequisiteCheck;
use crate::ui::icons::{CHECK, CLOCK, CROSS, HINT, ROLLBACK, RUNNING, SKIP, SPARKLE, WARN};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

/// Lines of captured output shown under a failed step.
const FAILURE_TAIL_LINES: usize = 15;

/// Terminal UI for a deployment run, rendered via `indicatif` progress bars.
///
/// Two bars are stacked vertically:
/// - Phase bar: how many phases have reached a terminal state
/// - Step spinner: the step currently running
///
/// All output goes through `MultiProgress` so log lines never tear the bars.
pub struct DeployUI {
    multi: MultiProgress,
    phase_bar: ProgressBar,
    step_bar: ProgressBar,
    verbose: bool,
}

impl DeployUI {
    /// Create the UI. `total_phases` sizes the phase bar; `verbose` also
    /// prints each successful step's output tail.
    pub fn new(total_phases: u64, verbose: bool) -> Self {
        let multi = MultiProgress::new();

        let phase_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");

        let phase_bar = multi.add(ProgressBar::new(total_phases));
        phase_bar.set_style(phase_style);
        phase_bar.set_prefix("Phases");

        let step_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg} {elapsed:.dim}")
            .expect("progress bar template is a valid static string");

        let step_bar = multi.add(ProgressBar::new_spinner());
        step_bar.set_style(step_style);
        step_bar.set_prefix("  Step");

        Self {
            multi,
            phase_bar,
            step_bar,
            verbose,
        }
    }

    /// Print a line via `MultiProgress`. A hidden draw target (stderr is not a
    /// terminal) swallows `println`, so those lines go straight to stderr.
    pub fn print_line(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        if self.multi.is_hidden() || self.multi.println(msg).is_err() {
            eprintln!("{}", msg);
        }
    }

    /// Hide the bars while a confirmation prompt owns the terminal.
    pub fn suspend(&self) {
        self.step_bar.disable_steady_tick();
        self.multi.set_draw_target(ProgressDrawTarget::hidden());
    }

    pub fn resume(&self) {
        self.multi.set_draw_target(ProgressDrawTarget::stderr());
    }

    pub fn print_separator(&self) {
        self.print_line(format!("{}", style("═".repeat(70)).cyan()));
    }

    pub fn print_phase_header(&self, ordinal: usize, total: usize, name: &str, mandatory: bool) {
        self.print_line("");
        self.print_separator();
        self.print_line(format!(
            "{} Phase {}/{}: {} {}",
            style("▶").green().bold(),
            style(ordinal).yellow().bold(),
            total,
            style(name).bold(),
            if mandatory {
                style("(mandatory)").red().dim()
            } else {
                style("(optional)").dim()
            }
        ));
        self.print_separator();
        self.phase_bar.set_message(name.to_string());
    }

    pub fn start_step(&self, label: &str, command: &str) {
        self.step_bar.reset_elapsed();
        self.step_bar.set_message(format!("{}", style(label).cyan()));
        self.step_bar.enable_steady_tick(Duration::from_millis(100));
        self.print_line(format!("  {} {}", RUNNING, style(label).bold()));
        self.print_line(format!("      {} {}", style("$").dim(), style(command).dim()));
    }

    pub fn step_succeeded(&self, record: &StepRecord) {
        self.step_bar.set_message(String::new());
        self.print_line(format!(
            "  {} {} {}",
            CHECK,
            record.label,
            style(format_duration(record.duration_ms)).dim()
        ));
        if self.verbose {
            for line in last_lines(&record.stdout, FAILURE_TAIL_LINES) {
                self.print_line(format!("      {}", style(line).dim()));
            }
        }
    }

    /// Failing command, captured output, and a remediation hint if one is known.
    pub fn step_failed(&self, record: &StepRecord) {
        self.step_bar.set_message(String::new());
        let icon = if record.tolerated { WARN } else { CROSS };
        self.print_line(format!(
            "  {} {} {}",
            icon,
            style(&record.label).red().bold(),
            if record.tolerated {
                style("(best-effort, continuing)").yellow().to_string()
            } else {
                String::new()
            }
        ));
        self.print_line(format!("      {} {}", style("command:").dim(), record.command));
        if let Some(error) = &record.error {
            self.print_line(format!("      {} {}", style("error:").dim(), style(error).red()));
        }
        for (label, text) in [("stdout", &record.stdout), ("stderr", &record.stderr)] {
            let lines = last_lines(text, FAILURE_TAIL_LINES);
            if lines.is_empty() {
                continue;
            }
            self.print_line(format!("      {}", style(format!("{}:", label)).dim()));
            for line in lines {
                self.print_line(format!("        {}", line));
            }
        }
        if let Some(hint) = &record.remediation {
            self.print_line(format!("      {} {}", HINT, style(hint).yellow()));
        }
    }

    pub fn rollback_step(&self, record: &StepRecord) {
        let status = if record.succeeded {
            style("ok").green()
        } else {
            style("failed").red()
        };
        self.print_line(format!(
            "  {} rollback {}: {} ({})",
            ROLLBACK,
            record.label,
            record.command,
            status
        ));
    }

    pub fn phase_complete(&self, name: &str, elapsed_ms: u64) {
        self.phase_bar.inc(1);
        self.print_line(format!(
            "\n{} {} complete {}\n",
            SPARKLE,
            style(name).green().bold(),
            style(format!("{}{}", CLOCK, format_duration(elapsed_ms))).dim()
        ));
    }

    pub fn phase_skipped(&self, name: &str) {
        self.phase_bar.inc(1);
        self.print_line(format!("{} {} skipped by operator", SKIP, style(name).yellow()));
    }

    /// Failure banner; the phase bar still advances since the phase is terminal.
    pub fn phase_failed(&self, name: &str, reason: &str) {
        self.phase_bar.inc(1);
        self.print_line(format!(
            "\n{} {} failed: {}\n",
            CROSS,
            style(name).red().bold(),
            reason
        ));
    }

    pub fn show_prerequisites(&self, checks: &[PrerequisiteCheck]) {
        self.print_line(format!("{}", style("Prerequisites").bold().underlined()));
        for check in checks {
            let icon = if check.satisfied { CHECK } else { CROSS };
            self.print_line(format!(
                "  {} {:<16} {}",
                icon,
                check.name,
                style(&check.detail).dim()
            ));
            if !check.satisfied
                && let Some(hint) = &check.remediation
            {
                self.print_line(format!("      {} {}", HINT, style(hint).yellow()));
            }
        }
        self.print_line("");
    }

    pub fn finish(&self, outcome: RunOutcome) {
        self.step_bar.finish_and_clear();
        let msg = match outcome {
            RunOutcome::Success => style("deployment succeeded").green().bold(),
            RunOutcome::Partial => style("deployment partially succeeded").yellow().bold(),
            RunOutcome::Aborted => style("deployment aborted").red().bold(),
        };
        self.phase_bar.finish_with_message(msg.to_string());
    }
}

/// `Xs` below a minute, `Xm Ys` above.
pub fn format_duration(ms: u64) -> String {
    let secs = ms / 1000;
    if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}

fn last_lines(text: &str, n: usize) -> Vec<&str> {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].to_vec()
}
