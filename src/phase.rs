//! Phase and step definitions, and the per-phase result record.
//!
//! This module provides:
//! - `Phase`, a named, ordered unit of deployment work
//! - `Step`, one action plus its success predicate and optional rollback
//! - `PhaseResult` / `StepRecord`, the immutable outcome of running a phase
//! - `validate_phases`, the startup check on static definitions

use crate::database::DatabaseTask;
use crate::errors::PipelineError;
use crate::runner::{CommandOutput, CommandTemplate};
use crate::secrets::SecretsTask;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Longest stdout/stderr tail kept on a step record.
const MAX_CAPTURED_CHARS: usize = 4000;

/// What a step does.
#[derive(Debug, Clone)]
pub enum StepAction {
    /// Run an external tool.
    Command(CommandTemplate),
    /// Talk to the database through the client library.
    Database(DatabaseTask),
    /// Check an HTTP endpoint.
    Http(HttpCheck),
    /// Make sure generated secrets exist in the local vault.
    Secrets(SecretsTask),
}

/// GET `url` (a template) and expect `expect_status`.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpCheck {
    pub url: String,
    pub expect_status: u16,
}

/// How a command step's output is judged.
#[derive(Debug, Clone, Default)]
pub enum SuccessPredicate {
    #[default]
    ExitZero,
    ExitCodeIn(Vec<i32>),
    /// Exit 0 and stdout matches.
    StdoutMatches(Regex),
    /// Exit 0, or any exit whose combined output matches (e.g. "already exists").
    ExitZeroOrOutput(Regex),
}

impl SuccessPredicate {
    /// `Err` carries a short reason suitable for the failure banner.
    pub fn check(&self, out: &CommandOutput) -> Result<(), String> {
        let code = describe_exit(out.exit_code);
        match self {
            SuccessPredicate::ExitZero => {
                if out.success() {
                    Ok(())
                } else {
                    Err(code)
                }
            }
            SuccessPredicate::ExitCodeIn(allowed) => match out.exit_code {
                Some(c) if allowed.contains(&c) => Ok(()),
                _ => Err(format!("{} (expected one of {:?})", code, allowed)),
            },
            SuccessPredicate::StdoutMatches(re) => {
                if !out.success() {
                    Err(code)
                } else if re.is_match(&out.stdout) {
                    Ok(())
                } else {
                    Err(format!("stdout did not match /{}/", re.as_str()))
                }
            }
            SuccessPredicate::ExitZeroOrOutput(re) => {
                if out.success() || re.is_match(&out.combined()) {
                    Ok(())
                } else {
                    Err(code)
                }
            }
        }
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {}", c),
        None => "terminated by signal".to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct Step {
    pub label: String,
    pub action: StepAction,
    pub predicate: SuccessPredicate,
    /// Undo action, run if the enclosing phase fails after this step ran.
    pub rollback: Option<CommandTemplate>,
    /// Best-effort: a failure is recorded but later steps still run.
    pub continue_on_failure: bool,
    pub timeout: Option<Duration>,
}

impl Step {
    fn with_action(label: &str, action: StepAction) -> Self {
        Self {
            label: label.to_string(),
            action,
            predicate: SuccessPredicate::default(),
            rollback: None,
            continue_on_failure: false,
            timeout: None,
        }
    }

    pub fn command(label: &str, template: CommandTemplate) -> Self {
        Self::with_action(label, StepAction::Command(template))
    }

    pub fn database(label: &str, task: DatabaseTask) -> Self {
        Self::with_action(label, StepAction::Database(task))
    }

    pub fn http(label: &str, url: &str, expect_status: u16) -> Self {
        Self::with_action(
            label,
            StepAction::Http(HttpCheck {
                url: url.to_string(),
                expect_status,
            }),
        )
    }

    pub fn secrets(label: &str, task: SecretsTask) -> Self {
        Self::with_action(label, StepAction::Secrets(task))
    }

    #[must_use]
    pub fn expect(mut self, predicate: SuccessPredicate) -> Self {
        self.predicate = predicate;
        self
    }

    #[must_use]
    pub fn rollback(mut self, template: CommandTemplate) -> Self {
        self.rollback = Some(template);
        self
    }

    #[must_use]
    pub fn best_effort(mut self) -> Self {
        self.continue_on_failure = true;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A named unit of deployment work. Defined once at startup, never mutated.
#[derive(Debug, Clone)]
pub struct Phase {
    /// Stable identifier used by `--only` / `--from` (e.g. "infrastructure")
    pub id: String,
    pub name: String,
    /// 1-based position in the full catalog
    pub ordinal: usize,
    /// A mandatory phase cannot be skipped, and its failure needs operator
    /// consent before the run continues.
    pub mandatory: bool,
    /// Pull infrastructure outputs once this phase completes.
    pub harvest_outputs: bool,
    pub steps: Vec<Step>,
}

impl Phase {
    pub fn new(id: &str, name: &str, ordinal: usize, mandatory: bool) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            ordinal,
            mandatory,
            harvest_outputs: false,
            steps: Vec::new(),
        }
    }

    #[must_use]
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    #[must_use]
    pub fn steps(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.steps.extend(steps);
        self
    }

    #[must_use]
    pub fn harvests_outputs(mut self) -> Self {
        self.harvest_outputs = true;
        self
    }
}

/// Reject malformed static definitions before anything runs.
pub fn validate_phases(phases: &[Phase]) -> Result<(), PipelineError> {
    let invalid = |reason: String| PipelineError::InvalidPhaseDefinition { reason };

    if phases.is_empty() {
        return Err(invalid("no phases selected".to_string()));
    }

    let mut seen = HashSet::new();
    let mut last_ordinal = 0;
    for phase in phases {
        if phase.id.is_empty()
            || !phase
                .id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(invalid(format!("phase id '{}' must be lowercase kebab-case", phase.id)));
        }
        if !seen.insert(phase.id.as_str()) {
            return Err(invalid(format!("duplicate phase id '{}'", phase.id)));
        }
        if phase.ordinal <= last_ordinal {
            return Err(invalid(format!(
                "phase '{}' has ordinal {} after {}",
                phase.id, phase.ordinal, last_ordinal
            )));
        }
        last_ordinal = phase.ordinal;
        if phase.steps.is_empty() {
            return Err(invalid(format!("phase '{}' has no steps", phase.id)));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Completed,
    Skipped,
    Failed,
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseStatus::Completed => write!(f, "completed"),
            PhaseStatus::Skipped => write!(f, "skipped"),
            PhaseStatus::Failed => write!(f, "failed"),
        }
    }
}

/// What happened when one step (or rollback) ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub label: String,
    /// Rendered command line (secrets masked) or task description
    pub command: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub succeeded: bool,
    /// Failed, but the step was best-effort so the phase carried on.
    #[serde(default)]
    pub tolerated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl StepRecord {
    pub fn from_output(label: &str, command: String, out: &CommandOutput) -> Self {
        Self {
            label: label.to_string(),
            command,
            exit_code: out.exit_code,
            stdout: tail(&out.stdout, MAX_CAPTURED_CHARS),
            stderr: tail(&out.stderr, MAX_CAPTURED_CHARS),
            duration_ms: out.duration_ms,
            succeeded: true,
            tolerated: false,
            error: None,
            remediation: None,
        }
    }

    pub fn message(label: &str, command: String, message: String, duration_ms: u64) -> Self {
        Self {
            label: label.to_string(),
            command,
            exit_code: None,
            stdout: tail(&message, MAX_CAPTURED_CHARS),
            stderr: String::new(),
            duration_ms,
            succeeded: true,
            tolerated: false,
            error: None,
            remediation: None,
        }
    }

    pub fn failed(mut self, error: String, remediation: Option<String>) -> Self {
        self.succeeded = false;
        self.error = Some(error);
        self.remediation = remediation;
        self
    }
}

/// Keep the last `max` characters, on a char boundary.
pub fn tail(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        return s.to_string();
    }
    let skipped: String = s.chars().skip(count - max).collect();
    format!("...{}", skipped)
}

/// Outcome of one phase in one run. Created once; a retry would be a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase_id: String,
    pub name: String,
    pub ordinal: usize,
    pub mandatory: bool,
    pub status: PhaseStatus,
    pub steps: Vec<StepRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rollbacks: Vec<StepRecord>,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PhaseResult {
    pub fn skipped(phase: &Phase) -> Self {
        Self {
            phase_id: phase.id.clone(),
            name: phase.name.clone(),
            ordinal: phase.ordinal,
            mandatory: phase.mandatory,
            status: PhaseStatus::Skipped,
            steps: Vec::new(),
            rollbacks: Vec::new(),
            elapsed_ms: 0,
            error: None,
        }
    }

    pub fn finished(
        phase: &Phase,
        steps: Vec<StepRecord>,
        rollbacks: Vec<StepRecord>,
        elapsed_ms: u64,
        error: Option<String>,
    ) -> Self {
        let status = if error.is_some() {
            PhaseStatus::Failed
        } else {
            PhaseStatus::Completed
        };
        Self {
            phase_id: phase.id.clone(),
            name: phase.name.clone(),
            ordinal: phase.ordinal,
            mandatory: phase.mandatory,
            status,
            steps,
            rollbacks,
            elapsed_ms,
            error,
        }
    }

    /// Best-effort steps that failed without failing the phase.
    pub fn tolerated_failures(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter().filter(|s| s.tolerated)
    }
}
