//! Phase state machine and the run record.
//!
//! Per phase: `Pending -> Gated -> (Skipped | Running) -> (Completed | Failed)`.
//! `PipelineRun` is owned by the controller while the run is in flight and is
//! read-only once `finish` has been called.

use crate::errors::PipelineError;
use crate::phase::{Phase, PhaseResult, PhaseStatus};
use crate::prereq::PrerequisiteCheck;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    Pending,
    Gated,
    Skipped,
    Running,
    Completed,
    Failed,
}

impl PhaseState {
    pub fn can_transition_to(self, next: PhaseState) -> bool {
        use PhaseState::*;
        matches!(
            (self, next),
            (Pending, Gated)
                | (Pending, Running)
                | (Gated, Skipped)
                | (Gated, Running)
                | (Running, Completed)
                | (Running, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PhaseState::Skipped | PhaseState::Completed | PhaseState::Failed)
    }
}

impl std::fmt::Display for PhaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PhaseState::Pending => "pending",
            PhaseState::Gated => "gated",
            PhaseState::Skipped => "skipped",
            PhaseState::Running => "running",
            PhaseState::Completed => "completed",
            PhaseState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Tracks one phase through its states, rejecting illegal moves.
#[derive(Debug)]
pub struct PhaseTracker {
    phase: String,
    state: PhaseState,
}

impl PhaseTracker {
    pub fn new(phase: &str) -> Self {
        Self {
            phase: phase.to_string(),
            state: PhaseState::Pending,
        }
    }

    pub fn state(&self) -> PhaseState {
        self.state
    }

    pub fn advance(&mut self, next: PhaseState) -> Result<(), PipelineError> {
        if !self.state.can_transition_to(next) {
            return Err(PipelineError::IllegalTransition {
                phase: self.phase.clone(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        tracing::debug!(phase = %self.phase, from = %self.state, to = %next, "phase transition");
        self.state = next;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Partial,
    Aborted,
}

impl RunOutcome {
    pub fn exit_code(self) -> u8 {
        match self {
            RunOutcome::Success | RunOutcome::Partial => 0,
            RunOutcome::Aborted => 1,
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Success => write!(f, "success"),
            RunOutcome::Partial => write!(f, "partial"),
            RunOutcome::Aborted => write!(f, "aborted"),
        }
    }
}

/// A phase included in the run, whether or not it was reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedPhase {
    pub id: String,
    pub name: String,
    pub ordinal: usize,
    pub mandatory: bool,
}

impl From<&Phase> for PlannedPhase {
    fn from(phase: &Phase) -> Self {
        Self {
            id: phase.id.clone(),
            name: phase.name.clone(),
            ordinal: phase.ordinal,
            mandatory: phase.mandatory,
        }
    }
}

/// One execution of the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    environment: String,
    gate_mode: String,
    planned: Vec<PlannedPhase>,
    prerequisites: Vec<PrerequisiteCheck>,
    results: Vec<PhaseResult>,
    outcome: Option<RunOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    abort_reason: Option<String>,
    #[serde(default)]
    continued_after_failure: bool,
    /// Mandatory phase whose gate the operator declined, ending the run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    declined_phase: Option<String>,
}

impl PipelineRun {
    pub fn start(environment: &str, gate_mode: &str, phases: &[Phase]) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            ended_at: None,
            environment: environment.to_string(),
            gate_mode: gate_mode.to_string(),
            planned: phases.iter().map(PlannedPhase::from).collect(),
            prerequisites: Vec::new(),
            results: Vec::new(),
            outcome: None,
            abort_reason: None,
            continued_after_failure: false,
            declined_phase: None,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// First eight characters of the run id, for file names and banners.
    pub fn short_id(&self) -> String {
        self.run_id.simple().to_string()[..8].to_string()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn gate_mode(&self) -> &str {
        &self.gate_mode
    }

    pub fn planned(&self) -> &[PlannedPhase] {
        &self.planned
    }

    pub fn prerequisites(&self) -> &[PrerequisiteCheck] {
        &self.prerequisites
    }

    pub fn results(&self) -> &[PhaseResult] {
        &self.results
    }

    pub fn outcome(&self) -> Option<RunOutcome> {
        self.outcome
    }

    pub fn abort_reason(&self) -> Option<&str> {
        self.abort_reason.as_deref()
    }

    pub fn continued_after_failure(&self) -> bool {
        self.continued_after_failure
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    /// The mandatory phase the operator declined to run, if that ended the run.
    pub fn declined(&self) -> Option<&PlannedPhase> {
        let id = self.declined_phase.as_deref()?;
        self.planned.iter().find(|p| p.id == id)
    }

    /// Planned phases with no result that the run ended before reaching.
    /// A declined phase is reported by [`PipelineRun::declined`] instead.
    pub fn not_reached(&self) -> Vec<&PlannedPhase> {
        self.planned
            .iter()
            .filter(|p| !self.results.iter().any(|r| r.phase_id == p.id))
            .filter(|p| self.declined_phase.as_deref() != Some(p.id.as_str()))
            .collect()
    }

    pub fn duration_secs(&self) -> Option<f64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds() as f64 / 1000.0)
    }

    pub(crate) fn record_prerequisites(&mut self, checks: Vec<PrerequisiteCheck>) {
        debug_assert!(!self.is_finished());
        self.prerequisites = checks;
    }

    pub(crate) fn record(&mut self, result: PhaseResult) {
        debug_assert!(!self.is_finished());
        self.results.push(result);
    }

    pub(crate) fn mark_continued(&mut self) {
        self.continued_after_failure = true;
    }

    pub(crate) fn mark_declined(&mut self, phase_id: &str) {
        debug_assert!(!self.is_finished());
        self.declined_phase = Some(phase_id.to_string());
    }

    /// Seal the run. `abort_reason` set means the run was aborted.
    pub(crate) fn finish(&mut self, abort_reason: Option<String>) -> RunOutcome {
        let outcome = derive_outcome(&self.results, abort_reason.is_some());
        self.abort_reason = abort_reason;
        self.outcome = Some(outcome);
        self.ended_at = Some(Utc::now());
        outcome
    }
}

/// success: nothing failed; partial: something failed but the run went on;
/// aborted: the operator stopped it.
pub fn derive_outcome(results: &[PhaseResult], aborted: bool) -> RunOutcome {
    if aborted {
        RunOutcome::Aborted
    } else if results.iter().any(|r| r.status == PhaseStatus::Failed) {
        RunOutcome::Partial
    } else {
        RunOutcome::Success
    }
}
