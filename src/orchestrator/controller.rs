//! The pipeline controller: drives gates, phases, and failure policy.

use crate::config::RunConfig;
use crate::errors::PipelineError;
use crate::gates::ConfirmationGate;
use crate::orchestrator::context::RunContext;
use crate::orchestrator::executor::StepExecutor;
use crate::orchestrator::state::{PhaseState, PhaseTracker, PipelineRun, RunOutcome};
use crate::phase::{Phase, PhaseResult, validate_phases};
use crate::prereq::{PrerequisiteChecker, all_satisfied};
use crate::report::harvest::Harvest;
use crate::runner::Vars;
use crate::ui::DeployUI;
use std::sync::Arc;

/// Everything a finished run leaves behind for the report and audit log.
#[derive(Debug)]
pub struct RunArtifacts {
    pub run: PipelineRun,
    pub harvest: Option<Harvest>,
}

/// A phase as it would run, for `--dry-run`.
#[derive(Debug, Clone)]
pub struct PhasePlan {
    pub ordinal: usize,
    pub id: String,
    pub name: String,
    pub mandatory: bool,
    /// (label, rendered command) per step
    pub steps: Vec<(String, String)>,
}

pub struct PipelineController {
    phases: Vec<Phase>,
    environment: String,
    base_vars: Vars,
    gate: Arc<dyn ConfirmationGate>,
    executor: StepExecutor,
    checker: PrerequisiteChecker,
    ui: Option<Arc<DeployUI>>,
}

impl PipelineController {
    pub fn new(
        config: &RunConfig,
        phases: Vec<Phase>,
        gate: Arc<dyn ConfirmationGate>,
        executor: StepExecutor,
    ) -> Self {
        Self {
            phases,
            environment: config.environment.clone(),
            base_vars: config.base_vars(),
            gate,
            executor,
            checker: PrerequisiteChecker::new(Vec::new()),
            ui: None,
        }
    }

    #[must_use]
    pub fn with_checker(mut self, checker: PrerequisiteChecker) -> Self {
        self.checker = checker;
        self
    }

    #[must_use]
    pub fn with_ui(mut self, ui: Arc<DeployUI>) -> Self {
        self.ui = Some(ui);
        self
    }

    /// A sealed, aborted run standing in for one that ended in `error`, so the
    /// audit history still gets an entry.
    pub fn errored_run(&self, error: &PipelineError) -> PipelineRun {
        let mut run = PipelineRun::start(&self.environment, self.gate.mode(), &self.phases);
        run.finish(Some(format!("run failed: {}", error)));
        run
    }

    /// Render every step without executing anything.
    pub fn plan(&self) -> Result<Vec<PhasePlan>, PipelineError> {
        validate_phases(&self.phases)?;
        let ctx = RunContext::new(self.base_vars.clone());
        Ok(self
            .phases
            .iter()
            .map(|phase| PhasePlan {
                ordinal: phase.ordinal,
                id: phase.id.clone(),
                name: phase.name.clone(),
                mandatory: phase.mandatory,
                steps: phase
                    .steps
                    .iter()
                    .map(|s| (s.label.clone(), self.executor.describe(s, &ctx)))
                    .collect(),
            })
            .collect())
    }

    /// Execute the pipeline once.
    ///
    /// Step failures never surface as `Err`; they become phase results and go
    /// through the failure policy. `Err` means the phase list is malformed, the
    /// state machine was violated, or the gate backend broke.
    pub async fn run(&self) -> Result<RunArtifacts, PipelineError> {
        validate_phases(&self.phases)?;

        let mut run = PipelineRun::start(&self.environment, self.gate.mode(), &self.phases);
        let mut ctx = RunContext::new(self.base_vars.clone());
        tracing::info!(
            run_id = %run.run_id(),
            environment = %self.environment,
            phases = self.phases.len(),
            gate = self.gate.mode(),
            "pipeline run started"
        );

        let checks = self.checker.check_all(self.executor.runner()).await;
        if let Some(ui) = &self.ui
            && !checks.is_empty()
        {
            ui.show_prerequisites(&checks);
        }
        let satisfied = all_satisfied(&checks);
        run.record_prerequisites(checks);
        if !satisfied
            && !self
                .ask("Some prerequisites are missing. Continue anyway?", false)
                .await?
        {
            tracing::warn!("run stopped at prerequisite check");
            return Ok(self.seal(run, Some("prerequisite check failed".to_string()), ctx));
        }

        let total = self.phases.len();
        let mut abort_reason = None;

        for (index, phase) in self.phases.iter().enumerate() {
            let mut tracker = PhaseTracker::new(&phase.id);
            tracker.advance(PhaseState::Gated)?;

            let prompt = format!("Run phase {}/{}: {}?", index + 1, total, phase.name);
            if !self.ask(&prompt, true).await? {
                if phase.mandatory {
                    let abort = PipelineError::OperatorAbort {
                        phase: phase.id.clone(),
                    };
                    tracing::warn!(phase = %phase.id, "mandatory phase declined; aborting");
                    run.mark_declined(&phase.id);
                    abort_reason = Some(abort.to_string());
                    break;
                }
                tracker.advance(PhaseState::Skipped)?;
                tracing::info!(phase = %phase.id, "phase skipped by operator");
                if let Some(ui) = &self.ui {
                    ui.phase_skipped(&phase.name);
                }
                run.record(PhaseResult::skipped(phase));
                continue;
            }

            tracker.advance(PhaseState::Running)?;
            tracing::info!(phase = %phase.id, mandatory = phase.mandatory, "phase started");
            if let Some(ui) = &self.ui {
                ui.print_phase_header(index + 1, total, &phase.name, phase.mandatory);
            }

            let execution = self
                .executor
                .run_phase(phase, &mut ctx, self.ui.as_deref())
                .await;
            if execution.error.is_none() && phase.harvest_outputs {
                self.executor.harvest(&mut ctx).await;
            }

            let error = execution.error.clone();
            tracker.advance(if error.is_some() {
                PhaseState::Failed
            } else {
                PhaseState::Completed
            })?;
            run.record(PhaseResult::finished(
                phase,
                execution.steps,
                execution.rollbacks,
                execution.elapsed_ms,
                execution.error,
            ));

            let Some(error) = error else {
                tracing::info!(phase = %phase.id, elapsed_ms = execution.elapsed_ms, "phase completed");
                if let Some(ui) = &self.ui {
                    ui.phase_complete(&phase.name, execution.elapsed_ms);
                }
                continue;
            };

            tracing::error!(phase = %phase.id, error = %error, "phase failed");
            if let Some(ui) = &self.ui {
                ui.phase_failed(&phase.name, &error);
            }
            if !phase.mandatory {
                tracing::warn!(phase = %phase.id, "optional phase failed; continuing");
                continue;
            }

            let prompt = format!("Mandatory phase '{}' failed. Continue anyway?", phase.name);
            if self.ask(&prompt, false).await? {
                tracing::warn!(phase = %phase.id, "operator continued past mandatory failure");
                run.mark_continued();
            } else {
                abort_reason = Some(
                    PipelineError::OperatorAbort {
                        phase: phase.id.clone(),
                    }
                    .to_string(),
                );
                break;
            }
        }

        Ok(self.seal(run, abort_reason, ctx))
    }

    fn seal(&self, mut run: PipelineRun, abort_reason: Option<String>, ctx: RunContext) -> RunArtifacts {
        let outcome = run.finish(abort_reason);
        tracing::info!(
            run_id = %run.run_id(),
            outcome = %outcome,
            phases_recorded = run.results().len(),
            "pipeline run finished"
        );
        if let Some(ui) = &self.ui {
            ui.finish(outcome);
        }
        RunArtifacts {
            run,
            harvest: ctx.harvest().cloned(),
        }
    }

    /// Ask the gate with the progress bars out of the way.
    async fn ask(&self, prompt: &str, default: bool) -> Result<bool, PipelineError> {
        if let Some(ui) = &self.ui {
            ui.suspend();
        }
        let answer = self.gate.confirm(prompt, default).await;
        if let Some(ui) = &self.ui {
            ui.resume();
        }
        let answer = answer.map_err(PipelineError::Gate)?;
        tracing::info!(prompt, answer, "gate resolved");
        Ok(answer)
    }
}

impl RunArtifacts {
    pub fn outcome(&self) -> RunOutcome {
        self.run.outcome().unwrap_or(RunOutcome::Aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CliOverrides;
    use crate::database::stub::StubDatabase;
    use crate::gates::AutoApproveGate;
    use crate::gates::stub::ScriptedGate;
    use crate::phase::{PhaseStatus, Step};
    use crate::prereq::Requirement;
    use crate::report::harvest::Harvester;
    use crate::rollout_config::RolloutToml;
    use crate::runner::stub::{Reply, StubRunner};
    use crate::runner::{CommandSpec, CommandTemplate};
    use crate::secrets::SecretVault;
    use std::path::Path;

    fn config(dir: &Path) -> RunConfig {
        RunConfig::from_layers(
            dir.to_path_buf(),
            RolloutToml::default(),
            &|_: &str| None,
            CliOverrides::default(),
        )
        .unwrap()
    }

    fn executor(runner: Arc<StubRunner>, dir: &Path) -> StepExecutor {
        StepExecutor::new(
            runner,
            Arc::new(StubDatabase::default()),
            SecretVault::new(dir.join(".rollout/secrets.env"), dir.to_path_buf()),
            Harvester::new("terraform", Path::new("terraform")),
            dir.to_path_buf(),
        )
    }

    /// Each phase runs one command named `run-<id>`.
    fn phase(id: &str, ordinal: usize, mandatory: bool) -> Phase {
        Phase::new(id, &id.to_uppercase(), ordinal, mandatory)
            .step(Step::command("work", CommandTemplate::new(format!("run-{}", id))))
    }

    fn controller(
        dir: &Path,
        phases: Vec<Phase>,
        runner: Arc<StubRunner>,
        gate: Arc<dyn ConfirmationGate>,
    ) -> PipelineController {
        PipelineController::new(&config(dir), phases, gate, executor(runner, dir))
    }

    fn statuses(run: &PipelineRun) -> Vec<(String, PhaseStatus)> {
        run.results()
            .iter()
            .map(|r| (r.phase_id.clone(), r.status))
            .collect()
    }

    #[tokio::test]
    async fn test_phases_run_in_declared_order_once_each() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(StubRunner::succeeding());
        let phases = vec![phase("a", 1, true), phase("b", 2, false), phase("c", 3, true), phase("d", 5, false)];
        let artifacts = controller(dir.path(), phases, runner.clone(), Arc::new(ScriptedGate::always(true)))
            .run()
            .await
            .unwrap();

        assert_eq!(runner.calls(), vec!["run-a", "run-b", "run-c", "run-d"]);
        let ids: Vec<_> = artifacts.run.results().iter().map(|r| r.phase_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
        assert_eq!(artifacts.outcome(), RunOutcome::Success);
    }

    #[tokio::test]
    async fn test_declined_optional_phase_is_skipped_without_running() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(StubRunner::succeeding());
        let gate = Arc::new(ScriptedGate::always(true).answer("phase 2/3", false));
        let phases = vec![phase("a", 1, true), phase("b", 2, false), phase("c", 3, true)];
        let artifacts = controller(dir.path(), phases, runner.clone(), gate)
            .run()
            .await
            .unwrap();

        assert_eq!(runner.calls_containing("run-b"), 0);
        assert_eq!(
            statuses(&artifacts.run),
            vec![
                ("a".to_string(), PhaseStatus::Completed),
                ("b".to_string(), PhaseStatus::Skipped),
                ("c".to_string(), PhaseStatus::Completed),
            ]
        );
        assert_eq!(artifacts.outcome(), RunOutcome::Success);
    }

    #[tokio::test]
    async fn test_declining_after_mandatory_failure_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(StubRunner::succeeding().on("run-a", Reply::fail(1, "denied")));
        let gate = Arc::new(ScriptedGate::always(true).answer("failed", false));
        let phases = vec![phase("a", 1, true), phase("b", 2, true)];
        let artifacts = controller(dir.path(), phases, runner.clone(), gate)
            .run()
            .await
            .unwrap();

        assert_eq!(artifacts.outcome(), RunOutcome::Aborted);
        assert_eq!(runner.calls_containing("run-b"), 0);
        assert_eq!(statuses(&artifacts.run), vec![("a".to_string(), PhaseStatus::Failed)]);
        assert_eq!(artifacts.run.not_reached()[0].id, "b");
        assert!(artifacts.run.abort_reason().unwrap().contains("'a'"));
    }

    #[tokio::test]
    async fn test_continuing_after_mandatory_failure_is_partial() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(StubRunner::succeeding().on("run-a", Reply::fail(1, "denied")));
        let gate = Arc::new(ScriptedGate::always(true));
        let phases = vec![phase("a", 1, true), phase("b", 2, true)];
        let artifacts = controller(dir.path(), phases, runner.clone(), gate.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(artifacts.outcome(), RunOutcome::Partial);
        assert_eq!(runner.calls_containing("run-b"), 1);
        assert!(artifacts.run.continued_after_failure());
        assert!(gate.prompts().iter().any(|p| p.contains("Mandatory phase 'A' failed")));
    }

    #[tokio::test]
    async fn test_optional_failure_does_not_prompt_or_block() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(StubRunner::succeeding().on("run-b", Reply::fail(3, "")));
        let gate = Arc::new(ScriptedGate::always(true));
        let phases = vec![phase("a", 1, true), phase("b", 2, false), phase("c", 3, true)];
        let artifacts = controller(dir.path(), phases, runner.clone(), gate.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(artifacts.outcome(), RunOutcome::Partial);
        assert_eq!(runner.calls_containing("run-b"), 1);
        assert_eq!(runner.calls_containing("run-c"), 1);
        assert!(!gate.prompts().iter().any(|p| p.contains("Continue anyway")));
        assert!(!artifacts.run.continued_after_failure());
    }

    #[tokio::test]
    async fn test_declining_a_mandatory_gate_aborts_before_running() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(StubRunner::succeeding());
        let gate = Arc::new(ScriptedGate::always(true).answer("phase 2/2", false));
        let phases = vec![phase("a", 1, false), phase("b", 2, true)];
        let artifacts = controller(dir.path(), phases, runner.clone(), gate)
            .run()
            .await
            .unwrap();

        assert_eq!(artifacts.outcome(), RunOutcome::Aborted);
        assert_eq!(runner.calls_containing("run-b"), 0);
        assert_eq!(artifacts.run.results().len(), 1);
        assert!(artifacts.run.results().iter().all(|r| r.status != PhaseStatus::Skipped || !r.mandatory));
        assert_eq!(artifacts.run.declined().map(|p| p.id.as_str()), Some("b"));
        assert!(artifacts.run.not_reached().is_empty());
    }

    #[tokio::test]
    async fn test_auto_approve_reruns_produce_identical_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let phases = vec![phase("a", 1, true), phase("b", 2, false), phase("c", 3, true)];
        let mut sequences = Vec::new();
        for _ in 0..2 {
            let runner = Arc::new(StubRunner::succeeding().on("run-b", Reply::fail(1, "flaky")));
            let artifacts = controller(dir.path(), phases.clone(), runner, Arc::new(AutoApproveGate))
                .run()
                .await
                .unwrap();
            assert_eq!(artifacts.run.gate_mode(), "auto-approve");
            sequences.push(statuses(&artifacts.run));
        }
        assert_eq!(sequences[0], sequences[1]);
    }

    #[tokio::test]
    async fn test_auto_approve_aborts_on_mandatory_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(StubRunner::succeeding().on("run-a", Reply::fail(1, "")));
        let artifacts = controller(
            dir.path(),
            vec![phase("a", 1, true), phase("b", 2, true)],
            runner.clone(),
            Arc::new(AutoApproveGate),
        )
        .run()
        .await
        .unwrap();
        assert_eq!(artifacts.outcome(), RunOutcome::Aborted);
        assert_eq!(runner.calls_containing("run-b"), 0);
    }

    #[tokio::test]
    async fn test_missing_prerequisite_asks_and_can_stop_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(StubRunner::succeeding().on("terraform", Reply::NotFound));
        let gate = Arc::new(ScriptedGate::always(true).answer("prerequisites", false));
        let checker = PrerequisiteChecker::new(vec![Requirement::new(
            "terraform",
            CommandSpec::new("terraform").arg("-version"),
            "install terraform",
        )]);
        let artifacts = controller(dir.path(), vec![phase("a", 1, true)], runner.clone(), gate)
            .with_checker(checker)
            .run()
            .await
            .unwrap();

        assert_eq!(artifacts.outcome(), RunOutcome::Aborted);
        assert!(artifacts.run.results().is_empty());
        assert_eq!(runner.calls_containing("run-a"), 0);
        assert!(!artifacts.run.prerequisites()[0].satisfied);
    }

    #[tokio::test]
    async fn test_missing_prerequisite_can_be_overridden() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(StubRunner::succeeding().on("terraform", Reply::fail(127, "")));
        let checker = PrerequisiteChecker::new(vec![Requirement::new(
            "terraform",
            CommandSpec::new("terraform").arg("-version"),
            "install terraform",
        )]);
        let artifacts = controller(
            dir.path(),
            vec![phase("a", 1, true)],
            runner.clone(),
            Arc::new(ScriptedGate::always(true)),
        )
        .with_checker(checker)
        .run()
        .await
        .unwrap();
        assert_eq!(artifacts.outcome(), RunOutcome::Success);
        assert_eq!(runner.calls_containing("run-a"), 1);
    }

    #[tokio::test]
    async fn test_malformed_phase_list_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(StubRunner::succeeding());
        let result = controller(
            dir.path(),
            vec![phase("a", 2, true), phase("a", 3, true)],
            runner.clone(),
            Arc::new(ScriptedGate::always(true)),
        )
        .run()
        .await;
        assert!(matches!(result, Err(PipelineError::InvalidPhaseDefinition { .. })));
        assert!(runner.calls().is_empty());
    }

    struct BrokenGate;

    #[async_trait::async_trait]
    impl ConfirmationGate for BrokenGate {
        async fn confirm(&self, _prompt: &str, _default: bool) -> anyhow::Result<bool> {
            anyhow::bail!("terminal went away")
        }

        fn mode(&self) -> &'static str {
            "interactive"
        }
    }

    #[tokio::test]
    async fn test_gate_failure_still_yields_an_auditable_run() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(StubRunner::succeeding());
        let ctl = controller(
            dir.path(),
            vec![phase("a", 1, true), phase("b", 2, false)],
            runner.clone(),
            Arc::new(BrokenGate),
        );
        let err = ctl.run().await.unwrap_err();
        assert!(matches!(err, PipelineError::Gate(_)));
        assert!(runner.calls().is_empty());

        let run = ctl.errored_run(&err);
        assert!(run.is_finished());
        assert_eq!(run.outcome(), Some(RunOutcome::Aborted));
        assert!(run.abort_reason().unwrap().contains("terminal went away"));
        assert_eq!(run.not_reached().len(), 2);
    }

    #[tokio::test]
    async fn test_harvesting_phase_exposes_outputs_to_later_phases() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(StubRunner::succeeding().on(
            "output -json",
            Reply::ok(r#"{"api_gateway_url": {"value": "https://api.example", "sensitive": false}}"#),
        ));
        let phases = vec![
            phase("infra", 1, true).harvests_outputs(),
            Phase::new("api", "API", 2, false).step(Step::command(
                "health check",
                CommandTemplate::new("curl").arg("${output.api_gateway_url}/health"),
            )),
        ];
        let artifacts = controller(dir.path(), phases, runner.clone(), Arc::new(ScriptedGate::always(true)))
            .run()
            .await
            .unwrap();

        assert_eq!(
            runner.calls(),
            vec![
                "run-infra",
                "terraform -chdir=terraform output -json",
                "curl https://api.example/health"
            ]
        );
        assert_eq!(
            artifacts.harvest.unwrap().lookup("api_gateway_url").unwrap(),
            "https://api.example"
        );
    }

    #[test]
    fn test_plan_renders_without_running() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(StubRunner::succeeding());
        let phases = vec![Phase::new("frontend", "Frontend", 1, false).step(Step::command(
            "sync",
            CommandTemplate::new("aws").args(["s3", "sync", "dist", "s3://${output.frontend_bucket}-${env}"]),
        ))];
        let plan = controller(dir.path(), phases, runner.clone(), Arc::new(ScriptedGate::always(true)))
            .plan()
            .unwrap();
        assert_eq!(plan[0].steps[0].0, "sync");
        assert!(plan[0].steps[0].1.contains("${output.frontend_bucket}"));
        assert!(runner.calls().is_empty());
    }
}
