//! Runs the steps of one phase.
//!
//! Steps execute strictly in order. A failing step stops the phase unless it
//! is best-effort; when the phase fails, rollbacks of the steps that ran are
//! executed in reverse order. Nothing here decides what the run does next:
//! that is the controller's policy.

use crate::database::{self, DatabaseClient};
use crate::errors::StepError;
use crate::orchestrator::context::RunContext;
use crate::phase::{HttpCheck, Phase, Step, StepAction, StepRecord};
use crate::report::harvest::Harvester;
use crate::runner::{CommandRunner, CommandTemplate, render_str};
use crate::secrets::SecretVault;
use crate::ui::DeployUI;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// What running a phase's steps produced.
#[derive(Debug, Default)]
pub struct PhaseExecution {
    pub steps: Vec<StepRecord>,
    pub rollbacks: Vec<StepRecord>,
    pub elapsed_ms: u64,
    /// First non-tolerated failure, if any
    pub error: Option<String>,
}

pub struct StepExecutor {
    runner: Arc<dyn CommandRunner>,
    database: Arc<dyn DatabaseClient>,
    http: reqwest::Client,
    vault: SecretVault,
    harvester: Harvester,
    project_dir: PathBuf,
    default_timeout: Option<Duration>,
}

impl StepExecutor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        database: Arc<dyn DatabaseClient>,
        vault: SecretVault,
        harvester: Harvester,
        project_dir: PathBuf,
    ) -> Self {
        Self {
            runner,
            database,
            http: reqwest::Client::new(),
            vault,
            harvester,
            project_dir,
            default_timeout: None,
        }
    }

    /// Timeout for command steps that don't set their own.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    /// Pull infrastructure outputs into the context.
    pub async fn harvest(&self, ctx: &mut RunContext) {
        let harvest = self.harvester.harvest(self.runner.as_ref()).await;
        ctx.apply_harvest(harvest);
    }

    pub async fn run_phase(
        &self,
        phase: &Phase,
        ctx: &mut RunContext,
        ui: Option<&DeployUI>,
    ) -> PhaseExecution {
        let start = Instant::now();
        let mut execution = PhaseExecution::default();
        let mut ran: Vec<&Step> = Vec::new();

        for step in &phase.steps {
            if let Some(ui) = ui {
                ui.start_step(&step.label, &self.describe(step, ctx));
            }
            ran.push(step);
            let record = self.run_step(step, ctx).await;

            if record.succeeded {
                if let Some(ui) = ui {
                    ui.step_succeeded(&record);
                }
                execution.steps.push(record);
                continue;
            }

            let mut record = record;
            if step.continue_on_failure {
                record.tolerated = true;
                tracing::warn!(phase = %phase.id, step = %step.label, error = ?record.error, "best-effort step failed");
                if let Some(ui) = ui {
                    ui.step_failed(&record);
                }
                execution.steps.push(record);
                continue;
            }

            tracing::error!(phase = %phase.id, step = %step.label, error = ?record.error, "step failed");
            if let Some(ui) = ui {
                ui.step_failed(&record);
            }
            execution.error = Some(format!(
                "step '{}' failed: {}",
                step.label,
                record.error.as_deref().unwrap_or("unknown error")
            ));
            execution.steps.push(record);
            break;
        }

        if execution.error.is_some() {
            execution.rollbacks = self.roll_back(&ran, ctx, ui).await;
        }
        execution.elapsed_ms = start.elapsed().as_millis() as u64;
        execution
    }

    /// Rollback actions of `ran`, newest first. Failures are recorded only.
    async fn roll_back(
        &self,
        ran: &[&Step],
        ctx: &mut RunContext,
        ui: Option<&DeployUI>,
    ) -> Vec<StepRecord> {
        let mut records = Vec::new();
        for step in ran.iter().rev() {
            let Some(template) = &step.rollback else {
                continue;
            };
            let label = format!("undo {}", step.label);
            let timeout = step.timeout.or(self.default_timeout);
            let record = self.run_command(&label, template, timeout, None, ctx).await;
            tracing::info!(step = %step.label, succeeded = record.succeeded, "rollback executed");
            if let Some(ui) = ui {
                ui.rollback_step(&record);
            }
            records.push(record);
        }
        records
    }

    /// Human-readable form of what a step will do, secrets masked.
    pub fn describe(&self, step: &Step, ctx: &RunContext) -> String {
        match &step.action {
            StepAction::Command(template) => match template.render(ctx.vars()) {
                Ok(spec) => spec.display(),
                // Render what resolves; unresolved arguments stay as written.
                Err(_) => std::iter::once(&template.program)
                    .chain(template.args.iter())
                    .map(|part| match render_str(part, ctx.vars()) {
                        Ok((_, true)) => "****".to_string(),
                        Ok((value, false)) => value,
                        Err(_) => part.clone(),
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
            },
            StepAction::Database(task) => task.describe(),
            StepAction::Http(check) => {
                let url = render_str(&check.url, ctx.vars())
                    .map(|(u, _)| u)
                    .unwrap_or_else(|_| check.url.clone());
                format!("GET {} (expect {})", url, check.expect_status)
            }
            StepAction::Secrets(task) => task.describe(),
        }
    }

    async fn run_step(&self, step: &Step, ctx: &mut RunContext) -> StepRecord {
        match &step.action {
            StepAction::Command(template) => {
                let timeout = step.timeout.or(self.default_timeout);
                self.run_command(&step.label, template, timeout, Some(step), ctx)
                    .await
            }
            StepAction::Database(task) => {
                let start = Instant::now();
                let result =
                    database::run_task(self.database.as_ref(), task, &self.project_dir).await;
                let elapsed = start.elapsed().as_millis() as u64;
                match result {
                    Ok(summary) => StepRecord::message(&step.label, task.describe(), summary, elapsed),
                    Err(e) => fail(
                        StepRecord::message(&step.label, task.describe(), String::new(), elapsed),
                        StepError::from(e),
                    ),
                }
            }
            StepAction::Http(check) => {
                let timeout = step.timeout.or(self.default_timeout);
                self.run_http(&step.label, check, timeout, ctx).await
            }
            StepAction::Secrets(task) => {
                let start = Instant::now();
                let result = self.vault.ensure(&task.names);
                let elapsed = start.elapsed().as_millis() as u64;
                match result {
                    Ok(ensured) => {
                        ctx.insert_secrets(&ensured.values);
                        StepRecord::message(&step.label, task.describe(), ensured.summary(), elapsed)
                    }
                    Err(e) => fail(
                        StepRecord::message(&step.label, task.describe(), String::new(), elapsed),
                        StepError::from(e),
                    ),
                }
            }
        }
    }

    /// Render, run, and judge one command. `step` carries the predicate; a
    /// rollback passes `None` and is judged by exit status alone.
    async fn run_command(
        &self,
        label: &str,
        template: &CommandTemplate,
        timeout: Option<Duration>,
        step: Option<&Step>,
        ctx: &mut RunContext,
    ) -> StepRecord {
        if template.references_outputs() && !ctx.has_harvested() {
            tracing::info!(step = %label, "step needs infrastructure outputs; harvesting first");
            self.harvest(ctx).await;
        }

        let mut spec = match template.render(ctx.vars()) {
            Ok(spec) => spec,
            Err(e) => {
                let shown = std::iter::once(template.program.clone())
                    .chain(template.args.iter().cloned())
                    .collect::<Vec<_>>()
                    .join(" ");
                return fail(StepRecord::message(label, shown, String::new(), 0), e.into());
            }
        };
        if let Some(cwd) = spec.cwd.take() {
            spec.cwd = Some(self.project_dir.join(cwd));
        } else {
            spec.cwd = Some(self.project_dir.clone());
        }
        let shown = spec.display();

        let out = match self.runner.run(&spec, timeout).await {
            Ok(out) => out,
            Err(e) => {
                return fail(StepRecord::message(label, shown, String::new(), 0), e.into());
            }
        };

        let record = StepRecord::from_output(label, shown.clone(), &out);
        let verdict = match step {
            Some(step) => step.predicate.check(&out),
            None if out.success() => Ok(()),
            None => Err(format!("exit code {:?}", out.exit_code)),
        };
        match verdict {
            Ok(()) => record,
            Err(reason) => fail(
                record,
                StepError::PredicateFailure {
                    command: shown,
                    reason,
                    exit_code: out.exit_code,
                    stdout: out.stdout.clone(),
                    stderr: out.stderr.clone(),
                },
            ),
        }
    }

    async fn run_http(
        &self,
        label: &str,
        check: &HttpCheck,
        timeout: Option<Duration>,
        ctx: &mut RunContext,
    ) -> StepRecord {
        if check.url.contains("${output.") && !ctx.has_harvested() {
            self.harvest(ctx).await;
        }
        let shown = format!("GET {}", check.url);
        let url = match render_str(&check.url, ctx.vars()) {
            Ok((url, _)) => url,
            Err(e) => return fail(StepRecord::message(label, shown, String::new(), 0), e.into()),
        };
        let shown = format!("GET {}", url);

        let start = Instant::now();
        let result = self
            .http
            .get(&url)
            .timeout(timeout.unwrap_or(DEFAULT_HTTP_TIMEOUT))
            .send()
            .await;
        let elapsed = start.elapsed().as_millis() as u64;

        match result {
            Ok(response) => {
                let status = response.status().as_u16();
                let body = match response.text().await {
                    Ok(body) => body,
                    Err(e) => {
                        return fail(
                            StepRecord::message(label, shown, String::new(), elapsed),
                            StepError::Http {
                                url,
                                reason: format!("status {}, failed to read body: {}", status, e),
                            },
                        );
                    }
                };
                let record = StepRecord::message(label, shown, body, elapsed);
                if status == check.expect_status {
                    record
                } else {
                    fail(
                        record,
                        StepError::Http {
                            url,
                            reason: format!("status {} (expected {})", status, check.expect_status),
                        },
                    )
                }
            }
            Err(e) => fail(
                StepRecord::message(label, shown, String::new(), elapsed),
                StepError::Http {
                    url,
                    reason: e.to_string(),
                },
            ),
        }
    }
}

fn fail(record: StepRecord, error: StepError) -> StepRecord {
    let remediation = error.remediation();
    record.failed(error.to_string(), remediation)
}
