//! Typed error hierarchy for the rollout orchestrator.
//!
//! One enum per seam:
//! - `RunnerError` — an external command could not be launched or waited on
//! - `TemplateError` — a step's argument template could not be rendered
//! - `DatabaseError` — the database client failed
//! - `StepError` — a single step failed (wraps the above, plus predicate failures)
//! - `PipelineError` — controller-level failures that end the process
//! - `HarvestError` — infrastructure outputs could not be read (never fatal)

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the command runner.
///
/// A nonzero exit status is *not* an error; only failure to launch or wait is.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Failed to launch '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' timed out after {seconds}s")]
    Timeout { program: String, seconds: u64 },

    #[error("I/O error while running '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl RunnerError {
    /// One-line hint for the operator, when the failure has a known fix.
    pub fn remediation(&self) -> Option<String> {
        match self {
            RunnerError::Launch { program, source } => match source.kind() {
                std::io::ErrorKind::NotFound => {
                    Some(format!("'{}' not found on PATH; install it or set its path in rollout.toml [tools]", program))
                }
                std::io::ErrorKind::PermissionDenied => {
                    Some(format!("'{}' is not executable by the current user", program))
                }
                _ => None,
            },
            RunnerError::Timeout { .. } => {
                Some("raise the step timeout or check the tool for a hung prompt".to_string())
            }
            RunnerError::Io { .. } => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Unresolved placeholder '${{{name}}}' in argument '{template}'")]
    Unresolved { name: String, template: String },
}

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Database connection failed: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("Statement {index} failed: {source}")]
    Statement {
        index: usize,
        #[source]
        source: sqlx::Error,
    },

    #[error("Query failed: {0}")]
    Query(#[source] sqlx::Error),

    #[error("Invalid identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid seed file {path}: {reason}")]
    InvalidSeed { path: PathBuf, reason: String },

    #[error("Database password is not configured")]
    MissingPassword,
}

#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("Failed to read secrets file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write secrets file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure of a single step. Every variant fails the enclosing phase.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Execution(#[from] RunnerError),

    #[error("'{command}' did not satisfy its success check: {reason}")]
    PredicateFailure {
        command: String,
        reason: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("HTTP check against {url} failed: {reason}")]
    Http { url: String, reason: String },

    #[error(transparent)]
    Secrets(#[from] SecretsError),
}

impl StepError {
    pub fn remediation(&self) -> Option<String> {
        match self {
            StepError::Execution(e) => e.remediation(),
            StepError::PredicateFailure { stderr, .. } => {
                if stderr.contains("ExpiredToken") || stderr.contains("Unable to locate credentials") {
                    Some("refresh cloud credentials (aws sso login / AWS_PROFILE)".to_string())
                } else {
                    None
                }
            }
            StepError::Template(TemplateError::Unresolved { name, .. }) if name.starts_with("output.") => {
                Some("run the infrastructure phase first so its outputs exist".to_string())
            }
            StepError::Template(_) => None,
            StepError::Database(DatabaseError::MissingPassword) => {
                Some("set MYSQL_PASSWORD in the environment or .env".to_string())
            }
            StepError::Database(DatabaseError::Connect(_)) => {
                Some("check MYSQL_HOST/MYSQL_PORT and that the database accepts connections".to_string())
            }
            StepError::Database(_) => None,
            StepError::Http { .. } => Some("confirm the API deployment finished and the stage is published".to_string()),
            StepError::Secrets(_) => Some("check permissions on the .rollout directory".to_string()),
        }
    }
}

/// Errors that terminate the orchestrator process.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid phase definition: {reason}")]
    InvalidPhaseDefinition { reason: String },

    #[error("Illegal transition for phase '{phase}': {from} -> {to}")]
    IllegalTransition {
        phase: String,
        from: String,
        to: String,
    },

    #[error("Confirmation gate failed: {0}")]
    Gate(#[source] anyhow::Error),

    #[error("Operator aborted the run at phase '{phase}'")]
    OperatorAbort { phase: String },
}

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Output command failed: {0}")]
    Command(String),

    #[error("Output was not valid JSON: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("Output JSON was not an object")]
    NotAnObject,
}
