//! Prerequisite checks.
//!
//! Before any phase runs, each required tool is invoked with a lightweight
//! version command and the cloud identity is resolved. Requirements are independent
//! and run concurrently; the checker never fails, it reports every check.

use crate::config::RunConfig;
use crate::runner::{CommandRunner, CommandSpec};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const CHECK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrerequisiteCheck {
    pub name: String,
    pub command: String,
    pub satisfied: bool,
    /// Version line, identity, or failure reason
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

/// One check: a command whose zero exit means "satisfied".
#[derive(Debug, Clone)]
pub struct Requirement {
    pub name: String,
    pub spec: CommandSpec,
    pub hint: String,
}

impl Requirement {
    pub fn new(name: &str, spec: CommandSpec, hint: &str) -> Self {
        Self {
            name: name.to_string(),
            spec,
            hint: hint.to_string(),
        }
    }
}

pub struct PrerequisiteChecker {
    requirements: Vec<Requirement>,
}

impl PrerequisiteChecker {
    pub fn new(requirements: Vec<Requirement>) -> Self {
        Self { requirements }
    }

    /// The requirements needed by the selected phases.
    pub fn for_phases(config: &RunConfig, phase_ids: &[&str]) -> Self {
        let uses = |ids: &[&str]| phase_ids.iter().any(|p| ids.contains(p));
        let tools = &config.tools;
        let mut requirements = Vec::new();

        let needs_cloud = uses(&["secrets", "infrastructure", "services", "api", "frontend"]);
        if needs_cloud {
            requirements.push(Requirement::new(
                "aws cli",
                CommandSpec::new(&tools.aws).arg("--version"),
                "install the AWS CLI v2 (https://aws.amazon.com/cli/)",
            ));
        }
        if uses(&["infrastructure", "services", "api", "frontend"]) {
            requirements.push(Requirement::new(
                "terraform",
                CommandSpec::new(&tools.terraform).arg("-version"),
                "install Terraform >= 1.5 (https://developer.hashicorp.com/terraform/install)",
            ));
        }
        if uses(&["services"]) {
            requirements.push(Requirement::new(
                "maven",
                CommandSpec::new(&tools.maven).arg("--version"),
                "install Maven 3 and a JDK 17+",
            ));
        }
        if uses(&["database", "services"]) {
            requirements.push(Requirement::new(
                "python",
                CommandSpec::new(&tools.python).arg("--version"),
                "install Python 3.10+",
            ));
        }
        if uses(&["frontend"]) {
            requirements.push(Requirement::new(
                "npm",
                CommandSpec::new(&tools.npm).arg("--version"),
                "install Node.js 18+ (ships with npm)",
            ));
        }
        if needs_cloud {
            requirements.push(Requirement::new(
                "aws credentials",
                CommandSpec::new(&tools.aws).args(["sts", "get-caller-identity", "--output", "json"]),
                "configure credentials: aws configure, aws sso login, or set AWS_PROFILE",
            ));
        }
        Self { requirements }
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    /// Run every requirement concurrently; results come back in requirement order.
    pub async fn check_all(&self, runner: &dyn CommandRunner) -> Vec<PrerequisiteCheck> {
        let checks = join_all(self.requirements.iter().map(|p| check_one(runner, p))).await;
        for check in &checks {
            tracing::info!(
                check = %check.name,
                satisfied = check.satisfied,
                detail = %check.detail,
                "prerequisite checked"
            );
        }
        checks
    }
}

async fn check_one(runner: &dyn CommandRunner, requirement: &Requirement) -> PrerequisiteCheck {
    let command = requirement.spec.display();
    match runner.run(&requirement.spec, Some(CHECK_TIMEOUT)).await {
        Ok(out) if out.success() => PrerequisiteCheck {
            name: requirement.name.clone(),
            command,
            satisfied: true,
            detail: describe_success(&out.stdout, &out.stderr),
            remediation: None,
        },
        Ok(out) => PrerequisiteCheck {
            name: requirement.name.clone(),
            command,
            satisfied: false,
            detail: format!(
                "exit code {}: {}",
                out.exit_code.map_or("none".to_string(), |c| c.to_string()),
                first_line(&out.stderr).unwrap_or("no error output")
            ),
            remediation: Some(requirement.hint.clone()),
        },
        Err(e) => PrerequisiteCheck {
            name: requirement.name.clone(),
            command,
            satisfied: false,
            detail: e.to_string(),
            remediation: e.remediation().or_else(|| Some(requirement.hint.clone())),
        },
    }
}

fn first_line(s: &str) -> Option<&str> {
    s.lines().map(str::trim).find(|l| !l.is_empty())
}

/// Identity JSON becomes "account 123 as arn:..."; anything else is its first line.
fn describe_success(stdout: &str, stderr: &str) -> String {
    if let Ok(identity) = serde_json::from_str::<serde_json::Value>(stdout)
        && let (Some(account), Some(arn)) = (
            identity.get("Account").and_then(|v| v.as_str()),
            identity.get("Arn").and_then(|v| v.as_str()),
        )
    {
        return format!("account {} as {}", account, arn);
    }
    first_line(stdout)
        .or_else(|| first_line(stderr))
        .unwrap_or("ok")
        .to_string()
}

pub fn all_satisfied(checks: &[PrerequisiteCheck]) -> bool {
    checks.iter().all(|c| c.satisfied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CliOverrides;
    use crate::rollout_config::RolloutToml;
    use crate::runner::stub::{Reply, StubRunner};
    use std::path::PathBuf;

    fn config() -> RunConfig {
        RunConfig::from_layers(
            PathBuf::from("/srv/shop"),
            RolloutToml::default(),
            &|_: &str| None,
            CliOverrides::default(),
        )
        .unwrap()
    }

    fn names(checker: &PrerequisiteChecker) -> Vec<&str> {
        checker.requirements().iter().map(|p| p.name.as_str()).collect()
    }

    #[test]
    fn test_requirements_follow_selected_phases() {
        let c = config();
        let all = PrerequisiteChecker::for_phases(
            &c,
            &["database", "secrets", "infrastructure", "services", "api", "frontend"],
        );
        assert_eq!(
            names(&all),
            vec!["aws cli", "terraform", "maven", "python", "npm", "aws credentials"]
        );

        let db_only = PrerequisiteChecker::for_phases(&c, &["database"]);
        assert_eq!(names(&db_only), vec!["python"]);
    }

    #[tokio::test]
    async fn test_check_all_reports_every_check_in_order() {
        let runner = StubRunner::succeeding()
            .on("terraform", Reply::NotFound)
            .on("sts", Reply::ok(r#"{"Account": "123456789012", "Arn": "arn:aws:iam::123456789012:user/deploy"}"#))
            .on("aws --version", Reply::ok("aws-cli/2.15.0 Python/3.11"));
        let checker = PrerequisiteChecker::for_phases(&config(), &["infrastructure"]);
        let checks = checker.check_all(&runner).await;

        assert_eq!(checks.len(), 3);
        assert_eq!(checks[0].name, "aws cli");
        assert!(checks[0].satisfied);
        assert_eq!(checks[0].detail, "aws-cli/2.15.0 Python/3.11");

        assert_eq!(checks[1].name, "terraform");
        assert!(!checks[1].satisfied);
        assert!(checks[1].remediation.as_ref().unwrap().contains("not found"));

        assert!(checks[2].satisfied);
        assert!(checks[2].detail.starts_with("account 123456789012"));
        assert!(!all_satisfied(&checks));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_unsatisfied_with_hint() {
        let runner = StubRunner::succeeding().on(
            "sts",
            Reply::fail(255, "Unable to locate credentials. You can configure credentials by running \"aws configure\"."),
        );
        let checker = PrerequisiteChecker::for_phases(&config(), &["secrets"]);
        let checks = checker.check_all(&runner).await;
        let creds = checks.iter().find(|c| c.name == "aws credentials").unwrap();
        assert!(!creds.satisfied);
        assert!(creds.detail.starts_with("exit code 255: Unable to locate credentials"));
        assert!(creds.remediation.as_ref().unwrap().contains("aws sso login"));
    }

    #[tokio::test]
    async fn test_empty_checker_is_satisfied() {
        let checks = PrerequisiteChecker::new(Vec::new())
            .check_all(&StubRunner::succeeding())
            .await;
        assert!(checks.is_empty());
        assert!(all_satisfied(&checks));
    }
}
