use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::rollout_config::{
    CostItem, DatabaseSection, FrontendSection, InfrastructureSection, RolloutToml, SecretsSection,
    ServiceConfig, ToolsSection,
};
use crate::runner::Vars;

/// Directory under the project root holding config, logs, secrets and archives.
pub const STATE_DIR: &str = ".rollout";

/// Fixed location of the latest report, relative to the project root.
pub const REPORT_FILE: &str = "DEPLOYMENT_REPORT.md";

/// Flags that come from the command line.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub yes: bool,
    pub verbose: bool,
    pub only: Vec<String>,
    pub from: Option<String>,
}

/// Which catalog phases take part in the run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseSelection {
    pub only: Vec<String>,
    pub from: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Only the database phase needs it; a missing value fails that phase.
    pub password: Option<String>,
    pub name: String,
}

impl DatabaseSettings {
    fn from_env(env: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let port = match env("MYSQL_PORT") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("MYSQL_PORT must be a port number, got '{}'", raw))?,
            None => 3306,
        };
        Ok(Self {
            host: env("MYSQL_HOST").unwrap_or_else(|| "localhost".to_string()),
            port,
            user: env("MYSQL_USER").unwrap_or_else(|| "root".to_string()),
            password: env("MYSQL_PASSWORD").filter(|p| !p.is_empty()),
            name: env("MYSQL_DATABASE").unwrap_or_else(|| "ecommerce".to_string()),
        })
    }
}

/// Immutable configuration for one run.
///
/// Built once from rollout.toml, the environment, and CLI flags, then passed by
/// reference to the catalog, controller, checker and report assembler.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub project_name: String,
    pub environment: String,
    pub region: String,
    pub aws_profile: Option<String>,
    pub aws_account_id: Option<String>,
    pub database: DatabaseSettings,
    pub target_size_mb: i64,
    pub tools: ToolsSection,
    pub database_files: DatabaseSection,
    pub secrets: SecretsSection,
    pub infrastructure: InfrastructureSection,
    pub services: Vec<ServiceConfig>,
    pub frontend: FrontendSection,
    pub cost_items: Vec<CostItem>,
    pub step_timeout: Option<Duration>,
    pub auto_approve: bool,
    pub verbose: bool,
    pub selection: PhaseSelection,
    file_warnings: Vec<String>,
}

impl RunConfig {
    /// Resolve the configuration for `project_dir` from every layer.
    ///
    /// A `.env` file in the project directory is loaded into the process
    /// environment first; variables already set win over it.
    pub fn load(project_dir: &Path, cli: CliOverrides) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let dotenv = project_dir.join(".env");
        if dotenv.exists() {
            dotenvy::from_path(&dotenv)
                .with_context(|| format!("Failed to load {}", dotenv.display()))?;
        }
        let state_dir = project_dir.join(STATE_DIR);
        let toml = RolloutToml::load_or_default(&state_dir)?;
        Self::from_layers(project_dir, toml, &|key| std::env::var(key).ok(), cli)
    }

    /// Merge the layers without touching process state.
    pub fn from_layers(
        project_dir: PathBuf,
        toml: RolloutToml,
        env: &dyn Fn(&str) -> Option<String>,
        cli: CliOverrides,
    ) -> Result<Self> {
        let state_dir = project_dir.join(STATE_DIR);
        let environment = env("ROLLOUT_ENV")
            .or_else(|| toml.project.environment.clone())
            .unwrap_or_else(|| "dev".to_string());
        let region = env("AWS_REGION")
            .or_else(|| env("AWS_DEFAULT_REGION"))
            .or_else(|| toml.project.region.clone())
            .unwrap_or_else(|| "us-east-1".to_string());
        let target_size_mb = match env("TARGET_SIZE_MB") {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("TARGET_SIZE_MB must be an integer, got '{}'", raw))?,
            None => 500,
        };

        let file_warnings = toml.validate();
        Ok(Self {
            state_dir,
            project_name: toml
                .project
                .name
                .clone()
                .unwrap_or_else(|| "ecommerce".to_string()),
            environment,
            region,
            aws_profile: env("AWS_PROFILE").filter(|p| !p.is_empty()),
            aws_account_id: env("AWS_ACCOUNT_ID").filter(|a| !a.is_empty()),
            database: DatabaseSettings::from_env(env)?,
            target_size_mb,
            services: toml.services(),
            cost_items: toml.cost_items(),
            step_timeout: toml.project.step_timeout_secs.map(Duration::from_secs),
            tools: toml.tools,
            database_files: toml.database,
            secrets: toml.secrets,
            infrastructure: toml.infrastructure,
            frontend: toml.frontend,
            auto_approve: cli.yes,
            verbose: cli.verbose,
            selection: PhaseSelection {
                only: cli.only,
                from: cli.from,
            },
            project_dir,
            file_warnings,
        })
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.state_dir.clone()
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.state_dir.join("reports")
    }

    pub fn secrets_file(&self) -> PathBuf {
        self.state_dir.join("secrets.env")
    }

    pub fn report_path(&self) -> PathBuf {
        self.project_dir.join(REPORT_FILE)
    }

    pub fn infrastructure_dir(&self) -> PathBuf {
        self.project_dir.join(&self.infrastructure.dir)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(self.log_dir()).context("Failed to create log directory")?;
        std::fs::create_dir_all(self.state_dir.join("runs"))
            .context("Failed to create runs directory")?;
        std::fs::create_dir_all(self.reports_dir()).context("Failed to create reports directory")?;
        Ok(())
    }

    /// Environment applied to every child process.
    pub fn child_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("AWS_REGION".to_string(), self.region.clone()),
            ("AWS_DEFAULT_REGION".to_string(), self.region.clone()),
        ];
        if let Some(profile) = &self.aws_profile {
            env.push(("AWS_PROFILE".to_string(), profile.clone()));
        }
        env
    }

    /// Base template variables: environment, region, project, tool paths and
    /// the non-secret database settings.
    pub fn base_vars(&self) -> Vars {
        let mut vars = Vars::new();
        vars.insert("env".into(), self.environment.clone());
        vars.insert("region".into(), self.region.clone());
        vars.insert("project".into(), self.project_name.clone());
        vars.insert("target_size_mb".into(), self.target_size_mb.to_string());
        vars.insert("db.host".into(), self.database.host.clone());
        vars.insert("db.port".into(), self.database.port.to_string());
        vars.insert("db.user".into(), self.database.user.clone());
        vars.insert("db.name".into(), self.database.name.clone());
        vars.insert("tool.aws".into(), self.tools.aws.clone());
        vars.insert("tool.terraform".into(), self.tools.terraform.clone());
        vars.insert("tool.maven".into(), self.tools.maven.clone());
        vars.insert("tool.python".into(), self.tools.python.clone());
        vars.insert("tool.npm".into(), self.tools.npm.clone());
        if let Some(account) = &self.aws_account_id {
            vars.insert("account_id".into(), account.clone());
        }
        if let Some(password) = &self.database.password {
            vars.insert("secret.db_password".into(), password.clone());
        }
        vars
    }

    /// Configuration warnings. `known_phases` is the catalog's id list and
    /// `selected` the ids that will actually run; database settings are only
    /// checked when the database phase is selected.
    pub fn validate(&self, known_phases: &[&str], selected: &[&str]) -> Vec<String> {
        let mut warnings = self.file_warnings.clone();
        for id in self.selection.only.iter().chain(self.selection.from.iter()) {
            if !known_phases.contains(&id.as_str()) {
                warnings.push(format!("Unknown phase '{}' in selection", id));
            }
        }
        if selected.contains(&"database") {
            if self.target_size_mb <= 0 {
                warnings.push(format!(
                    "TARGET_SIZE_MB is {}; the seed generator expects a positive size",
                    self.target_size_mb
                ));
            }
            if self.database.password.is_none() {
                warnings.push("MYSQL_PASSWORD is not set; the database phase will fail".to_string());
            }
        }
        warnings
    }

    /// A snapshot for the audit log, without secret values.
    pub fn summary(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("environment".to_string(), self.environment.clone());
        map.insert("region".to_string(), self.region.clone());
        map.insert("project".to_string(), self.project_name.clone());
        map.insert("auto_approve".to_string(), self.auto_approve.to_string());
        if let Some(profile) = &self.aws_profile {
            map.insert("aws_profile".to_string(), profile.clone());
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn config(pairs: &[(&str, &str)], cli: CliOverrides) -> RunConfig {
        RunConfig::from_layers(
            PathBuf::from("/srv/shop"),
            RolloutToml::default(),
            &env_from(pairs),
            cli,
        )
        .unwrap()
    }

    #[test]
    fn test_defaults_without_environment() {
        let c = config(&[], CliOverrides::default());
        assert_eq!(c.environment, "dev");
        assert_eq!(c.region, "us-east-1");
        assert_eq!(c.database.host, "localhost");
        assert_eq!(c.database.port, 3306);
        assert_eq!(c.database.user, "root");
        assert_eq!(c.database.name, "ecommerce");
        assert_eq!(c.database.password, None);
        assert_eq!(c.target_size_mb, 500);
        assert!(!c.auto_approve);
        assert_eq!(c.selection, PhaseSelection::default());
    }

    #[test]
    fn test_environment_overrides_file() {
        let mut toml = RolloutToml::default();
        toml.project.environment = Some("qa".into());
        toml.project.region = Some("eu-west-1".into());
        let c = RunConfig::from_layers(
            PathBuf::from("/srv/shop"),
            toml,
            &env_from(&[("ROLLOUT_ENV", "prod"), ("AWS_DEFAULT_REGION", "us-west-2")]),
            CliOverrides::default(),
        )
        .unwrap();
        assert_eq!(c.environment, "prod");
        assert_eq!(c.region, "us-west-2");
    }

    #[test]
    fn test_aws_region_wins_over_default_region() {
        let c = config(
            &[("AWS_REGION", "ap-south-1"), ("AWS_DEFAULT_REGION", "us-west-2")],
            CliOverrides::default(),
        );
        assert_eq!(c.region, "ap-south-1");
    }

    #[test]
    fn test_bad_numbers_are_errors() {
        let result = RunConfig::from_layers(
            PathBuf::from("/srv/shop"),
            RolloutToml::default(),
            &env_from(&[("MYSQL_PORT", "not-a-port")]),
            CliOverrides::default(),
        );
        assert!(result.unwrap_err().to_string().contains("MYSQL_PORT"));

        let result = RunConfig::from_layers(
            PathBuf::from("/srv/shop"),
            RolloutToml::default(),
            &env_from(&[("TARGET_SIZE_MB", "big")]),
            CliOverrides::default(),
        );
        assert!(result.unwrap_err().to_string().contains("TARGET_SIZE_MB"));
    }

    #[test]
    fn test_cli_flags_are_carried() {
        let c = config(
            &[],
            CliOverrides {
                yes: true,
                only: vec!["secrets".into()],
                ..Default::default()
            },
        );
        assert!(c.auto_approve);
        assert_eq!(c.selection.only, vec!["secrets"]);
    }

    #[test]
    fn test_base_vars_hold_password_only_as_secret() {
        let c = config(
            &[("MYSQL_PASSWORD", "hunter2"), ("ROLLOUT_ENV", "staging")],
            CliOverrides::default(),
        );
        let vars = c.base_vars();
        assert_eq!(vars["env"], "staging");
        assert_eq!(vars["secret.db_password"], "hunter2");
        assert!(!vars.contains_key("db.password"));
        assert_eq!(vars["tool.terraform"], "terraform");
    }

    #[test]
    fn test_validate_flags_unknown_phases_and_sizes() {
        let c = config(
            &[("TARGET_SIZE_MB", "0"), ("MYSQL_PASSWORD", "x")],
            CliOverrides {
                only: vec!["database".into(), "moon".into()],
                ..Default::default()
            },
        );
        let warnings = c.validate(&["database", "secrets"], &["database"]);
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().any(|w| w.contains("moon")));
        assert!(warnings.iter().any(|w| w.contains("TARGET_SIZE_MB")));
    }

    #[test]
    fn test_database_warnings_only_when_database_runs() {
        let c = config(&[("TARGET_SIZE_MB", "0")], CliOverrides::default());
        let warnings = c.validate(&["database", "frontend"], &["frontend"]);
        assert!(warnings.is_empty(), "{warnings:?}");

        let warnings = c.validate(&["database", "frontend"], &["database", "frontend"]);
        assert!(warnings.iter().any(|w| w.contains("MYSQL_PASSWORD")));
        assert!(warnings.iter().any(|w| w.contains("TARGET_SIZE_MB")));
    }

    #[test]
    fn test_paths_live_under_state_dir() {
        let c = config(&[], CliOverrides::default());
        assert_eq!(c.secrets_file(), PathBuf::from("/srv/shop/.rollout/secrets.env"));
        assert_eq!(c.report_path(), PathBuf::from("/srv/shop/DEPLOYMENT_REPORT.md"));
        assert_eq!(c.infrastructure_dir(), PathBuf::from("/srv/shop/terraform"));
    }

    #[test]
    fn test_child_env_passes_profile() {
        let c = config(&[("AWS_PROFILE", "deploy")], CliOverrides::default());
        let env = c.child_env();
        assert!(env.contains(&("AWS_PROFILE".to_string(), "deploy".to_string())));
        assert!(env.iter().any(|(k, _)| k == "AWS_REGION"));
    }

    #[test]
    fn test_load_reads_toml_from_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(STATE_DIR)).unwrap();
        std::fs::write(
            dir.path().join(STATE_DIR).join("rollout.toml"),
            "[tools]\nnpm = \"pnpm\"\n",
        )
        .unwrap();
        let c = RunConfig::load(dir.path(), CliOverrides::default()).unwrap();
        assert_eq!(c.tools.npm, "pnpm");
        config_dirs_can_be_created(&c);
    }

    fn config_dirs_can_be_created(c: &RunConfig) {
        c.ensure_directories().unwrap();
        assert!(c.log_dir().exists());
        assert!(c.state_dir.join("runs").exists());
        assert!(c.reports_dir().exists());
    }
}
