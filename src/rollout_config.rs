//! File layer of the configuration, read from `.rollout/rollout.toml`.
//!
//! Every section is optional and falls back to defaults that match the
//! reference project layout. Environment variables and CLI flags are layered
//! on top of this by [`crate::config::RunConfig`].
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! name = "ecommerce"
//! environment = "staging"
//! region = "us-east-2"
//!
//! [tools]
//! aws = "aws"
//! terraform = "terraform"
//! maven = "mvn"
//! python = "python3"
//! npm = "npm"
//!
//! [database]
//! schema_file = "database/schema.sql"
//! generator = ["${tool.python}", "database/data_generator/generate_sample_data.py"]
//! verify_tables = ["users", "products", "orders"]
//!
//! [[database.seed_files]]
//! table = "products"
//! path = "database/seed/products.json"
//!
//! [infrastructure]
//! dir = "terraform"
//! expected_outputs = ["api_gateway_url", "frontend_bucket"]
//!
//! [[services]]
//! name = "auth-service"
//! dir = "auth-service"
//! build = ["${tool.maven}", "-q", "clean", "package", "-DskipTests"]
//! artifact = "target/auth-service.jar"
//! function = "${project}-${env}-auth"
//!
//! [frontend]
//! dir = "frontend"
//!
//! [[cost]]
//! item = "RDS db.t3.micro"
//! monthly_usd = 15.0
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// File name inside the state directory.
pub const CONFIG_FILE: &str = "rollout.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectSection {
    /// Project name used to namespace resources (default "ecommerce")
    #[serde(default)]
    pub name: Option<String>,
    /// Target environment; `ROLLOUT_ENV` overrides it
    #[serde(default)]
    pub environment: Option<String>,
    /// Cloud region; `AWS_REGION` overrides it
    #[serde(default)]
    pub region: Option<String>,
    /// Per-step timeout applied to every command step, in seconds
    #[serde(default)]
    pub step_timeout_secs: Option<u64>,
}

/// External tool binaries. Override to pin versions or substitute stubs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsSection {
    #[serde(default = "default_aws")]
    pub aws: String,
    #[serde(default = "default_terraform")]
    pub terraform: String,
    #[serde(default = "default_maven")]
    pub maven: String,
    #[serde(default = "default_python")]
    pub python: String,
    #[serde(default = "default_npm")]
    pub npm: String,
}

fn default_aws() -> String {
    "aws".to_string()
}

fn default_terraform() -> String {
    "terraform".to_string()
}

fn default_maven() -> String {
    "mvn".to_string()
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_npm() -> String {
    "npm".to_string()
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            aws: default_aws(),
            terraform: default_terraform(),
            maven: default_maven(),
            python: default_python(),
            npm: default_npm(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedFileConfig {
    pub table: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_schema_file")]
    pub schema_file: String,
    /// Seed-data generator command; empty disables the step
    #[serde(default = "default_generator")]
    pub generator: Vec<String>,
    #[serde(default)]
    pub seed_files: Vec<SeedFileConfig>,
    #[serde(default = "default_verify_tables")]
    pub verify_tables: Vec<String>,
}

fn default_schema_file() -> String {
    "database/schema.sql".to_string()
}

fn default_generator() -> Vec<String> {
    vec![
        "${tool.python}".to_string(),
        "database/data_generator/generate_sample_data.py".to_string(),
    ]
}

fn default_verify_tables() -> Vec<String> {
    ["users", "products", "orders", "order_items"]
        .iter()
        .map(|t| t.to_string())
        .collect()
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            schema_file: default_schema_file(),
            generator: default_generator(),
            seed_files: Vec::new(),
            verify_tables: default_verify_tables(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsSection {
    /// Locally generated secrets, exposed as `${secret.<name>}`
    #[serde(default = "default_generated")]
    pub generated: Vec<String>,
    /// Secrets Manager id the JWT secret is stored under
    #[serde(default = "default_secret_id")]
    pub secret_id: String,
}

fn default_generated() -> Vec<String> {
    vec!["jwt_secret".to_string()]
}

fn default_secret_id() -> String {
    "${project}-jwt-secret-${env}".to_string()
}

impl Default for SecretsSection {
    fn default() -> Self {
        Self {
            generated: default_generated(),
            secret_id: default_secret_id(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfrastructureSection {
    #[serde(default = "default_infra_dir")]
    pub dir: String,
    /// Output keys the report lists even when missing
    #[serde(default = "default_expected_outputs")]
    pub expected_outputs: Vec<String>,
}

fn default_infra_dir() -> String {
    "terraform".to_string()
}

fn default_expected_outputs() -> Vec<String> {
    [
        "api_gateway_url",
        "frontend_bucket",
        "cloudfront_distribution_id",
        "cloudfront_url",
        "rds_endpoint",
    ]
    .iter()
    .map(|k| k.to_string())
    .collect()
}

impl Default for InfrastructureSection {
    fn default() -> Self {
        Self {
            dir: default_infra_dir(),
            expected_outputs: default_expected_outputs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub dir: String,
    /// Build-and-package command, first element is the program
    pub build: Vec<String>,
    /// Artifact path relative to `dir`
    pub artifact: String,
    /// Lambda function to update; omitted means build only
    #[serde(default)]
    pub function: Option<String>,
}

/// A Python function zipped with the standard library's `zipfile` CLI.
fn python_function(name: &str, dir: &str, sources: &[&str]) -> ServiceConfig {
    let archive = format!("{}.zip", name);
    let mut build = vec![
        "${tool.python}".to_string(),
        "-m".to_string(),
        "zipfile".to_string(),
        "-c".to_string(),
        archive.clone(),
    ];
    build.extend(sources.iter().map(|s| s.to_string()));
    ServiceConfig {
        name: name.to_string(),
        dir: dir.to_string(),
        build,
        artifact: archive,
        function: Some(format!("${{project}}-${{env}}-{}", name)),
    }
}

/// AI handlers shipped under `ai-systems/<name>/src`.
pub const AI_SYSTEMS: [&str; 5] = [
    "global-market-pulse",
    "demand-insights-engine",
    "market-intelligence-hub",
    "retail-copilot",
    "compliance-guardian",
];

pub fn default_services() -> Vec<ServiceConfig> {
    let mut services = vec![
        ServiceConfig {
            name: "auth-service".to_string(),
            dir: "auth-service".to_string(),
            build: vec![
                "${tool.maven}".to_string(),
                "-q".to_string(),
                "clean".to_string(),
                "package".to_string(),
                "-DskipTests".to_string(),
            ],
            artifact: "target/auth-service.jar".to_string(),
            function: Some("${project}-${env}-auth".to_string()),
        },
        ServiceConfig {
            function: Some("${project}-${env}-analytics".to_string()),
            ..python_function("analytics-service", "analytics-service", &["src"])
        },
        python_function(
            "raw-to-curated",
            "lambda-functions/raw-to-curated",
            &["lambda_function.py"],
        ),
        python_function(
            "curated-to-prod",
            "lambda-functions/curated-to-prod",
            &["lambda_function.py"],
        ),
        python_function("data-processing", "data-processing", &["src"]),
    ];
    services.extend(
        AI_SYSTEMS
            .iter()
            .map(|name| python_function(name, &format!("ai-systems/{}", name), &["src"])),
    );
    services
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontendSection {
    #[serde(default = "default_frontend_dir")]
    pub dir: String,
    #[serde(default = "default_build_dir")]
    pub build_dir: String,
}

fn default_frontend_dir() -> String {
    "frontend".to_string()
}

fn default_build_dir() -> String {
    "dist".to_string()
}

impl Default for FrontendSection {
    fn default() -> Self {
        Self {
            dir: default_frontend_dir(),
            build_dir: default_build_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostItem {
    pub item: String,
    pub monthly_usd: f64,
}

pub fn default_cost_items() -> Vec<CostItem> {
    [
        ("RDS MySQL db.t3.micro", 15.0),
        ("Lambda (1M requests)", 0.20),
        ("API Gateway (1M requests)", 3.50),
        ("S3 + CloudFront (10 GB)", 1.50),
        ("Secrets Manager (1 secret)", 0.40),
    ]
    .iter()
    .map(|(item, usd)| CostItem {
        item: item.to_string(),
        monthly_usd: *usd,
    })
    .collect()
}

/// The complete rollout.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RolloutToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub secrets: SecretsSection,
    #[serde(default)]
    pub infrastructure: InfrastructureSection,
    /// `None` means the default service list; `Some(vec![])` disables the phase's work
    #[serde(default)]
    pub services: Option<Vec<ServiceConfig>>,
    #[serde(default)]
    pub frontend: FrontendSection,
    #[serde(default)]
    pub cost: Option<Vec<CostItem>>,
}

impl RolloutToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse rollout.toml")
    }

    /// Returns defaults when the file doesn't exist.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let config_path = state_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn services(&self) -> Vec<ServiceConfig> {
        self.services.clone().unwrap_or_else(default_services)
    }

    pub fn cost_items(&self) -> Vec<CostItem> {
        self.cost.clone().unwrap_or_else(default_cost_items)
    }

    /// Problems worth telling the operator about; none of them stop a run.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        for service in self.services() {
            if service.build.is_empty() {
                warnings.push(format!("Service '{}' has an empty build command", service.name));
            }
        }
        if self.services.as_ref().is_some_and(|s| s.is_empty()) {
            warnings.push("No services configured; the services phase has nothing to deploy".to_string());
        }
        for seed in &self.database.seed_files {
            if !seed.path.ends_with(".json") {
                warnings.push(format!(
                    "Seed file '{}' for table '{}' is not a .json file",
                    seed.path, seed.table
                ));
            }
        }
        if let Some(items) = &self.cost {
            for item in items {
                if item.monthly_usd < 0.0 {
                    warnings.push(format!("Cost item '{}' has a negative amount", item.item));
                }
            }
        }

        warnings
    }
}
