//! Pull-based harvest of infrastructure outputs.
//!
//! `terraform output -json` yields `{"name": {"value": .., "sensitive": bool}}`.
//! Failures never propagate: they become [`Harvest::Unavailable`].

use crate::errors::HarvestError;
use crate::runner::{CommandRunner, CommandSpec};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

const HARVEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq)]
pub enum OutputValue {
    Plain(String),
    /// Value withheld from display; still usable as `${secret.output.<name>}`.
    Sensitive(String),
}

impl OutputValue {
    pub fn display(&self) -> &str {
        match self {
            OutputValue::Plain(v) => v,
            OutputValue::Sensitive(_) => "(sensitive)",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Harvest {
    Available { outputs: BTreeMap<String, OutputValue> },
    Unavailable { reason: String },
}

impl Harvest {
    /// Display value for `key`, or why it is missing.
    pub fn lookup(&self, key: &str) -> Result<&str, String> {
        match self {
            Harvest::Available { outputs } => outputs
                .get(key)
                .map(OutputValue::display)
                .ok_or_else(|| "unavailable (not in outputs)".to_string()),
            Harvest::Unavailable { reason } => Err(format!("unavailable ({})", reason)),
        }
    }

    pub fn outputs(&self) -> Option<&BTreeMap<String, OutputValue>> {
        match self {
            Harvest::Available { outputs } => Some(outputs),
            Harvest::Unavailable { .. } => None,
        }
    }

    /// Display values only, safe to persist.
    pub fn display_map(&self) -> BTreeMap<String, String> {
        match self {
            Harvest::Available { outputs } => outputs
                .iter()
                .map(|(k, v)| (k.clone(), v.display().to_string()))
                .collect(),
            Harvest::Unavailable { reason } => {
                BTreeMap::from([("(unavailable)".to_string(), reason.clone())])
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawOutput {
    value: serde_json::Value,
    #[serde(default)]
    sensitive: bool,
}

/// Parse `terraform output -json`. Strings are kept verbatim; other JSON
/// values are rendered compactly.
pub fn parse_outputs(json: &str) -> Result<BTreeMap<String, OutputValue>, HarvestError> {
    if json.trim().is_empty() {
        return Err(HarvestError::Command("output command printed nothing".to_string()));
    }
    let value: serde_json::Value = serde_json::from_str(json).map_err(HarvestError::Parse)?;
    let object = value.as_object().ok_or(HarvestError::NotAnObject)?;

    let mut outputs = BTreeMap::new();
    for (name, raw) in object {
        let raw: RawOutput = serde_json::from_value(raw.clone()).map_err(HarvestError::Parse)?;
        let rendered = match raw.value {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        let value = if raw.sensitive {
            OutputValue::Sensitive(rendered)
        } else {
            OutputValue::Plain(rendered)
        };
        outputs.insert(name.clone(), value);
    }
    Ok(outputs)
}

/// Runs the IaC tool's output command.
#[derive(Debug, Clone)]
pub struct Harvester {
    terraform: String,
    dir: std::path::PathBuf,
}

impl Harvester {
    pub fn new(terraform: &str, dir: &Path) -> Self {
        Self {
            terraform: terraform.to_string(),
            dir: dir.to_path_buf(),
        }
    }

    pub fn command(&self) -> CommandSpec {
        CommandSpec::new(&self.terraform)
            .arg(format!("-chdir={}", self.dir.display()))
            .args(["output", "-json"])
    }

    pub async fn harvest(&self, runner: &dyn CommandRunner) -> Harvest {
        match self.try_harvest(runner).await {
            Ok(outputs) => {
                tracing::info!(count = outputs.len(), "harvested infrastructure outputs");
                Harvest::Available { outputs }
            }
            Err(e) => {
                tracing::warn!(error = %e, "infrastructure outputs unavailable");
                Harvest::Unavailable {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn try_harvest(
        &self,
        runner: &dyn CommandRunner,
    ) -> Result<BTreeMap<String, OutputValue>, HarvestError> {
        let spec = self.command();
        let out = runner
            .run(&spec, Some(HARVEST_TIMEOUT))
            .await
            .map_err(|e| HarvestError::Command(e.to_string()))?;
        if !out.success() {
            let detail = out.stderr.lines().next().unwrap_or("").trim().to_string();
            return Err(HarvestError::Command(format!(
                "'{}' exited with {:?} {}",
                spec.display(),
                out.exit_code,
                detail
            )));
        }
        parse_outputs(&out.stdout)
    }
}
