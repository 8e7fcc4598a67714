//! Machine-readable history of pipeline runs.
//!
//! While a run is in flight, `.rollout/current-run.json` marks it as started.
//! A finished run is moved to `.rollout/runs/<timestamp>_<id8>.json` and never
//! rewritten.

pub mod logger;

pub use logger::AuditLogger;

use crate::orchestrator::state::PipelineRun;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Marker written when a run starts; left behind if the process dies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStarted {
    pub started_at: DateTime<Utc>,
    pub settings: BTreeMap<String, String>,
    pub phases: Vec<String>,
}

impl RunStarted {
    pub fn new(settings: BTreeMap<String, String>, phases: Vec<String>) -> Self {
        Self {
            started_at: Utc::now(),
            settings,
            phases,
        }
    }
}

/// One finished run as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Non-secret configuration the run used
    pub settings: BTreeMap<String, String>,
    pub run: PipelineRun,
    /// Display values of harvested outputs; sensitive ones are masked
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
}
