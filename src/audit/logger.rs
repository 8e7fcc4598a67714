use super::{AuditRecord, RunStarted};
use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub struct AuditLogger {
    audit_dir: PathBuf,
    current_run_file: PathBuf,
}

impl AuditLogger {
    pub fn new(audit_dir: &Path) -> Self {
        Self {
            audit_dir: audit_dir.to_path_buf(),
            current_run_file: audit_dir.join("current-run.json"),
        }
    }

    fn runs_dir(&self) -> PathBuf {
        self.audit_dir.join("runs")
    }

    /// Write the start marker atomically so a crash never leaves half a file.
    pub fn start_run(&self, started: &RunStarted) -> Result<()> {
        fs::create_dir_all(&self.audit_dir).context("Failed to create audit directory")?;
        let json =
            serde_json::to_string_pretty(started).context("Failed to serialize current run")?;
        let mut file = NamedTempFile::new_in(&self.audit_dir)
            .context("Failed to create temporary current run file")?;
        file.write_all(json.as_bytes())
            .context("Failed to write current run file")?;
        file.persist(&self.current_run_file)
            .context("Failed to persist current run file")?;
        Ok(())
    }

    /// A start marker left by a run that never finished.
    ///
    /// An unreadable marker is reported and ignored; the next `start_run`
    /// replaces it.
    pub fn interrupted_run(&self) -> Result<Option<RunStarted>> {
        if !self.current_run_file.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.current_run_file)
            .context("Failed to read current run file")?;
        match serde_json::from_str(&content) {
            Ok(started) => Ok(Some(started)),
            Err(e) => {
                tracing::warn!(
                    path = %self.current_run_file.display(),
                    error = %e,
                    "ignoring malformed current run marker"
                );
                Ok(None)
            }
        }
    }

    /// The most recent finished run, if any can be read.
    pub fn last_run(&self) -> Result<Option<AuditRecord>> {
        for path in self.list_runs()? {
            match self.load_run(&path) {
                Ok(record) => return Ok(Some(record)),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable audit record"),
            }
        }
        Ok(None)
    }

    /// Persist a sealed run and clear the start marker.
    ///
    /// Returns an error if the run has not been finished: an open run would
    /// be frozen mid-flight in the history.
    pub fn finish_run(&self, record: &AuditRecord) -> Result<PathBuf> {
        if !record.run.is_finished() {
            anyhow::bail!("finish_run called with a run that has no outcome");
        }

        let runs_dir = self.runs_dir();
        fs::create_dir_all(&runs_dir).context("Failed to create runs directory")?;
        let filename = format!(
            "{}_{}.json",
            record.run.started_at().format("%Y-%m-%dT%H-%M-%S"),
            record.run.short_id()
        );
        let run_file = runs_dir.join(&filename);
        if run_file.exists() {
            anyhow::bail!("Audit file {} already exists", run_file.display());
        }

        let json = serde_json::to_string_pretty(record).context("Failed to serialize audit run")?;
        fs::write(&run_file, json).context("Failed to write audit run file")?;

        if self.current_run_file.exists() {
            fs::remove_file(&self.current_run_file)
                .context("Failed to remove current-run.json after finishing run")?;
        }
        tracing::debug!(path = %run_file.display(), "audit record written");
        Ok(run_file)
    }

    /// Finished runs, most recent first.
    pub fn list_runs(&self) -> Result<Vec<PathBuf>> {
        let runs_dir = self.runs_dir();
        if !runs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs: Vec<PathBuf> = fs::read_dir(&runs_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();

        runs.sort();
        runs.reverse();
        Ok(runs)
    }

    pub fn load_run(&self, path: &Path) -> Result<AuditRecord> {
        let content = fs::read_to_string(path).context("Failed to read audit run file")?;
        let record: AuditRecord =
            serde_json::from_str(&content).context("Failed to parse audit run file")?;
        Ok(record)
    }
}
