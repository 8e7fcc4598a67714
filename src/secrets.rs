//! Local vault for generated secrets.
//!
//! Secrets the deployment needs (e.g. the JWT signing key) are generated once
//! and kept in `.rollout/secrets.env` so every re-run pushes the same value.
//! The file is owner-only and kept out of version control.

use crate::errors::SecretsError;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const HEADER: &str = "# Generated by rollout. Sensitive: do not commit or share.\n";

/// Ensure the named secrets exist; they become `${secret.<name>}` variables.
#[derive(Debug, Clone, PartialEq)]
pub struct SecretsTask {
    pub names: Vec<String>,
}

impl SecretsTask {
    pub fn describe(&self) -> String {
        format!("secrets: ensure {}", self.names.join(", "))
    }
}

/// Result of `SecretVault::ensure`.
#[derive(Debug, Clone, Default)]
pub struct EnsuredSecrets {
    pub values: BTreeMap<String, String>,
    pub generated: Vec<String>,
    pub reused: Vec<String>,
}

impl EnsuredSecrets {
    /// Summary without values.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.generated.is_empty() {
            parts.push(format!("generated {}", self.generated.join(", ")));
        }
        if !self.reused.is_empty() {
            parts.push(format!("reused {}", self.reused.join(", ")));
        }
        if parts.is_empty() {
            "nothing to do".to_string()
        } else {
            parts.join("; ")
        }
    }
}

/// 64 lowercase hex characters from two v4 UUIDs.
pub fn generate_secret() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

#[derive(Debug, Clone)]
pub struct SecretVault {
    path: PathBuf,
    project_dir: PathBuf,
}

impl SecretVault {
    pub fn new(path: PathBuf, project_dir: PathBuf) -> Self {
        Self { path, project_dir }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Existing secrets; an absent file is an empty vault.
    pub fn load(&self) -> Result<BTreeMap<String, String>, SecretsError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = std::fs::read_to_string(&self.path).map_err(|source| SecretsError::Read {
            path: self.path.clone(),
            source,
        })?;
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter_map(|l| l.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect())
    }

    /// Reuse stored values, generate the rest, and persist if anything changed.
    pub fn ensure(&self, names: &[String]) -> Result<EnsuredSecrets, SecretsError> {
        let mut stored = self.load()?;
        let mut ensured = EnsuredSecrets::default();

        for name in names {
            match stored.get(name) {
                Some(value) if !value.is_empty() => {
                    ensured.reused.push(name.clone());
                    ensured.values.insert(name.clone(), value.clone());
                }
                _ => {
                    let value = generate_secret();
                    stored.insert(name.clone(), value.clone());
                    ensured.generated.push(name.clone());
                    ensured.values.insert(name.clone(), value);
                }
            }
        }

        if !ensured.generated.is_empty() {
            self.write(&stored)?;
            tracing::info!(generated = ?ensured.generated, path = %self.path.display(), "secrets generated");
        }
        self.ensure_gitignored()?;
        Ok(ensured)
    }

    fn write(&self, values: &BTreeMap<String, String>) -> Result<(), SecretsError> {
        let write_err = |source: std::io::Error| SecretsError::Write {
            path: self.path.clone(),
            source,
        };
        let dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir).map_err(write_err)?;

        let mut file = tempfile::NamedTempFile::new_in(&dir).map_err(write_err)?;
        let mut body = String::from(HEADER);
        for (key, value) in values {
            body.push_str(&format!("{}={}\n", key, value));
        }
        file.write_all(body.as_bytes()).map_err(write_err)?;
        restrict_permissions(file.path()).map_err(write_err)?;
        file.persist(&self.path).map_err(|e| write_err(e.error))?;
        Ok(())
    }

    /// Add the vault to the project's `.gitignore` unless already covered.
    fn ensure_gitignored(&self) -> Result<(), SecretsError> {
        let gitignore = self.project_dir.join(".gitignore");
        let relative = self
            .path
            .strip_prefix(&self.project_dir)
            .unwrap_or(&self.path)
            .to_string_lossy()
            .replace('\\', "/");
        let parent = relative.rsplit_once('/').map(|(dir, _)| dir.to_string());

        let existing = if gitignore.exists() {
            std::fs::read_to_string(&gitignore).map_err(|source| SecretsError::Read {
                path: gitignore.clone(),
                source,
            })?
        } else {
            String::new()
        };
        let covered = existing.lines().map(str::trim).any(|line| {
            let line = line.trim_start_matches('/');
            line == relative
                || parent
                    .as_deref()
                    .is_some_and(|p| line == p || line.trim_end_matches('/') == p)
        });
        if covered {
            return Ok(());
        }

        let mut addition = String::new();
        if !existing.is_empty() && !existing.ends_with('\n') {
            addition.push('\n');
        }
        addition.push_str(&relative);
        addition.push('\n');
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&gitignore)
            .and_then(|mut f| f.write_all(addition.as_bytes()))
            .map_err(|source| SecretsError::Write {
                path: gitignore,
                source,
            })?;
        tracing::info!(entry = %relative, "added secrets file to .gitignore");
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
