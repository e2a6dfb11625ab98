use crate::error::RegistryError;
use crate::registry::{read_json_or_default, write_json_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// An environment that exists (or may exist) on disk without a registry record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEnv {
    pub prefix: PathBuf,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

/// Journal of environments created but not (yet) owned by a registry record.
#[derive(Debug)]
pub struct EnvJournal {
    path: PathBuf,
    entries: Vec<PendingEnv>,
}

impl EnvJournal {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let entries: Vec<PendingEnv> = read_json_or_default(&path)?;
        if !entries.is_empty() {
            tracing::info!(
                path = %path.display(),
                pending = entries.len(),
                "journal lists environments awaiting cleanup"
            );
        }
        Ok(Self { path, entries })
    }

    pub fn record(&mut self, entry: PendingEnv) -> Result<(), RegistryError> {
        if self.entries.iter().any(|e| e.prefix == entry.prefix) {
            return Ok(());
        }
        self.entries.push(entry);
        if let Err(err) = write_json_atomic(&self.path, &self.entries) {
            self.entries.pop();
            return Err(err);
        }
        Ok(())
    }

    /// Returns whether an entry was removed.
    pub fn clear(&mut self, prefix: &Path) -> Result<bool, RegistryError> {
        let Some(pos) = self.entries.iter().position(|e| e.prefix == prefix) else {
            return Ok(false);
        };
        let removed = self.entries.remove(pos);
        if let Err(err) = write_json_atomic(&self.path, &self.entries) {
            self.entries.insert(pos, removed);
            return Err(err);
        }
        Ok(true)
    }

    pub fn list(&self) -> &[PendingEnv] {
        &self.entries
    }
}
