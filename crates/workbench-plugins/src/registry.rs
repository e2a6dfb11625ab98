//! Durable plugin registry kept in the application's JSON settings file.
//!
//! Every mutation rewrites the file before returning, so a `lookup` after
//! `upsert` or `remove` always reflects disk.

use crate::error::RegistryError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

/// `model_id@version` with `.` replaced by `_`, since the settings store
/// treats `.` as a path separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginKey(String);

impl PluginKey {
    pub fn new(model_id: &str, version: &str) -> Self {
        Self::from_identity(&format!("{model_id}@{version}"))
    }

    /// Accepts escaped or unescaped identities.
    pub fn from_identity(identity: &str) -> Self {
        Self(identity.trim().replace('.', "_"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PluginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Plugin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRecord {
    #[serde(rename = "modelID")]
    pub model_id: String,
    pub model_title: String,
    #[serde(rename = "type")]
    pub kind: RecordKind,
    pub source: String,
    pub env: PathBuf,
    /// Unescaped, exactly as the package reported it.
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notebook_path: Option<String>,
}

impl PluginRecord {
    pub fn key(&self) -> PluginKey {
        PluginKey::new(&self.model_id, &self.version)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SettingsDocument {
    #[serde(default)]
    plugins: BTreeMap<PluginKey, PluginRecord>,
    #[serde(flatten)]
    other: serde_json::Map<String, serde_json::Value>,
}

/// Write `value` as pretty JSON via a temp file and rename.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), RegistryError> {
    let write_err = |source| RegistryError::Write {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(write_err)?;
    let data = serde_json::to_vec_pretty(value).map_err(|err| write_err(err.into()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(write_err)?;
    tmp.write_all(&data).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|err| write_err(err.error))?;
    Ok(())
}

/// Read JSON from `path`; a missing or empty file yields `T::default()`.
pub(crate) fn read_json_or_default<T>(path: &Path) -> Result<T, RegistryError>
where
    T: Default + for<'de> Deserialize<'de>,
{
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(source) => {
            return Err(RegistryError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(&data).map_err(|source| RegistryError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug)]
pub struct PluginRegistry {
    path: PathBuf,
    doc: SettingsDocument,
}

impl PluginRegistry {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let doc: SettingsDocument = read_json_or_default(&path)?;
        tracing::debug!(
            path = %path.display(),
            plugins = doc.plugins.len(),
            "opened plugin registry"
        );
        Ok(Self { path, doc })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create or replace. Returns the record that was replaced, if any.
    pub fn upsert(
        &mut self,
        key: PluginKey,
        record: PluginRecord,
    ) -> Result<Option<PluginRecord>, RegistryError> {
        let previous = self.doc.plugins.insert(key.clone(), record);
        if let Err(err) = self.flush() {
            match previous {
                Some(prev) => self.doc.plugins.insert(key, prev),
                None => self.doc.plugins.remove(&key),
            };
            return Err(err);
        }
        Ok(previous)
    }

    pub fn lookup(&self, key: &PluginKey) -> Option<PluginRecord> {
        self.doc.plugins.get(key).cloned()
    }

    /// Absent keys are a no-op.
    pub fn remove(&mut self, key: &PluginKey) -> Result<Option<PluginRecord>, RegistryError> {
        let Some(previous) = self.doc.plugins.remove(key) else {
            return Ok(None);
        };
        if let Err(err) = self.flush() {
            self.doc.plugins.insert(key.clone(), previous);
            return Err(err);
        }
        Ok(Some(previous))
    }

    pub fn list(&self) -> Vec<(PluginKey, PluginRecord)> {
        self.doc
            .plugins
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn references_env(&self, prefix: &Path) -> bool {
        self.doc.plugins.values().any(|r| r.env == prefix)
    }

    pub fn flush(&self) -> Result<(), RegistryError> {
        write_json_atomic(&self.path, &self.doc)
    }

    pub fn close(self) -> Result<(), RegistryError> {
        self.flush()
    }
}
