use crate::error::ManifestError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const MANIFEST_FILE: &str = "pyproject.toml";

/// Plugin metadata from the `[tool.natcap.invest]` table of a `pyproject.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginManifest {
    pub model_id: String,
    pub model_title: String,
    /// Importable module name.
    pub package_name: String,
    pub conda_dependencies: Vec<String>,
    pub notebook_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Document {
    tool: Option<Tool>,
}

#[derive(Debug, Deserialize)]
struct Tool {
    natcap: Option<Natcap>,
}

#[derive(Debug, Deserialize)]
struct Natcap {
    invest: Option<Section>,
}

#[derive(Debug, Deserialize)]
struct Section {
    model_id: Option<String>,
    #[serde(alias = "model_name")]
    model_title: Option<String>,
    #[serde(alias = "pyname")]
    package_name: Option<String>,
    #[serde(default)]
    conda_dependencies: Vec<String>,
    notebook_path: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn is_module_path(name: &str) -> bool {
    name.split('.').all(|part| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

impl PluginManifest {
    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ManifestError::NotFound(path.to_path_buf()))
            }
            Err(source) => {
                return Err(ManifestError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::parse(&text, path)
    }

    /// `origin` is only used in error messages.
    pub fn parse(text: &str, origin: &Path) -> Result<Self, ManifestError> {
        let doc: Document = toml::from_str(text).map_err(|source| ManifestError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        let section = doc
            .tool
            .and_then(|t| t.natcap)
            .and_then(|n| n.invest)
            .ok_or_else(|| ManifestError::MissingSection {
                path: origin.to_path_buf(),
            })?;

        let missing = |field| ManifestError::MissingField {
            path: origin.to_path_buf(),
            field,
        };
        let model_id = non_empty(section.model_id).ok_or_else(|| missing("model_id"))?;
        let package_name = non_empty(section.package_name).ok_or_else(|| missing("package_name"))?;
        if !is_module_path(&package_name) {
            return Err(ManifestError::InvalidField {
                path: origin.to_path_buf(),
                field: "package_name",
                reason: format!("{package_name:?} is not an importable module name"),
            });
        }
        let model_title = non_empty(section.model_title).unwrap_or_else(|| model_id.clone());

        Ok(Self {
            model_id,
            model_title,
            package_name,
            conda_dependencies: section.conda_dependencies,
            notebook_path: non_empty(section.notebook_path),
        })
    }
}
