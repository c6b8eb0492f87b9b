//! Model discovery
//!
//! Lists the GGUF files available for loading.

use crate::inference::model::validate_gguf;
use crate::storage::StorageError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Information about a GGUF model file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Full path to the model file
    pub path: PathBuf,
    /// Filename of the model
    pub filename: String,
    /// File size in bytes
    pub size_bytes: u64,
    /// Last modification time
    pub last_modified: SystemTime,
    /// GGUF format version, `None` if the header did not validate
    pub gguf_version: Option<u32>,
}

impl ModelInfo {
    /// Create a ModelInfo from a file path
    fn from_path(path: PathBuf) -> Result<Self, std::io::Error> {
        let metadata = fs::metadata(&path)?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        let gguf_version = match validate_gguf(&path) {
            Ok(header) => Some(header.version),
            Err(e) => {
                tracing::debug!("{} is not loadable: {}", filename, e);
                None
            }
        };

        Ok(Self {
            path,
            filename,
            size_bytes: metadata.len(),
            last_modified: metadata.modified()?,
            gguf_version,
        })
    }

    /// Whether the file carries a supported GGUF header
    pub fn is_loadable(&self) -> bool {
        self.gguf_version.is_some()
    }

    /// Get a human-readable size string
    pub fn size_string(&self) -> String {
        let bytes = self.size_bytes as f64;

        if bytes < 1024.0 {
            format!("{} B", bytes)
        } else if bytes < 1024.0 * 1024.0 {
            format!("{:.2} KB", bytes / 1024.0)
        } else if bytes < 1024.0 * 1024.0 * 1024.0 {
            format!("{:.2} MB", bytes / (1024.0 * 1024.0))
        } else {
            format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
        }
    }
}

/// Scan a directory for GGUF model files
///
/// Returns a list of ModelInfo for all .gguf files found in the directory, sorted by filename
pub fn scan_models_directory(directory: &Path) -> Result<Vec<ModelInfo>, StorageError> {
    if !directory.exists() {
        tracing::warn!("Models directory does not exist: {}", directory.display());
        return Ok(vec![]);
    }

    if !directory.is_dir() {
        tracing::warn!("Models path is not a directory: {}", directory.display());
        return Ok(vec![]);
    }

    let mut models = vec![];

    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        let is_gguf = path
            .extension()
            .is_some_and(|ext| ext.to_string_lossy().eq_ignore_ascii_case("gguf"));
        if !path.is_file() || !is_gguf {
            continue;
        }

        match ModelInfo::from_path(path.clone()) {
            Ok(model_info) => {
                tracing::debug!("Found model: {}", model_info.filename);
                models.push(model_info);
            }
            Err(e) => {
                tracing::warn!("Failed to read model file {:?}: {}", path, e);
            }
        }
    }

    models.sort_by(|a, b| a.filename.cmp(&b.filename));

    tracing::info!("Found {} model(s) in {}", models.len(), directory.display());

    Ok(models)
}

/// First loadable model in `directory`, by filename
pub fn first_loadable_model(directory: &Path) -> Result<Option<ModelInfo>, StorageError> {
    Ok(scan_models_directory(directory)?
        .into_iter()
        .find(ModelInfo::is_loadable))
}
