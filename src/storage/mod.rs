//! Persistent storage
//!
//! Settings and model discovery under the platform data directory.

use std::path::PathBuf;
use thiserror::Error;

pub mod models;
pub mod settings;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access data directory: {0}")]
    DataDirError(String),
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Get the application data directory
///
/// Returns the platform-specific application data directory:
/// - Windows: `C:\Users\{user}\AppData\Roaming\llm-session\llm-session`
/// - macOS: `/Users/{user}/Library/Application Support/com.llm-session.llm-session`
/// - Linux: `/home/{user}/.local/share/llm-session`
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("com", "llm-session", "llm-session")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| StorageError::DataDirError("Could not determine data directory".to_string()))
}

/// Default location scanned for `.gguf` files
pub fn default_models_dir() -> PathBuf {
    get_data_dir()
        .map(|d| d.join("models"))
        .unwrap_or_else(|_| PathBuf::from("./models"))
}
