//! Settings storage
//!
//! Manages persistence of the model selection and default prediction parameters.

use crate::inference::params::Parameters;
use crate::storage::{default_models_dir, get_data_dir, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Model to load; the first model in `models_directory` when unset
    pub model_path: Option<PathBuf>,
    /// Directory where model files (.gguf) are stored
    pub models_directory: PathBuf,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
    /// Parameters used for every prediction
    pub parameters: Parameters,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model_path: None,
            models_directory: default_models_dir(),
            gpu_layers: 99, // Offload all layers to GPU by default
            parameters: Parameters::default(),
        }
    }
}

impl Settings {
    /// Validate settings values
    ///
    /// Ensures all parameters are within acceptable ranges
    pub fn validate(&mut self) {
        let defaults = Parameters::default();
        let params = &mut self.parameters;

        params.temperature = params.temperature.clamp(0.0, 2.0);
        params.top_p = params.top_p.clamp(0.0, 1.0);
        params.tfs_z = params.tfs_z.clamp(0.0, 1.0);
        params.typical_p = params.typical_p.clamp(0.0, 1.0);

        if params.top_k < 0 {
            params.top_k = 0;
        }
        if params.repeat_penalty <= 0.0 {
            params.repeat_penalty = defaults.repeat_penalty;
        }

        // -1 is the only meaningful negative value
        params.n_predict = params.n_predict.max(-1);
        params.repeat_last_n = params.repeat_last_n.max(-1);

        if params.mirostat_tau < 0.0 {
            params.mirostat_tau = defaults.mirostat_tau;
        }
        if params.mirostat_eta < 0.0 {
            params.mirostat_eta = defaults.mirostat_eta;
        }
    }
}

/// Get the settings file path
fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> Settings {
    match get_settings_path().and_then(|path| load_settings_from(&path)) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            Settings::default()
        }
    }
}

/// Load and validate settings from `path`
pub fn load_settings_from(path: &Path) -> Result<Settings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(Settings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: Settings = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to disk
pub fn save_settings(settings: &Settings) -> Result<(), StorageError> {
    save_settings_to(settings, &get_settings_path()?)
}

/// Save settings to `path`, creating its parent directory
pub fn save_settings_to(settings: &Settings, path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}
