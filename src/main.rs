//! llm-session - streams a completion for a prompt read from stdin
//!
//! Usage: `llm-session [MODEL.gguf] < prompt.txt`

use std::error::Error;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use llm_session::inference::{LlamaEngine, LoadOptions, Model, StreamToken};
use llm_session::storage::models::first_loadable_model;
use llm_session::storage::settings::{load_settings, save_settings, Settings};

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("llm_session=info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    info!("Starting llm-session v{}", env!("CARGO_PKG_VERSION"));

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// Command-line argument, then settings, then the first model on disk.
fn resolve_model_path(settings: &Settings) -> Result<PathBuf, Box<dyn Error>> {
    if let Some(path) = std::env::args_os().nth(1) {
        return Ok(PathBuf::from(path));
    }
    if let Some(path) = &settings.model_path {
        return Ok(path.clone());
    }
    match first_loadable_model(&settings.models_directory)? {
        Some(model) => {
            info!("Using {} ({})", model.filename, model.size_string());
            Ok(model.path)
        }
        None => Err(format!(
            "no model given and none found in {}",
            settings.models_directory.display()
        )
        .into()),
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let settings = load_settings();
    let path = resolve_model_path(&settings)?;

    let options = LoadOptions {
        gpu_layers: settings.gpu_layers,
    };
    let model = Model::<LlamaEngine>::load(&path, &options)?;

    // Remember the last model that loaded so later runs skip the scan
    if settings.model_path.as_ref() != Some(&path) {
        let updated = Settings {
            model_path: Some(path.clone()),
            ..settings.clone()
        };
        if let Err(e) = save_settings(&updated) {
            warn!("Failed to save settings: {}", e);
        }
    }

    let mut prompt = String::new();
    std::io::stdin().read_to_string(&mut prompt)?;

    let mut stream = model.predict_text(&settings.parameters, prompt.trim_end())?;
    info!(seed = stream.seed(), "generating");

    let mut stdout = std::io::stdout().lock();
    let mut failure = None;
    for token in stream.by_ref() {
        match token {
            StreamToken::Token(text) => {
                stdout.write_all(text.as_bytes())?;
                stdout.flush()?;
            }
            StreamToken::Done => break,
            StreamToken::Error(e) => failure = Some(e),
        }
    }
    writeln!(stdout)?;
    info!(tokens = stream.generated(), "generation finished");
    stream.close();
    model.close();

    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
