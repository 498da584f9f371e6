//! Shared CLI helpers for workspace tools.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::{Error, Result};

/// Installs the global tracing subscriber. `RUST_LOG` wins over `verbose`.
pub fn setup_cli_logging(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(verbose))
        .with(filter)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logger: {e}")))?;

    Ok(())
}

pub fn load_toml_config<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read config {}: {e}", path.display())))?;

    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse config {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ExperimentConfig;

    #[test]
    fn test_load_toml_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("experiment.toml");
        fs::write(&path, "[model]\nsize = 256\n").unwrap();

        let config: ExperimentConfig = load_toml_config(&path).unwrap();
        assert_eq!(config.model.size, 256);
        assert_eq!(config.training.batch_size, 16);
    }

    #[test]
    fn test_load_missing_config() {
        let result: Result<ExperimentConfig> = load_toml_config(Path::new("/nonexistent/x.toml"));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
