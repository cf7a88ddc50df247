use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::pipeline_config::PipelineConfig;

/// Application-level constants
pub const APP_NAME: &str = "imaging-orchestrator";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable pointing at an explicit configuration file.
pub const CONFIG_ENV_VAR: &str = "IMAGING_ORCHESTRATOR_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read configuration at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed configuration at {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Log filter used when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    "imaging_orchestrator=info,warn"
}

/// Get the application data directory (~/.imaging-orchestrator/).
/// `None` when the home directory cannot be determined.
pub fn app_data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".imaging-orchestrator"))
}

/// Resolve the configuration file: env override first, then the data directory.
pub fn config_path() -> Option<PathBuf> {
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(path) if !path.is_empty() => Some(PathBuf::from(path)),
        _ => app_data_dir().map(|dir| dir.join("config.json")),
    }
}

/// Load the configuration, falling back to defaults when no file exists.
pub fn load_config() -> Result<PipelineConfig, ConfigError> {
    match config_path() {
        Some(path) if path.exists() => load_config_from(&path),
        _ => {
            tracing::debug!("No configuration file found, using defaults");
            Ok(PipelineConfig::default())
        }
    }
}

/// Load and validate a configuration file.
pub fn load_config_from(path: &Path) -> Result<PipelineConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: PipelineConfig = serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    config.validate()?;
    tracing::info!(path = %path.display(), "Loaded pipeline configuration");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn app_data_dir_under_home() {
        if let (Some(dir), Some(home)) = (app_data_dir(), dirs::home_dir()) {
            assert!(dir.starts_with(home));
            assert!(dir.ends_with(".imaging-orchestrator"));
        }
    }

    #[test]
    fn app_version_matches_cargo() {
        assert_eq!(APP_VERSION, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"gate": {{"acceptance_threshold": 0.8}}}}"#).unwrap();

        let config = load_config_from(file.path()).unwrap();
        assert!((config.gate.acceptance_threshold - 0.8).abs() < f32::EPSILON);
        assert_eq!(config.gate.max_cycles, 3);
    }

    #[test]
    fn load_rejects_malformed_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();

        let err = load_config_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn load_rejects_invalid_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"rate_limit": {{"ceiling": 0}}}}"#).unwrap();

        let err = load_config_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn load_missing_file_is_read_error() {
        let err = load_config_from(Path::new("/nonexistent/config.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
