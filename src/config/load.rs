use std::fs;
use std::path::Path;

use thiserror::Error;

use super::schema::Config;

#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

pub fn load(path: &Path) -> Result<Config, ConfigFileError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigFileError::Io {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigFileError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// Loads the config file if present; a missing file is not an error, a
/// malformed one is logged and replaced by defaults.
pub fn load_or_default(path: &Path) -> Config {
    if !path.exists() {
        return Config::default();
    }
    match load(path) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("config load failed, using defaults: {err}");
            Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = load_or_default(Path::new("/nonexistent/starling.toml"));
        assert_eq!(config.reactor.shard_count, 16);
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("starling.toml");
        let mut config = Config::default();
        config.reactor.shard_count = 2;
        let serialized = toml::to_string_pretty(&config).expect("serialize");
        fs::write(&path, serialized).expect("write");

        let loaded = load(&path).expect("load");
        assert_eq!(loaded.reactor.shard_count, 2);
    }
}
