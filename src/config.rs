use std::{
    env, io,
    path::{Path, PathBuf},
};

use thiserror::Error;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_BODY_LIMIT_MB: usize = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("PORT must be a valid number between 0 and 65535, got {0:?}")]
    InvalidPort(String),
    #[error("BODY_LIMIT_MB must be a valid integer, got {0:?}")]
    InvalidBodyLimit(String),
    #[error("MODEL_MANIFEST must be a plain file name ending in .json, got {0:?}")]
    InvalidManifestName(String),
}

/// Resolved runtime settings shared by every handler.
#[derive(Debug, Clone)]
pub struct Config {
    pub root: PathBuf,
    pub model_dir: PathBuf,
    pub uploads_dir: PathBuf,
    pub port: u16,
    pub body_limit_bytes: usize,
    /// Explicit manifest file inside `model_dir`; `None` means discovery.
    pub model_manifest: Option<String>,
}

impl Config {
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let static_dir = root.join("static");
        Config {
            model_dir: static_dir.join("model"),
            uploads_dir: static_dir.join("uploads"),
            root,
            port: DEFAULT_PORT,
            body_limit_bytes: DEFAULT_BODY_LIMIT_MB * 1024 * 1024,
            model_manifest: None,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Config::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let root = lookup("APP_ROOT").unwrap_or_else(|| ".".into());
        let mut config = Config::with_root(root);

        if let Some(port) = lookup("PORT") {
            config.port = port
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidPort(port))?;
        }

        if let Some(mb) = lookup("BODY_LIMIT_MB") {
            config.body_limit_bytes = mb
                .parse::<usize>()
                .map_err(|_| ConfigError::InvalidBodyLimit(mb))?
                * 1024
                * 1024;
        }

        if let Some(name) = lookup("MODEL_MANIFEST") {
            if !name.is_empty() {
                config.model_manifest = Some(validate_manifest_name(name)?);
            }
        }

        Ok(config)
    }

    pub fn ensure_dirs(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.model_dir)?;
        std::fs::create_dir_all(&self.uploads_dir)
    }
}

fn validate_manifest_name(name: String) -> Result<String, ConfigError> {
    let plain = Path::new(&name)
        .file_name()
        .map(|f| f == name.as_str())
        .unwrap_or(false);
    if plain && name.ends_with(".json") {
        Ok(name)
    } else {
        Err(ConfigError::InvalidManifestName(name))
    }
}
