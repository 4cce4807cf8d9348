use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::{
    artifact::{self, ArtifactError, DEFAULT_MANIFEST_NAME, MANIFEST_EXTENSION},
    network::{NetworkError, Sequential},
};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("No model files found")]
    NoModel,
    #[error("Error loading model: {0}")]
    Load(ArtifactError),
    #[error("Error saving model: {0}")]
    Save(ArtifactError),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

struct CachedModel {
    path: PathBuf,
    modified: SystemTime,
    len: u64,
    model: Arc<Sequential>,
}

/// Owns the model directory: finds the manifest to serve, keeps the last
/// loaded model around and serialises saves against loads.
pub struct ModelRegistry {
    model_dir: PathBuf,
    manifest_name: Option<String>,
    dir_lock: RwLock<()>,
    cache: Mutex<Option<CachedModel>>,
}

impl ModelRegistry {
    pub fn new(model_dir: impl Into<PathBuf>, manifest_name: Option<String>) -> Self {
        ModelRegistry {
            model_dir: model_dir.into(),
            manifest_name,
            dir_lock: RwLock::new(()),
            cache: Mutex::new(None),
        }
    }

    /// The configured manifest, or else the lexically first `.json` file in
    /// the model directory.
    pub async fn resolve(&self) -> Result<PathBuf, RegistryError> {
        if let Some(name) = &self.manifest_name {
            let path = self.model_dir.join(name);
            return match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => Ok(path),
                Ok(_) => Err(RegistryError::NoModel),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Err(RegistryError::NoModel),
                Err(e) => Err(RegistryError::Load(e.into())),
            };
        }

        let mut entries = match tokio::fs::read_dir(&self.model_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(RegistryError::NoModel),
            Err(e) => return Err(RegistryError::Load(e.into())),
        };

        let mut manifests = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RegistryError::Load(e.into()))?
        {
            let path = entry.path();
            if is_manifest(&path) && path.is_file() {
                manifests.push(path);
            }
        }
        manifests.sort();
        if manifests.len() > 1 {
            debug!("{} manifests in {}, using the first", manifests.len(), self.model_dir.display());
        }
        manifests.into_iter().next().ok_or(RegistryError::NoModel)
    }

    /// Returns the model to serve, reloading only when the manifest on disk
    /// differs from the cached one.
    pub async fn current(&self) -> Result<Arc<Sequential>, RegistryError> {
        let _dir = self.dir_lock.read().await;
        let path = self.resolve().await?;
        let (modified, len) = tokio::fs::metadata(&path)
            .await
            .and_then(|meta| Ok((meta.modified()?, meta.len())))
            .map_err(|e| RegistryError::Load(e.into()))?;

        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.path == path && cached.modified == modified && cached.len == len {
                return Ok(cached.model.clone());
            }
        }

        info!("Loading model from {}", path.display());
        let load_path = path.clone();
        let model = tokio::task::spawn_blocking(move || artifact::load(&load_path))
            .await?
            .map_err(RegistryError::Load)?;
        let model = Arc::new(model);
        *cache = Some(CachedModel {
            path,
            modified,
            len,
            model: model.clone(),
        });
        Ok(model)
    }

    /// Builds a fresh untrained classifier and saves it, overwriting the
    /// previous artifact. Holds the directory exclusively while writing.
    pub async fn train(&self) -> Result<PathBuf, RegistryError> {
        self.save_with(|| {
            Sequential::classifier(&mut rand::thread_rng(), Sequential::default_labels())
        })
        .await
    }

    /// Saves whatever `build` produces as the served model.
    pub async fn save_with<F>(&self, build: F) -> Result<PathBuf, RegistryError>
    where
        F: FnOnce() -> Result<Sequential, NetworkError> + Send + 'static,
    {
        let _dir = self.dir_lock.write().await;
        let dir = self.model_dir.clone();
        let name = self
            .manifest_name
            .clone()
            .unwrap_or_else(|| DEFAULT_MANIFEST_NAME.to_string());

        let path = tokio::task::spawn_blocking(move || {
            let model = build().map_err(ArtifactError::from)?;
            artifact::save(&model, &dir, &name)
        })
        .await?
        .map_err(RegistryError::Save)?;

        self.cache.lock().await.take();
        info!("Saved model to {}", path.display());
        Ok(path)
    }
}

fn is_manifest(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext == MANIFEST_EXTENSION)
        .unwrap_or(false)
}
