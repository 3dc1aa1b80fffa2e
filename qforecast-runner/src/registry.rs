//! Artifact registry — immutable model artifacts and ensemble weights on disk.
//!
//! Layout under the registry root:
//! - `models/<family>/<version>.json`
//! - `ensembles/<version>.json`
//!
//! Files are keyed by content-derived versions and written atomically. An
//! existing version is never overwritten: re-storing it is a no-op.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use qforecast_core::domain::{EnsembleVersion, ModelVersion};
use qforecast_core::model::{ArtifactSpec, ModelArtifact, ModelConfig, ModelError, ModelFamily};

use crate::journal::write_atomic;
use crate::stacker::EnsembleWeights;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("artifact {0}: {1}")]
    Model(PathBuf, ModelError),

    #[error("ensemble {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct ArtifactRegistry {
    root: PathBuf,
}

impl ArtifactRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn model_path(&self, family: ModelFamily, version: &ModelVersion) -> PathBuf {
        self.root
            .join("models")
            .join(family.as_str())
            .join(format!("{version}.json"))
    }

    fn ensemble_path(&self, version: &EnsembleVersion) -> PathBuf {
        self.root.join("ensembles").join(format!("{version}.json"))
    }

    /// Store an artifact. Returns `false` when the version already existed.
    pub fn put_model(&self, artifact: &ModelArtifact) -> Result<bool, RegistryError> {
        let path = self.model_path(artifact.family(), artifact.version());
        if path.exists() {
            debug!(path = %path.display(), "artifact already stored");
            return Ok(false);
        }
        let json = artifact
            .to_json()
            .map_err(|e| RegistryError::Model(path.clone(), e))?;
        write_atomic(&path, json.as_bytes()).map_err(|source| RegistryError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(true)
    }

    pub fn get_model(
        &self,
        family: ModelFamily,
        version: &ModelVersion,
    ) -> Result<Option<ModelArtifact>, RegistryError> {
        let path = self.model_path(family, version);
        let Some(json) = read_optional(&path)? else {
            return Ok(None);
        };
        ModelArtifact::from_json(&json)
            .map(Some)
            .map_err(|e| RegistryError::Model(path, e))
    }

    /// An artifact trained with exactly this configuration, window, dataset and
    /// row selection, if one was stored earlier.
    pub fn find_reusable(
        &self,
        config: &ModelConfig,
        spec: &ArtifactSpec,
    ) -> Result<Option<ModelArtifact>, RegistryError> {
        let version = ModelArtifact::version_for(config, spec)
            .map_err(|e| RegistryError::Model(self.root.clone(), e))?;
        self.get_model(config.family(), &version)
    }

    /// Store ensemble weights. Returns `false` when the version already existed.
    pub fn put_ensemble(&self, weights: &EnsembleWeights) -> Result<bool, RegistryError> {
        let path = self.ensemble_path(&weights.version);
        if path.exists() {
            return Ok(false);
        }
        let json = serde_json::to_vec_pretty(weights).map_err(|source| RegistryError::Json {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &json).map_err(|source| RegistryError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(true)
    }

    pub fn get_ensemble(
        &self,
        version: &EnsembleVersion,
    ) -> Result<Option<EnsembleWeights>, RegistryError> {
        let path = self.ensemble_path(version);
        let Some(json) = read_optional(&path)? else {
            return Ok(None);
        };
        serde_json::from_str(&json)
            .map(Some)
            .map_err(|source| RegistryError::Json { path, source })
    }

    /// Stored model versions for a family.
    pub fn model_versions(&self, family: ModelFamily) -> Result<Vec<ModelVersion>, RegistryError> {
        let dir = self.root.join("models").join(family.as_str());
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&dir).map_err(|source| RegistryError::Io {
            path: dir.clone(),
            source,
        })?;
        let mut versions: Vec<ModelVersion> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("json"))
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(|s| ModelVersion(s.to_string())))
            .collect();
        versions.sort();
        Ok(versions)
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, RegistryError> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(RegistryError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
