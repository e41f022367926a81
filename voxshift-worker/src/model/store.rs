//! Model weight store
//!
//! Weights for model key `k` live at `<model_dir>/k.bin`. A `k.sha256`
//! sidecar, when present, pins the expected content hash and is checked
//! before every load.

use crate::error::{Result, WorkerError};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tracing::{info, warn};
use voxshift_common::config::WorkerSettings;

pub struct ModelStore {
    dir: PathBuf,
    base_url: String,
}

impl ModelStore {
    pub fn new(dir: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            base_url: base_url.into(),
        }
    }

    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self::new(&settings.model_dir, &settings.model_base_url)
    }

    pub fn weights_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.dir.join(format!("{}.bin", key)))
    }

    fn checksum_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.dir.join(format!("{}.sha256", key)))
    }

    /// Path to verified weights for `key`. Missing or mismatched weights are
    /// a load error.
    pub async fn resolve(&self, key: &str) -> Result<PathBuf> {
        let path = self.weights_path(key)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(WorkerError::ModelLoad(format!(
                "Weights for {} not found at {} (run fetch-model)",
                key,
                path.display()
            )));
        }
        self.verify(key).await?;
        Ok(path)
    }

    /// Check the weights against the sidecar checksum, if one exists
    pub async fn verify(&self, key: &str) -> Result<()> {
        let checksum_path = self.checksum_path(key)?;
        let expected = match tokio::fs::read_to_string(&checksum_path).await {
            Ok(text) => text.trim().to_ascii_lowercase(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(model_key = key, "No checksum recorded; skipping verification");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let actual = file_sha256(self.weights_path(key)?).await?;
        if actual != expected {
            return Err(WorkerError::ModelLoad(format!(
                "Checksum mismatch for {}: expected {}, found {}",
                key, expected, actual
            )));
        }
        Ok(())
    }

    /// Download `<base_url>/<key>.bin`, store it atomically and record its
    /// checksum. Returns the weights path.
    pub async fn fetch(&self, key: &str) -> Result<PathBuf> {
        let path = self.weights_path(key)?;
        let url = format!("{}/{}.bin", self.base_url.trim_end_matches('/'), key);
        info!(model_key = key, url = %url, "Downloading model weights");

        let bytes = reqwest::get(&url)
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| WorkerError::ModelLoad(format!("Download of {} failed: {}", url, e)))?
            .bytes()
            .await
            .map_err(|e| WorkerError::ModelLoad(format!("Download of {} failed: {}", url, e)))?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = path.with_extension("bin.part");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        let digest = hex(&Sha256::digest(&bytes));
        tokio::fs::write(self.checksum_path(key)?, format!("{}\n", digest)).await?;

        info!(
            model_key = key,
            bytes = bytes.len(),
            sha256 = %digest,
            "Model weights stored"
        );
        Ok(path)
    }
}

fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !valid {
        return Err(WorkerError::ModelLoad(format!("Invalid model key: {:?}", key)));
    }
    Ok(())
}

async fn file_sha256(path: PathBuf) -> Result<String> {
    tokio::task::spawn_blocking(move || -> Result<String> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        Ok(hex(&hasher.finalize()))
    })
    .await
    .map_err(|e| WorkerError::ModelLoad(format!("Checksum task failed: {}", e)))?
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn keys_cannot_escape_the_store() {
        let store = ModelStore::new("/models", "http://localhost");
        assert!(store.weights_path("hubert-quantized-20231015").is_ok());
        assert!(store.weights_path("v1.2_final").is_ok());
        assert!(store.weights_path("../etc/passwd").is_err());
        assert!(store.weights_path("a/b").is_err());
        assert!(store.weights_path("").is_err());
        assert!(store.weights_path(".hidden").is_err());
    }

    #[tokio::test]
    async fn resolve_verifies_sidecar_checksum() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::new(dir.path(), "http://localhost");

        assert!(store.resolve("m").await.is_err());

        std::fs::write(dir.path().join("m.bin"), b"weights").unwrap();
        // No sidecar: accepted
        store.resolve("m").await.unwrap();

        let good = hex(&Sha256::digest(b"weights"));
        std::fs::write(dir.path().join("m.sha256"), format!("{}\n", good)).unwrap();
        assert_eq!(store.resolve("m").await.unwrap(), dir.path().join("m.bin"));

        std::fs::write(dir.path().join("m.bin"), b"tampered").unwrap();
        let err = store.resolve("m").await.unwrap_err();
        assert!(matches!(err, WorkerError::ModelLoad(_)));
    }
}
