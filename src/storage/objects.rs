//! Object storage for job inputs and stage outputs.
//!
//! The orchestration core only needs four operations, so storage sits behind
//! the [`ObjectStore`] trait. [`LocalObjectStore`] keeps objects as files
//! under a base directory and hands out HMAC-style signed download URLs.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::ObjectStoreError;

/// Default lifetime of a download URL.
pub const DEFAULT_URL_TTL: Duration = Duration::from_secs(3600);

/// Locator-addressed blob storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `bytes` under `locator` and returns the locator.
    async fn put(&self, locator: &str, bytes: Vec<u8>) -> Result<String, ObjectStoreError>;

    async fn get(&self, locator: &str) -> Result<Vec<u8>, ObjectStoreError>;

    /// Deletes an object. Deleting a missing object is not an error.
    async fn delete(&self, locator: &str) -> Result<(), ObjectStoreError>;

    /// Time-limited download URL.
    async fn presigned_url(&self, locator: &str, ttl: Duration)
        -> Result<String, ObjectStoreError>;
}

/// Locator of a job's uploaded input.
pub fn input_locator(job_id: &str, file_name: &str) -> String {
    format!("jobs/{job_id}/inputs/{file_name}")
}

/// Locator of a file produced by a stage.
pub fn stage_output_locator(job_id: &str, stage: &str, file_name: &str) -> String {
    format!("jobs/{job_id}/{stage}/{file_name}")
}

/// Filesystem-backed object store.
pub struct LocalObjectStore {
    base_path: PathBuf,
    base_url: String,
    secret: String,
}

impl LocalObjectStore {
    /// # Arguments
    ///
    /// * `base_path` - Directory holding the objects
    /// * `base_url` - Public URL prefix the objects are served under
    /// * `secret` - Key used to sign download URLs
    pub fn new(
        base_path: impl Into<PathBuf>,
        base_url: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            base_path: base_path.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret: secret.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Maps a locator to a path under the base directory.
    ///
    /// Absolute locators and `..` components are rejected so that no locator
    /// can address a file outside the store.
    fn resolve(&self, locator: &str) -> Result<PathBuf, ObjectStoreError> {
        let relative = Path::new(locator);
        let valid = !locator.is_empty()
            && !locator.contains('\\')
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));

        if !valid {
            return Err(ObjectStoreError::InvalidLocator(locator.to_string()));
        }

        Ok(self.base_path.join(relative))
    }

    fn signature(&self, locator: &str, expires: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b"\n");
        hasher.update(locator.as_bytes());
        hasher.update(b"\n");
        hasher.update(expires.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Checks a signature produced by [`ObjectStore::presigned_url`].
    pub fn verify_signature(&self, locator: &str, expires: i64, signature: &str) -> bool {
        expires >= Utc::now().timestamp() && self.signature(locator, expires) == signature
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, locator: &str, bytes: Vec<u8>) -> Result<String, ObjectStoreError> {
        let path = self.resolve(locator)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write then rename so readers never observe a partial object.
        let staging = path.with_extension(format!("partial-{}", Uuid::new_v4().simple()));
        let mut file = fs::File::create(&staging).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&staging, &path).await?;

        Ok(locator.to_string())
    }

    async fn get(&self, locator: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let path = self.resolve(locator)?;
        fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ObjectStoreError::NotFound(locator.to_string())
            } else {
                ObjectStoreError::Io(e)
            }
        })
    }

    async fn delete(&self, locator: &str) -> Result<(), ObjectStoreError> {
        let path = self.resolve(locator)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ObjectStoreError::Io(e)),
        }
    }

    async fn presigned_url(
        &self,
        locator: &str,
        ttl: Duration,
    ) -> Result<String, ObjectStoreError> {
        self.resolve(locator)?;

        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        let encoded: Vec<String> = locator
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();

        Ok(format!(
            "{}/{}?expires={}&signature={}",
            self.base_url,
            encoded.join("/"),
            expires,
            self.signature(locator, expires)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> LocalObjectStore {
        LocalObjectStore::new(dir.path(), "http://files.local/objects/", "s3cret")
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let locator = input_locator("job-1", "target.pdb");

        let stored = store.put(&locator, b"ATOM 1".to_vec()).await.unwrap();
        assert_eq!(stored, "jobs/job-1/inputs/target.pdb");
        assert_eq!(store.get(&locator).await.unwrap(), b"ATOM 1");

        store.delete(&locator).await.unwrap();
        assert!(matches!(
            store.get(&locator).await,
            Err(ObjectStoreError::NotFound(_))
        ));
        store.delete(&locator).await.unwrap();
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store.put("a/b.pdb", b"one".to_vec()).await.unwrap();
        store.put("a/b.pdb", b"two".to_vec()).await.unwrap();

        assert_eq!(store.get("a/b.pdb").await.unwrap(), b"two");
        let entries: Vec<_> = std::fs::read_dir(dir.path().join("a")).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_escaping_locators() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        for locator in ["", "/etc/passwd", "jobs/../../x", "jobs\\x", "./jobs/x"] {
            assert!(
                matches!(
                    store.put(locator, Vec::new()).await,
                    Err(ObjectStoreError::InvalidLocator(_))
                ),
                "{locator}"
            );
        }
    }

    #[tokio::test]
    async fn test_presigned_url_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let locator = stage_output_locator("job-1", "prediction", "model 1.pdb");

        let url = store
            .presigned_url(&locator, Duration::from_secs(60))
            .await
            .unwrap();

        assert!(url.starts_with("http://files.local/objects/jobs/job-1/prediction/model%201.pdb?expires="));
        let query = url.split_once('?').unwrap().1;
        let mut expires = 0;
        let mut signature = "";
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("expires", value)) => expires = value.parse().unwrap(),
                Some(("signature", value)) => signature = value,
                _ => {}
            }
        }

        assert!(store.verify_signature(&locator, expires, signature));
        assert!(!store.verify_signature("jobs/job-2/x.pdb", expires, signature));
        assert!(!store.verify_signature(&locator, expires - 7200, signature));
    }
}
