//! Persisted key share.
//!
//! One JSON document per node (`keygen.json` in the data directory). The
//! engine-specific share material is kept opaque; the envelope records the
//! cluster shape it was generated for so signing can refuse a share that
//! does not match the command.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const KEY_SHARE_FILE: &str = "keygen.json";

/// Current on-disk format version.
pub const STORE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no key share at {0}")]
    NotFound(PathBuf),

    #[error("key share I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt key share at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredKeyShare {
    pub version: u32,
    pub party: String,
    pub parties: Vec<String>,
    pub threshold: u16,
    /// Name of the engine that produced `share`.
    pub engine: String,
    pub public_key_hex: String,
    pub address: String,
    pub created_at: DateTime<Utc>,
    pub share: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct KeyShareStore {
    dir: PathBuf,
}

impl KeyShareStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(KEY_SHARE_FILE)
    }

    pub async fn load(&self) -> Result<StoredKeyShare, StoreError> {
        let path = self.path();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(path))
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        let stored: StoredKeyShare =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        if stored.version != STORE_VERSION {
            return Err(StoreError::Corrupt {
                path,
                reason: format!("unsupported version {}", stored.version),
            });
        }
        Ok(stored)
    }

    /// Overwrite the stored share. Written to a temp file and renamed so a
    /// crash never leaves a truncated document behind.
    pub async fn save(&self, share: &StoredKeyShare) -> Result<(), StoreError> {
        let path = self.path();
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(io_err(&self.dir))?;
        let json = serde_json::to_vec_pretty(share).map_err(|e| StoreError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let tmp = self.dir.join(format!("{}.tmp", KEY_SHARE_FILE));
        tokio::fs::write(&tmp, &json).await.map_err(io_err(&tmp))?;
        restrict_permissions(&tmp).await.map_err(io_err(&tmp))?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err(&path))?;

        info!("Saved key share to {:?}", path);
        Ok(())
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError {
    let path = path.to_path_buf();
    move |source| StoreError::Io { path, source }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
