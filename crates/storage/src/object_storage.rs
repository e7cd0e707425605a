//! Filesystem-backed media storage for frame and crop JPEGs.
//!
//! Frame assets use a deterministic path keyed by camera, frame id, and a
//! `_person`/`_vehicle` tag, so the same frame written twice (once per
//! Event Writer stage) lands on the same path and can be deduplicated by a
//! database-level unique constraint. Crop assets always get a fresh `Uuid`
//! path since every detection's crop is unique.

use crate::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Filesystem media store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemConfig {
    /// Root directory all media paths are relative to.
    pub root: String,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            root: std::env::var("MEDIA_ROOT").unwrap_or_else(|_| "./data/media".to_string()),
        }
    }
}

/// Storage for large binary frame/crop assets, addressed by a relative path
/// string that is also the primary key callers use to reference them later
/// (stored verbatim in `media_assets.path`).
#[async_trait::async_trait]
pub trait MediaStore: Send + Sync {
    /// Deterministic path for a frame asset, tagged by event type
    /// (`"person"`/`"vehicle"`): `frame/{frame_id}_{tag}.jpg`.
    fn frame_path(&self, frame_id: Uuid, tag: &str) -> String;

    /// Fresh, always-unique path for a detection crop:
    /// `{media_type}/{frame_id}_{uuid}.jpg`, where `media_type` is
    /// `"person_crop"` or `"vehicle_crop"`.
    fn crop_path(&self, media_type: &str, frame_id: Uuid) -> String;

    /// Write bytes to `path`, creating parent directories as needed.
    async fn write(&self, path: &str, data: &[u8]) -> StorageResult<()>;

    /// Read bytes back from `path`.
    async fn read(&self, path: &str) -> StorageResult<Vec<u8>>;
}

pub struct FilesystemMediaStore {
    root: PathBuf,
}

impl FilesystemMediaStore {
    pub fn new(config: FilesystemConfig) -> StorageResult<Self> {
        let root = PathBuf::from(config.root);
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait::async_trait]
impl MediaStore for FilesystemMediaStore {
    fn frame_path(&self, frame_id: Uuid, tag: &str) -> String {
        format!("frame/{frame_id}_{tag}.jpg")
    }

    fn crop_path(&self, media_type: &str, frame_id: Uuid) -> String {
        format!("{media_type}/{frame_id}_{}.jpg", Uuid::new_v4())
    }

    async fn write(&self, path: &str, data: &[u8]) -> StorageResult<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, data).await?;
        Ok(())
    }

    async fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        let full = self.resolve(path);
        tokio::fs::read(&full)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => StorageError::NotFound(path.to_string()),
                _ => StorageError::Io(e),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemMediaStore::new(FilesystemConfig {
            root: dir.path().to_str().unwrap().to_string(),
        })
        .unwrap();

        store.write("cam1/a.jpg", b"hello").await.unwrap();
        let data = store.read("cam1/a.jpg").await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemMediaStore::new(FilesystemConfig {
            root: dir.path().to_str().unwrap().to_string(),
        })
        .unwrap();

        let err = store.read("nope.jpg").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[test]
    fn test_frame_path_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemMediaStore::new(FilesystemConfig {
            root: dir.path().to_str().unwrap().to_string(),
        })
        .unwrap();
        let frame_id = Uuid::nil();
        let a = store.frame_path(frame_id, "person");
        let b = store.frame_path(frame_id, "person");
        assert_eq!(a, b);
        assert_ne!(a, store.frame_path(frame_id, "vehicle"));
        assert!(a.starts_with("frame/"));
    }

    #[test]
    fn test_crop_path_is_unique() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemMediaStore::new(FilesystemConfig {
            root: dir.path().to_str().unwrap().to_string(),
        })
        .unwrap();
        let frame_id = Uuid::nil();
        assert_ne!(
            store.crop_path("person_crop", frame_id),
            store.crop_path("person_crop", frame_id)
        );
        assert!(store.crop_path("vehicle_crop", frame_id).starts_with("vehicle_crop/"));
    }
}
