//! Storage layer for the camera pipeline.
//!
//! Two backends, split the same way the pipeline itself splits large binary
//! data from structured facts:
//! - [`object_storage`]: filesystem-backed [`MediaStore`] for frame and crop
//!   JPEGs.
//! - [`metadata_storage`]: `PostgreSQL`-backed [`EventStore`] for
//!   `media_assets`/`person_events`/`vehicle_events`/`notifications`/`jobs`/
//!   `settings`, including the transactional per-bundle writer from the
//!   Event Writer stage.
//!
//! # Example
//!
//! ```rust,no_run
//! use camwatch_storage::{StorageConfig, object_storage::{MediaStore, FilesystemMediaStore}};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = StorageConfig::default();
//!     let media = FilesystemMediaStore::new(config.filesystem)?;
//!     media.write(&"cam1/frame.jpg".to_string(), b"jpeg bytes").await?;
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod metadata_storage;
pub mod object_storage;

pub use metadata_storage::{EventStore, PostgresConfig, PostgresEventStore};
pub use object_storage::{FilesystemConfig, FilesystemMediaStore, MediaStore};

/// Storage layer errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("postgres error: {0}")]
    Postgres(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for camwatch_common::PipelineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Io(e) => camwatch_common::PipelineError::IoError(e),
            other => camwatch_common::PipelineError::EventStore(other.to_string()),
        }
    }
}

/// Complete storage configuration for both backends.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub filesystem: FilesystemConfig,

    #[serde(default)]
    pub postgres: PostgresConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_config_default() {
        let config = StorageConfig::default();
        assert_eq!(config.postgres.database, "camwatch");
    }
}
