//! # Content-addressed object storage
//!
//! Blobs are keyed by the SHA-256 of their content. Commits only ever hold [ObjectRef]s, so
//! reusing a datum's output or seeding an incremental commit never copies bytes.
//!
mod local;
mod memory;

pub use local::*;
pub use memory::*;

use crate::model::{ContentHash, ObjectRef};
use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::*;

#[async_trait]
pub trait ObjectStore: Sync + Send {
    /// Store a blob and return a reference to it. Putting the same bytes twice is a no-op.
    async fn put(&self, data: &[u8]) -> Result<ObjectRef, ObjectStoreError>;

    async fn get(&self, hash: &ContentHash) -> Result<Vec<u8>, ObjectStoreError>;

    async fn exists(&self, hash: &ContentHash) -> Result<bool, ObjectStoreError>;

    /// Every object currently stored. Meant for garbage collection: objects referenced by
    /// in-flight jobs are listed like any other.
    async fn list_refs(&self) -> Result<Vec<ObjectRef>, ObjectStoreError>;

    async fn delete(&self, hash: &ContentHash) -> Result<(), ObjectStoreError>;
}

#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("Object {hash} does not exist")]
    ObjectNotFound { hash: ContentHash },

    #[error("Could not access object storage at {path:?} due to {err:?}")]
    Io { path: PathBuf, err: std::io::Error },
}
