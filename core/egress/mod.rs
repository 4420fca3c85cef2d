//! # Egress
//!
//! Copies the output of a successful job somewhere outside of the commit graph. Only `file://`
//! destinations are understood.
//!

use crate::model::FileTree;
use crate::objects::{ObjectStore, ObjectStoreError};
use std::path::PathBuf;
use thiserror::*;
use tracing::*;
use url::Url;

#[derive(Error, Debug)]
pub enum EgressError {
    #[error("{url:?} is not a valid egress url: {err}")]
    InvalidUrl { url: String, err: url::ParseError },

    #[error("egress to {scheme}:// is not supported, only file:// is")]
    UnsupportedScheme { scheme: String },

    #[error("egress could not write {path:?} due to {err:?}")]
    Io { path: PathBuf, err: std::io::Error },

    #[error(transparent)]
    ObjectStoreError(ObjectStoreError),
}

impl From<ObjectStoreError> for EgressError {
    fn from(value: ObjectStoreError) -> Self {
        EgressError::ObjectStoreError(value)
    }
}

/// Write every file of `tree` under the destination.
#[instrument(name = "egress::push", skip(tree, objects))]
pub async fn push(url: &str, tree: &FileTree, objects: &dyn ObjectStore) -> Result<(), EgressError> {
    let parsed = Url::parse(url).map_err(|err| EgressError::InvalidUrl {
        url: url.to_string(),
        err,
    })?;

    if parsed.scheme() != "file" {
        return Err(EgressError::UnsupportedScheme {
            scheme: parsed.scheme().to_string(),
        });
    }

    let root = PathBuf::from(parsed.path());
    for (path, entry) in tree.iter() {
        let dest = root.join(path.trim_start_matches('/'));
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| EgressError::Io {
                    path: parent.to_path_buf(),
                    err,
                })?;
        }
        let mut data = Vec::with_capacity(entry.size() as usize);
        for object in &entry.objects {
            data.extend(objects.get(&object.hash).await?);
        }
        tokio::fs::write(&dest, data)
            .await
            .map_err(|err| EgressError::Io { path: dest, err })?;
    }

    debug!("Pushed {} files to {}", tree.len(), url);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FileEntry;
    use crate::objects::MemoryObjectStore;
    use assert_fs::prelude::*;

    async fn tree(objects: &MemoryObjectStore) -> FileTree {
        let mut tree = FileTree::new();
        let object = objects.put(b"foo").await.unwrap();
        tree.insert("/a/file", FileEntry::single(object));
        tree
    }

    #[tokio::test]
    async fn file_urls_receive_the_tree() {
        let dest = assert_fs::TempDir::new().unwrap();
        let objects = MemoryObjectStore::new();
        let url = format!("file://{}", dest.path().display());

        push(&url, &tree(&objects).await, &objects).await.unwrap();
        dest.child("a/file").assert("foo");
    }

    #[tokio::test]
    async fn other_schemes_are_rejected() {
        let objects = MemoryObjectStore::new();
        let err = push("s3://bucket/path", &tree(&objects).await, &objects)
            .await
            .unwrap_err();
        assert_matches!(err, EgressError::UnsupportedScheme { ref scheme } if scheme == "s3");
        assert!(err.to_string().contains("egress"));
    }
}
