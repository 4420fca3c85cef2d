use super::*;
use tracing::*;

/// Stores objects as files on the local disk, sharded by the first two characters of their hash.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, hash: &ContentHash) -> PathBuf {
        let hex = hash.as_str();
        let shard = hex.get(0..2).unwrap_or("00");
        self.root.join(shard).join(hex)
    }

    fn io_error(path: &std::path::Path) -> impl FnOnce(std::io::Error) -> ObjectStoreError + '_ {
        move |err| ObjectStoreError::Io {
            path: path.to_path_buf(),
            err,
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    #[tracing::instrument(name = "LocalObjectStore::put", skip(self, data))]
    async fn put(&self, data: &[u8]) -> Result<ObjectRef, ObjectStoreError> {
        let hash = ContentHash::of(data);
        let path = self.path_for(&hash);
        let object = ObjectRef {
            hash,
            size: data.len() as u64,
        };

        if tokio::fs::metadata(&path).await.is_ok() {
            return Ok(object);
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(Self::io_error(parent))?;
        }

        // Write to a sibling first so readers never observe a partial object.
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, data)
            .await
            .map_err(Self::io_error(&tmp))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(Self::io_error(&path))?;

        debug!("Stored object {} ({} bytes)", object.hash, object.size);
        Ok(object)
    }

    async fn get(&self, hash: &ContentHash) -> Result<Vec<u8>, ObjectStoreError> {
        let path = self.path_for(hash);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(ObjectStoreError::ObjectNotFound { hash: hash.clone() })
            }
            Err(err) => Err(ObjectStoreError::Io { path, err }),
        }
    }

    async fn exists(&self, hash: &ContentHash) -> Result<bool, ObjectStoreError> {
        Ok(tokio::fs::metadata(self.path_for(hash)).await.is_ok())
    }

    async fn list_refs(&self) -> Result<Vec<ObjectRef>, ObjectStoreError> {
        let mut refs = vec![];
        let mut shards = match tokio::fs::read_dir(&self.root).await {
            Ok(shards) => shards,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(refs),
            Err(err) => {
                return Err(ObjectStoreError::Io {
                    path: self.root.clone(),
                    err,
                })
            }
        };

        while let Some(shard) = shards
            .next_entry()
            .await
            .map_err(Self::io_error(&self.root))?
        {
            let shard_path = shard.path();
            let mut objects = tokio::fs::read_dir(&shard_path)
                .await
                .map_err(Self::io_error(&shard_path))?;
            while let Some(object) = objects
                .next_entry()
                .await
                .map_err(Self::io_error(&shard_path))?
            {
                let name = object.file_name().to_string_lossy().to_string();
                if name.contains(".tmp-") {
                    continue;
                }
                let size = object
                    .metadata()
                    .await
                    .map_err(Self::io_error(&shard_path))?
                    .len();
                refs.push(ObjectRef {
                    hash: ContentHash::from_hex(name),
                    size,
                });
            }
        }

        Ok(refs)
    }

    async fn delete(&self, hash: &ContentHash) -> Result<(), ObjectStoreError> {
        let path = self.path_for(hash);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ObjectStoreError::Io { path, err }),
        }
    }
}
