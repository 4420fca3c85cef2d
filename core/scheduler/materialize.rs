use super::SchedulerError;
use crate::model::{Datum, FileEntry, FileTree, JobId, ObjectRef};
use crate::objects::ObjectStore;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::*;

/// The directory user code runs against: one directory per input name holding the datum's
/// files, next to an `out` directory for its output.
#[derive(Debug)]
pub(crate) struct DatumView {
    root: PathBuf,
}

fn view_error(path: &Path) -> impl FnOnce(std::io::Error) -> SchedulerError + '_ {
    move |err| SchedulerError::ViewError {
        path: path.to_path_buf(),
        err,
    }
}

impl DatumView {
    /// Create a fresh, empty view. Leftovers from earlier attempts are removed.
    pub(crate) async fn create(
        scratch_root: &Path,
        job: JobId,
        index: usize,
        inputs: &[String],
    ) -> Result<Self, SchedulerError> {
        let root = scratch_root.join(job.to_string()).join(index.to_string());
        if fs::metadata(&root).await.is_ok() {
            fs::remove_dir_all(&root).await.map_err(view_error(&root))?;
        }
        let out = root.join("out");
        fs::create_dir_all(&out).await.map_err(view_error(&out))?;
        for input in inputs {
            let dir = root.join(input);
            fs::create_dir_all(&dir).await.map_err(view_error(&dir))?;
        }
        Ok(Self { root })
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn out(&self) -> PathBuf {
        self.root.join("out")
    }

    async fn write_entry(
        &self,
        objects: &dyn ObjectStore,
        dest: &Path,
        entry: &FileEntry,
    ) -> Result<u64, SchedulerError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await.map_err(view_error(parent))?;
        }
        let mut data = Vec::with_capacity(entry.size() as usize);
        for object in &entry.objects {
            data.extend(objects.get(&object.hash).await?);
        }
        fs::write(dest, &data).await.map_err(view_error(dest))?;
        Ok(data.len() as u64)
    }

    /// Write every input file of the datum into the view. Returns how many bytes were written.
    pub(crate) async fn download(
        &self,
        objects: &dyn ObjectStore,
        datum: &Datum,
    ) -> Result<u64, SchedulerError> {
        let mut bytes = 0;
        for file in &datum.files {
            let dest = self
                .root
                .join(&file.input)
                .join(file.path.trim_start_matches('/'));
            bytes += self.write_entry(objects, &dest, &file.entry).await?;
        }
        Ok(bytes)
    }

    /// Write a previous output into the `out` directory.
    pub(crate) async fn seed_output(
        &self,
        objects: &dyn ObjectStore,
        tree: &FileTree,
    ) -> Result<u64, SchedulerError> {
        let out = self.out();
        let mut bytes = 0;
        for (path, entry) in tree.iter() {
            let dest = out.join(path.trim_start_matches('/'));
            bytes += self.write_entry(objects, &dest, entry).await?;
        }
        Ok(bytes)
    }

    /// Store everything under `out` and return it as a tree, along with how many bytes it holds.
    pub(crate) async fn upload(
        &self,
        objects: &dyn ObjectStore,
    ) -> Result<(FileTree, u64), SchedulerError> {
        let out = self.out();
        let mut tree = FileTree::new();
        let mut bytes = 0;
        let mut pending = vec![out.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await.map_err(view_error(&dir))?;
            while let Some(entry) = entries.next_entry().await.map_err(view_error(&dir))? {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(view_error(&path))?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let data = fs::read(&path).await.map_err(view_error(&path))?;
                let object: ObjectRef = objects.put(&data).await?;
                bytes += object.size;
                let relative = path.strip_prefix(&out).unwrap_or(&path);
                tree.insert(&relative.to_string_lossy(), FileEntry::single(object));
            }
        }

        Ok((tree, bytes))
    }

    pub(crate) async fn remove(self) {
        if let Err(err) = fs::remove_dir_all(&self.root).await {
            debug!("Could not clean up datum view {:?}: {:?}", self.root, err);
        }
    }
}
