use super::{CommitId, ContentHash, JobId};
use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// A reference to a blob in the object store.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub hash: ContentHash,
    pub size: u64,
}

/// A file in a commit. Its content is the concatenation of its objects, in order.
///
/// Files written once have exactly one object. Output files that several datums wrote to carry
/// one object per contribution.
///
#[derive(Default, Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub objects: Vec<ObjectRef>,
}

impl FileEntry {
    pub fn single(object: ObjectRef) -> Self {
        Self {
            objects: vec![object],
        }
    }

    pub fn size(&self) -> u64 {
        self.objects.iter().map(|o| o.size).sum()
    }

    /// The hash that identifies this file's content. For single-object files this is the hash of
    /// the object itself.
    pub fn hash(&self) -> ContentHash {
        match self.objects.as_slice() {
            [only] => only.hash.clone(),
            objects => {
                let mut hasher = Sha256::new();
                for object in objects {
                    hasher.update(object.hash.as_str().as_bytes());
                }
                ContentHash::from_hex(hex::encode(hasher.finalize()))
            }
        }
    }

    pub fn append(&mut self, other: &FileEntry) {
        self.objects.extend(other.objects.iter().cloned());
    }
}

/// The content of a commit: a sorted mapping of absolute paths (always starting with `/`) to
/// files. Directories are implied by the paths of the files in them.
///
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileTree {
    files: BTreeMap<String, FileEntry>,
}

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize a user provided path into an absolute path without trailing slashes.
    pub fn clean_path(path: &str) -> String {
        let parts: Vec<&str> = path
            .split('/')
            .filter(|p| !p.is_empty() && *p != ".")
            .collect();
        format!("/{}", parts.join("/"))
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.files.get(&Self::clean_path(path))
    }

    pub fn insert(&mut self, path: &str, entry: FileEntry) {
        self.files.insert(Self::clean_path(path), entry);
    }

    /// Append the content of `entry` to the file at `path`, creating it if needed.
    pub fn append(&mut self, path: &str, entry: &FileEntry) {
        self.files
            .entry(Self::clean_path(path))
            .or_default()
            .append(entry);
    }

    /// Remove a file, or every file under a directory. Returns how many files were removed.
    pub fn remove(&mut self, path: &str) -> usize {
        let path = Self::clean_path(path);
        if path == "/" {
            let count = self.files.len();
            self.files.clear();
            return count;
        }
        let prefix = format!("{}/", path);
        let before = self.files.len();
        self.files
            .retain(|p, _| *p != path && !p.starts_with(&prefix));
        before - self.files.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FileEntry)> {
        self.files.iter()
    }

    /// Every file at or under `path`.
    pub fn walk(&self, path: &str) -> impl Iterator<Item = (&String, &FileEntry)> {
        let path = Self::clean_path(path);
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.files
            .iter()
            .filter(move |(p, _)| **p == path || p.starts_with(&prefix))
    }

    /// Every directory implied by the paths in this tree, excluding the root.
    pub fn directories(&self) -> BTreeSet<String> {
        let mut dirs = BTreeSet::new();
        for path in self.files.keys() {
            let mut current = String::new();
            let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
            for segment in segments.iter().take(segments.len().saturating_sub(1)) {
                current.push('/');
                current.push_str(segment);
                dirs.insert(current.clone());
            }
        }
        dirs
    }

    pub fn is_dir(&self, path: &str) -> bool {
        let path = Self::clean_path(path);
        path == "/" || self.directories().contains(&path)
    }

    /// The immediate children of a directory.
    pub fn list(&self, dir: &str) -> Vec<FileInfo> {
        let dir = Self::clean_path(dir);
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{}/", dir)
        };

        let mut children: BTreeMap<String, FileInfo> = BTreeMap::new();
        for (path, entry) in self.walk(&dir) {
            if *path == dir {
                children.insert(path.clone(), FileInfo::file(path, entry));
                continue;
            }
            let rest = &path[prefix.len()..];
            match rest.split_once('/') {
                None => {
                    children.insert(path.clone(), FileInfo::file(path, entry));
                }
                Some((child, _)) => {
                    let child_path = format!("{}{}", prefix, child);
                    let info = children
                        .entry(child_path.clone())
                        .or_insert_with(|| FileInfo::dir(&child_path));
                    info.size_bytes += entry.size();
                }
            }
        }
        children.into_values().collect()
    }

    /// Overlay every file in `other` on top of this tree.
    pub fn overlay(&mut self, other: &FileTree) {
        for (path, entry) in other.iter() {
            self.files.insert(path.clone(), entry.clone());
        }
    }

    /// Concatenate every file in `other` onto this tree.
    pub fn concat(&mut self, other: &FileTree) {
        for (path, entry) in other.iter() {
            self.append(path, entry);
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.files.values().map(|f| f.size()).sum()
    }

    pub fn objects(&self) -> impl Iterator<Item = &ObjectRef> {
        self.files.values().flat_map(|f| f.objects.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    File,
    Dir,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    pub file_type: FileType,
    pub size_bytes: u64,
    pub hash: Option<ContentHash>,
}

impl FileInfo {
    fn file(path: &str, entry: &FileEntry) -> Self {
        Self {
            path: path.to_string(),
            file_type: FileType::File,
            size_bytes: entry.size(),
            hash: Some(entry.hash()),
        }
    }

    fn dir(path: &str) -> Self {
        Self {
            path: path.to_string(),
            file_type: FileType::Dir,
            size_bytes: 0,
            hash: None,
        }
    }
}

/// Marks an output commit with the pipeline version that produced it.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub pipeline: String,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub id: CommitId,
    pub repo: String,
    pub branch: String,
    pub parent: Option<CommitId>,

    /// Every commit, in any repo, that is causally responsible for this one. Always transitively
    /// closed.
    pub provenance: BTreeSet<CommitId>,

    pub origin: Option<Origin>,

    /// The job writing into this commit, for output commits.
    pub job: Option<JobId>,

    #[serde(with = "crate::util::serde::iso8601")]
    pub started: DateTime<Utc>,

    #[serde(with = "crate::util::serde::option_iso8601")]
    pub finished: Option<DateTime<Utc>>,

    pub tree: FileTree,
}

impl CommitInfo {
    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    pub fn size_bytes(&self) -> u64 {
        self.tree.size_bytes()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoInfo {
    pub name: String,
    pub branches: BTreeMap<String, Option<CommitId>>,
    pub commit_count: usize,
    pub size_bytes: u64,
}
