//! # Commit Graph
//!
//! Repos own branches, branches point at commits, and commits carry their (transitively closed)
//! provenance. Everything downstream of here reacts to the [GraphEvent]s a graph publishes.
//!
//! The graph is the only place where an output commit for a `(pipeline, version, provenance)`
//! triple can be claimed: [CommitGraph::start_output_commit] is a compare-and-swap, so any number
//! of propagators can race on it and only one of them creates the commit.
//!
mod memory;

pub use memory::*;

use crate::model::{CommitId, CommitInfo, FileInfo, FileTree, JobId, Origin, RepoInfo};
use crate::objects::ObjectStoreError;
use async_trait::async_trait;
use std::collections::BTreeSet;
use thiserror::*;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphEvent {
    RepoCreated {
        repo: String,
    },
    RepoDeleted {
        repo: String,
    },
    CommitStarted {
        repo: String,
        branch: String,
        commit: CommitId,
    },
    CommitFinished {
        repo: String,
        branch: String,
        commit: CommitId,
    },
    /// A delete cascaded over these commits. Branch heads have already been moved back to the
    /// nearest surviving ancestors.
    CommitsDeleted {
        commits: Vec<CommitInfo>,
    },
}

/// Everything needed to claim an output commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputCommitRequest {
    pub repo: String,
    pub branch: String,
    pub provenance: BTreeSet<CommitId>,
    pub origin: Origin,
    /// The job that will write the commit, if this request wins.
    pub job: JobId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputCommit {
    /// This request won, and the commit is now the head of its branch.
    Created(CommitInfo),
    /// A commit with the same origin and provenance already exists.
    Existing(CommitInfo),
}

#[async_trait]
pub trait CommitGraph: Sync + Send {
    async fn create_repo(&self, repo: &str) -> Result<(), GraphError>;

    /// Create a repo unless it already exists.
    async fn ensure_repo(&self, repo: &str) -> Result<(), GraphError>;

    /// Delete a repo and every commit in it. Repos whose commits are the provenance of commits in
    /// other repos can only be deleted with `force`, which deletes those commits as well.
    async fn delete_repo(&self, repo: &str, force: bool) -> Result<Vec<CommitInfo>, GraphError>;

    async fn inspect_repo(&self, repo: &str) -> Result<RepoInfo, GraphError>;

    async fn list_repos(&self) -> Result<Vec<RepoInfo>, GraphError>;

    /// Start a user commit on a branch. The new commit starts out with the content of the
    /// branch's head, which must be finished.
    async fn start_commit(&self, repo: &str, branch: &str) -> Result<CommitInfo, GraphError>;

    /// Atomically claim the output commit for a request.
    async fn start_output_commit(
        &self,
        request: OutputCommitRequest,
    ) -> Result<OutputCommit, GraphError>;

    async fn finish_commit(&self, commit: CommitId) -> Result<CommitInfo, GraphError>;

    async fn put_file(&self, commit: CommitId, path: &str, data: &[u8]) -> Result<(), GraphError>;

    async fn append_file(
        &self,
        commit: CommitId,
        path: &str,
        data: &[u8],
    ) -> Result<(), GraphError>;

    async fn delete_file(&self, commit: CommitId, path: &str) -> Result<(), GraphError>;

    /// Replace the whole tree of an open commit.
    async fn put_tree(&self, commit: CommitId, tree: FileTree) -> Result<(), GraphError>;

    async fn get_file(&self, commit: CommitId, path: &str) -> Result<Vec<u8>, GraphError>;

    async fn list_file(&self, commit: CommitId, path: &str) -> Result<Vec<FileInfo>, GraphError>;

    async fn inspect_commit(&self, commit: CommitId) -> Result<CommitInfo, GraphError>;

    /// Every commit in a repo, newest first.
    async fn list_commit(&self, repo: &str) -> Result<Vec<CommitInfo>, GraphError>;

    async fn branch_head(&self, repo: &str, branch: &str)
        -> Result<Option<CommitInfo>, GraphError>;

    /// Delete a commit and every commit whose provenance includes it.
    async fn delete_commit(&self, commit: CommitId) -> Result<Vec<CommitInfo>, GraphError>;

    /// Subscribe to every event published after this call.
    fn subscribe(&self) -> broadcast::Receiver<GraphEvent>;
}

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Repo {repo} does not exist")]
    RepoNotFound { repo: String },

    #[error("Repo {repo} already exists")]
    RepoAlreadyExists { repo: String },

    #[error("{repo:?} is not a valid repo name, only letters, numbers, `-` and `_` are allowed")]
    InvalidRepoName { repo: String },

    #[error("Repo {repo} is the provenance of commits in {dependents:?}, use force to delete it")]
    RepoHasDependents {
        repo: String,
        dependents: Vec<String>,
    },

    #[error("Commit {commit} does not exist")]
    CommitNotFound { commit: CommitId },

    #[error("Commit {commit} has already been finished")]
    CommitFinished { commit: CommitId },

    #[error("Cannot start a commit on {repo}@{branch}, its head {commit} is not finished")]
    ParentNotFinished {
        repo: String,
        branch: String,
        commit: CommitId,
    },

    #[error("File {path} does not exist in commit {commit}")]
    FileNotFound { commit: CommitId, path: String },

    #[error(transparent)]
    ObjectStoreError(ObjectStoreError),
}

impl From<ObjectStoreError> for GraphError {
    fn from(value: ObjectStoreError) -> Self {
        GraphError::ObjectStoreError(value)
    }
}

pub(crate) fn is_valid_repo_name(repo: &str) -> bool {
    !repo.is_empty()
        && repo
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
