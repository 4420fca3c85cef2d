use super::*;
use crate::model::FileEntry;
use crate::objects::ObjectStore;
use crate::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::*;

const EVENT_CAPACITY: usize = 4096;

#[derive(Default, Debug)]
struct RepoState {
    branches: BTreeMap<String, Option<CommitId>>,
    /// Commits in creation order.
    commits: Vec<CommitId>,
}

#[derive(Default, Debug)]
struct GraphState {
    repos: BTreeMap<String, RepoState>,
    commits: HashMap<CommitId, CommitInfo>,
}

impl GraphState {
    fn repo(&self, repo: &str) -> Result<&RepoState, GraphError> {
        self.repos.get(repo).ok_or_else(|| GraphError::RepoNotFound {
            repo: repo.to_string(),
        })
    }

    fn repo_mut(&mut self, repo: &str) -> Result<&mut RepoState, GraphError> {
        self.repos
            .get_mut(repo)
            .ok_or_else(|| GraphError::RepoNotFound {
                repo: repo.to_string(),
            })
    }

    fn commit(&self, commit: CommitId) -> Result<&CommitInfo, GraphError> {
        self.commits
            .get(&commit)
            .ok_or(GraphError::CommitNotFound { commit })
    }

    fn open_commit_mut(&mut self, commit: CommitId) -> Result<&mut CommitInfo, GraphError> {
        let info = self
            .commits
            .get_mut(&commit)
            .ok_or(GraphError::CommitNotFound { commit })?;
        if info.is_finished() {
            return Err(GraphError::CommitFinished { commit });
        }
        Ok(info)
    }

    fn repo_info(&self, name: &str, repo: &RepoState) -> RepoInfo {
        let size_bytes = repo
            .branches
            .values()
            .flatten()
            .filter_map(|c| self.commits.get(c))
            .map(|c| c.size_bytes())
            .sum();
        RepoInfo {
            name: name.to_string(),
            branches: repo.branches.clone(),
            commit_count: repo.commits.len(),
            size_bytes,
        }
    }

    /// Remove a set of commits, relinking the parents of survivors and moving branch heads back to
    /// the nearest surviving ancestor.
    fn remove_commits(&mut self, victims: &HashSet<CommitId>) -> Vec<CommitInfo> {
        let survivor_of = |state: &GraphState, mut current: Option<CommitId>| {
            while let Some(id) = current {
                if !victims.contains(&id) {
                    return Some(id);
                }
                current = state.commits.get(&id).and_then(|c| c.parent);
            }
            None
        };

        let relinks: Vec<(CommitId, Option<CommitId>)> = self
            .commits
            .values()
            .filter(|c| !victims.contains(&c.id))
            .filter(|c| c.parent.map(|p| victims.contains(&p)).unwrap_or(false))
            .map(|c| (c.id, survivor_of(self, c.parent)))
            .collect();

        let mut head_moves = vec![];
        for (repo_name, repo) in &self.repos {
            for (branch, head) in &repo.branches {
                if head.map(|h| victims.contains(&h)).unwrap_or(false) {
                    head_moves.push((repo_name.clone(), branch.clone(), survivor_of(self, *head)));
                }
            }
        }

        for (id, parent) in relinks {
            if let Some(commit) = self.commits.get_mut(&id) {
                commit.parent = parent;
            }
        }

        for (repo, branch, head) in head_moves {
            if let Some(repo) = self.repos.get_mut(&repo) {
                repo.branches.insert(branch, head);
            }
        }

        let mut removed = vec![];
        for repo in self.repos.values_mut() {
            repo.commits.retain(|c| !victims.contains(c));
        }
        for victim in victims {
            if let Some(info) = self.commits.remove(victim) {
                removed.push(info);
            }
        }
        removed.sort_by_key(|c| c.started);
        removed
    }

    /// A commit and every commit that has it in its provenance.
    fn cascade(&self, root: CommitId) -> HashSet<CommitId> {
        let mut victims: HashSet<CommitId> = self
            .commits
            .values()
            .filter(|c| c.provenance.contains(&root))
            .map(|c| c.id)
            .collect();
        victims.insert(root);
        victims
    }
}

/// An in-memory commit graph. File contents live in the [ObjectStore] it was built with.
///
pub struct MemoryCommitGraph {
    state: RwLock<GraphState>,
    objects: Arc<dyn ObjectStore>,
    events: broadcast::Sender<GraphEvent>,
}

impl MemoryCommitGraph {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: RwLock::new(GraphState::default()),
            objects,
            events,
        }
    }

    fn publish(&self, event: GraphEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn read(&self) -> RwLockReadGuard<'_, GraphState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, GraphState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn write_file(
        &self,
        commit: CommitId,
        path: &str,
        data: &[u8],
        append: bool,
    ) -> Result<(), GraphError> {
        // Fail early instead of storing objects for a commit we cannot write to.
        self.read()
            .commit(commit)
            .and_then(|c| match c.is_finished() {
                true => Err(GraphError::CommitFinished { commit }),
                false => Ok(()),
            })?;

        let object = self.objects.put(data).await?;
        let entry = FileEntry::single(object);

        let mut state = self.write();
        let info = state.open_commit_mut(commit)?;
        if append {
            info.tree.append(path, &entry);
        } else {
            info.tree.insert(path, entry);
        }
        Ok(())
    }
}

#[async_trait]
impl CommitGraph for MemoryCommitGraph {
    #[instrument(name = "MemoryCommitGraph::create_repo", skip(self))]
    async fn create_repo(&self, repo: &str) -> Result<(), GraphError> {
        if !is_valid_repo_name(repo) {
            return Err(GraphError::InvalidRepoName {
                repo: repo.to_string(),
            });
        }
        {
            let mut state = self.write();
            if state.repos.contains_key(repo) {
                return Err(GraphError::RepoAlreadyExists {
                    repo: repo.to_string(),
                });
            }
            state.repos.insert(repo.to_string(), RepoState::default());
        }
        self.publish(GraphEvent::RepoCreated {
            repo: repo.to_string(),
        });
        Ok(())
    }

    async fn ensure_repo(&self, repo: &str) -> Result<(), GraphError> {
        match self.create_repo(repo).await {
            Ok(()) | Err(GraphError::RepoAlreadyExists { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    #[instrument(name = "MemoryCommitGraph::delete_repo", skip(self))]
    async fn delete_repo(&self, repo: &str, force: bool) -> Result<Vec<CommitInfo>, GraphError> {
        let removed = {
            let mut state = self.write();
            let own: HashSet<CommitId> = state.repo(repo)?.commits.iter().copied().collect();

            let mut victims = own.clone();
            let mut dependents = HashSet::new();
            for commit in state.commits.values() {
                if commit.repo != repo && commit.provenance.iter().any(|p| own.contains(p)) {
                    dependents.insert(commit.repo.clone());
                    victims.insert(commit.id);
                }
            }

            if !dependents.is_empty() && !force {
                let mut dependents: Vec<String> = dependents.into_iter().collect();
                dependents.sort();
                return Err(GraphError::RepoHasDependents {
                    repo: repo.to_string(),
                    dependents,
                });
            }

            let removed = state.remove_commits(&victims);
            state.repos.remove(repo);
            removed
        };

        if !removed.is_empty() {
            self.publish(GraphEvent::CommitsDeleted {
                commits: removed.clone(),
            });
        }
        self.publish(GraphEvent::RepoDeleted {
            repo: repo.to_string(),
        });
        Ok(removed)
    }

    async fn inspect_repo(&self, repo: &str) -> Result<RepoInfo, GraphError> {
        let state = self.read();
        let repo_state = state.repo(repo)?;
        Ok(state.repo_info(repo, repo_state))
    }

    async fn list_repos(&self) -> Result<Vec<RepoInfo>, GraphError> {
        let state = self.read();
        Ok(state
            .repos
            .iter()
            .map(|(name, repo)| state.repo_info(name, repo))
            .collect())
    }

    #[instrument(name = "MemoryCommitGraph::start_commit", skip(self))]
    async fn start_commit(&self, repo: &str, branch: &str) -> Result<CommitInfo, GraphError> {
        let info = {
            let mut state = self.write();
            let head = state.repo(repo)?.branches.get(branch).copied().flatten();

            let tree = match head {
                Some(head) => {
                    let parent = state.commit(head)?;
                    if !parent.is_finished() {
                        return Err(GraphError::ParentNotFinished {
                            repo: repo.to_string(),
                            branch: branch.to_string(),
                            commit: head,
                        });
                    }
                    parent.tree.clone()
                }
                None => FileTree::new(),
            };

            let info = CommitInfo {
                id: CommitId::next(),
                repo: repo.to_string(),
                branch: branch.to_string(),
                parent: head,
                provenance: BTreeSet::new(),
                origin: None,
                job: None,
                started: Utc::now(),
                finished: None,
                tree,
            };

            let repo_state = state.repo_mut(repo)?;
            repo_state.commits.push(info.id);
            repo_state
                .branches
                .insert(branch.to_string(), Some(info.id));
            state.commits.insert(info.id, info.clone());
            info
        };

        self.publish(GraphEvent::CommitStarted {
            repo: info.repo.clone(),
            branch: info.branch.clone(),
            commit: info.id,
        });
        Ok(info)
    }

    #[instrument(name = "MemoryCommitGraph::start_output_commit", skip(self, request), fields(repo = %request.repo))]
    async fn start_output_commit(
        &self,
        request: OutputCommitRequest,
    ) -> Result<OutputCommit, GraphError> {
        let info = {
            let mut state = self.write();
            let repo_state = state.repo(&request.repo)?;

            let existing = repo_state
                .commits
                .iter()
                .filter_map(|c| state.commits.get(c))
                .find(|c| {
                    c.origin.as_ref() == Some(&request.origin)
                        && c.provenance == request.provenance
                });

            if let Some(existing) = existing {
                debug!("Output commit {} already exists", existing.id);
                return Ok(OutputCommit::Existing(existing.clone()));
            }

            let parent = repo_state.branches.get(&request.branch).copied().flatten();

            let info = CommitInfo {
                id: CommitId::next(),
                repo: request.repo.clone(),
                branch: request.branch.clone(),
                parent,
                provenance: request.provenance,
                origin: Some(request.origin),
                job: Some(request.job),
                started: Utc::now(),
                finished: None,
                tree: FileTree::new(),
            };

            let repo_state = state.repo_mut(&request.repo)?;
            repo_state.commits.push(info.id);
            repo_state
                .branches
                .insert(request.branch.clone(), Some(info.id));
            state.commits.insert(info.id, info.clone());
            info
        };

        self.publish(GraphEvent::CommitStarted {
            repo: info.repo.clone(),
            branch: info.branch.clone(),
            commit: info.id,
        });
        Ok(OutputCommit::Created(info))
    }

    #[instrument(name = "MemoryCommitGraph::finish_commit", skip(self))]
    async fn finish_commit(&self, commit: CommitId) -> Result<CommitInfo, GraphError> {
        let info = {
            let mut state = self.write();
            let info = state.open_commit_mut(commit)?;
            info.finished = Some(Utc::now());
            info.clone()
        };

        self.publish(GraphEvent::CommitFinished {
            repo: info.repo.clone(),
            branch: info.branch.clone(),
            commit: info.id,
        });
        Ok(info)
    }

    async fn put_file(&self, commit: CommitId, path: &str, data: &[u8]) -> Result<(), GraphError> {
        self.write_file(commit, path, data, false).await
    }

    async fn append_file(
        &self,
        commit: CommitId,
        path: &str,
        data: &[u8],
    ) -> Result<(), GraphError> {
        self.write_file(commit, path, data, true).await
    }

    async fn delete_file(&self, commit: CommitId, path: &str) -> Result<(), GraphError> {
        let mut state = self.write();
        let info = state.open_commit_mut(commit)?;
        let removed = info.tree.remove(path);
        debug!("Removed {} files under {} in {}", removed, path, commit);
        Ok(())
    }

    async fn put_tree(&self, commit: CommitId, tree: FileTree) -> Result<(), GraphError> {
        let mut state = self.write();
        let info = state.open_commit_mut(commit)?;
        info.tree = tree;
        Ok(())
    }

    async fn get_file(&self, commit: CommitId, path: &str) -> Result<Vec<u8>, GraphError> {
        let entry = {
            let state = self.read();
            state
                .commit(commit)?
                .tree
                .get(path)
                .cloned()
                .ok_or_else(|| GraphError::FileNotFound {
                    commit,
                    path: path.to_string(),
                })?
        };

        let mut data = Vec::with_capacity(entry.size() as usize);
        for object in &entry.objects {
            data.extend(self.objects.get(&object.hash).await?);
        }
        Ok(data)
    }

    async fn list_file(&self, commit: CommitId, path: &str) -> Result<Vec<FileInfo>, GraphError> {
        let state = self.read();
        let info = state.commit(commit)?;
        let files = info.tree.list(path);
        if files.is_empty() && !info.tree.is_dir(path) {
            return Err(GraphError::FileNotFound {
                commit,
                path: path.to_string(),
            });
        }
        Ok(files)
    }

    async fn inspect_commit(&self, commit: CommitId) -> Result<CommitInfo, GraphError> {
        self.read().commit(commit).cloned()
    }

    async fn list_commit(&self, repo: &str) -> Result<Vec<CommitInfo>, GraphError> {
        let state = self.read();
        let repo = state.repo(repo)?;
        Ok(repo
            .commits
            .iter()
            .rev()
            .filter_map(|c| state.commits.get(c).cloned())
            .collect())
    }

    async fn branch_head(
        &self,
        repo: &str,
        branch: &str,
    ) -> Result<Option<CommitInfo>, GraphError> {
        let state = self.read();
        let head = state.repo(repo)?.branches.get(branch).copied().flatten();
        Ok(head.and_then(|h| state.commits.get(&h).cloned()))
    }

    #[instrument(name = "MemoryCommitGraph::delete_commit", skip(self))]
    async fn delete_commit(&self, commit: CommitId) -> Result<Vec<CommitInfo>, GraphError> {
        let removed = {
            let mut state = self.write();
            state.commit(commit)?;
            let victims = state.cascade(commit);
            state.remove_commits(&victims)
        };

        info!("Deleted {} commits", removed.len());
        self.publish(GraphEvent::CommitsDeleted {
            commits: removed.clone(),
        });
        Ok(removed)
    }

    fn subscribe(&self) -> broadcast::Receiver<GraphEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobId;
    use crate::objects::MemoryObjectStore;

    fn graph() -> MemoryCommitGraph {
        MemoryCommitGraph::new(Arc::new(MemoryObjectStore::new()))
    }

    async fn commit_file(graph: &MemoryCommitGraph, repo: &str, path: &str, data: &[u8]) -> CommitInfo {
        let commit = graph.start_commit(repo, "master").await.unwrap();
        graph.put_file(commit.id, path, data).await.unwrap();
        graph.finish_commit(commit.id).await.unwrap()
    }

    fn request(repo: &str, provenance: &[CommitId]) -> OutputCommitRequest {
        OutputCommitRequest {
            repo: repo.to_string(),
            branch: "master".to_string(),
            provenance: provenance.iter().copied().collect(),
            origin: Origin {
                pipeline: repo.to_string(),
                version: 1,
            },
            job: JobId::next(),
        }
    }

    #[tokio::test]
    async fn commits_inherit_the_content_of_their_parent() {
        let graph = graph();
        graph.create_repo("data").await.unwrap();
        let first = commit_file(&graph, "data", "/a", b"a").await;
        let second = commit_file(&graph, "data", "/b", b"b").await;

        assert_eq!(second.parent, Some(first.id));
        assert_eq!(graph.get_file(second.id, "a").await.unwrap(), b"a");
        assert_eq!(graph.get_file(second.id, "/b").await.unwrap(), b"b");
        assert_matches!(
            graph.get_file(first.id, "/b").await,
            Err(GraphError::FileNotFound { .. })
        );
    }

    #[tokio::test]
    async fn finished_commits_are_immutable() {
        let graph = graph();
        graph.create_repo("data").await.unwrap();
        let commit = commit_file(&graph, "data", "/a", b"a").await;
        assert_matches!(
            graph.put_file(commit.id, "/b", b"b").await,
            Err(GraphError::CommitFinished { .. })
        );
        assert_matches!(
            graph.finish_commit(commit.id).await,
            Err(GraphError::CommitFinished { .. })
        );
    }

    #[tokio::test]
    async fn cannot_start_on_top_of_an_open_commit() {
        let graph = graph();
        graph.create_repo("data").await.unwrap();
        graph.start_commit("data", "master").await.unwrap();
        assert_matches!(
            graph.start_commit("data", "master").await,
            Err(GraphError::ParentNotFinished { .. })
        );
    }

    #[tokio::test]
    async fn output_commits_are_claimed_once_per_provenance() {
        let graph = graph();
        graph.create_repo("data").await.unwrap();
        graph.create_repo("out").await.unwrap();
        let input = commit_file(&graph, "data", "/a", b"a").await;

        let first = graph
            .start_output_commit(request("out", &[input.id]))
            .await
            .unwrap();
        let second = graph
            .start_output_commit(request("out", &[input.id]))
            .await
            .unwrap();

        let created = assert_matches!(first, OutputCommit::Created(c) => c);
        assert_matches!(second, OutputCommit::Existing(c) if c.id == created.id);
        assert_eq!(graph.list_commit("out").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_claims_create_a_single_commit() {
        let graph = Arc::new(graph());
        graph.create_repo("data").await.unwrap();
        graph.create_repo("out").await.unwrap();
        let input = commit_file(&graph, "data", "/a", b"a").await;

        let mut handles = vec![];
        for _ in 0..16 {
            let graph = graph.clone();
            let req = request("out", &[input.id]);
            handles.push(tokio::spawn(async move {
                graph.start_output_commit(req).await.unwrap()
            }));
        }

        let mut created = 0;
        for handle in handles {
            if let OutputCommit::Created(_) = handle.await.unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn deleting_a_commit_cascades_over_its_provenance() {
        let graph = graph();
        graph.create_repo("data").await.unwrap();
        graph.create_repo("out").await.unwrap();
        let first = commit_file(&graph, "data", "/a", b"1").await;
        let second = commit_file(&graph, "data", "/a", b"2").await;

        let out1 = assert_matches!(
            graph.start_output_commit(request("out", &[first.id])).await.unwrap(),
            OutputCommit::Created(c) => c
        );
        graph.finish_commit(out1.id).await.unwrap();
        let out2 = assert_matches!(
            graph.start_output_commit(request("out", &[second.id])).await.unwrap(),
            OutputCommit::Created(c) => c
        );

        let mut events = graph.subscribe();
        let removed = graph.delete_commit(second.id).await.unwrap();
        let removed: HashSet<CommitId> = removed.into_iter().map(|c| c.id).collect();
        assert_eq!(removed, HashSet::from([second.id, out2.id]));

        let data_head = graph.branch_head("data", "master").await.unwrap().unwrap();
        let out_head = graph.branch_head("out", "master").await.unwrap().unwrap();
        assert_eq!(data_head.id, first.id);
        assert_eq!(out_head.id, out1.id);
        assert_matches!(events.recv().await, Ok(GraphEvent::CommitsDeleted { commits }) if commits.len() == 2);
    }

    #[tokio::test]
    async fn deleting_a_middle_commit_relinks_its_children() {
        let graph = graph();
        graph.create_repo("data").await.unwrap();
        let first = commit_file(&graph, "data", "/a", b"1").await;
        let second = commit_file(&graph, "data", "/a", b"2").await;
        let third = commit_file(&graph, "data", "/a", b"3").await;

        graph.delete_commit(second.id).await.unwrap();
        let third = graph.inspect_commit(third.id).await.unwrap();
        assert_eq!(third.parent, Some(first.id));
        assert_eq!(graph.get_file(third.id, "/a").await.unwrap(), b"3");
    }

    #[tokio::test]
    async fn repos_with_dependents_need_force() {
        let graph = graph();
        graph.create_repo("data").await.unwrap();
        graph.create_repo("out").await.unwrap();
        let input = commit_file(&graph, "data", "/a", b"a").await;
        graph
            .start_output_commit(request("out", &[input.id]))
            .await
            .unwrap();

        assert_matches!(
            graph.delete_repo("data", false).await,
            Err(GraphError::RepoHasDependents { dependents, .. }) if dependents == vec!["out".to_string()]
        );
        let removed = graph.delete_repo("data", true).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(graph.branch_head("out", "master").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn listing_files_shows_directories() {
        let graph = graph();
        graph.create_repo("data").await.unwrap();
        let commit = graph.start_commit("data", "master").await.unwrap();
        graph.put_file(commit.id, "/dir/a", b"aa").await.unwrap();
        graph.append_file(commit.id, "/dir/a", b"a").await.unwrap();
        graph.put_file(commit.id, "/top", b"t").await.unwrap();

        let root = graph.list_file(commit.id, "/").await.unwrap();
        assert_eq!(root.len(), 2);
        let dir = graph.list_file(commit.id, "dir").await.unwrap();
        assert_eq!(dir[0].size_bytes, 3);

        graph.delete_file(commit.id, "/dir").await.unwrap();
        assert_eq!(graph.list_file(commit.id, "/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_repo_names_are_rejected() {
        let graph = graph();
        assert_matches!(
            graph.create_repo("no spaces").await,
            Err(GraphError::InvalidRepoName { .. })
        );
        graph.create_repo("ok-name_1").await.unwrap();
        assert_matches!(
            graph.create_repo("ok-name_1").await,
            Err(GraphError::RepoAlreadyExists { .. })
        );
        graph.ensure_repo("ok-name_1").await.unwrap();
    }
}
