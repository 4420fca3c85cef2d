//! # Flushing
//!
//! Waits for everything downstream of a set of commits to be sealed. For every downstream repo
//! the waiter picks the oldest commit whose provenance holds every source commit upstream of it,
//! and emits it once it is finished. Finished only means sealed: the commit of a failed job is
//! emitted like any other.
//!
//! The set of downstream repos is recomputed on every graph event, so pipelines created after
//! the source commits are taken into account.
//!

use crate::graph::{CommitGraph, GraphError};
use crate::lifecycle::{JobRegistry, LifecycleError, PipelineRegistry};
use crate::model::{CommitId, CommitInfo, JobInfo, PipelineSpec};
use crate::propagator::PipelineGraph;
use crate::sync::Arc;
use futures::stream::{BoxStream, StreamExt};
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::*;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::*;

#[derive(Error, Debug)]
pub enum FlushError {
    #[error("Flush did not complete before its deadline, {} commits were emitted", .emitted.len())]
    DeadlineExceeded { emitted: Vec<CommitInfo> },

    #[error("The commit graph went away while flushing")]
    GraphClosed,

    #[error(transparent)]
    GraphError(GraphError),

    #[error(transparent)]
    LifecycleError(LifecycleError),
}

impl From<GraphError> for FlushError {
    fn from(value: GraphError) -> Self {
        FlushError::GraphError(value)
    }
}

impl From<LifecycleError> for FlushError {
    fn from(value: LifecycleError) -> Self {
        FlushError::LifecycleError(value)
    }
}

enum Wake {
    Event,
    Closed,
    Deadline,
}

#[derive(Clone)]
pub struct FlushWaiter {
    graph: Arc<dyn CommitGraph>,
    pipelines: Arc<PipelineRegistry>,
    jobs: Arc<JobRegistry>,
}

impl FlushWaiter {
    pub fn new(
        graph: Arc<dyn CommitGraph>,
        pipelines: Arc<PipelineRegistry>,
        jobs: Arc<JobRegistry>,
    ) -> Self {
        Self {
            graph,
            pipelines,
            jobs,
        }
    }

    fn pipeline_graph(&self) -> PipelineGraph {
        let specs: Vec<PipelineSpec> = self.pipelines.list().into_iter().map(|p| p.spec).collect();
        PipelineGraph::build(&specs).unwrap_or_default()
    }

    /// Every downstream commit, once, as soon as it is finished.
    pub fn flush_commit(
        &self,
        sources: Vec<CommitId>,
        to_repos: Option<Vec<String>>,
        deadline: Option<Duration>,
    ) -> BoxStream<'static, Result<CommitInfo, FlushError>> {
        // Subscribe first so nothing sealed while the sources are looked up is missed.
        let mut events = self.graph.subscribe();
        let waiter = self.clone();

        let stream = async_stream::try_stream! {
            let timeout = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep(deadline).await,
                    None => futures::future::pending().await,
                }
            };
            tokio::pin!(timeout);

            let mut origins = vec![];
            for source in &sources {
                origins.push(waiter.graph.inspect_commit(*source).await?);
            }

            let mut done: BTreeSet<String> = BTreeSet::new();
            let mut emitted: Vec<CommitInfo> = vec![];

            loop {
                let graph = waiter.pipeline_graph();
                let mut downstream = BTreeSet::new();
                for origin in &origins {
                    downstream.extend(graph.downstream_repos(&origin.repo));
                }
                if let Some(to_repos) = &to_repos {
                    downstream.retain(|repo| to_repos.contains(repo));
                }

                let mut ready = vec![];
                let mut waiting = false;
                for repo in graph.pipelines() {
                    if !downstream.contains(&repo) || done.contains(&repo) {
                        continue;
                    }
                    let upstream = graph.upstream_repos(&repo);
                    let required: Vec<CommitId> = origins
                        .iter()
                        .filter(|origin| upstream.contains(&origin.repo))
                        .map(|origin| origin.id)
                        .collect();

                    let mut commits = waiter.graph.list_commit(&repo).await?;
                    commits.reverse();
                    let found = commits
                        .into_iter()
                        .find(|c| required.iter().all(|r| c.provenance.contains(r)));
                    match found {
                        Some(commit) if commit.is_finished() => {
                            done.insert(repo);
                            ready.push(commit);
                        }
                        _ => waiting = true,
                    }
                }

                for commit in ready {
                    trace!("Flushed commit {} of {}", commit.id, commit.repo);
                    emitted.push(commit.clone());
                    yield commit;
                }
                if !waiting {
                    break;
                }

                let wake = tokio::select! {
                    event = events.recv() => match event {
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => Wake::Event,
                        Err(broadcast::error::RecvError::Closed) => Wake::Closed,
                    },
                    _ = &mut timeout => Wake::Deadline,
                };
                match wake {
                    Wake::Event => continue,
                    Wake::Closed => Err(FlushError::GraphClosed)?,
                    Wake::Deadline => {
                        debug!("Flush ran out of time after {} commits", emitted.len());
                        Err(FlushError::DeadlineExceeded { emitted: emitted.clone() })?
                    }
                }
            }
        };
        stream.boxed()
    }

    /// Wait for every downstream commit, and return them in the order they were sealed.
    pub async fn wait(
        &self,
        sources: Vec<CommitId>,
        to_repos: Option<Vec<String>>,
        deadline: Option<Duration>,
    ) -> Result<Vec<CommitInfo>, FlushError> {
        let mut stream = self.flush_commit(sources, to_repos, deadline);
        let mut commits = vec![];
        while let Some(commit) = stream.next().await {
            commits.push(commit?);
        }
        Ok(commits)
    }

    /// Wait for the same commits as [FlushWaiter::wait], then for the jobs that wrote them to
    /// reach a terminal state.
    #[instrument(name = "FlushWaiter::flush_job_all", skip(self))]
    pub async fn flush_job_all(
        &self,
        sources: Vec<CommitId>,
        to_pipelines: Option<Vec<String>>,
        deadline: Option<Duration>,
    ) -> Result<Vec<JobInfo>, FlushError> {
        let started = Instant::now();
        let commits = self.wait(sources, to_pipelines, deadline).await?;

        let mut jobs = vec![];
        for commit in &commits {
            let job = match commit.job {
                Some(job) => job,
                None => continue,
            };
            let wait = self.jobs.wait_terminal(job);
            let info = match deadline {
                Some(deadline) => tokio::time::timeout_at(started + deadline, wait)
                    .await
                    .map_err(|_| FlushError::DeadlineExceeded {
                        emitted: commits.clone(),
                    })?,
                None => wait.await,
            };
            match info {
                Ok(info) => jobs.push(info),
                Err(LifecycleError::JobNotFound { .. }) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::DedupCache;
    use crate::events::EventChannel;
    use crate::graph::MemoryCommitGraph;
    use crate::model::{FileTree, Input, Transform};
    use crate::objects::MemoryObjectStore;
    use crate::propagator::Propagator;

    struct Harness {
        graph: Arc<MemoryCommitGraph>,
        pipelines: Arc<PipelineRegistry>,
        jobs: Arc<JobRegistry>,
        propagator: Propagator,
        waiter: FlushWaiter,
    }

    fn harness() -> Harness {
        let events = Arc::new(EventChannel::new());
        let graph = Arc::new(MemoryCommitGraph::new(Arc::new(MemoryObjectStore::new())));
        let pipelines = Arc::new(PipelineRegistry::new(events.clone()));
        let jobs = Arc::new(JobRegistry::new(events));
        let propagator = Propagator::new(
            graph.clone(),
            pipelines.clone(),
            jobs.clone(),
            Arc::new(DedupCache::new()),
        );
        let waiter = FlushWaiter::new(graph.clone(), pipelines.clone(), jobs.clone());
        Harness {
            graph,
            pipelines,
            jobs,
            propagator,
            waiter,
        }
    }

    impl Harness {
        async fn pipeline(&self, name: &str, input: Input) {
            self.graph.create_repo(name).await.unwrap();
            self.pipelines
                .create(PipelineSpec::new(name, Transform::shell(["true"]), input))
                .unwrap();
        }

        async fn commit(&self, repo: &str) -> CommitInfo {
            let commit = self.graph.start_commit(repo, "master").await.unwrap();
            self.graph.put_file(commit.id, "/file", b"foo").await.unwrap();
            self.graph.finish_commit(commit.id).await.unwrap()
        }

        /// Seal every open output commit, the way controllers would.
        async fn seal_all(&self) {
            for job in self.jobs.list(None, None) {
                self.propagator
                    .seal_output(job.output_commit, Some(FileTree::new()))
                    .await
                    .unwrap();
            }
        }
    }

    #[tokio::test]
    async fn diamonds_flush_one_commit_per_repo() {
        let h = harness();
        h.graph.create_repo("a").await.unwrap();
        h.pipeline("b", Input::atom("a", "/*")).await;
        h.pipeline("c", Input::atom("a", "/*")).await;
        h.pipeline(
            "d",
            Input::Cross(vec![Input::atom("b", "/*"), Input::atom("c", "/*")]),
        )
        .await;

        let a1 = h.commit("a").await;
        h.propagator.on_commit_finished("a").await.unwrap();

        let flush = {
            let waiter = h.waiter.clone();
            tokio::spawn(async move { waiter.wait(vec![a1.id], None, None).await })
        };
        h.seal_all().await;

        let commits = flush.await.unwrap().unwrap();
        let repos: BTreeSet<String> = commits.iter().map(|c| c.repo.clone()).collect();
        assert_eq!(commits.len(), 3);
        assert_eq!(
            repos,
            BTreeSet::from(["b".to_string(), "c".to_string(), "d".to_string()])
        );
    }

    #[tokio::test]
    async fn flushes_can_be_narrowed_to_some_repos() {
        let h = harness();
        h.graph.create_repo("a").await.unwrap();
        h.pipeline("b", Input::atom("a", "/*")).await;
        h.pipeline("c", Input::atom("b", "/*")).await;

        let a1 = h.commit("a").await;
        h.propagator.on_commit_finished("a").await.unwrap();
        h.seal_all().await;

        let commits = h
            .waiter
            .wait(vec![a1.id], Some(vec!["c".to_string()]), None)
            .await
            .unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].repo, "c");
    }

    #[tokio::test]
    async fn commits_without_downstream_flush_right_away() {
        let h = harness();
        h.graph.create_repo("a").await.unwrap();
        let a1 = h.commit("a").await;
        let commits = h.waiter.wait(vec![a1.id], None, None).await.unwrap();
        assert!(commits.is_empty());
    }

    #[tokio::test]
    async fn deadlines_report_what_was_emitted() {
        let h = harness();
        h.graph.create_repo("a").await.unwrap();
        h.pipeline("b", Input::atom("a", "/*")).await;
        let a1 = h.commit("a").await;
        h.propagator.on_commit_finished("a").await.unwrap();

        let err = h
            .waiter
            .wait(vec![a1.id], None, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert_matches!(err, FlushError::DeadlineExceeded { ref emitted } if emitted.is_empty());
    }

    #[tokio::test]
    async fn jobs_are_returned_once_terminal() {
        let h = harness();
        h.graph.create_repo("a").await.unwrap();
        h.pipeline("b", Input::atom("a", "/*")).await;
        let a1 = h.commit("a").await;
        let job = h.propagator.on_commit_finished("a").await.unwrap().remove(0);

        let flush = {
            let waiter = h.waiter.clone();
            tokio::spawn(async move { waiter.flush_job_all(vec![a1.id], None, None).await })
        };
        h.seal_all().await;
        h.jobs
            .transition(job.id, crate::model::JobState::Killed, Some("stopped".into()))
            .unwrap();

        let jobs = flush.await.unwrap().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, job.id);
        assert_eq!(jobs[0].state, crate::model::JobState::Killed);
    }
}
