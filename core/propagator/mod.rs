//! # Provenance Propagation
//!
//! Reacts to finished commits by working out, for every pipeline downstream of them, which input
//! commits its branch heads currently point at. Every distinct set of input commits (taken with
//! their own provenance) gets exactly one output commit and one job.
//!
//! Pipelines are walked in topological order, and the output commit of an upstream pipeline
//! becomes the head of its repo right away, even while it is still open. Downstream pipelines
//! therefore see one consistent generation of heads, and a graph like `A -> B -> C, A -> C`
//! produces a single commit in `C` per commit in `A`.
//!
//! Claiming the output commit is a compare-and-swap on the commit graph, so any number of
//! propagators can watch the same graph.
//!
mod error;
mod pipeline_graph;
mod validation;

pub use error::*;
pub use pipeline_graph::*;
pub use validation::*;

use crate::dedup::DedupCache;
use crate::graph::{CommitGraph, GraphError, GraphEvent, OutputCommit, OutputCommitRequest};
use crate::lifecycle::{JobRegistry, LifecycleError, PipelineRegistry};
use crate::model::*;
use crate::sync::Arc;
use chrono::Utc;
use std::collections::BTreeSet;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::*;

impl PropagatorError {
    /// Whatever was being evaluated got deleted in the meantime.
    fn is_gone(&self) -> bool {
        matches!(
            self,
            PropagatorError::LifecycleError(LifecycleError::PipelineNotFound { .. })
                | PropagatorError::GraphError(GraphError::RepoNotFound { .. })
                | PropagatorError::GraphError(GraphError::CommitNotFound { .. })
        )
    }
}

pub struct Propagator {
    graph: Arc<dyn CommitGraph>,
    pipelines: Arc<PipelineRegistry>,
    jobs: Arc<JobRegistry>,
    dedup: Arc<DedupCache>,
}

impl Propagator {
    pub fn new(
        graph: Arc<dyn CommitGraph>,
        pipelines: Arc<PipelineRegistry>,
        jobs: Arc<JobRegistry>,
        dedup: Arc<DedupCache>,
    ) -> Self {
        Self {
            graph,
            pipelines,
            jobs,
            dedup,
        }
    }

    /// The graph of every current pipeline.
    pub fn pipeline_graph(&self) -> Result<PipelineGraph, PropagatorError> {
        let specs: Vec<PipelineSpec> = self.pipelines.list().into_iter().map(|p| p.spec).collect();
        PipelineGraph::build(&specs).map_err(|cycle| {
            ValidationError::Cycle {
                pipeline: cycle.pipeline,
            }
            .into()
        })
    }

    /// Evaluate every pipeline downstream of a repo that just got a finished commit.
    #[instrument(name = "Propagator::on_commit_finished", skip(self))]
    pub async fn on_commit_finished(&self, repo: &str) -> Result<Vec<JobInfo>, PropagatorError> {
        let pipelines = self.pipeline_graph()?.downstream_pipelines([repo]);
        self.evaluate(&pipelines).await
    }

    /// Evaluate every pipeline against the current heads.
    pub async fn evaluate_all(&self) -> Result<Vec<JobInfo>, PropagatorError> {
        let pipelines = self.pipeline_graph()?.pipelines();
        self.evaluate(&pipelines).await
    }

    /// Evaluate pipelines in the given order, returning the jobs that were created.
    pub async fn evaluate(&self, pipelines: &[String]) -> Result<Vec<JobInfo>, PropagatorError> {
        let mut created = vec![];
        for pipeline in pipelines {
            match self.evaluate_pipeline(pipeline).await {
                Ok(Some(job)) => created.push(job),
                Ok(None) => (),
                Err(err) if err.is_gone() => {
                    debug!("Skipping {} since it went away: {}", pipeline, err);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(created)
    }

    #[instrument(name = "Propagator::evaluate_pipeline", skip(self))]
    async fn evaluate_pipeline(&self, pipeline: &str) -> Result<Option<JobInfo>, PropagatorError> {
        let info = self.pipelines.get(pipeline)?;
        if matches!(info.state, PipelineState::Paused | PipelineState::Failure) {
            trace!("Pipeline {} is {}, not evaluating it", pipeline, info.state);
            return Ok(None);
        }

        let spec = &info.spec;
        let leaves = spec.input.leaves(pipeline);
        let mut heads = Vec::with_capacity(leaves.len());
        for leaf in &leaves {
            heads.push(self.graph.branch_head(&leaf.repo, &leaf.branch).await?);
        }

        let ready: Vec<bool> = heads.iter().map(Option::is_some).collect();
        if !spec.input.is_ready(&ready) {
            trace!("Pipeline {} has no input yet", pipeline);
            return Ok(None);
        }
        let contributing = spec.input.contributing_leaves(&ready);

        let mut provenance = BTreeSet::new();
        let mut inputs = Vec::with_capacity(leaves.len());
        for ((leaf, head), contributes) in leaves.into_iter().zip(&heads).zip(contributing) {
            let commit = match head {
                Some(head) if contributes => {
                    provenance.insert(head.id);
                    provenance.extend(head.provenance.iter().copied());
                    Some(head.id)
                }
                _ => None,
            };
            inputs.push(JobInput {
                name: leaf.name,
                repo: leaf.repo,
                branch: leaf.branch,
                glob: leaf.glob,
                commit,
            });
        }

        let job = JobId::next();
        let request = OutputCommitRequest {
            repo: pipeline.to_string(),
            branch: spec.output_branch.clone(),
            provenance,
            origin: Origin {
                pipeline: pipeline.to_string(),
                version: info.version,
            },
            job,
        };

        let commit = match self.graph.start_output_commit(request).await? {
            OutputCommit::Existing(commit) => {
                trace!("Pipeline {} already has output commit {}", pipeline, commit.id);
                return Ok(None);
            }
            OutputCommit::Created(commit) => commit,
        };

        let job = self.jobs.create(JobInfo {
            id: job,
            pipeline: pipeline.to_string(),
            pipeline_version: info.version,
            inputs,
            output_commit: commit.id,
            state: JobState::Starting,
            reason: None,
            created: Utc::now(),
            started: None,
            finished: None,
            data_total: 0,
            data_processed: 0,
            data_skipped: 0,
            data_failed: 0,
            retries: 0,
            workers: 0,
            worker_status: vec![],
            stats: JobStats::default(),
        });
        info!(
            "Created job {} of pipeline {} writing to commit {}",
            job.id, pipeline, commit.id
        );
        self.pipelines.wake(pipeline);
        Ok(Some(job))
    }

    /// Kill the jobs writing into deleted commits and re-evaluate against the heads the delete
    /// left behind.
    #[instrument(name = "Propagator::on_commits_deleted", skip(self, deleted))]
    pub async fn on_commits_deleted(
        &self,
        deleted: &[CommitInfo],
    ) -> Result<Vec<JobInfo>, PropagatorError> {
        let mut killed = vec![];
        for commit in deleted {
            if let Some(job) = commit.job {
                match self.jobs.kill(job, "input commit deleted") {
                    Ok(_) => killed.push(job),
                    Err(LifecycleError::JobNotFound { .. }) => (),
                    Err(err) => return Err(err.into()),
                }
            }
        }
        if !killed.is_empty() {
            info!("Killed {} jobs whose commits were deleted", killed.len());
            self.dedup.forget_jobs(&killed);
        }
        self.evaluate_all().await
    }

    /// Seal the output commit of a job. Without a tree the commit is finished empty, which is
    /// what failed and killed jobs leave behind.
    #[instrument(name = "Propagator::seal_output", skip(self, tree))]
    pub async fn seal_output(
        &self,
        commit: CommitId,
        tree: Option<FileTree>,
    ) -> Result<(), PropagatorError> {
        let result = async {
            if let Some(tree) = tree {
                self.graph.put_tree(commit, tree).await?;
            }
            self.graph.finish_commit(commit).await
        }
        .await;

        match result {
            Ok(_) => Ok(()),
            // Deleted or sealed by someone else, like a delete racing with the job.
            Err(GraphError::CommitNotFound { .. }) | Err(GraphError::CommitFinished { .. }) => {
                debug!("Output commit {} was already gone or sealed", commit);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Start `count` propagators that follow the commit graph until `shutdown`.
    pub fn spawn_replicas(
        self: &Arc<Self>,
        count: usize,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|replica| {
                // Subscribe before spawning, so nothing published after this call is missed.
                let events = self.graph.subscribe();
                let propagator = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { propagator.follow(replica, events, shutdown).await })
            })
            .collect()
    }

    async fn follow(
        &self,
        replica: usize,
        mut events: broadcast::Receiver<GraphEvent>,
        shutdown: CancellationToken,
    ) {
        debug!("Propagator {} started", replica);
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = shutdown.cancelled() => break,
            };

            let result = match event {
                Ok(GraphEvent::CommitFinished { repo, .. }) => {
                    self.on_commit_finished(&repo).await.map(|_| ())
                }
                Ok(_) => Ok(()),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "Propagator {} missed {} events, evaluating everything",
                        replica, skipped
                    );
                    self.evaluate_all().await.map(|_| ())
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            if let Err(err) = result {
                error!("Propagator {} could not propagate: {}", replica, err);
            }
        }
        debug!("Propagator {} stopped", replica);
    }
}
