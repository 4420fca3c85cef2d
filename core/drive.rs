use super::*;
use crate::controller::{ControllerContext, PipelineController};
use crate::cron::{self, CronError};
use crate::dedup::DedupCache;
use crate::events::event::{CommitEvent, WorkflowEvent};
use crate::events::EventChannel;
use crate::executor::{DatumExecutor, ProcessExecutor};
use crate::flush::{FlushError, FlushWaiter};
use crate::graph::{CommitGraph, GraphError, GraphEvent, MemoryCommitGraph};
use crate::lifecycle::{JobRegistry, LifecycleError, PipelineRegistry};
use crate::logs::{LogFilter, LogLine, LogStore};
use crate::model::*;
use crate::objects::{LocalObjectStore, MemoryObjectStore, ObjectStore};
use crate::planner::Page;
use crate::propagator::{validate, Propagator, PropagatorError, ValidationError};
use crate::scheduler::Scheduler;
use crate::sync::{Arc, Mutex};
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use thiserror::*;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, *};

/// The background work that belongs to one pipeline.
struct PipelineTasks {
    stop: CancellationToken,
    controller: JoinHandle<()>,
    /// Cron tickers are restarted on every update, so they get a token of their own.
    crons: CancellationToken,
}

/// # Sluice Drive
///
/// The service object that owns the commit graph, the object store, and every registry, and
/// that runs the background loops working on them: the propagators following the graph and one
/// controller per pipeline.
///
/// Every operation the service exposes is a method here.
///
pub struct SluiceDrive {
    config: Config,
    graph: Arc<dyn CommitGraph>,
    pipelines: Arc<PipelineRegistry>,
    jobs: Arc<JobRegistry>,
    dedup: Arc<DedupCache>,
    logs: Arc<LogStore>,
    propagator: Arc<Propagator>,
    flush: FlushWaiter,
    controllers: ControllerContext,
    tasks: DashMap<String, PipelineTasks>,
    background: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl SluiceDrive {
    #[instrument(name = "SluiceDrive::new", skip(graph, objects))]
    pub async fn new(
        config: Config,
        graph: Arc<dyn CommitGraph>,
        objects: Arc<dyn ObjectStore>,
    ) -> Result<Self, SluiceDriveError> {
        Ok(Self::assemble(
            config,
            graph,
            objects,
            Arc::new(ProcessExecutor::new()),
        ))
    }

    /// A drive over an in-memory commit graph. Objects live under `Config::object_root` when it
    /// is set, and in memory otherwise.
    pub async fn with_memory(config: Config) -> Result<Self, SluiceDriveError> {
        let objects: Arc<dyn ObjectStore> = match config.object_root() {
            Some(root) => Arc::new(LocalObjectStore::new(root.clone())),
            None => Arc::new(MemoryObjectStore::new()),
        };
        let graph = Arc::new(MemoryCommitGraph::new(objects.clone()));
        Self::new(config, graph, objects).await
    }

    pub(crate) fn assemble(
        config: Config,
        graph: Arc<dyn CommitGraph>,
        objects: Arc<dyn ObjectStore>,
        executor: Arc<dyn DatumExecutor>,
    ) -> Self {
        let events = config.event_channel();
        let pipelines = Arc::new(PipelineRegistry::new(events.clone()));
        let jobs = Arc::new(JobRegistry::new(events.clone()));
        let dedup = Arc::new(DedupCache::new());
        let logs = Arc::new(LogStore::new());
        let scheduler = Arc::new(Scheduler::new(
            config.clone(),
            objects,
            jobs.clone(),
            dedup.clone(),
            logs.clone(),
            executor,
        ));
        let propagator = Arc::new(Propagator::new(
            graph.clone(),
            pipelines.clone(),
            jobs.clone(),
            dedup.clone(),
        ));
        let flush = FlushWaiter::new(graph.clone(), pipelines.clone(), jobs.clone());

        let shutdown = CancellationToken::new();
        let mut background =
            propagator.spawn_replicas(config.propagator_replicas(), shutdown.child_token());
        background.push(relay_graph_events(
            graph.subscribe(),
            events.clone(),
            shutdown.child_token(),
        ));

        events.send(WorkflowEvent::drive_started());
        info!(
            "Sluice started with {} propagators over {} nodes",
            config.propagator_replicas().max(1),
            config.cluster_nodes()
        );

        let controllers = ControllerContext {
            config: config.clone(),
            graph: graph.clone(),
            pipelines: pipelines.clone(),
            jobs: jobs.clone(),
            logs: logs.clone(),
            scheduler,
            propagator: propagator.clone(),
        };

        Self {
            config,
            graph,
            pipelines,
            jobs,
            dedup,
            logs,
            propagator,
            flush,
            controllers,
            tasks: DashMap::new(),
            background: Mutex::new(background),
            shutdown,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn event_channel(&self) -> Arc<EventChannel> {
        self.config.event_channel()
    }

    // Repos and commits

    pub async fn create_repo(&self, repo: &str) -> Result<(), SluiceDriveError> {
        Ok(self.graph.create_repo(repo).await?)
    }

    pub async fn inspect_repo(&self, repo: &str) -> Result<RepoInfo, SluiceDriveError> {
        Ok(self.graph.inspect_repo(repo).await?)
    }

    pub async fn list_repo(&self) -> Result<Vec<RepoInfo>, SluiceDriveError> {
        Ok(self.graph.list_repos().await?)
    }

    /// Delete a repo. Output repos go away with their pipeline, so they cannot be deleted here.
    #[instrument(name = "SluiceDrive::delete_repo", skip(self))]
    pub async fn delete_repo(&self, repo: &str, force: bool) -> Result<(), SluiceDriveError> {
        if self.pipelines.contains(repo) {
            return Err(SluiceDriveError::PipelineOutputRepo {
                repo: repo.to_string(),
            });
        }
        let deleted = self.graph.delete_repo(repo, force).await?;
        self.propagator.on_commits_deleted(&deleted).await?;
        Ok(())
    }

    pub async fn start_commit(
        &self,
        repo: &str,
        branch: &str,
    ) -> Result<CommitInfo, SluiceDriveError> {
        Ok(self.graph.start_commit(repo, branch).await?)
    }

    pub async fn put_file(
        &self,
        commit: CommitId,
        path: &str,
        data: &[u8],
    ) -> Result<(), SluiceDriveError> {
        Ok(self.graph.put_file(commit, path, data).await?)
    }

    pub async fn delete_file(&self, commit: CommitId, path: &str) -> Result<(), SluiceDriveError> {
        Ok(self.graph.delete_file(commit, path).await?)
    }

    pub async fn get_file(&self, commit: CommitId, path: &str) -> Result<Vec<u8>, SluiceDriveError> {
        Ok(self.graph.get_file(commit, path).await?)
    }

    pub async fn list_file(
        &self,
        commit: CommitId,
        path: &str,
    ) -> Result<Vec<FileInfo>, SluiceDriveError> {
        Ok(self.graph.list_file(commit, path).await?)
    }

    /// Seal a commit. The jobs it triggers exist by the time this returns.
    #[instrument(name = "SluiceDrive::finish_commit", skip(self))]
    pub async fn finish_commit(&self, commit: CommitId) -> Result<CommitInfo, SluiceDriveError> {
        let info = self.graph.finish_commit(commit).await?;
        self.propagator.on_commit_finished(&info.repo).await?;
        Ok(info)
    }

    /// Delete a commit along with everything it is the provenance of. Jobs writing into any of
    /// those commits are killed, and their pipelines are evaluated again against what is left.
    #[instrument(name = "SluiceDrive::delete_commit", skip(self))]
    pub async fn delete_commit(&self, commit: CommitId) -> Result<Vec<CommitInfo>, SluiceDriveError> {
        let deleted = self.graph.delete_commit(commit).await?;
        self.propagator.on_commits_deleted(&deleted).await?;
        Ok(deleted)
    }

    pub async fn inspect_commit(&self, commit: CommitId) -> Result<CommitInfo, SluiceDriveError> {
        Ok(self.graph.inspect_commit(commit).await?)
    }

    /// Every commit of a repo, newest first.
    pub async fn list_commit(&self, repo: &str) -> Result<Vec<CommitInfo>, SluiceDriveError> {
        Ok(self.graph.list_commit(repo).await?)
    }

    // Pipelines

    /// Create a pipeline, or store a new version of it when `update` is set. Specs are validated
    /// before anything is created.
    #[instrument(name = "SluiceDrive::create_pipeline", skip(self, spec), fields(pipeline = %spec.name))]
    pub async fn create_pipeline(
        &self,
        spec: PipelineSpec,
        update: bool,
        reprocess: bool,
    ) -> Result<PipelineInfo, SluiceDriveError> {
        let existing: Vec<PipelineSpec> =
            self.pipelines.list().into_iter().map(|p| p.spec).collect();
        let repos: BTreeSet<String> = self
            .graph
            .list_repos()
            .await?
            .into_iter()
            .map(|r| r.name)
            .collect();
        validate(&spec, update, &existing, &repos)?;

        let name = spec.name.clone();
        for cron_input in spec.input.crons() {
            self.graph
                .ensure_repo(&Input::cron_repo(&name, &cron_input.name))
                .await?;
        }
        for git in spec.input.gits() {
            self.graph.ensure_repo(&git.effective_name()).await?;
        }
        self.graph.ensure_repo(&name).await?;

        let info = if self.pipelines.contains(&name) {
            self.pipelines.update(spec.clone(), reprocess)?
        } else {
            let info = self.pipelines.create(spec.clone())?;
            let stop = self.shutdown.child_token();
            let controller =
                PipelineController::new(&name, self.controllers.clone(), stop.clone()).spawn();
            self.tasks.insert(
                name.clone(),
                PipelineTasks {
                    crons: stop.child_token(),
                    stop,
                    controller,
                },
            );
            info
        };
        self.start_crons(&spec)?;

        info!("Pipeline {} is at version {}", name, info.version);
        self.propagator.evaluate_all().await?;
        self.inspect_pipeline(&name)
    }

    fn start_crons(&self, spec: &PipelineSpec) -> Result<(), SluiceDriveError> {
        let mut tasks = match self.tasks.get_mut(&spec.name) {
            Some(tasks) => tasks,
            None => return Ok(()),
        };
        tasks.crons.cancel();
        tasks.crons = tasks.stop.child_token();
        for cron_input in spec.input.crons() {
            // Tickers stop on their own once their token is cancelled.
            cron::spawn_ticker(
                self.graph.clone(),
                &spec.name,
                cron_input,
                tasks.crons.clone(),
            )?;
        }
        Ok(())
    }

    pub fn inspect_pipeline(&self, pipeline: &str) -> Result<PipelineInfo, SluiceDriveError> {
        let mut info = self.pipelines.get(pipeline)?;
        info.job_counts = self.jobs.counts(pipeline);
        Ok(info)
    }

    /// The spec a pipeline had at an earlier version.
    pub fn inspect_pipeline_version(
        &self,
        pipeline: &str,
        version: u64,
    ) -> Result<PipelineSpec, SluiceDriveError> {
        Ok(self.pipelines.get_version(pipeline, version)?)
    }

    pub fn list_pipeline(&self) -> Vec<PipelineInfo> {
        self.pipelines
            .list()
            .into_iter()
            .map(|mut info| {
                info.job_counts = self.jobs.counts(info.name());
                info
            })
            .collect()
    }

    /// Delete a pipeline, its jobs, and its output repo. Pipelines that others read from are
    /// only deleted with `force`.
    #[instrument(name = "SluiceDrive::delete_pipeline", skip(self))]
    pub async fn delete_pipeline(&self, pipeline: &str, force: bool) -> Result<(), SluiceDriveError> {
        let info = self.pipelines.get(pipeline)?;
        let dependents = self.propagator.pipeline_graph()?.dependents(pipeline);
        if !dependents.is_empty() && !force {
            return Err(SluiceDriveError::PipelineHasDependents {
                pipeline: pipeline.to_string(),
                dependents,
            });
        }

        let killed = self.jobs.remove_pipeline(pipeline, "pipeline deleted");
        if let Some((_, tasks)) = self.tasks.remove(pipeline) {
            tasks.stop.cancel();
            if let Err(err) = tasks.controller.await {
                warn!("Controller of {} did not stop cleanly: {}", pipeline, err);
            }
        }
        self.pipelines.remove(pipeline)?;
        debug!("Removed {} jobs of {}", killed.len(), pipeline);

        let mut deleted = self.graph.delete_repo(pipeline, true).await?;
        for cron_input in info.spec.input.crons() {
            let repo = Input::cron_repo(pipeline, &cron_input.name);
            match self.graph.delete_repo(&repo, true).await {
                Ok(commits) => deleted.extend(commits),
                Err(GraphError::RepoNotFound { .. }) => (),
                Err(err) => return Err(err.into()),
            }
        }
        self.dedup.forget_pipeline(pipeline);
        self.logs.forget_pipeline(pipeline);

        self.propagator.on_commits_deleted(&deleted).await?;
        info!("Deleted pipeline {}", pipeline);
        Ok(())
    }

    /// Resume a stopped pipeline. Commits that arrived while it was stopped are picked up.
    pub async fn start_pipeline(&self, pipeline: &str) -> Result<PipelineInfo, SluiceDriveError> {
        self.pipelines.resume(pipeline)?;
        self.propagator.evaluate_all().await?;
        self.inspect_pipeline(pipeline)
    }

    /// Pause a pipeline. Its running job is interrupted and goes back in the queue.
    pub fn stop_pipeline(&self, pipeline: &str) -> Result<PipelineInfo, SluiceDriveError> {
        self.pipelines.pause(pipeline)?;
        self.inspect_pipeline(pipeline)
    }

    // Jobs

    /// Jobs newest first, optionally only the ones of a pipeline or the ones that read a commit.
    pub fn list_job(&self, pipeline: Option<&str>, input_commit: Option<CommitId>) -> Vec<JobInfo> {
        self.jobs.list(pipeline, input_commit)
    }

    /// Look up a job. With `block_state`, wait for it to finish first.
    pub async fn inspect_job(
        &self,
        job: JobId,
        block_state: bool,
    ) -> Result<JobInfo, SluiceDriveError> {
        if block_state {
            Ok(self.jobs.wait_terminal(job).await?)
        } else {
            Ok(self.jobs.get(job)?)
        }
    }

    /// Kill a job that has not finished yet.
    #[instrument(name = "SluiceDrive::stop_job", skip(self))]
    pub async fn stop_job(&self, job: JobId) -> Result<JobInfo, SluiceDriveError> {
        let before = self.jobs.get(job)?;
        if before.state.is_terminal() {
            return Ok(before);
        }
        let info = self.jobs.kill(job, "job stopped")?;
        if info.state == JobState::Killed {
            // A queued job has no controller looking after it yet.
            self.propagator
                .seal_output(info.output_commit, None)
                .await?;
        }
        Ok(info)
    }

    /// Delete a job record, stopping it first if it is still going.
    pub async fn delete_job(&self, job: JobId) -> Result<JobInfo, SluiceDriveError> {
        self.stop_job(job).await?;
        Ok(self.jobs.remove(job)?)
    }

    // Datums

    /// One page of a job's datums, in plan order. A `page_size` of zero lists them all.
    pub fn list_datum(
        &self,
        job: JobId,
        page: usize,
        page_size: usize,
    ) -> Result<Page<DatumInfo>, SluiceDriveError> {
        let datums = self.jobs.datums(job)?;
        Ok(Page::of(&datums, page, page_size))
    }

    /// Look up a datum of a job by its id, in hex or base64.
    pub fn inspect_datum(&self, job: JobId, datum: &str) -> Result<DatumInfo, SluiceDriveError> {
        let id = DatumId::parse(datum)?;
        self.jobs
            .datums(job)?
            .into_iter()
            .find(|d| d.id == id)
            .ok_or_else(|| SluiceDriveError::DatumNotFound {
                job,
                datum: datum.to_string(),
            })
    }

    /// Forget a datum's recorded output, so the next job of the pipeline processes it again.
    #[instrument(name = "SluiceDrive::restart_datum", skip(self))]
    pub fn restart_datum(&self, job: JobId, datum: &str) -> Result<DatumInfo, SluiceDriveError> {
        let info = self.inspect_datum(job, datum)?;
        let pipeline = self.jobs.get(job)?.pipeline;
        if self.dedup.evict(&pipeline, &info.id) {
            self.logs.master(
                &pipeline,
                Some(job),
                Some(info.id.clone()),
                "datum restarted",
            );
        }
        Ok(info)
    }

    // Logs

    /// Log lines matching `filter`. With `follow`, the stream stays open for new lines until the
    /// filtered job finishes, or until the drive shuts down when no job is given.
    pub fn get_logs(&self, filter: LogFilter, follow: bool) -> BoxStream<'static, LogLine> {
        if !follow {
            return stream::iter(self.logs.query(&filter)).boxed();
        }
        let shutdown = self.shutdown.clone();
        match filter.job {
            Some(job) => {
                let jobs = self.jobs.clone();
                self.logs.follow(filter, async move {
                    tokio::select! {
                        _ = jobs.wait_terminal(job) => (),
                        _ = shutdown.cancelled() => (),
                    }
                })
            }
            None => self
                .logs
                .follow(filter, async move { shutdown.cancelled().await }),
        }
    }

    // Flushing

    /// Every commit downstream of `commits`, each once, as soon as it is sealed.
    pub fn flush_commit(
        &self,
        commits: Vec<CommitId>,
        to_repos: Option<Vec<String>>,
        deadline: Option<Duration>,
    ) -> BoxStream<'static, Result<CommitInfo, FlushError>> {
        self.flush.flush_commit(commits, to_repos, deadline)
    }

    /// Collect what [SluiceDrive::flush_commit] streams.
    pub async fn flush_commit_all(
        &self,
        commits: Vec<CommitId>,
        to_repos: Option<Vec<String>>,
        deadline: Option<Duration>,
    ) -> Result<Vec<CommitInfo>, SluiceDriveError> {
        Ok(self.flush.wait(commits, to_repos, deadline).await?)
    }

    /// The finished jobs that wrote every commit downstream of `commits`.
    pub async fn flush_job_all(
        &self,
        commits: Vec<CommitId>,
        to_pipelines: Option<Vec<String>>,
        deadline: Option<Duration>,
    ) -> Result<Vec<JobInfo>, SluiceDriveError> {
        Ok(self
            .flush
            .flush_job_all(commits, to_pipelines, deadline)
            .await?)
    }

    // Housekeeping

    /// Delete every pipeline and every repo.
    #[instrument(name = "SluiceDrive::delete_all", skip(self))]
    pub async fn delete_all(&self) -> Result<(), SluiceDriveError> {
        // Downstream pipelines first, so nothing is left reading a deleted repo.
        let mut order = self.propagator.pipeline_graph()?.pipelines();
        order.reverse();
        for pipeline in order {
            self.delete_pipeline(&pipeline, true).await?;
        }
        for repo in self.graph.list_repos().await? {
            match self.graph.delete_repo(&repo.name, true).await {
                Ok(_) | Err(GraphError::RepoNotFound { .. }) => (),
                Err(err) => return Err(err.into()),
            }
        }
        self.logs.clear();
        Ok(())
    }

    /// Stop every background loop and wait for them to exit.
    #[instrument(name = "SluiceDrive::shutdown", skip(self))]
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let names: Vec<String> = self.tasks.iter().map(|t| t.key().clone()).collect();
        for name in names {
            if let Some((_, tasks)) = self.tasks.remove(&name) {
                let _ = tasks.controller.await;
            }
        }
        let background: Vec<JoinHandle<()>> = {
            let mut background = self.background.lock().unwrap_or_else(|p| p.into_inner());
            background.drain(..).collect()
        };
        for handle in background {
            let _ = handle.await;
        }
        self.config.event_channel().send(WorkflowEvent::Shutdown);
        info!("Sluice stopped");
    }
}

impl Drop for SluiceDrive {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Echo commit graph events on the event channel.
fn relay_graph_events(
    mut graph_events: broadcast::Receiver<GraphEvent>,
    events: Arc<EventChannel>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = graph_events.recv() => event,
                _ = shutdown.cancelled() => break,
            };
            match event {
                Ok(GraphEvent::CommitFinished { repo, commit, .. }) => {
                    events.send(CommitEvent::CommitFinished {
                        repo,
                        commit: commit.to_string(),
                    });
                }
                Ok(GraphEvent::CommitsDeleted { commits }) => {
                    let mut by_repo: BTreeMap<String, Vec<String>> = BTreeMap::new();
                    for commit in commits {
                        by_repo
                            .entry(commit.repo)
                            .or_default()
                            .push(commit.id.to_string());
                    }
                    for (repo, commits) in by_repo {
                        events.send(CommitEvent::CommitsDeleted { repo, commits });
                    }
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => (),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[derive(Error, Debug)]
pub enum SluiceDriveError {
    #[error("Repo {repo} is the output of a pipeline, delete the pipeline instead")]
    PipelineOutputRepo { repo: String },

    #[error("Pipeline {pipeline} is read by {dependents:?}, use force to delete it anyway")]
    PipelineHasDependents {
        pipeline: String,
        dependents: Vec<String>,
    },

    #[error("Datum {datum} is not part of job {job}")]
    DatumNotFound { job: JobId, datum: String },

    #[error(transparent)]
    IdError(IdError),

    #[error(transparent)]
    GraphError(GraphError),

    #[error(transparent)]
    LifecycleError(LifecycleError),

    #[error(transparent)]
    ValidationError(ValidationError),

    #[error(transparent)]
    PropagatorError(PropagatorError),

    #[error(transparent)]
    FlushError(FlushError),

    #[error(transparent)]
    CronError(CronError),
}

impl From<IdError> for SluiceDriveError {
    fn from(value: IdError) -> Self {
        SluiceDriveError::IdError(value)
    }
}

impl From<GraphError> for SluiceDriveError {
    fn from(value: GraphError) -> Self {
        SluiceDriveError::GraphError(value)
    }
}

impl From<LifecycleError> for SluiceDriveError {
    fn from(value: LifecycleError) -> Self {
        SluiceDriveError::LifecycleError(value)
    }
}

impl From<ValidationError> for SluiceDriveError {
    fn from(value: ValidationError) -> Self {
        SluiceDriveError::ValidationError(value)
    }
}

impl From<PropagatorError> for SluiceDriveError {
    fn from(value: PropagatorError) -> Self {
        SluiceDriveError::PropagatorError(value)
    }
}

impl From<FlushError> for SluiceDriveError {
    fn from(value: FlushError) -> Self {
        SluiceDriveError::FlushError(value)
    }
}

impl From<CronError> for SluiceDriveError {
    fn from(value: CronError) -> Self {
        SluiceDriveError::CronError(value)
    }
}
