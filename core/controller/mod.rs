//! # Pipeline Controllers
//!
//! Every pipeline gets a controller: a loop that picks up the oldest pending job of its pipeline,
//! waits for the job's input commits to be sealed, plans its datums and hands them to the
//! scheduler. The controller is also what moves the pipeline between RUNNING and STANDBY, and what
//! gives up on a pipeline that keeps failing.
//!
//! A controller only ever suspends on its pipeline's waker, on graph events while inputs are
//! still open, or on the job it is running.
//!
mod error;

pub use error::*;

use crate::config::Config;
use crate::graph::{CommitGraph, GraphError};
use crate::lifecycle::{JobRegistry, LifecycleError, PipelineRegistry};
use crate::logs::LogStore;
use crate::model::*;
use crate::planner::{DatumPlanner, LeafSnapshot};
use crate::propagator::Propagator;
use crate::scheduler::{JobOutcome, JobRun, Scheduler};
use crate::sync::Arc;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// The services every controller works with.
#[derive(Clone)]
pub struct ControllerContext {
    pub config: Config,
    pub graph: Arc<dyn CommitGraph>,
    pub pipelines: Arc<PipelineRegistry>,
    pub jobs: Arc<JobRegistry>,
    pub logs: Arc<LogStore>,
    pub scheduler: Arc<Scheduler>,
    pub propagator: Arc<Propagator>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Killed,
    Paused,
    Shutdown,
}

enum Inputs {
    Ready(Vec<Option<CommitInfo>>),
    Interrupted(Interrupt),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Idle {
    Woken,
    Standby,
    Stopped,
}

pub struct PipelineController {
    pipeline: String,
    ctx: ControllerContext,
    planner: DatumPlanner,
    shutdown: CancellationToken,
}

impl PipelineController {
    pub fn new(
        pipeline: impl Into<String>,
        ctx: ControllerContext,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            pipeline: pipeline.into(),
            ctx,
            planner: DatumPlanner::new(),
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    #[instrument(name = "PipelineController::run", skip(self), fields(pipeline = %self.pipeline))]
    pub async fn run(self) {
        let waker = match self.ctx.pipelines.waker(&self.pipeline) {
            Ok(waker) => waker,
            Err(err) => {
                warn!("Not starting a controller: {}", err);
                return;
            }
        };
        debug!("Controller of {} started", self.pipeline);

        let mut restarts = 0;
        while !self.shutdown.is_cancelled() {
            let info = match self.ctx.pipelines.get(&self.pipeline) {
                Ok(info) => info,
                Err(_) => break,
            };

            if matches!(info.state, PipelineState::Paused | PipelineState::Failure) {
                if self.idle(&waker, false).await == Idle::Stopped {
                    break;
                }
                continue;
            }

            let job = match self.ctx.jobs.next_pending(&self.pipeline) {
                Some(job) => job,
                None => {
                    if info.state == PipelineState::Starting && !info.spec.standby {
                        self.set_state(PipelineState::Running);
                    }
                    let standby = info.spec.standby && info.state != PipelineState::Standby;
                    match self.idle(&waker, standby).await {
                        Idle::Woken => (),
                        Idle::Standby => self.set_state(PipelineState::Standby),
                        Idle::Stopped => break,
                    }
                    continue;
                }
            };

            match self.run_job(job).await {
                Ok(()) => restarts = 0,
                Err(err) if err.is_pipeline_fatal() => {
                    self.fail_pipeline(err.to_string()).await;
                }
                Err(err) => {
                    restarts += 1;
                    warn!(
                        "Controller of {} hit an error ({} of {}): {}",
                        self.pipeline,
                        restarts,
                        self.ctx.config.max_controller_restarts(),
                        err
                    );
                    if restarts > self.ctx.config.max_controller_restarts() {
                        self.fail_pipeline(format!("crash loop: {}", err)).await;
                        restarts = 0;
                    } else {
                        tokio::time::sleep(Duration::from_millis(50 * restarts as u64)).await;
                    }
                }
            }
        }
        debug!("Controller of {} stopped", self.pipeline);
    }

    async fn idle(&self, waker: &Notify, standby: bool) -> Idle {
        tokio::select! {
            _ = waker.notified() => Idle::Woken,
            _ = tokio::time::sleep(self.ctx.config.standby_grace()), if standby => Idle::Standby,
            _ = self.shutdown.cancelled() => Idle::Stopped,
        }
    }

    fn set_state(&self, state: PipelineState) {
        if let Err(err) = self.ctx.pipelines.set_state(&self.pipeline, state, None) {
            debug!("Pipeline {} stays where it is: {}", self.pipeline, err);
        }
    }

    /// Mark the pipeline as failed, along with every job it had not finished.
    async fn fail_pipeline(&self, reason: String) {
        error!("Pipeline {} failed: {}", self.pipeline, reason);
        self.ctx
            .logs
            .master(&self.pipeline, None, None, format!("pipeline failed: {}", reason));
        if let Err(err) =
            self.ctx
                .pipelines
                .set_state(&self.pipeline, PipelineState::Failure, Some(reason.clone()))
        {
            warn!("Could not fail pipeline {}: {}", self.pipeline, err);
        }

        for job in self.ctx.jobs.list(Some(&self.pipeline), None) {
            if job.state.is_terminal() {
                continue;
            }
            let result = async {
                if self.finish(job.id, JobState::Failure, Some(reason.clone()), Utc::now())? {
                    self.seal(job.output_commit, None).await?;
                }
                Ok::<(), ControllerError>(())
            }
            .await;
            if let Err(err) = result {
                warn!("Could not fail job {}: {}", job.id, err);
            }
        }
    }

    /// Move a job to a terminal state. Returns false if something else got there first.
    fn finish(
        &self,
        job: JobId,
        state: JobState,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<bool, ControllerError> {
        match self.ctx.jobs.transition_at(job, state, reason, at) {
            Ok(_) => Ok(true),
            Err(LifecycleError::InvalidJobTransition { .. }) | Err(LifecycleError::JobNotFound { .. }) => {
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn seal(&self, commit: CommitId, tree: Option<FileTree>) -> Result<(), ControllerError> {
        Ok(self.ctx.propagator.seal_output(commit, tree).await?)
    }

    #[instrument(name = "PipelineController::run_job", skip(self, job), fields(job = %job.id))]
    async fn run_job(&self, job: JobInfo) -> Result<(), ControllerError> {
        let id = job.id;
        let output = job.output_commit;
        let spec = self
            .ctx
            .pipelines
            .get_version(&self.pipeline, job.pipeline_version)?;
        let salt = self.ctx.pipelines.get(&self.pipeline)?.salt;
        let job_cancel = self.ctx.jobs.cancel_token(id)?;
        let pause = self.ctx.pipelines.pause_token(&self.pipeline)?;

        let inputs = match self.wait_for_inputs(&job, &job_cancel, &pause).await? {
            Inputs::Ready(inputs) => inputs,
            Inputs::Interrupted(Interrupt::Killed) => return self.seal(output, None).await,
            Inputs::Interrupted(_) => return Ok(()),
        };

        for commit in inputs.iter().flatten() {
            let upstream = match commit.job.and_then(|j| self.ctx.jobs.get(j).ok()) {
                Some(upstream) => upstream,
                None => continue,
            };
            if matches!(upstream.state, JobState::Failure | JobState::Killed) {
                let reason = format!(
                    "input commit {} of {} was written by job {}, which ended in {}",
                    commit.id, commit.repo, upstream.id, upstream.state
                );
                info!("Job {} cannot run: {}", id, reason);
                self.ctx
                    .logs
                    .master(&self.pipeline, Some(id), None, reason.clone());
                if self.finish(id, JobState::Failure, Some(reason), Utc::now())? {
                    self.seal(output, None).await?;
                }
                return Ok(());
            }
        }

        let snapshots: Vec<LeafSnapshot> = job
            .inputs
            .iter()
            .zip(inputs)
            .map(|(input, commit)| LeafSnapshot {
                name: input.name.clone(),
                repo: input.repo.clone(),
                glob: input.glob.clone(),
                commit: commit.as_ref().map(|c| c.id),
                tree: commit.map(|c| c.tree).unwrap_or_default(),
            })
            .collect();
        let datums = self.planner.plan(&spec.input, &snapshots)?;

        let parent_output = if spec.incremental {
            self.parent_output(output).await?
        } else {
            None
        };

        if pause.is_cancelled() || self.shutdown.is_cancelled() {
            return Ok(());
        }
        if let Ok(info) = self.ctx.pipelines.get(&self.pipeline) {
            if matches!(info.state, PipelineState::Starting | PipelineState::Standby) {
                self.set_state(PipelineState::Running);
            }
        }

        // The run stops when the job is killed, the pipeline is paused, or the service shuts down.
        let token = job_cancel.child_token();
        let relay = {
            let token = token.clone();
            let pause = pause.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = pause.cancelled() => token.cancel(),
                    _ = shutdown.cancelled() => token.cancel(),
                    _ = token.cancelled() => (),
                }
            })
        };

        self.ctx.logs.master(
            &self.pipeline,
            Some(id),
            None,
            format!("started processing {} datums", datums.len()),
        );
        let outcome = self
            .ctx
            .scheduler
            .run(
                JobRun {
                    job: id,
                    spec,
                    salt,
                    datums,
                    parent_output,
                },
                token,
            )
            .await;
        relay.abort();

        match outcome {
            Ok(JobOutcome::Succeeded { tree }) => {
                if self.finish(id, JobState::Success, None, Utc::now())? {
                    self.ctx
                        .logs
                        .master(&self.pipeline, Some(id), None, "job succeeded");
                    self.seal(output, Some(tree)).await
                } else {
                    self.seal(output, None).await
                }
            }

            Ok(JobOutcome::Failed { reason }) => {
                self.ctx.logs.master(
                    &self.pipeline,
                    Some(id),
                    None,
                    format!("job failed: {}", reason),
                );
                self.finish(id, JobState::Failure, Some(reason), Utc::now())?;
                self.seal(output, None).await
            }

            Ok(JobOutcome::TimedOut { timeout }) => {
                let started = self.ctx.jobs.get(id)?.started.unwrap_or_else(Utc::now);
                let elapsed = chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero());
                let reason = format!("job timed out after {}", humantime::format_duration(timeout));
                self.ctx
                    .logs
                    .master(&self.pipeline, Some(id), None, reason.clone());
                self.finish(id, JobState::Killed, Some(reason), started + elapsed)?;
                self.seal(output, None).await
            }

            Ok(JobOutcome::Cancelled) => match self.ctx.jobs.get(id) {
                Ok(info) if info.state.is_terminal() => self.seal(output, None).await,
                Err(LifecycleError::JobNotFound { .. }) => self.seal(output, None).await,
                Ok(info) if pause.is_cancelled() => {
                    debug!("Job {} goes back in the queue until {} resumes", id, self.pipeline);
                    if info.state == JobState::Running {
                        self.ctx.jobs.transition(id, JobState::Starting, None)?;
                    }
                    Ok(())
                }
                Ok(_) => Ok(()),
                Err(err) => Err(err.into()),
            },

            Err(err) => {
                if err.is_pipeline_fatal() {
                    if self.finish(id, JobState::Failure, Some(err.to_string()), Utc::now())? {
                        self.seal(output, None).await?;
                    }
                } else if self.ctx.jobs.get(id)?.state == JobState::Running {
                    self.ctx.jobs.transition(id, JobState::Starting, None)?;
                }
                Err(err.into())
            }
        }
    }

    /// Wait until every commit the job reads is sealed.
    async fn wait_for_inputs(
        &self,
        job: &JobInfo,
        job_cancel: &CancellationToken,
        pause: &CancellationToken,
    ) -> Result<Inputs, ControllerError> {
        // Subscribe first so a commit sealed between the check and the wait is not missed.
        let mut events = self.ctx.graph.subscribe();
        loop {
            let mut commits = Vec::with_capacity(job.inputs.len());
            let mut open = None;
            for input in &job.inputs {
                let commit = match input.commit {
                    Some(commit) => match self.ctx.graph.inspect_commit(commit).await {
                        Ok(commit) => Some(commit),
                        Err(GraphError::CommitNotFound { .. }) => {
                            self.ctx.jobs.kill(job.id, "input commit deleted")?;
                            return Ok(Inputs::Interrupted(Interrupt::Killed));
                        }
                        Err(err) => return Err(err.into()),
                    },
                    None => None,
                };
                if let Some(commit) = &commit {
                    if !commit.is_finished() && open.is_none() {
                        open = Some(commit.id);
                    }
                }
                commits.push(commit);
            }

            let open = match open {
                Some(open) => open,
                None => return Ok(Inputs::Ready(commits)),
            };
            trace!("Job {} is waiting for commit {}", job.id, open);

            let interrupt = tokio::select! {
                event = events.recv() => match event {
                    Err(broadcast::error::RecvError::Closed) => Some(Interrupt::Shutdown),
                    _ => None,
                },
                _ = job_cancel.cancelled() => Some(Interrupt::Killed),
                _ = pause.cancelled() => Some(Interrupt::Paused),
                _ = self.shutdown.cancelled() => Some(Interrupt::Shutdown),
            };
            if let Some(interrupt) = interrupt {
                return Ok(Inputs::Interrupted(interrupt));
            }
        }
    }

    /// The output of the nearest earlier job of this pipeline that succeeded.
    async fn parent_output(&self, output: CommitId) -> Result<Option<FileTree>, ControllerError> {
        let mut next = self.ctx.graph.inspect_commit(output).await?.parent;
        while let Some(id) = next {
            let commit = match self.ctx.graph.inspect_commit(id).await {
                Ok(commit) => commit,
                Err(GraphError::CommitNotFound { .. }) => break,
                Err(err) => return Err(err.into()),
            };
            let succeeded = commit
                .job
                .and_then(|job| self.ctx.jobs.get(job).ok())
                .map(|job| job.state == JobState::Success)
                .unwrap_or(false);
            if succeeded {
                return Ok(Some(commit.tree));
            }
            next = commit.parent;
        }
        Ok(None)
    }
}
