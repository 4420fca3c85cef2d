//! # Job Scheduling
//!
//! A `Scheduler` takes a job and its plan, skips every datum the dedup cache already knows, and
//! hands the rest out in chunks to a pool of workers. Each worker has a bounded queue, so the
//! dispatcher only moves forward as fast as the slowest free worker allows.
//!
//! Outputs are assembled in plan order once every datum is accounted for, so the result never
//! depends on which worker finished first.
//!
mod chunker;
mod error;
mod materialize;
mod worker;

pub use chunker::*;
pub use error::*;

use crate::config::Config;
use crate::dedup::{DatumRecord, DedupCache};
use crate::egress;
use crate::events::EventChannel;
use crate::executor::DatumExecutor;
use crate::lifecycle::JobRegistry;
use crate::logs::LogStore;
use crate::model::*;
use crate::objects::ObjectStore;
use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::Arc;
use futures::future::select_all;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::*;
use worker::*;

/// A job that is ready to run, along with its plan.
#[derive(Debug, Clone)]
pub struct JobRun {
    pub job: JobId,
    /// The spec of the pipeline version that created the job.
    pub spec: PipelineSpec,
    pub salt: String,
    pub datums: Vec<Datum>,
    /// What the previous job of an incremental pipeline left behind.
    pub parent_output: Option<FileTree>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded { tree: FileTree },
    Failed { reason: String },
    TimedOut { timeout: Duration },
    Cancelled,
}

/// Everything the workers of one job share.
pub(crate) struct JobContext {
    pub(crate) job: JobId,
    pub(crate) pipeline: String,
    pub(crate) spec: PipelineSpec,
    pub(crate) datums: Vec<Datum>,
    pub(crate) parent_output: Option<FileTree>,
    pub(crate) inputs: Vec<String>,
    pub(crate) env: HashMap<String, String>,
    pub(crate) tries: u32,
    pub(crate) scratch_root: PathBuf,
    /// How many chunks are waiting in each worker's queue.
    pub(crate) queued: Vec<AtomicUsize>,
    pub(crate) objects: Arc<dyn ObjectStore>,
    pub(crate) jobs: Arc<JobRegistry>,
    pub(crate) logs: Arc<LogStore>,
    pub(crate) executor: Arc<dyn DatumExecutor>,
    pub(crate) events: Arc<EventChannel>,
}

enum Step<'a> {
    Reserved(usize, mpsc::Permit<'a, Vec<usize>>),
    QueueClosed(usize),
    Result(Option<DatumResult>),
    WorkerExited(Result<(), SchedulerError>),
    TimedOut(Duration),
    Cancelled,
}

/// Wait until any of the queues has room for another chunk.
async fn reserve_any(
    queues: &[mpsc::Sender<Vec<usize>>],
) -> (usize, Option<mpsc::Permit<'_, Vec<usize>>>) {
    if queues.is_empty() {
        return futures::future::pending().await;
    }
    let (permit, index, _) = select_all(queues.iter().map(|tx| Box::pin(tx.reserve()))).await;
    (index, permit.ok())
}

async fn job_deadline(timeout: Option<Duration>) -> Duration {
    match timeout {
        Some(timeout) => {
            tokio::time::sleep(timeout).await;
            timeout
        }
        None => futures::future::pending().await,
    }
}

pub struct Scheduler {
    config: Config,
    objects: Arc<dyn ObjectStore>,
    jobs: Arc<JobRegistry>,
    dedup: Arc<DedupCache>,
    logs: Arc<LogStore>,
    executor: Arc<dyn DatumExecutor>,
}

impl Scheduler {
    pub fn new(
        config: Config,
        objects: Arc<dyn ObjectStore>,
        jobs: Arc<JobRegistry>,
        dedup: Arc<DedupCache>,
        logs: Arc<LogStore>,
        executor: Arc<dyn DatumExecutor>,
    ) -> Self {
        Self {
            config,
            objects,
            jobs,
            dedup,
            logs,
            executor,
        }
    }

    /// The environment every datum of a pipeline starts from: the service's environment plus the
    /// secrets the transform asks for.
    fn environment(&self, transform: &Transform) -> Result<HashMap<String, String>, SchedulerError> {
        let mut env = self.config.env().clone();
        for mount in &transform.secrets {
            let value = self.config.secret(&mount.name, &mount.key).ok_or_else(|| {
                SchedulerError::MissingSecret {
                    name: mount.name.clone(),
                    key: mount.key.clone(),
                }
            })?;
            env.insert(mount.env_var.clone(), value.clone());
        }
        Ok(env)
    }

    /// Run a job to completion. The job is moved to Running here, but reaching a terminal state
    /// is left to the caller, which also owns the output commit.
    #[instrument(name = "Scheduler::run", skip(self, run, cancel), fields(job = %run.job, pipeline = %run.spec.name))]
    pub async fn run(
        &self,
        run: JobRun,
        cancel: CancellationToken,
    ) -> Result<JobOutcome, SchedulerError> {
        let JobRun {
            job,
            spec,
            salt,
            datums,
            parent_output,
        } = run;

        let env = self.environment(&spec.transform)?;
        let workers = ParallelismSpec::worker_count(
            spec.parallelism_spec.as_ref(),
            self.config.cluster_nodes(),
        );
        let tries = spec
            .datum_tries
            .unwrap_or_else(|| self.config.default_datum_tries())
            .max(1);
        let max_queue = spec
            .max_queue_size
            .unwrap_or_else(|| self.config.default_max_queue_size())
            .max(1);

        let mut infos: Vec<DatumInfo> = datums
            .iter()
            .enumerate()
            .map(|(index, datum)| DatumInfo::pending(job, index, datum))
            .collect();
        let mut skipped: BTreeMap<usize, DatumRecord> = BTreeMap::new();
        let mut pending = vec![];
        for (index, datum) in datums.iter().enumerate() {
            match self.dedup.lookup(&spec.name, &salt, &datum.id) {
                Some(record) => {
                    infos[index].state = DatumState::Skipped;
                    skipped.insert(index, record);
                }
                None => pending.push((index, datum.size_bytes())),
            }
        }

        self.jobs.set_datums(job, infos)?;
        self.jobs.transition(job, JobState::Running, None)?;
        self.jobs.update(job, |info| {
            info.workers = workers;
            info.data_total = datums.len() as u64;
            info.data_processed = 0;
            info.data_skipped = skipped.len() as u64;
            info.data_failed = 0;
            info.retries = 0;
            info.stats = JobStats::default();
        })?;
        info!(
            "Job {} has {} datums, {} to process over {} workers",
            job,
            datums.len(),
            pending.len(),
            workers
        );

        let mut names = spec.input.names(&spec.name);
        names.sort();
        names.dedup();

        let ctx = Arc::new(JobContext {
            job,
            pipeline: spec.name.clone(),
            spec: spec.clone(),
            datums: datums.clone(),
            parent_output: parent_output.clone(),
            inputs: names,
            env,
            tries,
            scratch_root: self.config.scratch_root().clone(),
            queued: (0..workers).map(|_| AtomicUsize::new(0)).collect(),
            objects: self.objects.clone(),
            jobs: self.jobs.clone(),
            logs: self.logs.clone(),
            executor: self.executor.clone(),
            events: self.config.event_channel(),
        });

        let mut chunks: VecDeque<Vec<usize>> = chunk(&pending, spec.chunk_spec.as_ref()).into();
        let worker_cancel = cancel.child_token();
        let (results_tx, mut results_rx) = mpsc::channel(pending.len().max(1));
        let mut queues = vec![];
        let mut pool = JoinSet::new();
        for worker in 0..workers {
            let (tx, rx) = mpsc::channel(max_queue);
            queues.push(tx);
            pool.spawn(run_worker(
                worker,
                ctx.clone(),
                rx,
                results_tx.clone(),
                worker_cancel.clone(),
            ));
        }
        drop(results_tx);
        if chunks.is_empty() {
            queues.clear();
        }

        let mut outputs: BTreeMap<usize, FileTree> = BTreeMap::new();
        let mut failure: Option<String> = None;
        let mut interrupted: Option<JobOutcome> = None;
        let mut worker_error: Option<SchedulerError> = None;

        let deadline = job_deadline(spec.job_timeout);
        tokio::pin!(deadline);

        loop {
            let step = tokio::select! {
                (index, permit) = reserve_any(&queues), if !chunks.is_empty() => match permit {
                    Some(permit) => Step::Reserved(index, permit),
                    None => Step::QueueClosed(index),
                },
                result = results_rx.recv() => Step::Result(result),
                Some(joined) = pool.join_next() => Step::WorkerExited(match joined {
                    Ok(result) => result,
                    Err(err) => Err(SchedulerError::WorkerCrashed {
                        job: job.to_string(),
                        reason: err.to_string(),
                    }),
                }),
                timeout = &mut deadline => Step::TimedOut(timeout),
                _ = cancel.cancelled() => Step::Cancelled,
            };

            match step {
                Step::Reserved(index, permit) => {
                    if let Some(next) = chunks.pop_front() {
                        ctx.queued[index].fetch_add(1, Ordering::SeqCst);
                        trace!("Queued chunk {:?} on worker {}", next, index);
                        permit.send(next);
                    }
                    if chunks.is_empty() {
                        queues.clear();
                    }
                }

                Step::QueueClosed(index) => {
                    queues.remove(index);
                }

                Step::Result(None) => break,

                Step::Result(Some(DatumResult::Succeeded {
                    index,
                    output,
                    stats,
                })) => {
                    let datum = &datums[index];
                    self.dedup.record(
                        &spec.name,
                        &salt,
                        datum.id.clone(),
                        DatumRecord {
                            job,
                            output: output.clone(),
                            stats: stats.clone(),
                        },
                    );
                    self.jobs.update(job, |info| {
                        info.data_processed += 1;
                        info.stats.add(&stats);
                    })?;
                    outputs.insert(index, output);
                }

                Step::Result(Some(DatumResult::Failed {
                    index,
                    error,
                    stats,
                })) => {
                    self.jobs.update(job, |info| {
                        info.data_failed += 1;
                        info.stats.add(&stats);
                    })?;
                    if failure.is_none() {
                        failure = Some(format!("datum {} failed: {}", datums[index].id, error));
                        chunks.clear();
                        queues.clear();
                        worker_cancel.cancel();
                    }
                }

                Step::Result(Some(DatumResult::Cancelled { .. })) => (),

                Step::WorkerExited(Ok(())) => (),

                Step::WorkerExited(Err(err)) => {
                    error!("A worker of job {} failed: {}", job, err);
                    worker_error = Some(err);
                    break;
                }

                Step::TimedOut(timeout) => {
                    warn!("Job {} ran past its timeout of {:?}", job, timeout);
                    interrupted = Some(JobOutcome::TimedOut { timeout });
                    break;
                }

                Step::Cancelled => {
                    debug!("Job {} was cancelled", job);
                    interrupted = Some(JobOutcome::Cancelled);
                    break;
                }
            }
        }

        worker_cancel.cancel();
        drop(queues);
        while let Some(joined) = pool.join_next().await {
            match joined {
                Ok(Err(err)) if worker_error.is_none() => worker_error = Some(err),
                Err(err) if worker_error.is_none() && !err.is_cancelled() => {
                    worker_error = Some(SchedulerError::WorkerCrashed {
                        job: job.to_string(),
                        reason: err.to_string(),
                    })
                }
                _ => (),
            }
        }

        if let Some(outcome) = interrupted {
            return Ok(outcome);
        }
        if let Some(err) = worker_error {
            return Err(err);
        }
        if let Some(reason) = failure {
            return Ok(JobOutcome::Failed { reason });
        }

        let tree = assemble(job, &spec, datums.len(), &outputs, &skipped, parent_output);

        if let Some(target) = &spec.egress {
            if let Err(err) = egress::push(&target.url, &tree, self.objects.as_ref()).await {
                warn!("Job {} could not push its output: {}", job, err);
                self.logs
                    .master(&spec.name, Some(job), None, format!("egress failed: {}", err));
                return Ok(JobOutcome::Failed {
                    reason: format!("egress failed: {}", err),
                });
            }
        }

        Ok(JobOutcome::Succeeded { tree })
    }
}

/// Merge the per-datum outputs in plan order.
///
/// Regular pipelines concatenate colliding paths. Incremental pipelines start from the previous
/// output, and every datum only contributes the files it changed, so the highest plan index wins
/// a collision.
fn assemble(
    job: JobId,
    spec: &PipelineSpec,
    count: usize,
    outputs: &BTreeMap<usize, FileTree>,
    skipped: &BTreeMap<usize, DatumRecord>,
    parent: Option<FileTree>,
) -> FileTree {
    if !spec.incremental {
        let mut tree = FileTree::new();
        for index in 0..count {
            if let Some(output) = outputs.get(&index) {
                tree.concat(output);
            } else if let Some(record) = skipped.get(&index) {
                tree.concat(&record.output);
            }
        }
        return tree;
    }

    let parent = parent.unwrap_or_default();
    let mut tree = parent.clone();
    for index in 0..count {
        let output = match (outputs.get(&index), skipped.get(&index)) {
            (Some(output), _) => output,
            // Datums skipped from an earlier run of this very job still have to land.
            (None, Some(record)) if record.job == job => &record.output,
            _ => continue,
        };
        for (path, entry) in output.iter() {
            if parent.get(path) != Some(entry) {
                tree.insert(path, entry.clone());
            }
        }
    }
    tree
}
