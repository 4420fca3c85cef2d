use super::materialize::DatumView;
use super::*;
use crate::events::event::DatumEvent;
use crate::executor::{ExecutionOutcome, Invocation};
use crate::model::{DatumState, JobStats, WorkerStatus};
use crate::sync::atomic::Ordering;
use std::time::Instant;
use tracing::*;

/// How a datum ended up, as reported back to the dispatcher.
#[derive(Debug)]
pub(crate) enum DatumResult {
    Succeeded {
        index: usize,
        output: FileTree,
        stats: JobStats,
    },
    Failed {
        index: usize,
        error: String,
        stats: JobStats,
    },
    Cancelled {
        index: usize,
    },
}

impl JobContext {
    fn report(&self, worker: usize, current: Option<usize>) -> Result<(), SchedulerError> {
        self.jobs.set_worker_status(
            self.job,
            WorkerStatus {
                worker,
                queue_size: self.queued[worker].load(Ordering::SeqCst),
                current_datum: current.map(|i| self.datums[i].id.clone()),
            },
        )?;
        Ok(())
    }
}

/// A worker processes the chunks in its queue one datum at a time, until the queue is closed or
/// it is cancelled.
pub(crate) async fn run_worker(
    worker: usize,
    ctx: Arc<JobContext>,
    mut chunks: mpsc::Receiver<Vec<usize>>,
    results: mpsc::Sender<DatumResult>,
    cancel: CancellationToken,
) -> Result<(), SchedulerError> {
    loop {
        let chunk = tokio::select! {
            chunk = chunks.recv() => chunk,
            _ = cancel.cancelled() => None,
        };
        let chunk = match chunk {
            Some(chunk) => chunk,
            None => break,
        };
        ctx.queued[worker].fetch_sub(1, Ordering::SeqCst);

        for index in chunk {
            if cancel.is_cancelled() {
                return Ok(());
            }
            ctx.report(worker, Some(index))?;
            let result = process_datum(&ctx, worker, index, &cancel).await?;
            if results.send(result).await.is_err() {
                return Ok(());
            }
        }
        ctx.report(worker, None)?;
    }
    Ok(())
}

#[instrument(name = "scheduler::process_datum", skip(ctx, cancel))]
async fn process_datum(
    ctx: &JobContext,
    worker: usize,
    index: usize,
    cancel: &CancellationToken,
) -> Result<DatumResult, SchedulerError> {
    let datum = &ctx.datums[index];
    ctx.events.send(DatumEvent::DatumStarted {
        job: ctx.job.to_string(),
        datum: datum.id.to_string(),
        worker,
    });

    let mut stats = JobStats::default();
    let mut user_lines = vec![];
    let mut last_error = String::new();
    let mut attempts = 0;

    for attempt in 1..=ctx.tries {
        attempts = attempt;
        let view = DatumView::create(&ctx.scratch_root, ctx.job, index, &ctx.inputs).await?;

        let download = Instant::now();
        let mut downloaded = view.download(ctx.objects.as_ref(), datum).await?;
        if ctx.spec.incremental {
            if let Some(parent) = &ctx.parent_output {
                downloaded += view.seed_output(ctx.objects.as_ref(), parent).await?;
            }
        }
        stats.download_time += download.elapsed();
        stats.download_bytes += downloaded;

        let invocation = Invocation {
            job: ctx.job,
            datum: datum.id.clone(),
            transform: ctx.spec.transform.clone(),
            root: view.root().to_path_buf(),
            inputs: ctx.inputs.clone(),
            env: ctx.env.clone(),
            timeout: ctx.spec.datum_timeout,
        };

        let outcome = match ctx.executor.execute(&invocation, cancel).await {
            Ok(outcome) => outcome,
            Err(err) => {
                view.remove().await;
                return Err(err.into());
            }
        };

        match outcome {
            ExecutionOutcome::Succeeded { elapsed, output } => {
                ctx.log_output(&datum.id, &output);
                user_lines.extend(output);
                stats.process_time += elapsed;

                let upload = Instant::now();
                let uploaded = view.upload(ctx.objects.as_ref()).await;
                view.remove().await;
                let (tree, uploaded_bytes) = uploaded?;
                stats.upload_time += upload.elapsed();
                stats.upload_bytes += uploaded_bytes;

                ctx.jobs.update_datum(ctx.job, index, |info| {
                    info.state = DatumState::Success;
                    info.stats = stats.clone();
                    info.attempts = attempts;
                    info.error = None;
                    if ctx.spec.enable_stats {
                        info.logs = user_lines.clone();
                    }
                })?;
                ctx.events.send(DatumEvent::DatumCompleted {
                    job: ctx.job.to_string(),
                    datum: datum.id.to_string(),
                    state: DatumState::Success,
                });

                return Ok(DatumResult::Succeeded {
                    index,
                    output: tree,
                    stats,
                });
            }

            ExecutionOutcome::Failed {
                elapsed,
                error,
                output,
            } => {
                view.remove().await;
                ctx.log_output(&datum.id, &output);
                user_lines.extend(output);
                stats.process_time += elapsed;
                ctx.attempt_failed(index, attempt, elapsed, &error)?;
                last_error = error;
            }

            ExecutionOutcome::TimedOut { timeout, output } => {
                view.remove().await;
                ctx.log_output(&datum.id, &output);
                user_lines.extend(output);
                stats.process_time = timeout;
                let error = format!("datum timed out after {}", humantime::format_duration(timeout));
                ctx.attempt_failed(index, ctx.tries, timeout, &error)?;
                last_error = error;
                // A datum that hit its timeout is not retried.
                break;
            }

            ExecutionOutcome::Cancelled => {
                view.remove().await;
                return Ok(DatumResult::Cancelled { index });
            }
        }
    }

    ctx.jobs.update_datum(ctx.job, index, |info| {
        info.state = DatumState::Failed;
        info.stats = stats.clone();
        info.attempts = attempts;
        info.error = Some(last_error.clone());
        if ctx.spec.enable_stats {
            info.logs = user_lines.clone();
        }
    })?;
    ctx.events.send(DatumEvent::DatumCompleted {
        job: ctx.job.to_string(),
        datum: datum.id.to_string(),
        state: DatumState::Failed,
    });

    Ok(DatumResult::Failed {
        index,
        error: last_error,
        stats,
    })
}

impl JobContext {
    fn log_output(&self, datum: &DatumId, output: &[String]) {
        for line in output {
            self.logs.user(&self.pipeline, self.job, datum.clone(), line.clone());
        }
    }

    fn attempt_failed(
        &self,
        index: usize,
        attempt: u32,
        elapsed: Duration,
        error: &str,
    ) -> Result<(), SchedulerError> {
        let datum = &self.datums[index].id;
        let message = format!(
            "errored running user code after {}: {}",
            humantime::format_duration(elapsed),
            error
        );
        warn!("Datum {} of job {}: {}", datum, self.job, message);
        self.logs
            .master(&self.pipeline, Some(self.job), Some(datum.clone()), message);
        self.events.send(DatumEvent::DatumAttemptFailed {
            job: self.job.to_string(),
            datum: datum.to_string(),
            attempt,
            error: error.to_string(),
        });
        if attempt < self.tries {
            self.jobs.update(self.job, |info| info.retries += 1)?;
        }
        Ok(())
    }
}
