use super::*;
use crate::events::event::JobEvent;
use crate::events::EventChannel;
use crate::model::{CommitId, DatumInfo, JobId, JobInfo, JobState, WorkerStatus};
use crate::sync::atomic::{AtomicU64, Ordering};
use crate::sync::{Arc, Mutex, RwLock};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::*;

struct JobSlot {
    /// Creation order, used to list jobs newest first.
    seq: u64,
    info: watch::Sender<JobInfo>,
    datums: RwLock<Vec<DatumInfo>>,
    cancel: Mutex<CancellationToken>,
}

/// Keeps every job record and the state machine that moves them along.
///
/// Waiting on a job is done through a watch, so blocking on a job's state never polls.
///
pub struct JobRegistry {
    jobs: DashMap<JobId, Arc<JobSlot>>,
    seq: AtomicU64,
    events: Arc<EventChannel>,
}

impl JobRegistry {
    pub fn new(events: Arc<EventChannel>) -> Self {
        Self {
            jobs: DashMap::new(),
            seq: AtomicU64::new(0),
            events,
        }
    }

    fn slot(&self, job: JobId) -> Result<Arc<JobSlot>, LifecycleError> {
        self.jobs
            .get(&job)
            .map(|s| s.value().clone())
            .ok_or(LifecycleError::JobNotFound { job })
    }

    #[instrument(name = "JobRegistry::create", skip(self, info), fields(job = %info.id))]
    pub fn create(&self, info: JobInfo) -> JobInfo {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let (tx, _) = watch::channel(info.clone());
        self.jobs.insert(
            info.id,
            Arc::new(JobSlot {
                seq,
                info: tx,
                datums: RwLock::new(vec![]),
                cancel: Mutex::new(CancellationToken::new()),
            }),
        );
        self.events.send(JobEvent::JobCreated {
            pipeline: info.pipeline.clone(),
            job: info.id.to_string(),
            output_commit: info.output_commit.to_string(),
        });
        info
    }

    pub fn get(&self, job: JobId) -> Result<JobInfo, LifecycleError> {
        Ok(self.slot(job)?.info.borrow().clone())
    }

    pub fn contains(&self, job: JobId) -> bool {
        self.jobs.contains_key(&job)
    }

    /// Jobs newest first, optionally only the ones of a pipeline or the ones reading a commit.
    pub fn list(&self, pipeline: Option<&str>, input_commit: Option<CommitId>) -> Vec<JobInfo> {
        let mut jobs: Vec<(u64, JobInfo)> = self
            .jobs
            .iter()
            .map(|slot| (slot.seq, slot.info.borrow().clone()))
            .filter(|(_, info)| pipeline.map(|p| info.pipeline == p).unwrap_or(true))
            .filter(|(_, info)| {
                input_commit
                    .map(|c| info.input_commits().contains(&c))
                    .unwrap_or(true)
            })
            .collect();
        jobs.sort_by(|(a, _), (b, _)| b.cmp(a));
        jobs.into_iter().map(|(_, info)| info).collect()
    }

    /// The oldest job of a pipeline that is waiting to run.
    pub fn next_pending(&self, pipeline: &str) -> Option<JobInfo> {
        self.jobs
            .iter()
            .map(|slot| (slot.seq, slot.info.borrow().clone()))
            .filter(|(_, info)| info.pipeline == pipeline && info.state == JobState::Starting)
            .min_by_key(|(seq, _)| *seq)
            .map(|(_, info)| info)
    }

    pub fn by_output_commit(&self, commit: CommitId) -> Option<JobInfo> {
        self.jobs
            .iter()
            .map(|slot| slot.info.borrow().clone())
            .find(|info| info.output_commit == commit)
    }

    pub fn counts(&self, pipeline: &str) -> BTreeMap<JobState, u64> {
        let mut counts = BTreeMap::new();
        for slot in self.jobs.iter() {
            let info = slot.info.borrow();
            if info.pipeline == pipeline {
                *counts.entry(info.state).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Move a job to a new state. Starting a job stamps its start time, and reaching a terminal
    /// state stamps its finish time.
    pub fn transition(
        &self,
        job: JobId,
        to: JobState,
        reason: Option<String>,
    ) -> Result<JobInfo, LifecycleError> {
        self.transition_at(job, to, reason, Utc::now())
    }

    #[instrument(name = "JobRegistry::transition", skip(self))]
    pub fn transition_at(
        &self,
        job: JobId,
        to: JobState,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<JobInfo, LifecycleError> {
        let slot = self.slot(job)?;
        let mut result = Ok(());
        slot.info.send_if_modified(|info| {
            if !info.state.can_transition_to(to) {
                result = Err(LifecycleError::InvalidJobTransition {
                    job,
                    from: info.state,
                    to,
                });
                return false;
            }
            info.state = to;
            if reason.is_some() {
                info.reason = reason.clone();
            }
            match to {
                JobState::Running => {
                    info.started = Some(at);
                    info.finished = None;
                }
                JobState::Starting => {
                    info.worker_status.clear();
                }
                _ => {
                    info.finished = Some(at);
                    info.worker_status.clear();
                }
            }
            true
        });
        result?;

        let info = slot.info.borrow().clone();
        debug!("Job {} is now {}", job, info.state);
        self.events.send(JobEvent::JobStateChanged {
            pipeline: info.pipeline.clone(),
            job: job.to_string(),
            state: info.state,
            reason: info.reason.clone(),
        });
        Ok(info)
    }

    /// Kill a job that has not finished yet, and cancel whatever is running on its behalf.
    /// Killing a finished job leaves it as it was.
    pub fn kill(&self, job: JobId, reason: &str) -> Result<JobInfo, LifecycleError> {
        let slot = self.slot(job)?;
        let state = slot.info.borrow().state;
        if state.is_terminal() {
            return Ok(slot.info.borrow().clone());
        }
        let info = self.transition(job, JobState::Killed, Some(reason.to_string()))?;
        self.cancel_token(job)?.cancel();
        Ok(info)
    }

    /// Update the progress counters of a job.
    pub fn update<F>(&self, job: JobId, f: F) -> Result<JobInfo, LifecycleError>
    where
        F: FnOnce(&mut JobInfo),
    {
        let slot = self.slot(job)?;
        slot.info.send_modify(f);
        let info = slot.info.borrow().clone();
        Ok(info)
    }

    pub fn set_worker_status(
        &self,
        job: JobId,
        status: WorkerStatus,
    ) -> Result<(), LifecycleError> {
        self.update(job, |info| {
            match info
                .worker_status
                .iter_mut()
                .find(|w| w.worker == status.worker)
            {
                Some(current) => *current = status,
                None => {
                    info.worker_status.push(status);
                    info.worker_status.sort_by_key(|w| w.worker);
                }
            }
        })
        .map(|_| ())
    }

    pub fn set_datums(&self, job: JobId, datums: Vec<DatumInfo>) -> Result<(), LifecycleError> {
        let slot = self.slot(job)?;
        let mut current = slot.datums.write().unwrap_or_else(|p| p.into_inner());
        *current = datums;
        Ok(())
    }

    pub fn update_datum<F>(&self, job: JobId, index: usize, f: F) -> Result<(), LifecycleError>
    where
        F: FnOnce(&mut DatumInfo),
    {
        let slot = self.slot(job)?;
        let mut datums = slot.datums.write().unwrap_or_else(|p| p.into_inner());
        let datum = datums
            .get_mut(index)
            .ok_or(LifecycleError::DatumNotFound { job, index })?;
        f(datum);
        Ok(())
    }

    /// Every datum of a job, in plan order.
    pub fn datums(&self, job: JobId) -> Result<Vec<DatumInfo>, LifecycleError> {
        let slot = self.slot(job)?;
        let datums = slot.datums.read().unwrap_or_else(|p| p.into_inner());
        Ok(datums.clone())
    }

    pub fn cancel_token(&self, job: JobId) -> Result<CancellationToken, LifecycleError> {
        let slot = self.slot(job)?;
        let token = slot.cancel.lock().unwrap_or_else(|p| p.into_inner());
        Ok(token.clone())
    }

    /// Block until a job reaches a terminal state.
    pub async fn wait_terminal(&self, job: JobId) -> Result<JobInfo, LifecycleError> {
        self.wait_for(job, |info| info.state.is_terminal()).await
    }

    /// Block until a job's record satisfies `predicate`. Fails if the job is deleted meanwhile.
    pub async fn wait_for<P>(&self, job: JobId, predicate: P) -> Result<JobInfo, LifecycleError>
    where
        P: Fn(&JobInfo) -> bool,
    {
        let mut rx = self.slot(job)?.info.subscribe();
        loop {
            {
                let info = rx.borrow_and_update();
                if predicate(&info) {
                    return Ok(info.clone());
                }
            }
            if rx.changed().await.is_err() {
                return Err(LifecycleError::JobNotFound { job });
            }
        }
    }

    /// Delete a finished job.
    #[instrument(name = "JobRegistry::remove", skip(self))]
    pub fn remove(&self, job: JobId) -> Result<JobInfo, LifecycleError> {
        let info = self.get(job)?;
        if !info.state.is_terminal() {
            return Err(LifecycleError::JobNotTerminal {
                job,
                state: info.state,
            });
        }
        self.jobs.remove(&job);
        Ok(info)
    }

    /// Kill and forget every job of a pipeline.
    pub fn remove_pipeline(&self, pipeline: &str, reason: &str) -> Vec<JobInfo> {
        let jobs: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|slot| slot.info.borrow().pipeline == pipeline)
            .map(|slot| *slot.key())
            .collect();
        jobs.into_iter()
            .filter_map(|job| {
                let _ = self.kill(job, reason);
                self.jobs.remove(&job).map(|(_, slot)| slot.info.borrow().clone())
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
