use super::{CommitId, DatumId, JobId};
use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Starting,
    Running,
    Success,
    Failure,
    Killed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Failure | JobState::Killed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Starting => "starting",
            JobState::Running => "running",
            JobState::Success => "success",
            JobState::Failure => "failure",
            JobState::Killed => "killed",
        };
        s.fmt(f)
    }
}

/// One leaf of a job's input, pinned to the commit it reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInput {
    pub name: String,
    pub repo: String,
    pub branch: String,
    pub glob: String,
    /// `None` for leaves under a union branch that had nothing to read yet.
    pub commit: Option<CommitId>,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    #[serde(with = "crate::util::serde::duration")]
    pub download_time: Duration,
    #[serde(with = "crate::util::serde::duration")]
    pub process_time: Duration,
    #[serde(with = "crate::util::serde::duration")]
    pub upload_time: Duration,
    pub download_bytes: u64,
    pub upload_bytes: u64,
}

impl JobStats {
    pub fn add(&mut self, other: &JobStats) {
        self.download_time += other.download_time;
        self.process_time += other.process_time;
        self.upload_time += other.upload_time;
        self.download_bytes += other.download_bytes;
        self.upload_bytes += other.upload_bytes;
    }
}

/// What a single worker of a running job is doing.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker: usize,
    pub queue_size: usize,
    pub current_datum: Option<DatumId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub pipeline: String,
    pub pipeline_version: u64,
    pub inputs: Vec<JobInput>,
    pub output_commit: CommitId,
    pub state: JobState,
    pub reason: Option<String>,

    #[serde(with = "crate::util::serde::iso8601")]
    pub created: DateTime<Utc>,
    #[serde(with = "crate::util::serde::option_iso8601")]
    pub started: Option<DateTime<Utc>>,
    #[serde(with = "crate::util::serde::option_iso8601")]
    pub finished: Option<DateTime<Utc>>,

    pub data_total: u64,
    pub data_processed: u64,
    pub data_skipped: u64,
    pub data_failed: u64,

    /// How many attempts failed and were retried across every datum of the job.
    pub retries: u64,

    pub workers: usize,
    pub worker_status: Vec<WorkerStatus>,
    pub stats: JobStats,
}

impl JobInfo {
    pub fn input_commits(&self) -> Vec<CommitId> {
        self.inputs.iter().filter_map(|i| i.commit).collect()
    }
}
