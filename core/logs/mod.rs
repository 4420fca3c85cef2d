//! # Job Logs
//!
//! What user code printed, plus what the system had to say about running it. These are the lines
//! served by `get_logs`, and are kept apart from the tracing output of the service itself.
//!

use crate::model::{DatumId, JobId};
use crate::sync::atomic::{AtomicU64, Ordering};
use crate::sync::RwLock;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use futures::Future;
use serde_derive::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::*;

const FOLLOW_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub seq: u64,
    pub pipeline: String,
    pub job: Option<JobId>,
    pub datum: Option<DatumId>,
    /// Lines written by the system rather than by user code.
    pub master: bool,
    pub message: String,
    #[serde(with = "crate::util::serde::iso8601")]
    pub ts: DateTime<Utc>,
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub pipeline: Option<String>,
    pub job: Option<JobId>,
    pub datum: Option<DatumId>,
    /// Include system lines along with user lines.
    pub master: bool,
    /// Only the last `n` matching lines.
    pub tail: Option<usize>,
}

impl LogFilter {
    pub fn matches(&self, line: &LogLine) -> bool {
        self.pipeline
            .as_ref()
            .map(|p| *p == line.pipeline)
            .unwrap_or(true)
            && self.job.map(|j| Some(j) == line.job).unwrap_or(true)
            && self
                .datum
                .as_ref()
                .map(|d| Some(d) == line.datum.as_ref())
                .unwrap_or(true)
            && (self.master || !line.master)
    }
}

pub struct LogStore {
    lines: RwLock<Vec<LogLine>>,
    seq: AtomicU64,
    follow: broadcast::Sender<LogLine>,
}

impl Default for LogStore {
    fn default() -> Self {
        let (follow, _) = broadcast::channel(FOLLOW_CAPACITY);
        Self {
            lines: RwLock::new(vec![]),
            seq: AtomicU64::new(0),
            follow,
        }
    }
}

impl LogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn append(
        &self,
        pipeline: &str,
        job: Option<JobId>,
        datum: Option<DatumId>,
        master: bool,
        message: String,
    ) {
        // Sequence numbers are taken under the lock, so the stored lines are always a prefix
        // of the sequence.
        let line = {
            let mut lines = self.lines.write().unwrap_or_else(|p| p.into_inner());
            let line = LogLine {
                seq: self.seq.fetch_add(1, Ordering::SeqCst),
                pipeline: pipeline.to_string(),
                job,
                datum,
                master,
                message,
                ts: Utc::now(),
            };
            lines.push(line.clone());
            line
        };
        let _ = self.follow.send(line);
    }

    /// A line written by the system on behalf of a pipeline.
    pub fn master(
        &self,
        pipeline: &str,
        job: Option<JobId>,
        datum: Option<DatumId>,
        message: impl Into<String>,
    ) {
        self.append(pipeline, job, datum, true, message.into())
    }

    /// A line printed by user code while processing a datum.
    pub fn user(&self, pipeline: &str, job: JobId, datum: DatumId, message: impl Into<String>) {
        self.append(pipeline, Some(job), Some(datum), false, message.into())
    }

    pub fn query(&self, filter: &LogFilter) -> Vec<LogLine> {
        let lines = self.lines.read().unwrap_or_else(|p| p.into_inner());
        let matching: Vec<LogLine> = lines.iter().filter(|l| filter.matches(l)).cloned().collect();
        match filter.tail {
            Some(tail) if tail < matching.len() => matching[matching.len() - tail..].to_vec(),
            _ => matching,
        }
    }

    /// Every matching line so far, followed by every new matching line until `until` completes.
    pub fn follow<F>(&self, filter: LogFilter, until: F) -> BoxStream<'static, LogLine>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Subscribe first so nothing written between the query and the subscription is lost.
        let mut rx = self.follow.subscribe();
        let backlog = self.query(&filter);
        let last_seen = backlog.last().map(|l| l.seq);

        let stream = async_stream::stream! {
            for line in backlog {
                yield line;
            }

            tokio::pin!(until);
            loop {
                let next = tokio::select! {
                    biased;
                    line = rx.recv() => Some(line),
                    _ = &mut until => None,
                };
                match next {
                    Some(Ok(line)) => {
                        let seen = last_seen.map(|s| line.seq <= s).unwrap_or(false);
                        if !seen && filter.matches(&line) {
                            yield line;
                        }
                    }
                    Some(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                        warn!("Log follower fell behind and skipped {} lines", skipped);
                    }
                    Some(Err(broadcast::error::RecvError::Closed)) | None => break,
                }
            }

            // Lines that were written right before the end.
            while let Ok(line) = rx.try_recv() {
                if last_seen.map(|s| line.seq > s).unwrap_or(true) && filter.matches(&line) {
                    yield line;
                }
            }
        };
        stream.boxed()
    }

    /// Drop every line of a pipeline.
    pub fn forget_pipeline(&self, pipeline: &str) {
        self.lines
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|l| l.pipeline != pipeline);
    }

    pub fn clear(&self) {
        self.lines.write().unwrap_or_else(|p| p.into_inner()).clear();
    }
}
