//! # Cron Inputs
//!
//! A cron input is backed by a repo of its own. Every tick starts a commit on that repo, writes
//! the tick time into a `time` file and finishes it, which is what triggers the pipeline.
//!

use crate::graph::{CommitGraph, GraphError};
use crate::model::{CommitInfo, CronInput, Input};
use crate::sync::Arc;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::*;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::*;

const EVERY: &str = "@every ";

#[derive(Error, Debug)]
pub enum CronError {
    #[error("Cron schedule {spec:?} is not supported, use `@every <duration>` like `@every 10s`")]
    InvalidSchedule { spec: String },

    #[error(transparent)]
    GraphError(GraphError),
}

impl From<GraphError> for CronError {
    fn from(value: GraphError) -> Self {
        CronError::GraphError(value)
    }
}

/// Parse an `@every <duration>` schedule.
pub fn parse_schedule(spec: &str) -> Result<Duration, CronError> {
    let invalid = || CronError::InvalidSchedule {
        spec: spec.to_string(),
    };
    let every = spec.trim().strip_prefix(EVERY).ok_or_else(invalid)?;
    let period = humantime::parse_duration(every.trim()).map_err(|_| invalid())?;
    if period.is_zero() {
        return Err(invalid());
    }
    Ok(period)
}

/// Commit a single tick into the backing repo of a cron input.
#[instrument(name = "cron::tick", skip(graph))]
pub async fn tick(
    graph: &dyn CommitGraph,
    repo: &str,
    at: DateTime<Utc>,
) -> Result<CommitInfo, CronError> {
    let commit = graph.start_commit(repo, crate::config::DEFAULT_BRANCH).await?;
    graph
        .put_file(commit.id, "/time", at.to_rfc3339().as_bytes())
        .await?;
    Ok(graph.finish_commit(commit.id).await?)
}

/// Tick a cron input of `pipeline` until cancelled.
///
/// The first tick happens one period after `start` (or now), and ticks that were missed while
/// the loop was not running are not made up for.
pub fn spawn_ticker(
    graph: Arc<dyn CommitGraph>,
    pipeline: &str,
    cron: &CronInput,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>, CronError> {
    let period = parse_schedule(&cron.spec)?;
    let step = chrono::Duration::from_std(period).map_err(|_| CronError::InvalidSchedule {
        spec: cron.spec.clone(),
    })?;
    let repo = Input::cron_repo(pipeline, &cron.name);
    let start = cron.start.unwrap_or_else(Utc::now);

    Ok(tokio::spawn(async move {
        let mut next = start;
        loop {
            next += step;
            let now = Utc::now();
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(wait) => (),
                _ = cancel.cancelled() => break,
            }

            match tick(graph.as_ref(), &repo, next).await {
                Ok(commit) => debug!("Cron {} ticked into commit {}", repo, commit.id),
                Err(err) => warn!("Cron {} could not tick: {}", repo, err),
            }

            // Skip whatever ticks were missed while committing.
            let now = Utc::now();
            while next + step < now {
                next += step;
            }
        }
        debug!("Cron {} stopped", repo);
    }))
}
