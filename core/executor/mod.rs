//! # Datum Execution
//!
//! Runs a pipeline's transform once against a datum's materialized view. Executors do not know
//! about retries, dedup, or output assembly; they only report how a single attempt went.
//!
mod error;
mod process;

pub use error::*;
pub use process::*;

use crate::model::{DatumId, JobId, Transform};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything needed to run user code for one datum.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub job: JobId,
    pub datum: DatumId,
    pub transform: Transform,

    /// Root of the datum's view. Inputs are mounted under `<root>/<input name>`, and the output
    /// directory is `<root>/out`.
    pub root: PathBuf,

    pub inputs: Vec<String>,

    /// The environment the transform starts from, with secrets already resolved.
    pub env: HashMap<String, String>,

    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn out_dir(&self) -> PathBuf {
        self.root.join("out")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Succeeded {
        elapsed: Duration,
        output: Vec<String>,
    },

    /// User code ran but its exit code was not accepted.
    Failed {
        elapsed: Duration,
        error: String,
        output: Vec<String>,
    },

    /// The process was killed for running past the datum timeout.
    TimedOut {
        timeout: Duration,
        output: Vec<String>,
    },

    Cancelled,
}

#[async_trait]
pub trait DatumExecutor: Sync + Send {
    async fn execute(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutorError>;
}
