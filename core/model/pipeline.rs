use super::{Input, JobState};
use crate::config::DEFAULT_BRANCH;
use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

/// A secret pulled into the environment of a transform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretMount {
    pub name: String,
    pub key: String,
    pub env_var: String,
}

/// The user code a pipeline runs for every datum.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transform {
    pub cmd: Vec<String>,
    #[serde(default)]
    pub stdin: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub secrets: Vec<SecretMount>,
    /// Exit codes other than 0 that still count as success.
    #[serde(default)]
    pub accept_return_code: Vec<i32>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl Transform {
    pub fn new<C, S>(cmd: C, stdin: S) -> Self
    where
        C: IntoIterator,
        C::Item: Into<String>,
        S: IntoIterator,
        S::Item: Into<String>,
    {
        Self {
            cmd: cmd.into_iter().map(Into::into).collect(),
            stdin: stdin.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// A `sh` transform that runs every line of `script`.
    pub fn shell<S>(script: S) -> Self
    where
        S: IntoIterator,
        S::Item: Into<String>,
    {
        Self::new(["sh"], script)
    }
}

/// How many workers a pipeline gets.
#[derive(Default, Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParallelismSpec {
    #[serde(default)]
    pub constant: u64,
    #[serde(default)]
    pub coefficient: f64,
}

impl ParallelismSpec {
    pub fn constant(n: u64) -> Self {
        Self {
            constant: n,
            coefficient: 0.0,
        }
    }

    pub fn coefficient(c: f64) -> Self {
        Self {
            constant: 0,
            coefficient: c,
        }
    }

    /// Resolve this spec against the size of the cluster. Never less than one worker.
    pub fn worker_count(spec: Option<&ParallelismSpec>, cluster_nodes: usize) -> usize {
        match spec {
            Some(spec) if spec.constant > 0 => spec.constant as usize,
            Some(spec) if spec.coefficient > 0.0 => {
                let workers = (spec.coefficient * cluster_nodes as f64).round();
                (workers as usize).max(1)
            }
            _ => 1,
        }
    }
}

/// How datums are grouped into the chunks handed to workers.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSpec {
    #[serde(default)]
    pub number: u64,
    #[serde(default)]
    pub size_bytes: u64,
}

/// Where a successful job's output is copied to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Egress {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub name: String,
    pub transform: Transform,
    #[serde(default)]
    pub parallelism_spec: Option<ParallelismSpec>,
    pub input: Input,
    #[serde(default = "default_output_branch")]
    pub output_branch: String,
    #[serde(default)]
    pub incremental: bool,
    #[serde(default)]
    pub standby: bool,
    #[serde(default)]
    pub enable_stats: bool,
    #[serde(default)]
    pub chunk_spec: Option<ChunkSpec>,
    #[serde(default)]
    pub max_queue_size: Option<usize>,
    #[serde(default)]
    pub datum_tries: Option<u32>,
    #[serde(default, with = "crate::util::serde::option_duration")]
    pub datum_timeout: Option<Duration>,
    #[serde(default, with = "crate::util::serde::option_duration")]
    pub job_timeout: Option<Duration>,
    #[serde(default)]
    pub egress: Option<Egress>,
    #[serde(default)]
    pub description: String,
}

fn default_output_branch() -> String {
    DEFAULT_BRANCH.to_string()
}

impl PipelineSpec {
    pub fn new(name: impl Into<String>, transform: Transform, input: Input) -> Self {
        Self {
            name: name.into(),
            transform,
            parallelism_spec: None,
            input,
            output_branch: default_output_branch(),
            incremental: false,
            standby: false,
            enable_stats: false,
            chunk_spec: None,
            max_queue_size: None,
            datum_tries: None,
            datum_timeout: None,
            job_timeout: None,
            egress: None,
            description: String::new(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Starting,
    Running,
    Standby,
    Paused,
    Failure,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PipelineState::Starting => "starting",
            PipelineState::Running => "running",
            PipelineState::Standby => "standby",
            PipelineState::Paused => "paused",
            PipelineState::Failure => "failure",
        };
        s.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineInfo {
    pub spec: PipelineSpec,
    pub version: u64,
    pub state: PipelineState,
    pub reason: Option<String>,

    /// Dedup results are keyed by this salt. A reprocessing update picks a new one.
    pub salt: String,

    /// Whether the pipeline was stopped by the user.
    pub stopped: bool,

    pub job_counts: BTreeMap<JobState, u64>,

    #[serde(with = "crate::util::serde::iso8601")]
    pub created_at: DateTime<Utc>,
}

impl PipelineInfo {
    pub fn name(&self) -> &str {
        &self.spec.name
    }
}
