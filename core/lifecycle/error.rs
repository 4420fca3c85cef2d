use crate::model::{JobId, JobState, PipelineState};
use thiserror::*;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Job {job} does not exist")]
    JobNotFound { job: JobId },

    #[error("Job {job} cannot go from {from} to {to}")]
    InvalidJobTransition {
        job: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("Job {job} is still {state}, only finished jobs can be deleted")]
    JobNotTerminal { job: JobId, state: JobState },

    #[error("Pipeline {pipeline} does not exist")]
    PipelineNotFound { pipeline: String },

    #[error("Pipeline {pipeline} does not have a version {version}")]
    PipelineVersionNotFound { pipeline: String, version: u64 },

    #[error("Pipeline {pipeline} already exists")]
    PipelineAlreadyExists { pipeline: String },

    #[error("Pipeline {pipeline} cannot go from {from} to {to}")]
    InvalidPipelineTransition {
        pipeline: String,
        from: PipelineState,
        to: PipelineState,
    },

    #[error("Datum {index} is not part of job {job}")]
    DatumNotFound { job: JobId, index: usize },
}
