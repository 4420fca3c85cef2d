use crate::executor::ExecutorError;
use crate::lifecycle::LifecycleError;
use crate::objects::ObjectStoreError;
use std::path::PathBuf;
use thiserror::*;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    ExecutorError(ExecutorError),

    #[error(transparent)]
    ObjectStoreError(ObjectStoreError),

    #[error(transparent)]
    LifecycleError(LifecycleError),

    #[error("Could not prepare the datum view at {path:?} due to {err:?}")]
    ViewError { path: PathBuf, err: std::io::Error },

    #[error("The transform needs secret {name}/{key}, but it is not configured")]
    MissingSecret { name: String, key: String },

    #[error("A worker of job {job} crashed: {reason}")]
    WorkerCrashed { job: String, reason: String },
}

impl SchedulerError {
    /// Errors that will happen again no matter how many times the job is retried, like user code
    /// that cannot be started at all.
    pub fn is_pipeline_fatal(&self) -> bool {
        matches!(
            self,
            SchedulerError::ExecutorError(ExecutorError::SpawnFailed { .. })
                | SchedulerError::ExecutorError(ExecutorError::EmptyCommand)
                | SchedulerError::MissingSecret { .. }
        )
    }
}

impl From<ExecutorError> for SchedulerError {
    fn from(value: ExecutorError) -> Self {
        SchedulerError::ExecutorError(value)
    }
}

impl From<ObjectStoreError> for SchedulerError {
    fn from(value: ObjectStoreError) -> Self {
        SchedulerError::ObjectStoreError(value)
    }
}

impl From<LifecycleError> for SchedulerError {
    fn from(value: LifecycleError) -> Self {
        SchedulerError::LifecycleError(value)
    }
}
