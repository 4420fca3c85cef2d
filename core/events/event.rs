use crate::model::{DatumState, JobState, PipelineState};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CommitEvent {
    CommitFinished {
        repo: String,
        commit: String,
    },
    CommitsDeleted {
        repo: String,
        commits: Vec<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineEvent {
    PipelineCreated {
        pipeline: String,
        version: u64,
    },
    PipelineStateChanged {
        pipeline: String,
        from: PipelineState,
        to: PipelineState,
        reason: Option<String>,
    },
    PipelineDeleted {
        pipeline: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobEvent {
    JobCreated {
        pipeline: String,
        job: String,
        output_commit: String,
    },
    JobStateChanged {
        pipeline: String,
        job: String,
        state: JobState,
        reason: Option<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DatumEvent {
    DatumStarted {
        job: String,
        datum: String,
        worker: usize,
    },
    DatumAttemptFailed {
        job: String,
        datum: String,
        attempt: u32,
        error: String,
    },
    DatumCompleted {
        job: String,
        datum: String,
        state: DatumState,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkflowEvent {
    DriveStarted(std::time::Instant),
    Shutdown,
}

impl WorkflowEvent {
    pub(crate) fn drive_started() -> Self {
        Self::DriveStarted(std::time::Instant::now())
    }
}

#[derive(Default, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Event {
    /// The "nothing happened" event.
    #[default]
    Noop,
    CommitEvent(CommitEvent),
    PipelineEvent(PipelineEvent),
    JobEvent(JobEvent),
    DatumEvent(DatumEvent),
    WorkflowEvent(WorkflowEvent),
}

impl From<CommitEvent> for Event {
    fn from(value: CommitEvent) -> Self {
        Event::CommitEvent(value)
    }
}

impl From<PipelineEvent> for Event {
    fn from(value: PipelineEvent) -> Self {
        Event::PipelineEvent(value)
    }
}

impl From<JobEvent> for Event {
    fn from(value: JobEvent) -> Self {
        Event::JobEvent(value)
    }
}

impl From<DatumEvent> for Event {
    fn from(value: DatumEvent) -> Self {
        Event::DatumEvent(value)
    }
}

impl From<WorkflowEvent> for Event {
    fn from(value: WorkflowEvent) -> Self {
        Event::WorkflowEvent(value)
    }
}
