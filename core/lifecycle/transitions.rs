use crate::model::{JobState, PipelineState};

impl JobState {
    /// Jobs move forward only, except for a running job that gets put back in the queue when its
    /// pipeline is paused. A job that never ran can still be killed or failed.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, Killed)
                | (Starting, Failure)
                | (Running, Success)
                | (Running, Failure)
                | (Running, Killed)
                | (Running, Starting)
        )
    }
}

impl PipelineState {
    /// FAILURE is reachable from anywhere, and only a pipeline update leaves it.
    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (_, Failure)
                | (Failure, Starting)
                | (Starting, Running)
                | (Starting, Standby)
                | (Starting, Paused)
                | (Running, Standby)
                | (Running, Paused)
                | (Standby, Running)
                | (Standby, Paused)
                | (Paused, Running)
                | (Paused, Starting)
        )
    }
}
