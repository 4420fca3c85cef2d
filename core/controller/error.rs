use crate::graph::GraphError;
use crate::lifecycle::LifecycleError;
use crate::planner::PlannerError;
use crate::propagator::PropagatorError;
use crate::scheduler::SchedulerError;
use thiserror::*;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error(transparent)]
    GraphError(GraphError),

    #[error(transparent)]
    LifecycleError(LifecycleError),

    #[error(transparent)]
    PlannerError(PlannerError),

    #[error(transparent)]
    PropagatorError(PropagatorError),

    #[error(transparent)]
    SchedulerError(SchedulerError),
}

impl ControllerError {
    /// Errors that no amount of restarting will fix.
    pub fn is_pipeline_fatal(&self) -> bool {
        match self {
            ControllerError::SchedulerError(err) => err.is_pipeline_fatal(),
            ControllerError::PlannerError(_) => true,
            _ => false,
        }
    }
}

impl From<GraphError> for ControllerError {
    fn from(value: GraphError) -> Self {
        ControllerError::GraphError(value)
    }
}

impl From<LifecycleError> for ControllerError {
    fn from(value: LifecycleError) -> Self {
        ControllerError::LifecycleError(value)
    }
}

impl From<PlannerError> for ControllerError {
    fn from(value: PlannerError) -> Self {
        ControllerError::PlannerError(value)
    }
}

impl From<PropagatorError> for ControllerError {
    fn from(value: PropagatorError) -> Self {
        ControllerError::PropagatorError(value)
    }
}

impl From<SchedulerError> for ControllerError {
    fn from(value: SchedulerError) -> Self {
        ControllerError::SchedulerError(value)
    }
}
