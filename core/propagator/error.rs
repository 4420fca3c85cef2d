use super::ValidationError;
use crate::graph::GraphError;
use crate::lifecycle::LifecycleError;
use thiserror::*;

#[derive(Error, Debug)]
pub enum PropagatorError {
    #[error(transparent)]
    GraphError(GraphError),

    #[error(transparent)]
    LifecycleError(LifecycleError),

    #[error(transparent)]
    ValidationError(ValidationError),
}

impl From<GraphError> for PropagatorError {
    fn from(value: GraphError) -> Self {
        PropagatorError::GraphError(value)
    }
}

impl From<LifecycleError> for PropagatorError {
    fn from(value: LifecycleError) -> Self {
        PropagatorError::LifecycleError(value)
    }
}

impl From<ValidationError> for PropagatorError {
    fn from(value: ValidationError) -> Self {
        PropagatorError::ValidationError(value)
    }
}
