use thiserror::*;

#[derive(Error, Debug)]
pub enum PlannerError {
    #[error("Glob {glob:?} is not valid: {err}")]
    InvalidGlob { glob: String, err: globset::Error },

    #[error("The input expression has {expected} leaves, but {found} were provided")]
    LeafMismatch { expected: usize, found: usize },
}

impl PlannerError {
    pub(crate) fn invalid_glob(glob: &str, err: globset::Error) -> Self {
        PlannerError::InvalidGlob {
            glob: glob.to_string(),
            err,
        }
    }
}
