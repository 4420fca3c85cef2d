//! # Job & Pipeline Lifecycles
//!
//! The registries here own every job and pipeline record, and are the only place their states
//! change. Every change is validated against the state machines in `transitions` and echoed on
//! the event channel.
//!
mod error;
mod jobs;
mod pipelines;
mod transitions;

pub use error::*;
pub use jobs::*;
pub use pipelines::*;
