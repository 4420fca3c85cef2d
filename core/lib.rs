//! # Sluice
//!
//! The flow begins by creating a `Config` struct and using it to build a new `SluiceDrive`.
//! From there, every finished commit is picked up by the propagators, which create one job per
//! pipeline and provenance. A controller per pipeline plans each job into datums, skips the ones
//! it has already seen, and hands the rest to a pool of workers that run the pipeline's transform.
//!
//! The commit graph and the object store are traits, so the drive can run over the in-memory
//! implementations shipped here or over anything else that keeps their contracts.
//!

pub(crate) mod config;
pub(crate) mod controller;
pub(crate) mod cron;
pub(crate) mod dedup;
pub(crate) mod drive;
pub mod events;
pub(crate) mod egress;
pub(crate) mod executor;
pub(crate) mod flush;
pub(crate) mod graph;
pub(crate) mod lifecycle;
pub(crate) mod logs;
pub(crate) mod model;
pub(crate) mod objects;
pub(crate) mod planner;
pub(crate) mod propagator;
pub(crate) mod scheduler;
pub(crate) mod sync;
#[cfg(test)]
pub(crate) mod testing;
pub(crate) mod util;

pub use config::*;
pub use drive::*;
pub use flush::FlushError;
pub use graph::{CommitGraph, GraphError, GraphEvent, MemoryCommitGraph};
pub use lifecycle::LifecycleError;
pub use logs::{LogFilter, LogLine};
pub use model::*;
pub use objects::{LocalObjectStore, MemoryObjectStore, ObjectStore, ObjectStoreError};
pub use planner::Page;
pub use propagator::ValidationError;

#[macro_use]
extern crate derive_builder;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;

#[cfg(test)]
extern crate quickcheck;
#[cfg(test)]
#[macro_use(quickcheck)]
extern crate quickcheck_macros;
