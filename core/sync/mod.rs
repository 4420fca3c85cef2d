//! Wrapper over standard sync primitives so the registries can be driven by `shuttle` in
//! concurrency tests.
//!
//! Anything that is awaited across (watches, notifications, channels) lives in `tokio::sync` and
//! is imported directly where needed.
//!

#[cfg(all(shuttle, test))]
pub(crate) use shuttle::{sync::*, thread};

#[cfg(not(all(shuttle, test)))]
pub(crate) use std::sync::*;
