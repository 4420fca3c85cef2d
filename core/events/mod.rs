//! # Wire-friendly Pipeline Events
//!
//! None of these events include references to existing data, and they are all self-contained with
//! primitives that make them easy to ship to a reporter or across the wire.
//!
//! Controllers, the propagator, and the scheduler push into the same channel, and consumers see
//! the events in the order they were sent.
//!
mod channel;
mod consumer;
pub mod event;

pub use channel::*;
pub use consumer::*;
