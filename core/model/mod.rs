mod commit;
mod datum;
mod ids;
mod input;
mod job;
mod pipeline;

pub use commit::*;
pub use datum::*;
pub use ids::*;
pub use input::*;
pub use job::*;
pub use pipeline::*;
