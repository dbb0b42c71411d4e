mod counters;
mod position;

pub use counters::{Counter, CountersManager, SystemCounters};
pub use position::{Position, ReadablePosition};
