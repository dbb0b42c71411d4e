mod clock;
mod nanos;

pub use clock::Clocks;
pub use nanos::{Nanos, NanosParseError};
pub use quanta::Mock;
