use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use quanta::Mock;

use crate::Nanos;

/// The driver's clock pair: a monotonic nanosecond clock for deadlines and a
/// wall clock in epoch millis for cross-process timestamps.
///
/// Both can be driven from a single [`quanta::Mock`] so lifecycle tests are
/// deterministic.
#[derive(Clone, Debug)]
pub struct Clocks {
    source: Source,
}

#[derive(Clone, Debug)]
enum Source {
    System(quanta::Clock),
    Mocked(quanta::Clock),
}

impl Clocks {
    pub fn new() -> Self {
        Self { source: Source::System(quanta::Clock::new()) }
    }

    /// Mock-driven clock pair. `mock.increment(n)` advances both clocks by
    /// `n` nanoseconds.
    pub fn mocked() -> (Self, Arc<Mock>) {
        let (clock, mock) = quanta::Clock::mock();
        // 0 reads as "never"; start the mock one tick in.
        mock.increment(1);
        (Self { source: Source::Mocked(clock) }, mock)
    }

    /// Monotonic nanoseconds. Starts near zero at process (or mock) start.
    #[inline]
    pub fn nano_time(&self) -> Nanos {
        match &self.source {
            Source::System(c) => Nanos(c.delta_as_nanos(0, c.raw()) as i64),
            Source::Mocked(c) => Nanos(c.raw() as i64),
        }
    }

    /// Milliseconds since the unix epoch (mock nanos under test).
    #[inline]
    pub fn epoch_ms(&self) -> i64 {
        match &self.source {
            Source::System(_) => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0),
            Source::Mocked(c) => (c.raw() / 1_000_000) as i64,
        }
    }
}

impl Default for Clocks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mock_drives_both_clocks() {
        let (clocks, mock) = Clocks::mocked();
        let t0 = clocks.nano_time();
        mock.increment(Nanos::from_millis(250).0 as u64);
        assert_eq!(clocks.nano_time() - t0, Nanos::from_millis(250));
        assert_eq!(clocks.epoch_ms(), 250);
    }

    #[test]
    fn system_nanos_advance() {
        let clocks = Clocks::new();
        let t0 = clocks.nano_time();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(clocks.nano_time() > t0);
    }
}
