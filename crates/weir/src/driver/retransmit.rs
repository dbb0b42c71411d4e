use tinyvec::ArrayVec;
use tracing::debug;
use weir_concurrent::Counter;
use weir_timing::Nanos;

use crate::error::DriverError;

/// Most retransmissions in flight at once; later NAKs are dropped and the
/// receiver re-asks.
const MAX_RETRANSMITS: usize = 16;

pub const RETRANSMIT_LINGER_TIMEOUT: Nanos = Nanos::from_millis(100);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum ActionState {
    /// Held until its delay elapses so bursts of NAKs coalesce.
    #[default]
    Delayed,
    /// Already resent; suppresses duplicates until the linger window ends.
    Lingering,
}

#[derive(Clone, Copy, Debug, Default)]
struct RetransmitAction {
    term_id: i32,
    term_offset: i32,
    length: usize,
    expiry: Nanos,
    state: ActionState,
}

impl RetransmitAction {
    fn overlaps(&self, term_id: i32, term_offset: i32, length: usize) -> bool {
        self.term_id == term_id
            && (term_offset as usize) < self.term_offset as usize + self.length
            && (self.term_offset as usize) < term_offset as usize + length
    }
}

/// Deduplicates and rate-limits retransmission requests.
///
/// NAK intake only records an action; the actual resends are dispatched from
/// [`process_timeouts`](Self::process_timeouts) on the sender thread.
pub struct RetransmitHandler {
    actions: ArrayVec<[RetransmitAction; MAX_RETRANSMITS]>,
    delay_timeout: Nanos,
    linger_timeout: Nanos,
    invalid_packets: Counter,
}

impl RetransmitHandler {
    pub fn new(invalid_packets: Counter, delay_timeout: Nanos, linger_timeout: Nanos) -> Self {
        Self { actions: ArrayVec::new(), delay_timeout, linger_timeout, invalid_packets }
    }

    pub fn on_nak(
        &mut self,
        term_id: i32,
        term_offset: i32,
        length: i32,
        term_length: usize,
        now: Nanos,
    ) {
        if term_offset < 0 || length <= 0 || term_offset as usize + length as usize > term_length {
            self.invalid_packets.increment_release();
            return;
        }
        let length = length as usize;

        if self.actions.iter().any(|a| a.overlaps(term_id, term_offset, length)) {
            return;
        }
        if self.actions.len() == MAX_RETRANSMITS {
            debug!(term_id, term_offset, length, "retransmit slots exhausted, dropping nak");
            return;
        }

        self.actions.push(RetransmitAction {
            term_id,
            term_offset,
            length,
            expiry: now + self.delay_timeout,
            state: ActionState::Delayed,
        });
    }

    /// Fire due retransmissions and retire lingered ones.
    ///
    /// The first resend error is returned once all state transitions are
    /// done; an errored action still lingers so the range isn't re-requested
    /// immediately.
    pub fn process_timeouts<F>(&mut self, now: Nanos, mut resend: F) -> Result<(), DriverError>
    where
        F: FnMut(i32, i32, usize) -> Result<(), DriverError>,
    {
        let mut result = Ok(());

        for action in &mut self.actions {
            if action.state == ActionState::Delayed && now >= action.expiry {
                if let Err(e) = resend(action.term_id, action.term_offset, action.length) {
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
                action.state = ActionState::Lingering;
                action.expiry = now + self.linger_timeout;
            }
        }

        self.actions.retain(|a| !(a.state == ActionState::Lingering && now > a.expiry));
        result
    }

    pub fn active_count(&self) -> usize {
        self.actions.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const TERM_LENGTH: usize = 64 * 1024;

    fn handler() -> RetransmitHandler {
        RetransmitHandler::new(Counter::default(), Nanos::ZERO, RETRANSMIT_LINGER_TIMEOUT)
    }

    #[test]
    fn zero_delay_naks_fire_on_the_next_pass() {
        let mut h = handler();
        let now = Nanos::from_millis(10);
        h.on_nak(5, 2048, 1024, TERM_LENGTH, now);

        let mut resends = Vec::new();
        h.process_timeouts(now, |t, o, l| {
            resends.push((t, o, l));
            Ok(())
        })
        .unwrap();
        assert_eq!(resends, vec![(5, 2048, 1024)]);

        // Still lingering; nothing more fires.
        h.process_timeouts(now + Nanos::from_millis(1), |_, _, _| panic!("resent twice"))
            .unwrap();
        assert_eq!(h.active_count(), 1);
    }

    #[test]
    fn overlapping_naks_are_suppressed() {
        let mut h = handler();
        let now = Nanos::from_millis(10);
        h.on_nak(5, 2048, 1024, TERM_LENGTH, now);
        h.on_nak(5, 2048, 1024, TERM_LENGTH, now);
        h.on_nak(5, 2560, 4096, TERM_LENGTH, now); // tail overlap
        assert_eq!(h.active_count(), 1);

        // Same offsets in another term are a different range.
        h.on_nak(6, 2048, 1024, TERM_LENGTH, now);
        assert_eq!(h.active_count(), 2);
    }

    #[test]
    fn lingering_expires_and_frees_the_range() {
        let mut h = handler();
        let now = Nanos::from_millis(10);
        h.on_nak(5, 0, 256, TERM_LENGTH, now);
        h.process_timeouts(now, |_, _, _| Ok(())).unwrap();

        let past_linger = now + RETRANSMIT_LINGER_TIMEOUT + Nanos(1);
        h.process_timeouts(past_linger, |_, _, _| Ok(())).unwrap();
        assert_eq!(h.active_count(), 0);

        let mut resent = 0;
        h.on_nak(5, 0, 256, TERM_LENGTH, past_linger);
        h.process_timeouts(past_linger, |_, _, _| {
            resent += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(resent, 1);
    }

    #[test]
    fn malformed_naks_count_as_invalid() {
        let invalid = Counter::default();
        let mut h = RetransmitHandler::new(invalid.clone(), Nanos::ZERO, RETRANSMIT_LINGER_TIMEOUT);
        let now = Nanos::ZERO;

        h.on_nak(5, -8, 256, TERM_LENGTH, now);
        h.on_nak(5, 0, 0, TERM_LENGTH, now);
        h.on_nak(5, TERM_LENGTH as i32 - 8, 1024, TERM_LENGTH, now);
        assert_eq!(invalid.get(), 3);
        assert_eq!(h.active_count(), 0);
    }

    #[test]
    fn slots_are_bounded() {
        let mut h = handler();
        let now = Nanos::ZERO;
        for i in 0..MAX_RETRANSMITS as i32 + 4 {
            h.on_nak(1, i * 1024, 512, TERM_LENGTH, now);
        }
        assert_eq!(h.active_count(), MAX_RETRANSMITS);
    }
}
