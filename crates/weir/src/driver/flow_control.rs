use std::net::SocketAddr;

use weir_timing::Nanos;

use crate::{logbuffer::compute_position, protocol::StatusMessage};

/// Decides how far ahead of the receivers the sender may run.
///
/// The returned position is authoritative: the publication stores it to the
/// sender-limit counter with release ordering and asks no questions.
pub trait FlowControl: Send {
    fn on_status_message(
        &mut self,
        sm: &StatusMessage,
        sender: SocketAddr,
        snd_lmt: i64,
        initial_term_id: i32,
        position_bits_to_shift: u32,
        now: Nanos,
    ) -> i64;

    /// Periodic tick while the sender has nothing to do.
    fn on_idle(&mut self, now: Nanos, snd_lmt: i64) -> i64;
}

/// Single-receiver strategy: the latest status message is the whole truth.
#[derive(Debug, Default)]
pub struct UnicastFlowControl;

impl FlowControl for UnicastFlowControl {
    fn on_status_message(
        &mut self,
        sm: &StatusMessage,
        _sender: SocketAddr,
        snd_lmt: i64,
        initial_term_id: i32,
        position_bits_to_shift: u32,
        _now: Nanos,
    ) -> i64 {
        let position = compute_position(
            sm.consumption_term_id,
            sm.consumption_term_offset,
            position_bits_to_shift,
            initial_term_id,
        );
        (position + i64::from(sm.receiver_window)).max(snd_lmt)
    }

    fn on_idle(&mut self, _now: Nanos, snd_lmt: i64) -> i64 {
        snd_lmt
    }
}
