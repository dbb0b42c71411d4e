//! The term-partitioned log a publication drains onto the wire.
//!
//! The log is a single mapping: three fixed-size term buffers back to back,
//! followed by one metadata page. The stream position is a 64-bit byte offset
//! decomposed into `(term_id, term_offset)`; terms rotate through the three
//! partitions so one can be written, one drained, and one cleaned.

mod mapped;
mod scanner;

use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

pub use mapped::MappedRawLog;
pub use scanner::scan_for_availability;

use crate::protocol::DATA_HEADER_LENGTH;

pub const PARTITION_COUNT: usize = 3;
pub const TERM_MIN_LENGTH: usize = 64 * 1024;
pub const LOG_META_DATA_LENGTH: usize = 4096;

#[inline]
pub fn index_by_position(position: i64, position_bits_to_shift: u32) -> usize {
    ((position >> position_bits_to_shift) % PARTITION_COUNT as i64) as usize
}

#[inline]
pub fn compute_term_id_from_position(
    position: i64,
    position_bits_to_shift: u32,
    initial_term_id: i32,
) -> i32 {
    ((position >> position_bits_to_shift) as i32).wrapping_add(initial_term_id)
}

/// Inverse of the `(term_id, term_offset)` decomposition. The term id delta
/// wraps in 32 bits, matching producer-side term rotation.
#[inline]
pub fn compute_position(
    term_id: i32,
    term_offset: i32,
    position_bits_to_shift: u32,
    initial_term_id: i32,
) -> i64 {
    let term_delta = i64::from(term_id.wrapping_sub(initial_term_id));
    (term_delta << position_bits_to_shift) + i64::from(term_offset)
}

#[inline]
pub fn position_bits_to_shift(term_length: usize) -> u32 {
    term_length.trailing_zeros()
}

#[inline]
pub const fn pack_raw_tail(term_id: i32, tail: i32) -> i64 {
    ((term_id as i64) << 32) | (tail as u32 as i64)
}

#[inline]
pub const fn term_id_from_raw_tail(raw_tail: i64) -> i32 {
    (raw_tail >> 32) as i32
}

#[inline]
pub fn tail_from_raw_tail(raw_tail: i64, term_length: usize) -> i32 {
    ((raw_tail & 0xFFFF_FFFF) as i64).min(term_length as i64) as i32
}

/// Metadata page at the tail of the mapping, shared with producers.
#[repr(C)]
pub struct LogMetadata {
    /// One per partition, packing `term_id << 32 | tail`.
    pub term_tail_counters: [AtomicI64; PARTITION_COUNT],
    pub initial_term_id: i32,
    pub mtu_length: i32,
    pub correlation_id: i64,
    /// Epoch millis of the last status message, written by the conductor with
    /// release ordering and read back with acquire.
    pub time_of_last_status_message: AtomicI64,
    /// Template producers stamp onto every appended frame.
    pub default_frame_header: [u8; DATA_HEADER_LENGTH],
}

/// Acquire-load of a frame's length field. Producers commit a frame by
/// release-storing a non-zero length last, so a zero read means "not yet".
#[inline]
pub fn frame_length_volatile(term: &[u8], offset: usize) -> i32 {
    debug_assert!(offset + 4 <= term.len());
    unsafe { (*term.as_ptr().add(offset).cast::<AtomicI32>()).load(Ordering::Acquire) }
}

/// Commit a frame by publishing its length. Pairs with
/// [`frame_length_volatile`].
#[inline]
pub fn set_frame_length_release(term: &[u8], offset: usize, frame_length: i32) {
    debug_assert!(offset + 4 <= term.len());
    unsafe {
        (*term.as_ptr().add(offset).cast::<AtomicI32>()).store(frame_length, Ordering::Release);
    }
}
