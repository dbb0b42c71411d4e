use std::{
    fs,
    path::{Path, PathBuf},
    slice,
    sync::atomic::{AtomicI64, Ordering},
};

use shared_memory::{Shmem, ShmemConf};
use tracing::debug;

use crate::{
    error::DriverError,
    logbuffer::{LOG_META_DATA_LENGTH, LogMetadata, PARTITION_COUNT, pack_raw_tail},
    protocol::DATA_HEADER_LENGTH,
};

/// The mapped log: three term buffers and a metadata page, flink-backed so
/// producers can attach by path. Owned by the publication; dropping it unmaps
/// the memory and removes the link file.
pub struct MappedRawLog {
    shmem: Shmem,
    term_length: usize,
    path: PathBuf,
}

// The mapping is raw shared memory; cross-thread access is disciplined by the
// publication (atomics for frame commits and metadata, disjoint regions for
// cleaning).
unsafe impl Send for MappedRawLog {}
unsafe impl Sync for MappedRawLog {}

impl MappedRawLog {
    pub fn log_length(term_length: usize) -> usize {
        PARTITION_COUNT * term_length + LOG_META_DATA_LENGTH
    }

    pub fn create(
        path: &Path,
        term_length: usize,
        initial_term_id: i32,
        mtu_length: i32,
        correlation_id: i64,
        default_frame_header: &[u8; DATA_HEADER_LENGTH],
    ) -> Result<Self, DriverError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let shmem = ShmemConf::new()
            .size(Self::log_length(term_length))
            .flink(path)
            .create()
            .map_err(|source| DriverError::Map { path: path.to_path_buf(), source })?;
        debug!(?path, term_length, "mapped raw log");

        let log = Self { shmem, term_length, path: path.to_path_buf() };
        unsafe {
            let meta = &mut *log.metadata_ptr();
            meta.term_tail_counters[0] = AtomicI64::new(pack_raw_tail(initial_term_id, 0));
            // The other partitions start one rotation behind so tail scans
            // order them before the active term.
            for (i, counter) in meta.term_tail_counters.iter_mut().enumerate().skip(1) {
                let term_id = initial_term_id.wrapping_add(i as i32 - PARTITION_COUNT as i32);
                *counter = AtomicI64::new(pack_raw_tail(term_id, 0));
            }
            meta.initial_term_id = initial_term_id;
            meta.mtu_length = mtu_length;
            meta.correlation_id = correlation_id;
            meta.time_of_last_status_message = AtomicI64::new(0);
            meta.default_frame_header = *default_frame_header;
        }
        Ok(log)
    }

    #[inline]
    pub fn term_length(&self) -> usize {
        self.term_length
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub(crate) fn term_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < PARTITION_COUNT);
        unsafe { self.shmem.as_ptr().add(index * self.term_length) }
    }

    /// Shared view of a term buffer. Frame commits are read through acquire
    /// loads on top of this.
    #[inline]
    pub fn term(&self, index: usize) -> &[u8] {
        unsafe { slice::from_raw_parts(self.term_ptr(index), self.term_length) }
    }

    /// Mutable view of a term buffer.
    ///
    /// # Safety
    /// The caller must be the sole writer of every byte range it touches
    /// through the returned slice.
    #[inline]
    pub unsafe fn term_mut(&self, index: usize) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.term_ptr(index), self.term_length) }
    }

    #[inline]
    fn metadata_ptr(&self) -> *mut LogMetadata {
        unsafe { self.shmem.as_ptr().add(PARTITION_COUNT * self.term_length).cast::<LogMetadata>() }
    }

    #[inline]
    pub fn metadata(&self) -> &LogMetadata {
        unsafe { &*self.metadata_ptr() }
    }

    /// Highest committed producer position across the partitions.
    pub fn producer_position(&self, position_bits_to_shift: u32, initial_term_id: i32) -> i64 {
        use crate::logbuffer::{compute_position, tail_from_raw_tail, term_id_from_raw_tail};

        let meta = self.metadata();
        let mut position = 0;
        for counter in &meta.term_tail_counters {
            let raw_tail = counter.load(Ordering::Acquire);
            let term_id = term_id_from_raw_tail(raw_tail);
            let tail = tail_from_raw_tail(raw_tail, self.term_length);
            position =
                position.max(compute_position(term_id, tail, position_bits_to_shift, initial_term_id));
        }
        position
    }
}
