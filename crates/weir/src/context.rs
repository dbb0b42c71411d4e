use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;
use weir_timing::{Clocks, Nanos};

use crate::{
    error::DriverError,
    logbuffer::TERM_MIN_LENGTH,
    protocol::{DATA_HEADER_LENGTH, FRAME_ALIGNMENT},
};

pub const DEFAULT_TERM_BUFFER_LENGTH: usize = 16 * 1024 * 1024;
pub const DEFAULT_MTU_LENGTH: usize = 1408;

fn default_driver_dir() -> PathBuf {
    let Some(base_dirs) = directories::BaseDirs::new() else {
        warn!("couldn't find basedirs, keeping driver data in /tmp/weir");
        return PathBuf::from("/tmp/weir");
    };
    base_dirs.data_dir().join("weir")
}

fn statvfs_usable_space(path: &Path) -> u64 {
    use std::os::unix::ffi::OsStrExt;

    let Ok(cpath) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        return 0;
    };
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(cpath.as_ptr(), &mut stat) } != 0 {
        return 0;
    }
    stat.f_bavail as u64 * stat.f_frsize as u64
}

fn default_usable_space() -> fn(&Path) -> u64 {
    statvfs_usable_space
}

/// Driver-wide configuration every publication is created against.
///
/// Duration fields deserialize from humantime strings (`"100ms"`, `"5s"`) or
/// raw nanos.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DriverContext {
    pub dir: PathBuf,
    pub term_buffer_length: usize,
    pub mtu_length: usize,
    /// Bound on unacknowledged bytes; defaults to half a term.
    pub term_window_length: Option<usize>,
    pub publication_linger_timeout: Nanos,
    pub connection_timeout: Nanos,
    pub heartbeat_timeout: Nanos,
    pub setup_timeout: Nanos,
    #[serde(skip)]
    pub clocks: Clocks,
    #[serde(skip, default = "default_usable_space")]
    pub usable_space: fn(&Path) -> u64,
}

impl Default for DriverContext {
    fn default() -> Self {
        Self {
            dir: default_driver_dir(),
            term_buffer_length: DEFAULT_TERM_BUFFER_LENGTH,
            mtu_length: DEFAULT_MTU_LENGTH,
            term_window_length: None,
            publication_linger_timeout: Nanos::from_secs(5),
            connection_timeout: Nanos::from_secs(5),
            heartbeat_timeout: Nanos::from_millis(100),
            setup_timeout: Nanos::from_millis(100),
            clocks: Clocks::new(),
            usable_space: statvfs_usable_space,
        }
    }
}

impl DriverContext {
    pub fn validate(&self) -> Result<(), DriverError> {
        validate_term_length(self.term_buffer_length)?;
        validate_mtu(self.mtu_length)?;
        if let Some(window) = self.term_window_length {
            if window > self.term_buffer_length {
                return Err(DriverError::Config(format!(
                    "term window {window} larger than term buffer {}",
                    self.term_buffer_length
                )));
            }
        }
        Ok(())
    }

    pub fn publications_dir(&self) -> PathBuf {
        self.dir.join("publications")
    }

    pub fn log_file_path(
        &self,
        canonical_channel: &str,
        session_id: i32,
        stream_id: i32,
        registration_id: i64,
    ) -> PathBuf {
        self.publications_dir().join(format!(
            "{canonical_channel}-{session_id}-{stream_id}-{registration_id}.logbuffer"
        ))
    }

    pub fn term_window_length(&self, term_length: usize) -> i64 {
        self.term_window_length.unwrap_or(term_length / 2) as i64
    }
}

pub(crate) fn validate_term_length(term_length: usize) -> Result<(), DriverError> {
    if term_length < TERM_MIN_LENGTH || !term_length.is_power_of_two() {
        return Err(DriverError::Config(format!(
            "term buffer length {term_length} must be a power of two >= {TERM_MIN_LENGTH}"
        )));
    }
    Ok(())
}

pub(crate) fn validate_mtu(mtu_length: usize) -> Result<(), DriverError> {
    if mtu_length < DATA_HEADER_LENGTH || mtu_length % FRAME_ALIGNMENT != 0 {
        return Err(DriverError::Config(format!(
            "mtu {mtu_length} must be a multiple of {FRAME_ALIGNMENT} and at least {DATA_HEADER_LENGTH}"
        )));
    }
    Ok(())
}
