use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("insufficient usable storage for new log of length={needed} in {dir}")]
    InsufficientSpace { needed: u64, dir: PathBuf },
    #[error("error mapping raw log {path}: {source}")]
    Map {
        path: PathBuf,
        #[source]
        source: shared_memory::ShmemError,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("socket error")]
    Io(#[from] io::Error),
}
