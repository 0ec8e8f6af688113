use std::path::PathBuf;
use thiserror::Error;

use super::constants::*;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TrainFormatError {
    #[error("Incorrect magic header {0:#x} found in train; expected {exp:#x}", exp=MAGIC_HEADER)]
    BadMagicHeader(u64),
    #[error("Train reports a pulse count of {0}; must be between 1 and {1}")]
    BadPulseCount(u64, usize),
    #[error("Train needs {needed} bytes but only {available} bytes are available")]
    Truncated { needed: usize, available: usize },
    #[error("Train buffer capacity of {0} bytes is too small for the requested depth {1}")]
    CapacityTooSmall(usize, usize),
    #[error("Conversion from {from} layout to {to} layout is not supported")]
    UnsupportedConversion { from: String, to: String },
    #[error("ASIC {0} is not part of this train")]
    AsicNotPresent(usize),
    #[error("Frame {0} is out of range; train has {1} frames")]
    FrameOutOfRange(usize, usize),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue close called more often than open")]
    Unbalanced,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("Handle for slot {slot} belongs to pool {handle_pool}, not to pool {pool}")]
    ForeignHandle {
        slot: usize,
        handle_pool: u64,
        pool: u64,
    },
    #[error("Handle for slot {slot} has generation {handle}, the pool expects {current}")]
    StaleHandle {
        slot: usize,
        handle: u64,
        current: u64,
    },
    #[error("Pool must hold at least one buffer")]
    ZeroCapacity,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CorrectionError {
    #[error("Correction table has shape {0:?}; expected ({1}, depth)")]
    BadShape((usize, usize), usize),
    #[error("Correction table has depth {0}, smaller than the train depth {1}")]
    TooShallow(usize, usize),
}

#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("Receiver could not bind a UDP port in range {0}..{1}")]
    NoFreePort(u16, u16),
    #[error("Receiver failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Receiver failed due to train format error: {0}")]
    FormatError(#[from] TrainFormatError),
    #[error("Receiver failed due to correction error: {0}")]
    CorrectionError(#[from] CorrectionError),
    #[error("Receiver was given a buffer of {0} bytes, too small for a single datagram")]
    BufferTooSmall(usize),
}

#[derive(Debug, Error)]
pub enum FileSourceError {
    #[error("Could not read trains because directory {0:?} does not exist")]
    BadDirectory(PathBuf),
    #[error("File source failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Train file {0:?} is malformed: {1}")]
    BadTrainFile(PathBuf, TrainFormatError),
    #[error("File source failed due to pool error: {0}")]
    PoolError(#[from] PoolError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config is invalid: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum SorterError {
    #[error("Sorter failed due to Receiver error: {0}")]
    ReceiverError(#[from] ReceiverError),
    #[error("Sorter failed due to pool error: {0}")]
    PoolError(#[from] PoolError),
    #[error("Sorter failed due to file source error: {0}")]
    FileSourceError(#[from] FileSourceError),
    #[error("Sorter failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Sorter failed due to correction error: {0}")]
    CorrectionError(#[from] CorrectionError),
    #[error("Sorter is already running")]
    AlreadyRunning,
    #[error("Sorter worker thread panicked")]
    WorkerPanicked,
    #[error("Sorter failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}
