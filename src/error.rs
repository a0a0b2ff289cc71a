//! Error types for the detector core

use std::{io, path::PathBuf};

use thiserror::Error;

/// Result type for detector operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The capture device could not be opened
    #[error("failed to open capture device {path}: {source}")]
    DeviceOpen { path: PathBuf, source: io::Error },

    /// A register operation on the device failed
    #[error("device operation `{op}` failed: {source}")]
    Device { op: &'static str, source: io::Error },

    /// Mapping the capture region failed
    #[error("failed to map {len} byte capture region: {source}")]
    Map { len: usize, source: io::Error },

    /// Configured banks do not fit into the mapped region
    #[error("capture layout needs {required} bytes but the region only has {available}")]
    RegionTooSmall { required: usize, available: usize },

    /// A read outside the mapped region was requested
    #[error("range {offset}..{end} is outside the {len} byte capture region")]
    OutOfBounds { offset: usize, end: usize, len: usize },

    #[error("bank {bank} / phase {phase} does not exist in this layout")]
    NoSuchSlice { bank: usize, phase: usize },

    /// A max/min register points outside the slice it was read for
    #[error("register address {addr:#x} is outside the phase slice at {base:#x} ({len} samples)")]
    RegisterAddress { addr: u64, base: u64, len: usize },

    /// Sample data is not 16-bit aligned
    #[error("misaligned sample data: {0}")]
    Misaligned(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Figment(#[from] Box<figment::Error>),

    #[error("time and signal vectors differ in length ({time} vs {signal})")]
    LengthMismatch { time: usize, signal: usize },

    #[error("fft failed: {0}")]
    Fft(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("cannot parse `{value}` for field {field}")]
    Parse { field: String, value: String },

    #[error("upload transport failed: {0}")]
    Transport(String),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<figment::Error> for Error {
    fn from(e: figment::Error) -> Self {
        Error::Figment(Box::new(e))
    }
}

impl Error {
    /// Errors that mean acquisition cannot start at all
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::DeviceOpen { .. }
                | Error::Map { .. }
                | Error::RegionTooSmall { .. }
                | Error::Config(_)
                | Error::Figment(_)
        )
    }
}
