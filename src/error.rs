//! Error type shared by the device backends, the sample sources and the session

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Enumeration found nothing to open
    #[error("no transmitter found")]
    NoDevice,

    /// A device call returned an error; `op` names the call
    #[error("{op} -> {message}")]
    Device { op: &'static str, message: String },

    /// A blocking device call ran out of time
    #[error("{op} timed out after {timeout_ms} ms")]
    Timeout { op: &'static str, timeout_ms: u64 },

    /// The backend has no way to do this
    #[error("{0} is not supported by this device")]
    Unsupported(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("WAV: {0}")]
    Wav(#[from] hound::Error),

    /// Input data the sources can't stream (wrong channel count, bit depth, ...)
    #[error("bad input format: {0}")]
    Format(String),

    /// Rejected configuration value
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn device(op: &'static str, message: impl Into<String>) -> Self {
        Error::Device {
            op,
            message: message.into(),
        }
    }

    /// True when the call ran out of time rather than failing outright
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}
