use num_complex::Complex;

pub mod args;
pub mod device;
pub mod error;
pub mod file_source;
pub mod ramp;
pub mod session;
pub mod sim;
#[cfg(feature = "soapy")]
pub mod soapy;
pub mod source;
pub mod sweep;
pub mod txtsp;

pub use error::{Error, Result};

/// One complex baseband sample, as the radio takes it (16-bit interleaved I/Q)
pub type IqSample = Complex<i16>;

/// Full scale of a 16-bit I or Q component
pub const FULL_SCALE: f64 = 32767.0;

/// The transmit channel we drive (channel A)
pub const CHANNEL: usize = 0;
/// Host-side FIFO depth, in samples
pub const FIFO_SIZE: usize = 1 << 17;
/// Samples per pushed chunk
pub const CHUNK_SAMPLES: usize = 8192;
/// How long a single push may block
pub const SEND_TIMEOUT_MS: u64 = 1000;

/// Documented TX gain range of the radio, in dB
pub const GAIN_MIN_DB: i32 = 0;
pub const GAIN_MAX_DB: i32 = 73;

/// Clamp a requested gain into the hardware range
pub fn clamp_gain(db: i32) -> i32 {
    db.clamp(GAIN_MIN_DB, GAIN_MAX_DB)
}

/// Convert a fraction of full scale to a saturated 16-bit component
pub fn to_i16(x: f64) -> i16 {
    (x * FULL_SCALE).round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
}
