//! The narrow contract we need from a transmitter driver.
//!
//! Everything hard (PLL lock, calibration, NCO programming, FIFO management)
//! happens behind this trait. Backends report every failure as an
//! [`Error::Device`](crate::Error::Device) naming the call that failed, so the
//! caller can print it and decide whether it is fatal.

use std::time::Duration;

use crate::{IqSample, Result};

/// Effective rates after the driver picked its dividers
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SampleRate {
    /// Rate of samples crossing the host link
    pub host_hz: f64,
    /// Rate the DAC/NCO runs at (host rate times oversampling)
    pub rf_hz: f64,
}

/// Setting of the digital mixer (NCO) in front of the DAC
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mixer {
    /// Magnitude of the frequency shift
    pub freq_hz: f64,
    /// true: RF = LO - freq, false: RF = LO + freq
    pub downconvert: bool,
}

impl Mixer {
    /// Mixer setting that lands a DC baseband on `target_hz` for a given LO
    pub fn for_target(lo_hz: f64, target_hz: f64) -> Self {
        Self {
            freq_hz: (lo_hz - target_hz).abs(),
            downconvert: lo_hz >= target_hz,
        }
    }

    /// Where DC baseband ends up on air
    pub fn rf_hz(&self, lo_hz: f64) -> f64 {
        if self.downconvert {
            lo_hz - self.freq_hz
        } else {
            lo_hz + self.freq_hz
        }
    }

    pub fn direction(&self) -> &'static str {
        if self.downconvert {
            "down"
        } else {
            "up"
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub channel: usize,
    /// Depth of the driver FIFO, in samples
    pub fifo_size: usize,
    /// Samples per pushed chunk
    pub chunk_samples: usize,
    /// Upper bound on a single push
    pub send_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            channel: crate::CHANNEL,
            fifo_size: crate::FIFO_SIZE,
            chunk_samples: crate::CHUNK_SAMPLES,
            send_timeout: Duration::from_millis(crate::SEND_TIMEOUT_MS),
        }
    }
}

/// Snapshot of the transmit FIFO
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStatus {
    pub fifo_filled: usize,
    pub fifo_size: usize,
    pub underrun: u32,
    pub overrun: u32,
    pub dropped_packets: u32,
    /// Samples consumed by the hardware so far
    pub timestamp: u64,
}

/// A transmit-capable radio, opened and exclusively owned by the caller.
///
/// Calls are synchronous; only [`TxDevice::send`] may block, and never for
/// longer than the timeout it is given.
pub trait TxDevice {
    /// Short human readable identification
    fn describe(&self) -> String;

    /// Put every register back to its power-on default
    fn reset(&mut self) -> Result<()>;
    fn init(&mut self) -> Result<()>;
    fn enable_tx(&mut self, channel: usize, enabled: bool) -> Result<()>;

    fn set_sample_rate(&mut self, host_hz: f64, oversample: u32) -> Result<()>;
    fn sample_rate(&self, channel: usize) -> Result<SampleRate>;

    fn set_lo_frequency(&mut self, channel: usize, hz: f64) -> Result<()>;
    fn lo_frequency(&self, channel: usize) -> Result<f64>;

    fn set_lpf_bandwidth(&mut self, channel: usize, hz: f64) -> Result<()>;
    fn lpf_bandwidth(&self, channel: usize) -> Result<f64>;

    /// The driver clamps to its own range
    fn set_gain_db(&mut self, channel: usize, db: u32) -> Result<()>;
    fn gain_db(&self, channel: usize) -> Result<u32>;

    fn calibrate(&mut self, channel: usize, bandwidth_hz: f64) -> Result<()>;

    /// Load the mixer table slot we use and select it with the given direction
    fn set_mixer(&mut self, channel: usize, mixer: Mixer) -> Result<()>;

    fn read_register(&mut self, addr: u16) -> Result<u16>;
    fn write_register(&mut self, addr: u16, value: u16) -> Result<()>;

    fn setup_stream(&mut self, config: &StreamConfig) -> Result<()>;
    fn start_stream(&mut self) -> Result<()>;
    /// Push samples into the FIFO, returns how many were accepted
    fn send(&mut self, samples: &[IqSample], timeout: Duration) -> Result<usize>;
    fn stream_status(&mut self) -> Result<StreamStatus>;
    fn stop_stream(&mut self) -> Result<()>;
    fn destroy_stream(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

impl<D: TxDevice + ?Sized> TxDevice for Box<D> {
    fn describe(&self) -> String {
        (**self).describe()
    }
    fn reset(&mut self) -> Result<()> {
        (**self).reset()
    }
    fn init(&mut self) -> Result<()> {
        (**self).init()
    }
    fn enable_tx(&mut self, channel: usize, enabled: bool) -> Result<()> {
        (**self).enable_tx(channel, enabled)
    }
    fn set_sample_rate(&mut self, host_hz: f64, oversample: u32) -> Result<()> {
        (**self).set_sample_rate(host_hz, oversample)
    }
    fn sample_rate(&self, channel: usize) -> Result<SampleRate> {
        (**self).sample_rate(channel)
    }
    fn set_lo_frequency(&mut self, channel: usize, hz: f64) -> Result<()> {
        (**self).set_lo_frequency(channel, hz)
    }
    fn lo_frequency(&self, channel: usize) -> Result<f64> {
        (**self).lo_frequency(channel)
    }
    fn set_lpf_bandwidth(&mut self, channel: usize, hz: f64) -> Result<()> {
        (**self).set_lpf_bandwidth(channel, hz)
    }
    fn lpf_bandwidth(&self, channel: usize) -> Result<f64> {
        (**self).lpf_bandwidth(channel)
    }
    fn set_gain_db(&mut self, channel: usize, db: u32) -> Result<()> {
        (**self).set_gain_db(channel, db)
    }
    fn gain_db(&self, channel: usize) -> Result<u32> {
        (**self).gain_db(channel)
    }
    fn calibrate(&mut self, channel: usize, bandwidth_hz: f64) -> Result<()> {
        (**self).calibrate(channel, bandwidth_hz)
    }
    fn set_mixer(&mut self, channel: usize, mixer: Mixer) -> Result<()> {
        (**self).set_mixer(channel, mixer)
    }
    fn read_register(&mut self, addr: u16) -> Result<u16> {
        (**self).read_register(addr)
    }
    fn write_register(&mut self, addr: u16, value: u16) -> Result<()> {
        (**self).write_register(addr, value)
    }
    fn setup_stream(&mut self, config: &StreamConfig) -> Result<()> {
        (**self).setup_stream(config)
    }
    fn start_stream(&mut self) -> Result<()> {
        (**self).start_stream()
    }
    fn send(&mut self, samples: &[IqSample], timeout: Duration) -> Result<usize> {
        (**self).send(samples, timeout)
    }
    fn stream_status(&mut self) -> Result<StreamStatus> {
        (**self).stream_status()
    }
    fn stop_stream(&mut self) -> Result<()> {
        (**self).stop_stream()
    }
    fn destroy_stream(&mut self) -> Result<()> {
        (**self).destroy_stream()
    }
    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}
