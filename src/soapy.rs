//! `TxDevice` on top of SoapySDR (a LimeSDR through SoapyLMS7, or anything
//! else with a TX channel and a tunable baseband CORDIC)

use std::time::Duration;

use soapysdr::{Device, Direction, ErrorCode, TxStream};
use tracing::{debug, info};

use crate::{
    device::{Mixer, SampleRate, StreamConfig, StreamStatus, TxDevice},
    Error, IqSample, Result,
};

fn soapy_err(op: &'static str) -> impl Fn(soapysdr::Error) -> Error {
    move |e| Error::device(op, e.to_string())
}

/// RF rate implied by the NCO tuning ranges, which reach ±rf/2
fn rf_from_nco_ranges(ranges: impl Iterator<Item = (f64, f64)>) -> Option<f64> {
    ranges
        .map(|(min, max)| min.abs().max(max.abs()))
        .filter(|hz| hz.is_finite())
        .reduce(f64::max)
        .filter(|hz| *hz > 0.0)
        .map(|half| 2.0 * half)
}

pub struct SoapyDevice {
    device: Option<Device>,
    label: String,
    oversample: u32,
    channel: usize,
    stream: Option<TxStream<IqSample>>,
    active: bool,
}

impl SoapyDevice {
    /// Open the first device matching `args` ("" takes whatever is found first)
    pub fn open(args: &str) -> Result<Self> {
        let found = soapysdr::enumerate(args).map_err(soapy_err("enumerate"))?;
        if found.is_empty() {
            return Err(Error::NoDevice);
        }
        let device = Device::new(args).map_err(soapy_err("open"))?;
        let label = format!(
            "{} ({})",
            device.hardware_key().unwrap_or_else(|_| "unknown".to_owned()),
            device.driver_key().unwrap_or_else(|_| "soapy".to_owned())
        );
        info!("opened {}", label);
        Ok(Self {
            device: Some(device),
            label,
            oversample: 1,
            channel: crate::CHANNEL,
            stream: None,
            active: false,
        })
    }

    fn dev(&self, op: &'static str) -> Result<&Device> {
        self.device
            .as_ref()
            .ok_or_else(|| Error::device(op, "device is closed"))
    }

    fn stream_mut(&mut self, op: &'static str) -> Result<&mut TxStream<IqSample>> {
        self.stream
            .as_mut()
            .ok_or_else(|| Error::device(op, "no stream"))
    }
}

impl TxDevice for SoapyDevice {
    fn describe(&self) -> String {
        self.label.clone()
    }

    fn reset(&mut self) -> Result<()> {
        Err(Error::Unsupported("reset"))
    }

    fn init(&mut self) -> Result<()> {
        self.dev("init")?;
        Ok(())
    }

    /// SoapySDR has no per-channel power switch. The TX path powers up when
    /// the stream is activated and down when it is deactivated and closed, so
    /// this only checks the device is still open.
    fn enable_tx(&mut self, channel: usize, enabled: bool) -> Result<()> {
        self.dev("enable_tx")?;
        self.channel = channel;
        debug!("TX channel {} {}", channel, if enabled { "on" } else { "off" });
        Ok(())
    }

    fn set_sample_rate(&mut self, host_hz: f64, oversample: u32) -> Result<()> {
        let ch = self.channel;
        self.dev("set_sample_rate")?
            .set_sample_rate(Direction::Tx, ch, host_hz)
            .map_err(soapy_err("set_sample_rate"))?;
        self.oversample = oversample.max(1);
        Ok(())
    }

    /// The RF rate is not exposed through SoapySDR. It is taken from the
    /// baseband NCO's tuning range (which spans ±rf/2) when the driver reports
    /// one, and estimated as host × oversample otherwise.
    fn sample_rate(&self, channel: usize) -> Result<SampleRate> {
        let dev = self.dev("sample_rate")?;
        let host_hz = dev
            .sample_rate(Direction::Tx, channel)
            .map_err(soapy_err("sample_rate"))?;
        let nco_rf = dev
            .component_frequency_range(Direction::Tx, channel, "BB")
            .ok()
            .and_then(|ranges| rf_from_nco_ranges(ranges.iter().map(|r| (r.minimum, r.maximum))));
        let rf_hz = match nco_rf {
            Some(rf_hz) => rf_hz,
            None => {
                debug!("no BB range from the driver, RF rate estimated from oversample");
                host_hz * self.oversample as f64
            }
        };
        Ok(SampleRate { host_hz, rf_hz })
    }

    fn set_lo_frequency(&mut self, channel: usize, hz: f64) -> Result<()> {
        self.dev("set_lo_frequency")?
            .set_component_frequency(Direction::Tx, channel, "RF", hz, "")
            .map_err(soapy_err("set_lo_frequency"))
    }

    fn lo_frequency(&self, channel: usize) -> Result<f64> {
        self.dev("lo_frequency")?
            .component_frequency(Direction::Tx, channel, "RF")
            .map_err(soapy_err("lo_frequency"))
    }

    fn set_lpf_bandwidth(&mut self, channel: usize, hz: f64) -> Result<()> {
        self.dev("set_lpf_bandwidth")?
            .set_bandwidth(Direction::Tx, channel, hz)
            .map_err(soapy_err("set_lpf_bandwidth"))
    }

    fn lpf_bandwidth(&self, channel: usize) -> Result<f64> {
        self.dev("lpf_bandwidth")?
            .bandwidth(Direction::Tx, channel)
            .map_err(soapy_err("lpf_bandwidth"))
    }

    fn set_gain_db(&mut self, channel: usize, db: u32) -> Result<()> {
        let db = (db as i32).clamp(crate::GAIN_MIN_DB, crate::GAIN_MAX_DB);
        self.dev("set_gain_db")?
            .set_gain(Direction::Tx, channel, db as f64)
            .map_err(soapy_err("set_gain_db"))
    }

    fn gain_db(&self, channel: usize) -> Result<u32> {
        let db = self
            .dev("gain_db")?
            .gain(Direction::Tx, channel)
            .map_err(soapy_err("gain_db"))?;
        Ok(db.round().max(0.0) as u32)
    }

    fn calibrate(&mut self, _channel: usize, _bandwidth_hz: f64) -> Result<()> {
        Err(Error::Unsupported("calibrate"))
    }

    // The baseband CORDIC adds its frequency to the LO, so downconvert is negative
    fn set_mixer(&mut self, channel: usize, mixer: Mixer) -> Result<()> {
        let signed = if mixer.downconvert {
            -mixer.freq_hz
        } else {
            mixer.freq_hz
        };
        self.dev("set_mixer")?
            .set_component_frequency(Direction::Tx, channel, "BB", signed, "")
            .map_err(soapy_err("set_mixer"))
    }

    fn read_register(&mut self, _addr: u16) -> Result<u16> {
        Err(Error::Unsupported("read_register"))
    }

    fn write_register(&mut self, _addr: u16, _value: u16) -> Result<()> {
        Err(Error::Unsupported("write_register"))
    }

    fn setup_stream(&mut self, config: &StreamConfig) -> Result<()> {
        if self.stream.is_some() {
            return Err(Error::device("setup_stream", "stream already exists"));
        }
        let stream = self
            .dev("setup_stream")?
            .tx_stream::<IqSample>(&[config.channel])
            .map_err(soapy_err("setup_stream"))?;
        debug!(
            "TX stream on channel {}, MTU {:?}",
            config.channel,
            stream.mtu().ok()
        );
        self.stream = Some(stream);
        Ok(())
    }

    fn start_stream(&mut self) -> Result<()> {
        self.stream_mut("start_stream")?
            .activate(None)
            .map_err(soapy_err("start_stream"))?;
        self.active = true;
        Ok(())
    }

    fn send(&mut self, samples: &[IqSample], timeout: Duration) -> Result<usize> {
        let timeout_us = timeout.as_micros().min(i64::MAX as u128) as i64;
        let stream = self.stream_mut("send")?;
        // write_all keeps going through partial writes
        match stream.write_all(&[samples], None, false, timeout_us) {
            Ok(()) => Ok(samples.len()),
            Err(e) if matches!(e.code, ErrorCode::Timeout) => Err(Error::Timeout {
                op: "send",
                timeout_ms: timeout.as_millis() as u64,
            }),
            Err(e) => Err(Error::device("send", e.to_string())),
        }
    }

    fn stream_status(&mut self) -> Result<StreamStatus> {
        Err(Error::Unsupported("stream_status"))
    }

    fn stop_stream(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        self.stream_mut("stop_stream")?
            .deactivate(None)
            .map_err(soapy_err("stop_stream"))
    }

    fn destroy_stream(&mut self) -> Result<()> {
        match self.stream.take() {
            Some(_) => Ok(()),
            None => Err(Error::device("destroy_stream", "no stream")),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.stream = None;
        match self.device.take() {
            Some(_) => Ok(()),
            None => Err(Error::device("close", "device is closed")),
        }
    }
}
