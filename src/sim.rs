//! A transmitter that only exists in memory.
//!
//! The FIFO drains at the configured host sample rate against the wall clock,
//! so `send` blocks and times out like the real driver does. Every pushed
//! chunk can be captured to disk, and tests can look at the journal of calls.

use std::{
    collections::HashMap,
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use byte_slice_cast::AsByteSlice;
use chrono::{DateTime, Datelike, Timelike, Utc};
use tracing::{debug, info};

use crate::{
    device::{Mixer, SampleRate, StreamConfig, StreamStatus, TxDevice},
    Error, IqSample, Result, GAIN_MAX_DB, GAIN_MIN_DB,
};

/// How the simulated hardware consumes the FIFO
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// At the host sample rate
    RealTime,
    /// Not at all, every push past capacity times out
    Stalled,
}

#[derive(Debug, Clone)]
pub struct SimOptions {
    pub drain: Drain,
    /// Keep a journal of every call
    pub journal: bool,
    /// Directory to write a capture of every pushed chunk into
    pub capture_dir: Option<PathBuf>,
    /// Number of upcoming gain sets that fail
    pub fail_gain_sets: usize,
    pub fail_calibration: bool,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            drain: Drain::RealTime,
            journal: false,
            capture_dir: None,
            fail_gain_sets: 0,
            fail_calibration: false,
        }
    }
}

/// One call into the simulated driver
#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    Reset,
    Init,
    EnableTx(bool),
    SampleRate { host_hz: f64, oversample: u32 },
    Lo(f64),
    Lpf(f64),
    Gain(u32),
    Calibrate(f64),
    Mixer(Mixer),
    WriteRegister(u16, u16),
    SetupStream,
    StartStream,
    Send { samples: usize, silent: bool },
    StopStream,
    DestroyStream,
    Close,
}

struct SimStream {
    config: StreamConfig,
    running: bool,
    filled: usize,
    last_drain: Instant,
    consumed: u64,
    underrun: u32,
    dry: bool,
}

/// Raw little-endian i16 I/Q dump of everything that was pushed
struct Capture {
    path: PathBuf,
    writer: BufWriter<File>,
    staging: Vec<i16>,
}

impl Capture {
    fn create(dir: &Path) -> Result<Self> {
        let path = dir.join(format!("lime_tx-{}.iq", capture_timestamp(&Utc::now())));
        let writer = BufWriter::new(File::create(&path)?);
        info!("capturing pushed samples to {}", path.display());
        Ok(Self {
            path,
            writer,
            staging: Vec::new(),
        })
    }

    fn write(&mut self, samples: &[IqSample]) -> std::io::Result<()> {
        self.staging.clear();
        self.staging
            .extend(samples.iter().flat_map(|s| [s.re.to_le(), s.im.to_le()]));
        self.writer.write_all(self.staging.as_byte_slice())
    }
}

fn capture_timestamp(time: &DateTime<Utc>) -> String {
    format!(
        "{}-{:02}-{:02}-{:02}{:02}{:02}",
        time.year(),
        time.month(),
        time.day(),
        time.hour(),
        time.minute(),
        time.second()
    )
}

pub struct SimDevice {
    options: SimOptions,
    journal: Vec<SimEvent>,
    rate: SampleRate,
    lo_hz: f64,
    lpf_hz: f64,
    gain_db: u32,
    mixer: Option<Mixer>,
    tx_enabled: bool,
    registers: HashMap<u16, u16>,
    stream: Option<SimStream>,
    capture: Option<Capture>,
    closed: bool,
}

impl SimDevice {
    pub fn open(options: SimOptions) -> Result<Self> {
        let capture = match &options.capture_dir {
            Some(dir) => Some(Capture::create(dir)?),
            None => None,
        };
        Ok(Self {
            options,
            journal: Vec::new(),
            rate: SampleRate::default(),
            lo_hz: 0.0,
            lpf_hz: 0.0,
            gain_db: 0,
            mixer: None,
            tx_enabled: false,
            registers: HashMap::new(),
            stream: None,
            capture,
            closed: false,
        })
    }

    pub fn journal(&self) -> &[SimEvent] {
        &self.journal
    }

    pub fn mixer(&self) -> Option<Mixer> {
        self.mixer
    }

    pub fn tx_enabled(&self) -> bool {
        self.tx_enabled
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Gain values in the order they were set
    pub fn gain_history(&self) -> Vec<u32> {
        self.journal
            .iter()
            .filter_map(|e| match e {
                SimEvent::Gain(g) => Some(*g),
                _ => None,
            })
            .collect()
    }

    /// Make the next `n` gain sets fail
    pub fn fail_next_gain_sets(&mut self, n: usize) {
        self.options.fail_gain_sets = n;
    }

    pub fn capture_path(&self) -> Option<&Path> {
        self.capture.as_ref().map(|c| c.path.as_path())
    }

    fn record(&mut self, event: SimEvent) {
        if self.options.journal {
            self.journal.push(event);
        }
    }

    fn check_open(&self, op: &'static str) -> Result<()> {
        if self.closed {
            Err(Error::device(op, "device is closed"))
        } else {
            Ok(())
        }
    }

    /// Let the hardware eat whatever it would have consumed since last time
    fn drain(&mut self, now: Instant) {
        let host_hz = self.rate.host_hz;
        let drain = self.options.drain;
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        if !stream.running || drain == Drain::Stalled || host_hz <= 0.0 {
            stream.last_drain = now;
            return;
        }
        let elapsed = now.saturating_duration_since(stream.last_drain);
        let due = (elapsed.as_secs_f64() * host_hz) as usize;
        if due == 0 {
            return;
        }
        stream.last_drain += Duration::from_secs_f64(due as f64 / host_hz);
        let eaten = due.min(stream.filled);
        stream.filled -= eaten;
        stream.consumed += eaten as u64;
        if due > eaten && !stream.dry {
            stream.dry = true;
            stream.underrun += 1;
        }
    }
}

impl TxDevice for SimDevice {
    fn describe(&self) -> String {
        format!("simulated transmitter ({:?} drain)", self.options.drain)
    }

    fn reset(&mut self) -> Result<()> {
        self.check_open("reset")?;
        self.registers.clear();
        self.gain_db = 0;
        self.mixer = None;
        self.record(SimEvent::Reset);
        Ok(())
    }

    fn init(&mut self) -> Result<()> {
        self.check_open("init")?;
        self.record(SimEvent::Init);
        Ok(())
    }

    fn enable_tx(&mut self, _channel: usize, enabled: bool) -> Result<()> {
        self.check_open("enable_tx")?;
        self.tx_enabled = enabled;
        self.record(SimEvent::EnableTx(enabled));
        Ok(())
    }

    fn set_sample_rate(&mut self, host_hz: f64, oversample: u32) -> Result<()> {
        self.check_open("set_sample_rate")?;
        if host_hz <= 0.0 || oversample == 0 {
            return Err(Error::device(
                "set_sample_rate",
                format!("unusable rate {host_hz} Hz x{oversample}"),
            ));
        }
        self.rate = SampleRate {
            host_hz,
            rf_hz: host_hz * oversample as f64,
        };
        self.record(SimEvent::SampleRate {
            host_hz,
            oversample,
        });
        Ok(())
    }

    fn sample_rate(&self, _channel: usize) -> Result<SampleRate> {
        self.check_open("sample_rate")?;
        Ok(self.rate)
    }

    fn set_lo_frequency(&mut self, _channel: usize, hz: f64) -> Result<()> {
        self.check_open("set_lo_frequency")?;
        self.lo_hz = hz;
        self.record(SimEvent::Lo(hz));
        Ok(())
    }

    fn lo_frequency(&self, _channel: usize) -> Result<f64> {
        self.check_open("lo_frequency")?;
        Ok(self.lo_hz)
    }

    fn set_lpf_bandwidth(&mut self, _channel: usize, hz: f64) -> Result<()> {
        self.check_open("set_lpf_bandwidth")?;
        self.lpf_hz = hz;
        self.record(SimEvent::Lpf(hz));
        Ok(())
    }

    fn lpf_bandwidth(&self, _channel: usize) -> Result<f64> {
        self.check_open("lpf_bandwidth")?;
        Ok(self.lpf_hz)
    }

    fn set_gain_db(&mut self, _channel: usize, db: u32) -> Result<()> {
        self.check_open("set_gain_db")?;
        if self.options.fail_gain_sets > 0 {
            self.options.fail_gain_sets -= 1;
            return Err(Error::device("set_gain_db", "control link busy"));
        }
        let db = db.clamp(GAIN_MIN_DB as u32, GAIN_MAX_DB as u32);
        self.gain_db = db;
        self.record(SimEvent::Gain(db));
        Ok(())
    }

    fn gain_db(&self, _channel: usize) -> Result<u32> {
        self.check_open("gain_db")?;
        Ok(self.gain_db)
    }

    fn calibrate(&mut self, _channel: usize, bandwidth_hz: f64) -> Result<()> {
        self.check_open("calibrate")?;
        self.record(SimEvent::Calibrate(bandwidth_hz));
        if self.options.fail_calibration {
            return Err(Error::device("calibrate", "loopback level too low"));
        }
        Ok(())
    }

    fn set_mixer(&mut self, _channel: usize, mixer: Mixer) -> Result<()> {
        self.check_open("set_mixer")?;
        let limit = self.rate.rf_hz / 2.0;
        if mixer.freq_hz < 0.0 || mixer.freq_hz > limit {
            return Err(Error::device(
                "set_mixer",
                format!(
                    "NCO {:.3} MHz outside 0..{:.3} MHz",
                    mixer.freq_hz / 1e6,
                    limit / 1e6
                ),
            ));
        }
        self.mixer = Some(mixer);
        self.record(SimEvent::Mixer(mixer));
        Ok(())
    }

    fn read_register(&mut self, addr: u16) -> Result<u16> {
        self.check_open("read_register")?;
        Ok(self.registers.get(&addr).copied().unwrap_or(0))
    }

    fn write_register(&mut self, addr: u16, value: u16) -> Result<()> {
        self.check_open("write_register")?;
        self.registers.insert(addr, value);
        self.record(SimEvent::WriteRegister(addr, value));
        Ok(())
    }

    fn setup_stream(&mut self, config: &StreamConfig) -> Result<()> {
        self.check_open("setup_stream")?;
        if self.stream.is_some() {
            return Err(Error::device("setup_stream", "stream already exists"));
        }
        if config.chunk_samples > config.fifo_size {
            return Err(Error::device(
                "setup_stream",
                format!(
                    "chunk of {} samples does not fit a {} sample FIFO",
                    config.chunk_samples, config.fifo_size
                ),
            ));
        }
        self.stream = Some(SimStream {
            config: config.clone(),
            running: false,
            filled: 0,
            last_drain: Instant::now(),
            consumed: 0,
            underrun: 0,
            dry: true,
        });
        self.record(SimEvent::SetupStream);
        Ok(())
    }

    fn start_stream(&mut self) -> Result<()> {
        self.check_open("start_stream")?;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::device("start_stream", "no stream"))?;
        stream.running = true;
        stream.last_drain = Instant::now();
        self.record(SimEvent::StartStream);
        Ok(())
    }

    fn send(&mut self, samples: &[IqSample], timeout: Duration) -> Result<usize> {
        self.check_open("send")?;
        let deadline = Instant::now() + timeout;
        let n = samples.len();
        loop {
            let now = Instant::now();
            self.drain(now);
            let host_hz = self.rate.host_hz;
            let drain = self.options.drain;
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| Error::device("send", "no stream"))?;
            if !stream.running {
                return Err(Error::device("send", "stream not started"));
            }
            if n > stream.config.fifo_size {
                return Err(Error::device("send", "chunk larger than the FIFO"));
            }
            let free = stream.config.fifo_size - stream.filled;
            if free >= n {
                stream.filled += n;
                if n > 0 {
                    stream.dry = false;
                }
                break;
            }
            let wait = match drain {
                Drain::RealTime if host_hz > 0.0 => {
                    Duration::from_secs_f64((n - free) as f64 / host_hz)
                }
                _ => Duration::MAX,
            };
            let remaining = deadline.saturating_duration_since(now);
            if wait > remaining {
                thread::sleep(remaining);
                return Err(Error::Timeout {
                    op: "send",
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            thread::sleep(wait);
        }
        if let Some(capture) = self.capture.as_mut() {
            capture
                .write(samples)
                .map_err(|e| Error::device("send", format!("capture: {e}")))?;
        }
        let silent = samples.iter().all(|s| s.re == 0 && s.im == 0);
        self.record(SimEvent::Send { samples: n, silent });
        Ok(n)
    }

    fn stream_status(&mut self) -> Result<StreamStatus> {
        self.check_open("stream_status")?;
        self.drain(Instant::now());
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| Error::device("stream_status", "no stream"))?;
        Ok(StreamStatus {
            fifo_filled: stream.filled,
            fifo_size: stream.config.fifo_size,
            underrun: stream.underrun,
            overrun: 0,
            dropped_packets: 0,
            timestamp: stream.consumed,
        })
    }

    fn stop_stream(&mut self) -> Result<()> {
        self.check_open("stop_stream")?;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::device("stop_stream", "no stream"))?;
        stream.running = false;
        self.record(SimEvent::StopStream);
        Ok(())
    }

    fn destroy_stream(&mut self) -> Result<()> {
        self.check_open("destroy_stream")?;
        if self.stream.take().is_none() {
            return Err(Error::device("destroy_stream", "no stream"));
        }
        self.record(SimEvent::DestroyStream);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.check_open("close")?;
        if let Some(mut capture) = self.capture.take() {
            capture.writer.flush()?;
            debug!("capture closed: {}", capture.path.display());
        }
        self.record(SimEvent::Close);
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_complex::Complex;

    fn streaming(drain: Drain, fifo_size: usize) -> SimDevice {
        let mut dev = SimDevice::open(SimOptions {
            drain,
            journal: true,
            ..Default::default()
        })
        .unwrap();
        dev.set_sample_rate(1e6, 8).unwrap();
        dev.setup_stream(&StreamConfig {
            fifo_size,
            chunk_samples: 64,
            ..Default::default()
        })
        .unwrap();
        dev.start_stream().unwrap();
        dev
    }

    #[test]
    fn test_gain_is_clamped() {
        let mut dev = SimDevice::open(SimOptions::default()).unwrap();
        dev.set_gain_db(0, 90).unwrap();
        assert_eq!(dev.gain_db(0).unwrap(), 73);
    }

    #[test]
    fn test_full_fifo_times_out_when_stalled() {
        let mut dev = streaming(Drain::Stalled, 128);
        let chunk = vec![Complex::new(1i16, 0i16); 64];
        let timeout = Duration::from_millis(30);
        assert_eq!(dev.send(&chunk, timeout).unwrap(), 64);
        assert_eq!(dev.send(&chunk, timeout).unwrap(), 64);
        let start = Instant::now();
        let err = dev.send(&chunk, timeout).unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() >= timeout);
    }

    #[test]
    fn test_realtime_drain_makes_room() {
        let mut dev = streaming(Drain::RealTime, 128);
        let chunk = vec![Complex::new(1i16, 0i16); 64];
        // 64 samples at 1 Msps take 64 us to drain
        for _ in 0..10 {
            dev.send(&chunk, Duration::from_millis(100)).unwrap();
        }
        let status = dev.stream_status().unwrap();
        assert!(status.fifo_filled <= 128);
        assert!(status.timestamp >= 64 * 8);
    }

    #[test]
    fn test_mixer_range_is_checked() {
        let mut dev = SimDevice::open(SimOptions::default()).unwrap();
        dev.set_sample_rate(5e6, 8).unwrap();
        assert!(dev
            .set_mixer(0, Mixer { freq_hz: 20e6, downconvert: true })
            .is_ok());
        assert!(dev
            .set_mixer(0, Mixer { freq_hz: 21e6, downconvert: true })
            .is_err());
    }

    #[test]
    fn test_send_needs_started_stream() {
        let mut dev = SimDevice::open(SimOptions::default()).unwrap();
        let chunk = vec![Complex::new(0i16, 0i16); 16];
        assert!(dev.send(&chunk, Duration::from_millis(1)).is_err());
    }

    #[test]
    fn test_capture_file_holds_pushed_samples() {
        let dir = std::env::temp_dir().join(format!("lime_tx_capture_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut dev = SimDevice::open(SimOptions {
            capture_dir: Some(dir.clone()),
            ..Default::default()
        })
        .unwrap();
        dev.set_sample_rate(1e6, 1).unwrap();
        dev.setup_stream(&StreamConfig {
            fifo_size: 1024,
            chunk_samples: 2,
            ..Default::default()
        })
        .unwrap();
        dev.start_stream().unwrap();
        let chunk = [Complex::new(1i16, -2i16), Complex::new(0x0102, 3)];
        dev.send(&chunk, Duration::from_millis(10)).unwrap();
        let path = dev.capture_path().unwrap().to_path_buf();
        dev.close().unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes, vec![1, 0, 0xfe, 0xff, 0x02, 0x01, 3, 0]);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
