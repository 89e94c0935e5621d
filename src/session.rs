//! One transmit session, from configuration to teardown.
//!
//! `TxSession` owns the device. Whatever way the session ends (source done,
//! push failure, Ctrl-C, a setup error) the transmitter is muted with one
//! all-zero chunk and then the stream, the channel and the device are shut
//! down in that order. Dropping the session runs the same teardown.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use num_complex::Complex;
use tracing::{debug, error, info, warn};

use crate::{
    device::{Mixer, SampleRate, StreamConfig, TxDevice},
    ramp::GainRamp,
    source::{Fill, SampleSource},
    sweep::Sweep,
    txtsp::TxCorrectors,
    Error, IqSample, Result,
};

const STATUS_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Configuring,
    Streaming,
    Draining,
    Closed,
}

/// RF front end settings applied before streaming
#[derive(Debug, Clone, PartialEq)]
pub struct RfConfig {
    pub channel: usize,
    /// Put the chip back to defaults before anything else
    pub reset: bool,
    pub host_sample_rate_hz: f64,
    pub oversample: u32,
    pub lpf_bandwidth_hz: f64,
    pub lo_hz: f64,
    /// Fixed NCO setting, `None` when a sweep programs it instead
    pub mixer: Option<Mixer>,
    /// Calibration bandwidth, `None` skips calibration
    pub calibration_bw_hz: Option<f64>,
    /// Log the TXTSP correctors around calibration
    pub print_correctors: bool,
}

/// Why the streaming loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Cancelled,
    SourceExhausted,
    SourceFailed,
    SendFailed,
    RetuneFailed,
}

#[derive(Debug)]
pub struct SessionReport {
    pub reason: EndReason,
    pub chunks: u64,
    pub samples: u64,
    pub elapsed: Duration,
    /// The failure behind `SourceFailed`, `SendFailed` or `RetuneFailed`
    pub error: Option<Error>,
}

pub struct TxSession<D: TxDevice> {
    device: D,
    channel: usize,
    state: SessionState,
    tx_enabled: bool,
    stream: Option<StreamConfig>,
    chunk: Vec<IqSample>,
}

/// Corrector snapshot; a backend without register access only gets a warning
pub fn log_correctors<D: TxDevice + ?Sized>(device: &mut D, channel: usize) {
    match TxCorrectors::read(device, channel) {
        Ok(c) => c.log(channel),
        Err(e) => warn!("can't read TXTSP correctors: {}", e),
    }
}

impl<D: TxDevice> TxSession<D> {
    pub fn new(device: D) -> Self {
        info!("device: {}", device.describe());
        Self {
            device,
            channel: crate::CHANNEL,
            state: SessionState::Configuring,
            tx_enabled: false,
            stream: None,
            chunk: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    fn expect_state(&self, want: SessionState, op: &str) -> Result<()> {
        if self.state == want {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "{op} needs a {want:?} session, this one is {:?}",
                self.state
            )))
        }
    }

    /// Bring the RF chain up; returns the rates the driver actually picked.
    ///
    /// The ramp's start gain goes in before the LO, so calibration runs at it.
    pub fn configure(
        &mut self,
        rf: &RfConfig,
        ramp: Option<&mut GainRamp>,
    ) -> Result<SampleRate> {
        self.expect_state(SessionState::Configuring, "configure")?;
        self.channel = rf.channel;
        let ch = rf.channel;
        let dev = &mut self.device;
        if rf.reset {
            dev.reset()?;
            info!("device reset to defaults");
        }
        dev.init()?;
        dev.enable_tx(ch, true)?;
        self.tx_enabled = true;

        dev.set_sample_rate(rf.host_sample_rate_hz, rf.oversample)?;
        let rate = dev.sample_rate(ch)?;
        info!(
            "sample rate: host {:.3} MHz, RF {:.3} MHz (x{})",
            rate.host_hz / 1e6,
            rate.rf_hz / 1e6,
            rf.oversample
        );

        dev.set_lpf_bandwidth(ch, rf.lpf_bandwidth_hz)?;
        match dev.lpf_bandwidth(ch) {
            Ok(bw) => info!("TX LPF bandwidth {:.3} MHz", bw / 1e6),
            Err(e) => warn!("TX LPF readback failed: {}", e),
        }

        if let Some(ramp) = ramp {
            ramp.apply_start(dev)?;
        }

        dev.set_lo_frequency(ch, rf.lo_hz)?;
        match dev.lo_frequency(ch) {
            Ok(lo) => info!("TX LO {:.6} MHz", lo / 1e6),
            Err(e) => warn!("TX LO readback failed: {}", e),
        }

        if let Some(mixer) = rf.mixer {
            dev.set_mixer(ch, mixer)?;
            info!(
                "NCO {:.3} MHz {}convert, RF {:.6} MHz",
                mixer.freq_hz / 1e6,
                mixer.direction(),
                mixer.rf_hz(rf.lo_hz) / 1e6
            );
        }

        if let Some(bw) = rf.calibration_bw_hz {
            if rf.print_correctors {
                info!("before calibration:");
                log_correctors(dev, ch);
            }
            match dev.calibrate(ch, bw) {
                Ok(()) => info!("TX calibrated over {:.3} MHz", bw / 1e6),
                Err(e) => warn!("TX calibration failed, continuing uncalibrated: {}", e),
            }
            if rf.print_correctors {
                info!("after calibration:");
                log_correctors(dev, ch);
            }
        } else if rf.print_correctors {
            log_correctors(dev, ch);
        }
        Ok(rate)
    }

    /// Create and start the stream, allocate the chunk buffer
    pub fn start_stream(&mut self, config: &StreamConfig) -> Result<()> {
        self.expect_state(SessionState::Configuring, "start_stream")?;
        if config.chunk_samples == 0 {
            return Err(Error::Config("chunk size must be at least one sample".to_owned()));
        }
        self.device.setup_stream(config)?;
        self.stream = Some(config.clone());
        self.device.start_stream()?;
        self.chunk = vec![Complex::new(0, 0); config.chunk_samples];
        self.state = SessionState::Streaming;
        info!(
            "stream started: FIFO {} samples, chunk {} samples, timeout {} ms",
            config.fifo_size,
            config.chunk_samples,
            config.send_timeout.as_millis()
        );
        Ok(())
    }

    fn log_status(&mut self, samples: u64, started: Instant) {
        let rate = samples as f64 / started.elapsed().as_secs_f64().max(1e-9);
        match self.device.stream_status() {
            Ok(s) => info!(
                "FIFO {}/{}, underrun {}, overrun {}, dropped {}, {:.3} Msps pushed",
                s.fifo_filled,
                s.fifo_size,
                s.underrun,
                s.overrun,
                s.dropped_packets,
                rate / 1e6
            ),
            Err(e) => debug!("stream status unavailable: {}", e),
        }
    }

    /// Push chunks until something ends the session
    pub fn stream<S: SampleSource + ?Sized>(
        &mut self,
        source: &mut S,
        mut ramp: Option<&mut GainRamp>,
        mut sweep: Option<&mut Sweep>,
        running: &AtomicBool,
    ) -> Result<SessionReport> {
        self.expect_state(SessionState::Streaming, "stream")?;
        let timeout = self
            .stream
            .as_ref()
            .map(|s| s.send_timeout)
            .unwrap_or(Duration::from_millis(crate::SEND_TIMEOUT_MS));
        info!("streaming {}", source.describe());

        let started = Instant::now();
        if let Some(r) = ramp.as_mut() {
            r.arm(started);
        }
        if let Some(s) = sweep.as_mut() {
            s.arm(started);
        }
        let mut next_status = started + STATUS_PERIOD;
        let mut chunks = 0u64;
        let mut samples = 0u64;
        let mut failure = None;

        let reason = loop {
            if !running.load(Ordering::SeqCst) {
                info!("stop requested");
                break EndReason::Cancelled;
            }
            let fill = match source.fill(&mut self.chunk) {
                Ok(fill) => fill,
                Err(e) => {
                    error!("source read failed: {}", e);
                    failure = Some(e);
                    break EndReason::SourceFailed;
                }
            };
            if fill == Fill::Exhausted {
                info!("end of input");
                break EndReason::SourceExhausted;
            }
            match self.device.send(&self.chunk, timeout) {
                Ok(n) => {
                    chunks += 1;
                    samples += n as u64;
                }
                Err(e) => {
                    error!("send failed: {}", e);
                    failure = Some(e);
                    break EndReason::SendFailed;
                }
            }
            if fill == Fill::Last {
                info!("end of input");
                break EndReason::SourceExhausted;
            }

            let now = Instant::now();
            if let Some(r) = ramp.as_mut() {
                r.tick(&mut self.device, now);
            }
            if let Some(s) = sweep.as_mut() {
                if let Err(e) = s.tick(&mut self.device, now) {
                    error!("retune failed: {}", e);
                    failure = Some(e);
                    break EndReason::RetuneFailed;
                }
            }
            if now >= next_status {
                self.log_status(samples, started);
                next_status = now + STATUS_PERIOD;
            }
        };

        self.state = SessionState::Draining;
        let elapsed = started.elapsed();
        info!(
            "stream ended ({:?}) after {} chunks, {} samples, {:.1} s",
            reason,
            chunks,
            samples,
            elapsed.as_secs_f64()
        );
        Ok(SessionReport {
            reason,
            chunks,
            samples,
            elapsed,
            error: failure,
        })
    }

    /// Mute, stop and destroy the stream, disable TX, close the device.
    ///
    /// Every step runs even if an earlier one failed; the first failure is
    /// returned. A failed mute push is only logged. Calling it again is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.state = SessionState::Draining;
        let mut first: Option<Error> = None;
        let mut note = |op: &str, result: Result<()>| {
            if let Err(e) = result {
                warn!("teardown: {} failed: {}", op, e);
                if first.is_none() {
                    first = Some(e);
                }
            }
        };

        if let Some(config) = self.stream.take() {
            let silence = vec![Complex::new(0, 0); config.chunk_samples];
            match self.device.send(&silence, config.send_timeout) {
                Ok(_) => debug!("muted with {} zero samples", silence.len()),
                Err(e) => warn!("mute push failed: {}", e),
            }
            note("stop_stream", self.device.stop_stream());
            note("destroy_stream", self.device.destroy_stream());
        }
        if self.tx_enabled {
            self.tx_enabled = false;
            note("enable_tx", self.device.enable_tx(self.channel, false));
        }
        note("close", self.device.close());

        self.chunk = Vec::new();
        self.state = SessionState::Closed;
        info!("device closed");
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<D: TxDevice> Drop for TxSession<D> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("teardown on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ramp::RampConfig,
        sim::{Drain, SimDevice, SimEvent, SimOptions},
        source::ConstantDc,
        sweep::SweepConfig,
    };
    use std::thread;

    fn rf() -> RfConfig {
        RfConfig {
            channel: 0,
            reset: true,
            host_sample_rate_hz: 5e6,
            oversample: 8,
            lpf_bandwidth_hz: 50e6,
            lo_hz: 30e6,
            mixer: Some(Mixer::for_target(30e6, 15e6)),
            calibration_bw_hz: Some(20e6),
            print_correctors: false,
        }
    }

    fn small_stream() -> StreamConfig {
        StreamConfig {
            fifo_size: 1 << 17,
            chunk_samples: 64,
            send_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    fn session(options: SimOptions) -> TxSession<SimDevice> {
        TxSession::new(
            SimDevice::open(SimOptions {
                journal: true,
                ..options
            })
            .unwrap(),
        )
    }

    fn streaming(options: SimOptions, stream: &StreamConfig) -> TxSession<SimDevice> {
        let mut s = session(options);
        s.configure(&rf(), None).unwrap();
        s.start_stream(stream).unwrap();
        s
    }

    /// Emits `full` non-zero chunks, then one more as `Last` or reports `Exhausted`
    struct Counted {
        full: usize,
        end: Fill,
        sleep: Duration,
        stop_after: Option<(usize, &'static AtomicBool)>,
        calls: usize,
    }

    impl Counted {
        fn new(full: usize, end: Fill) -> Self {
            Self {
                full,
                end,
                sleep: Duration::ZERO,
                stop_after: None,
                calls: 0,
            }
        }
    }

    impl SampleSource for Counted {
        fn fill(&mut self, chunk: &mut [IqSample]) -> Result<Fill> {
            self.calls += 1;
            if let Some((n, flag)) = self.stop_after {
                if self.calls > n {
                    flag.store(false, Ordering::SeqCst);
                }
            }
            thread::sleep(self.sleep);
            if self.calls <= self.full {
                chunk.fill(Complex::new(1000, -1000));
                return Ok(Fill::More);
            }
            match self.end {
                Fill::Last => {
                    chunk.fill(Complex::new(0, 0));
                    chunk[0] = Complex::new(7, 7);
                    Ok(Fill::Last)
                }
                other => Ok(other),
            }
        }

        fn describe(&self) -> String {
            "test source".to_owned()
        }
    }

    struct Broken;

    impl SampleSource for Broken {
        fn fill(&mut self, _chunk: &mut [IqSample]) -> Result<Fill> {
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "pipe writer went away",
            )))
        }

        fn describe(&self) -> String {
            "broken".to_owned()
        }
    }

    fn tail(dev: &SimDevice, n: usize) -> Vec<SimEvent> {
        let j = dev.journal();
        j[j.len() - n..].to_vec()
    }

    #[test]
    fn test_configure_order() {
        let mut s = session(SimOptions::default());
        let rate = s.configure(&rf(), None).unwrap();
        assert_eq!(rate.rf_hz, 40e6);
        assert_eq!(
            s.device().journal(),
            &[
                SimEvent::Reset,
                SimEvent::Init,
                SimEvent::EnableTx(true),
                SimEvent::SampleRate {
                    host_hz: 5e6,
                    oversample: 8
                },
                SimEvent::Lpf(50e6),
                SimEvent::Lo(30e6),
                SimEvent::Mixer(Mixer {
                    freq_hz: 15e6,
                    downconvert: true
                }),
                SimEvent::Calibrate(20e6),
            ]
        );
        assert_eq!(s.state(), SessionState::Configuring);
    }

    #[test]
    fn test_start_gain_is_set_before_calibration() {
        let mut s = session(SimOptions::default());
        let mut ramp = GainRamp::new(
            RampConfig {
                start_db: 12,
                target_db: 40,
                total_ms: 1000,
                interval_ms: 20,
            },
            0,
        );
        let mut rf = rf();
        rf.print_correctors = true;
        s.configure(&rf, Some(&mut ramp)).unwrap();
        assert_eq!(ramp.applied_db(), 12);
        let j = s.device().journal();
        let at = |want: &SimEvent| j.iter().position(|e| e == want).unwrap();
        let gain = at(&SimEvent::Gain(12));
        assert!(gain > at(&SimEvent::Lpf(50e6)));
        assert!(gain < at(&SimEvent::Lo(30e6)));
        assert!(gain < at(&SimEvent::Calibrate(20e6)));
        // Snapshots select the channel through MAC on both sides of calibration
        let cal = at(&SimEvent::Calibrate(20e6));
        let mac = |e: &SimEvent| matches!(e, SimEvent::WriteRegister(crate::txtsp::REG_MAC, _));
        assert!(j[..cal].iter().any(mac));
        assert!(j[cal..].iter().any(mac));
    }

    #[test]
    fn test_last_chunk_is_pushed_then_muted() {
        let mut s = streaming(SimOptions::default(), &small_stream());
        assert_eq!(s.state(), SessionState::Streaming);
        let running = AtomicBool::new(true);
        let mut src = Counted::new(3, Fill::Last);
        let report = s.stream(&mut src, None, None, &running).unwrap();
        assert_eq!(report.reason, EndReason::SourceExhausted);
        assert_eq!(report.chunks, 4);
        assert_eq!(report.samples, 4 * 64);
        assert_eq!(s.state(), SessionState::Draining);
        s.close().unwrap();
        assert_eq!(s.state(), SessionState::Closed);
        assert_eq!(
            tail(s.device(), 6),
            vec![
                SimEvent::Send {
                    samples: 64,
                    silent: false
                },
                SimEvent::Send {
                    samples: 64,
                    silent: true
                },
                SimEvent::StopStream,
                SimEvent::DestroyStream,
                SimEvent::EnableTx(false),
                SimEvent::Close,
            ]
        );
        assert!(s.device().is_closed());
        assert!(!s.device().tx_enabled());
    }

    #[test]
    fn test_exhausted_source_pushes_nothing_more() {
        let mut s = streaming(SimOptions::default(), &small_stream());
        let running = AtomicBool::new(true);
        let report = s
            .stream(&mut Counted::new(2, Fill::Exhausted), None, None, &running)
            .unwrap();
        assert_eq!(report.reason, EndReason::SourceExhausted);
        assert_eq!(report.chunks, 2);
    }

    #[test]
    fn test_cancel_before_first_chunk() {
        let mut s = streaming(SimOptions::default(), &small_stream());
        let running = AtomicBool::new(false);
        let mut src = ConstantDc::new(0.5).unwrap();
        let report = s.stream(&mut src, None, None, &running).unwrap();
        assert_eq!(report.reason, EndReason::Cancelled);
        assert_eq!(report.chunks, 0);
        s.close().unwrap();
        // Only the mute chunk went out
        let sends: Vec<_> = s
            .device()
            .journal()
            .iter()
            .filter(|e| matches!(e, SimEvent::Send { .. }))
            .collect();
        assert_eq!(
            sends,
            vec![&SimEvent::Send {
                samples: 64,
                silent: true
            }]
        );
    }

    #[test]
    fn test_cancel_mid_stream() {
        static RUNNING: AtomicBool = AtomicBool::new(true);
        let mut s = streaming(SimOptions::default(), &small_stream());
        let mut src = Counted::new(usize::MAX, Fill::Last);
        src.stop_after = Some((5, &RUNNING));
        let report = s.stream(&mut src, None, None, &RUNNING).unwrap();
        assert_eq!(report.reason, EndReason::Cancelled);
        // The chunk in flight when the flag flipped still completes
        assert_eq!(report.chunks, 6);
    }

    #[test]
    fn test_full_fifo_timeout_ends_session() {
        let stream = StreamConfig {
            fifo_size: 128,
            chunk_samples: 64,
            send_timeout: Duration::from_millis(30),
            ..Default::default()
        };
        let mut s = streaming(
            SimOptions {
                drain: Drain::Stalled,
                ..Default::default()
            },
            &stream,
        );
        let running = AtomicBool::new(true);
        let mut src = ConstantDc::new(1.0).unwrap();
        let report = s.stream(&mut src, None, None, &running).unwrap();
        assert_eq!(report.reason, EndReason::SendFailed);
        assert_eq!(report.chunks, 2);
        assert!(report.error.unwrap().is_timeout());
        // The mute push times out too, teardown carries on
        s.close().unwrap();
        assert_eq!(
            tail(s.device(), 4),
            vec![
                SimEvent::StopStream,
                SimEvent::DestroyStream,
                SimEvent::EnableTx(false),
                SimEvent::Close,
            ]
        );
    }

    #[test]
    fn test_source_failure_ends_session() {
        let mut s = streaming(SimOptions::default(), &small_stream());
        let running = AtomicBool::new(true);
        let report = s.stream(&mut Broken, None, None, &running).unwrap();
        assert_eq!(report.reason, EndReason::SourceFailed);
        assert!(matches!(report.error, Some(Error::Io(_))));
        assert_eq!(report.chunks, 0);
    }

    #[test]
    fn test_calibration_failure_is_advisory() {
        let mut s = session(SimOptions {
            fail_calibration: true,
            ..Default::default()
        });
        assert!(s.configure(&rf(), None).is_ok());
        assert!(s.device().journal().contains(&SimEvent::Calibrate(20e6)));
    }

    #[test]
    fn test_setup_failure_still_tears_down() {
        let mut s = session(SimOptions::default());
        let mut bad = rf();
        bad.oversample = 0;
        assert!(s.configure(&bad, None).is_err());
        s.close().unwrap();
        assert_eq!(
            tail(s.device(), 2),
            vec![SimEvent::EnableTx(false), SimEvent::Close]
        );
        // No stream was created, so nothing to mute or stop
        assert!(!s
            .device()
            .journal()
            .iter()
            .any(|e| matches!(e, SimEvent::Send { .. } | SimEvent::StopStream)));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut s = streaming(SimOptions::default(), &small_stream());
        s.close().unwrap();
        let n = s.device().journal().len();
        s.close().unwrap();
        assert_eq!(s.device().journal().len(), n);
    }

    #[test]
    fn test_wrong_state_is_rejected() {
        let mut s = session(SimOptions::default());
        let running = AtomicBool::new(true);
        let mut src = ConstantDc::new(0.5).unwrap();
        assert!(s.stream(&mut src, None, None, &running).is_err());
        s.configure(&rf(), None).unwrap();
        s.start_stream(&small_stream()).unwrap();
        assert!(s.start_stream(&small_stream()).is_err());
        assert!(s.configure(&rf(), None).is_err());
    }

    #[test]
    fn test_ramp_and_sweep_run_inside_the_loop() {
        static RUNNING: AtomicBool = AtomicBool::new(true);
        let mut s = streaming(SimOptions::default(), &small_stream());
        let mut ramp = GainRamp::new(
            RampConfig {
                start_db: 0,
                target_db: 10,
                total_ms: 50,
                interval_ms: 10,
            },
            0,
        );
        ramp.apply_start(s.device_mut()).unwrap();
        let mut sweep = Sweep::new(
            SweepConfig {
                start_hz: 14e6,
                stop_hz: 16e6,
                step_hz: 1e6,
                dwell: Duration::from_millis(20),
                allow_upconvert: false,
            },
            0,
            30e6,
            40e6,
        )
        .unwrap();
        sweep.begin(s.device_mut()).unwrap();

        let mut src = Counted::new(usize::MAX, Fill::Last);
        src.sleep = Duration::from_millis(5);
        src.stop_after = Some((60, &RUNNING));
        let report = s
            .stream(&mut src, Some(&mut ramp), Some(&mut sweep), &RUNNING)
            .unwrap();
        assert_eq!(report.reason, EndReason::Cancelled);
        assert!(ramp.is_done());
        assert_eq!(s.device().gain_db(0).unwrap(), 10);
        let retunes = s
            .device()
            .journal()
            .iter()
            .filter(|e| matches!(e, SimEvent::Mixer(_)))
            .count();
        // One from configure, one from begin, several from the dwell timer
        assert!(retunes >= 4);
    }
}
