//! Stepped frequency sweep around a fixed LO.
//!
//! Only the mixer is retuned: the LO stays put and every dwell the NCO is
//! moved so DC baseband lands on the next frequency of the range.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::{device::Mixer, device::TxDevice, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepConfig {
    pub start_hz: f64,
    pub stop_hz: f64,
    pub step_hz: f64,
    /// Time spent on each frequency
    pub dwell: Duration,
    /// Also reach frequencies above the LO (RF = LO + NCO)
    pub allow_upconvert: bool,
}

/// Why a target frequency can't be reached
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutOfRange {
    /// Mixer would have to shift further than the NCO can go
    MixerLimit { mixer_hz: f64, limit_hz: f64 },
    /// Target is above the LO, but the sweep is pinned to RF = LO - NCO
    NeedsUpconvert { mixer_hz: f64 },
}

impl std::fmt::Display for OutOfRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutOfRange::MixerLimit { mixer_hz, limit_hz } => write!(
                f,
                "required NCO={:.3} MHz exceeds limit {:.3} MHz",
                mixer_hz / 1e6,
                limit_hz / 1e6
            ),
            OutOfRange::NeedsUpconvert { mixer_hz } => write!(
                f,
                "needs NCO={:.3} MHz upconvert, sweep is downconvert only",
                mixer_hz / 1e6
            ),
        }
    }
}

pub struct Sweep {
    config: SweepConfig,
    channel: usize,
    lo_hz: f64,
    limit_hz: f64,
    /// Position of the frequency on air within the pass
    current: usize,
    next_retune: Option<Instant>,
}

impl Sweep {
    pub fn new(
        config: SweepConfig,
        channel: usize,
        lo_hz: f64,
        rf_sample_rate_hz: f64,
    ) -> Result<Self> {
        if !(config.step_hz > 0.0) {
            return Err(Error::Config(format!(
                "sweep step must be positive, got {} Hz",
                config.step_hz
            )));
        }
        if config.start_hz > config.stop_hz {
            return Err(Error::Config(format!(
                "sweep start {} Hz is above stop {} Hz",
                config.start_hz, config.stop_hz
            )));
        }
        if config.dwell.is_zero() {
            return Err(Error::Config("sweep dwell must be positive".to_owned()));
        }
        Ok(Self {
            config,
            channel,
            lo_hz,
            limit_hz: rf_sample_rate_hz / 2.0,
            current: 0,
            next_retune: None,
        })
    }

    /// Frequency currently on air
    pub fn current_hz(&self) -> f64 {
        self.freq_at(self.current)
    }

    /// Number of frequencies in one pass
    pub fn pass_len(&self) -> usize {
        // Slack so a stop that is a whole number of steps away stays in
        let steps = (self.config.stop_hz - self.config.start_hz) / self.config.step_hz;
        (steps + 1e-9).floor() as usize + 1
    }

    /// Frequency `index` steps into the pass
    pub fn freq_at(&self, index: usize) -> f64 {
        self.config.start_hz + index as f64 * self.config.step_hz
    }

    /// Mixer setting for `target_hz`, if the hardware can get there
    pub fn plan(&self, target_hz: f64) -> std::result::Result<Mixer, OutOfRange> {
        let mixer = Mixer::for_target(self.lo_hz, target_hz);
        if !mixer.downconvert && !self.config.allow_upconvert {
            return Err(OutOfRange::NeedsUpconvert {
                mixer_hz: mixer.freq_hz,
            });
        }
        if mixer.freq_hz > self.limit_hz {
            return Err(OutOfRange::MixerLimit {
                mixer_hz: mixer.freq_hz,
                limit_hz: self.limit_hz,
            });
        }
        Ok(mixer)
    }

    fn following(&self, index: usize) -> usize {
        (index + 1) % self.pass_len()
    }

    /// Walk from `from` (inclusive) to the first reachable index, at most one pass
    fn first_reachable(&self, from: usize) -> Option<(usize, Mixer)> {
        let mut index = from;
        for _ in 0..self.pass_len() {
            let hz = self.freq_at(index);
            match self.plan(hz) {
                Ok(mixer) => return Some((index, mixer)),
                Err(why) => warn!("skip {:.3} MHz: {}", hz / 1e6, why),
            }
            index = self.following(index);
        }
        None
    }

    fn program<D: TxDevice + ?Sized>(
        &mut self,
        device: &mut D,
        index: usize,
        mixer: Mixer,
    ) -> Result<()> {
        device.set_mixer(self.channel, mixer)?;
        self.current = index;
        let hz = self.freq_at(index);
        info!(
            "TX @ {:.3} MHz (NCO={:.3} MHz, {}convert)",
            hz / 1e6,
            mixer.freq_hz / 1e6,
            mixer.direction()
        );
        Ok(())
    }

    /// Tune to the first reachable frequency; no reachable frequency is a setup error
    pub fn begin<D: TxDevice + ?Sized>(&mut self, device: &mut D) -> Result<()> {
        let (index, mixer) = self.first_reachable(0).ok_or_else(|| {
            Error::Config(format!(
                "no frequency in {:.3}..{:.3} MHz is reachable from LO {:.3} MHz",
                self.config.start_hz / 1e6,
                self.config.stop_hz / 1e6,
                self.lo_hz / 1e6
            ))
        })?;
        info!(
            "sweeping {:.3} -> {:.3} MHz, step {:.3} kHz, dwell {} ms",
            self.config.start_hz / 1e6,
            self.config.stop_hz / 1e6,
            self.config.step_hz / 1e3,
            self.config.dwell.as_millis()
        );
        self.program(device, index, mixer)
    }

    /// Start timing the first dwell
    pub fn arm(&mut self, now: Instant) {
        self.next_retune = Some(now + self.config.dwell);
    }

    /// Move to the next frequency once the dwell is over; returns the new one
    pub fn tick<D: TxDevice + ?Sized>(
        &mut self,
        device: &mut D,
        now: Instant,
    ) -> Result<Option<f64>> {
        match self.next_retune {
            Some(due) if now >= due => {}
            _ => return Ok(None),
        }
        self.next_retune = Some(now + self.config.dwell);
        let from = self.following(self.current);
        match self.first_reachable(from) {
            Some((index, mixer)) => {
                self.program(device, index, mixer)?;
                Ok(Some(self.freq_at(index)))
            }
            None => Ok(None),
        }
    }
}
