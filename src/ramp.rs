//! Host-timed TX gain ramp.
//!
//! The gain moves from a start value to a target in equal (fractional) steps,
//! one per interval, and only touches the control link when the rounded value
//! actually changes. Once the target is reached the ramp goes quiet for good.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::{clamp_gain, device::TxDevice, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RampConfig {
    pub start_db: i32,
    pub target_db: i32,
    /// Total ramp time, 0 disables ramping
    pub total_ms: u64,
    /// Time between steps
    pub interval_ms: u64,
}

pub struct GainRamp {
    channel: usize,
    start_db: i32,
    target_db: i32,
    interval: Duration,
    steps: u64,
    step_db: f64,
    accum_db: f64,
    applied_db: i32,
    next_tick: Option<Instant>,
}

impl GainRamp {
    pub fn new(config: RampConfig, channel: usize) -> Self {
        let start_db = clamp_gain(config.start_db);
        let target_db = clamp_gain(config.target_db);
        let interval_ms = config.interval_ms.max(1);
        let ramping = config.total_ms > 0 && start_db != target_db;
        let steps = if ramping {
            config.total_ms.div_ceil(interval_ms)
        } else {
            0
        };
        let step_db = if ramping {
            (target_db - start_db) as f64 / steps as f64
        } else {
            0.0
        };
        Self {
            channel,
            start_db,
            target_db,
            interval: Duration::from_millis(interval_ms),
            steps,
            step_db,
            accum_db: start_db as f64,
            applied_db: start_db,
            next_tick: None,
        }
    }

    pub fn is_ramping(&self) -> bool {
        self.steps > 0
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn step_db(&self) -> f64 {
        self.step_db
    }

    pub fn start_db(&self) -> i32 {
        self.start_db
    }

    pub fn target_db(&self) -> i32 {
        self.target_db
    }

    /// Last value the hardware accepted
    pub fn applied_db(&self) -> i32 {
        self.applied_db
    }

    /// No more gain changes will happen
    pub fn is_done(&self) -> bool {
        self.next_tick.is_none()
    }

    /// Set the starting gain; part of configuration, so a failure is fatal
    pub fn apply_start<D: TxDevice + ?Sized>(&mut self, device: &mut D) -> Result<()> {
        device.set_gain_db(self.channel, self.start_db as u32)?;
        self.applied_db = self.start_db;
        self.accum_db = self.start_db as f64;
        if let Ok(read) = device.gain_db(self.channel) {
            info!("set/get: TX gain = {} dB (read {} dB)", self.start_db, read);
        }
        Ok(())
    }

    /// Start the clock; the first step is due one interval from `now`
    pub fn arm(&mut self, now: Instant) {
        // An interval too long to represent never falls due
        self.next_tick = if self.is_ramping() && self.applied_db != self.target_db {
            now.checked_add(self.interval)
        } else {
            None
        };
        if self.is_ramping() {
            info!(
                "gain ramp {} -> {} dB in {} steps of {:.3} dB every {} ms",
                self.start_db,
                self.target_db,
                self.steps,
                self.step_db,
                self.interval.as_millis()
            );
        }
    }

    fn reached_target(&self) -> bool {
        if self.step_db >= 0.0 {
            self.applied_db >= self.target_db
        } else {
            self.applied_db <= self.target_db
        }
    }

    /// Next value to ask for: rounded, in range and never past the target
    fn wanted_db(&self) -> i32 {
        let g = clamp_gain(self.accum_db.round() as i32);
        if self.step_db >= 0.0 {
            g.min(self.target_db)
        } else {
            g.max(self.target_db)
        }
    }

    fn set<D: TxDevice + ?Sized>(&mut self, device: &mut D, db: i32) {
        match device.set_gain_db(self.channel, db as u32) {
            Ok(()) => {
                self.applied_db = db;
                match device.gain_db(self.channel) {
                    Ok(read) => debug!("ramp: set={} dB, get={} dB", db, read),
                    Err(e) => debug!("ramp: gain readback failed: {}", e),
                }
            }
            Err(e) => warn!("gain ramp set to {} dB failed: {}", db, e),
        }
    }

    /// Catch up on every step that fell due by `now`
    pub fn tick<D: TxDevice + ?Sized>(&mut self, device: &mut D, now: Instant) {
        let Some(mut next) = self.next_tick else {
            return;
        };
        if now < next {
            return;
        }
        while next <= now {
            self.accum_db += self.step_db;
            match next.checked_add(self.interval) {
                Some(n) => next = n,
                None => break,
            }
        }
        let wanted = self.wanted_db();
        if wanted != self.applied_db {
            debug!("ramp: setting gain to {} dB", wanted);
            self.set(device, wanted);
        }
        if self.reached_target() {
            if self.applied_db != self.target_db {
                self.set(device, self.target_db);
            }
            info!("gain ramp done at {} dB", self.applied_db);
            self.next_tick = None;
        } else {
            self.next_tick = Some(next);
        }
    }
}
