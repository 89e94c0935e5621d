//! Synthesized sample sources.
//!
//! A source fills the session's chunk buffer in place, one chunk per loop
//! iteration. The file and pipe sources live in [`crate::file_source`].

use std::f64::consts::TAU;

use num_complex::Complex;

use tracing::warn;

use crate::{to_i16, Error, IqSample, Result};

/// What a source managed to put in the chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// The chunk is full and there is more where that came from
    More,
    /// The chunk is full (zero padded) and it is the final one
    Last,
    /// Nothing was written, the input is done
    Exhausted,
}

pub trait SampleSource {
    /// Overwrite every entry of `chunk`
    fn fill(&mut self, chunk: &mut [IqSample]) -> Result<Fill>;

    fn describe(&self) -> String;
}

fn check_fraction(name: &str, value: f64) -> Result<()> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(Error::Config(format!("{name} must be in (0, 1], got {value}")))
    }
}

/// Constant I, zero Q. The mixer turns this into a carrier at LO ± NCO.
pub struct ConstantDc {
    value: IqSample,
}

impl ConstantDc {
    pub fn new(scale: f64) -> Result<Self> {
        check_fraction("scale", scale)?;
        Ok(Self {
            value: Complex::new(to_i16(scale), 0),
        })
    }

    pub fn value(&self) -> IqSample {
        self.value
    }
}

impl SampleSource for ConstantDc {
    fn fill(&mut self, chunk: &mut [IqSample]) -> Result<Fill> {
        chunk.fill(self.value);
        Ok(Fill::More)
    }

    fn describe(&self) -> String {
        format!("constant DC, I={} Q={}", self.value.re, self.value.im)
    }
}

struct Tone {
    offset_hz: f64,
    phase: f64,
    step: f64,
}

/// Sum of real sine tones at baseband offsets (a two-tone test is `[+d, -d]`)
pub struct MultiTone {
    tones: Vec<Tone>,
    /// Amplitude per tone, so the sum never leaves full scale
    tone_amp: f64,
}

impl MultiTone {
    pub fn new(offsets_hz: &[f64], amplitude: f64, sample_rate_hz: f64) -> Result<Self> {
        check_fraction("amplitude", amplitude)?;
        if offsets_hz.is_empty() {
            return Err(Error::Config("need at least one tone".to_owned()));
        }
        if sample_rate_hz <= 0.0 {
            return Err(Error::Config(format!(
                "sample rate must be positive, got {sample_rate_hz}"
            )));
        }
        let nyquist = sample_rate_hz / 2.0;
        let tones = offsets_hz
            .iter()
            .map(|&offset_hz| {
                if offset_hz.abs() >= nyquist {
                    return Err(Error::Config(format!(
                        "tone at {offset_hz} Hz is not below half the sample rate ({nyquist} Hz)"
                    )));
                }
                Ok(Tone {
                    offset_hz,
                    phase: 0.0,
                    step: TAU * offset_hz / sample_rate_hz,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            tone_amp: amplitude / tones.len() as f64,
            tones,
        })
    }
}

impl SampleSource for MultiTone {
    fn fill(&mut self, chunk: &mut [IqSample]) -> Result<Fill> {
        for sample in chunk.iter_mut() {
            let mut acc = 0.0;
            for tone in self.tones.iter_mut() {
                acc += self.tone_amp * tone.phase.sin();
                tone.phase = (tone.phase + tone.step).rem_euclid(TAU);
            }
            *sample = Complex::new(to_i16(acc), 0);
        }
        Ok(Fill::More)
    }

    fn describe(&self) -> String {
        let offsets: Vec<String> = self
            .tones
            .iter()
            .map(|t| format!("{:+.0} Hz", t.offset_hz))
            .collect();
        format!(
            "{} tone(s) at {}, {:.2} FS each",
            self.tones.len(),
            offsets.join(", "),
            self.tone_amp
        )
    }
}

/// Single complex tone with I = A·sin φ and Q = A·cos φ.
///
/// That pair rotates the negative way, so after the mixer the one sideband
/// lands at LO ± NCO - `bb_hz`.
pub struct ComplexTone {
    bb_hz: f64,
    amplitude: f64,
    phase: f64,
    step: f64,
}

impl ComplexTone {
    pub fn new(bb_hz: f64, amplitude: f64, sample_rate_hz: f64) -> Result<Self> {
        check_fraction("amplitude", amplitude)?;
        if sample_rate_hz <= 0.0 {
            return Err(Error::Config(format!(
                "sample rate must be positive, got {sample_rate_hz}"
            )));
        }
        if !bb_hz.is_finite() || bb_hz.abs() >= sample_rate_hz / 2.0 {
            return Err(Error::Config(format!(
                "baseband tone at {bb_hz} Hz is not below half the sample rate ({} Hz)",
                sample_rate_hz / 2.0
            )));
        }
        if bb_hz <= 0.0 {
            warn!("baseband tone at {} Hz, expected a positive frequency", bb_hz);
        }
        Ok(Self {
            bb_hz,
            amplitude,
            phase: 0.0,
            step: TAU * bb_hz / sample_rate_hz,
        })
    }

    pub fn bb_hz(&self) -> f64 {
        self.bb_hz
    }

    /// Where the tone ends up for a mixer output centred on `center_hz`
    pub fn rf_hz(&self, center_hz: f64) -> f64 {
        center_hz - self.bb_hz
    }
}

impl SampleSource for ComplexTone {
    fn fill(&mut self, chunk: &mut [IqSample]) -> Result<Fill> {
        for sample in chunk.iter_mut() {
            let (sin, cos) = self.phase.sin_cos();
            *sample = Complex::new(to_i16(self.amplitude * sin), to_i16(self.amplitude * cos));
            self.phase = (self.phase + self.step).rem_euclid(TAU);
        }
        Ok(Fill::More)
    }

    fn describe(&self) -> String {
        format!(
            "complex tone (I=sin, Q=cos) at {:.3} Hz, {:.2} FS",
            self.bb_hz, self.amplitude
        )
    }
}

fn xorshift32(mut x: u32) -> u32 {
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    x
}

/// Uniform noise on I and Q from two independent xorshift32 generators
pub struct Noise {
    amplitude: f64,
    state_i: u32,
    state_q: u32,
}

impl Noise {
    pub const SEED_I: u32 = 0x1234_5678;
    pub const SEED_Q: u32 = 0x8765_4321;

    pub fn new(amplitude: f64) -> Result<Self> {
        check_fraction("amplitude", amplitude)?;
        Ok(Self {
            amplitude,
            state_i: Self::SEED_I,
            state_q: Self::SEED_Q,
        })
    }

    fn uniform(state: u32) -> f64 {
        ((state & 0xFFFF) as i32 - 32768) as f64 / 32768.0
    }
}

impl SampleSource for Noise {
    fn fill(&mut self, chunk: &mut [IqSample]) -> Result<Fill> {
        for sample in chunk.iter_mut() {
            self.state_i = xorshift32(self.state_i);
            self.state_q = xorshift32(self.state_q);
            *sample = Complex::new(
                to_i16(self.amplitude * Self::uniform(self.state_i)),
                to_i16(self.amplitude * Self::uniform(self.state_q)),
            );
        }
        Ok(Fill::More)
    }

    fn describe(&self) -> String {
        format!("xorshift noise, {:.2} FS", self.amplitude)
    }
}
