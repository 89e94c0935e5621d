//! Manual access to the TX signal processor's IQ correctors.
//!
//! The corrector registers are shared by both channels; the MAC field of
//! register 0x0020 selects which channel a read or write lands on.

use tracing::info;

use crate::{device::TxDevice, Result};

pub const REG_MAC: u16 = 0x0020;
pub const REG_GCORRQ: u16 = 0x0201;
pub const REG_GCORRI: u16 = 0x0202;
pub const REG_IQCORR: u16 = 0x0203;
pub const REG_DCCORR: u16 = 0x0204;
pub const REG_BYPASS: u16 = 0x0208;

const GAIN_MASK: u16 = 0x07FF;
const PHASE_MASK: u16 = 0x0FFF;
const PH_BYP: u16 = 1 << 0;
const GC_BYP: u16 = 1 << 1;
const DC_BYP: u16 = 1 << 3;

pub const GAIN_MAX: u16 = 2047;
pub const PHASE_LIMIT: i16 = 2047;

fn select_channel<D: TxDevice + ?Sized>(device: &mut D, channel: usize) -> Result<()> {
    let mac = device.read_register(REG_MAC)?;
    let sel = if channel == 0 { 0x1 } else { 0x2 };
    device.write_register(REG_MAC, (mac & !0x3) | sel)
}

/// 12 bit two's complement field to i16
fn sign_extend_12(raw: u16) -> i16 {
    (((raw & PHASE_MASK) << 4) as i16) >> 4
}

fn channel_name(channel: usize) -> char {
    if channel == 0 {
        'A'
    } else {
        'B'
    }
}

/// Current corrector values of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxCorrectors {
    pub gain_i: u16,
    pub gain_q: u16,
    pub phase: i16,
    pub dc_i: i8,
    pub dc_q: i8,
    pub bypass: u16,
}

impl TxCorrectors {
    pub fn read<D: TxDevice + ?Sized>(device: &mut D, channel: usize) -> Result<Self> {
        select_channel(device, channel)?;
        let gain_q = device.read_register(REG_GCORRQ)? & GAIN_MASK;
        let gain_i = device.read_register(REG_GCORRI)? & GAIN_MASK;
        let phase = sign_extend_12(device.read_register(REG_IQCORR)?);
        let dc = device.read_register(REG_DCCORR)?;
        let bypass = device.read_register(REG_BYPASS)?;
        Ok(Self {
            gain_i,
            gain_q,
            phase,
            dc_i: (dc >> 8) as u8 as i8,
            dc_q: (dc & 0xFF) as u8 as i8,
            bypass,
        })
    }

    /// Linear I gain, 2048 is unity
    pub fn gain_i_linear(&self) -> f64 {
        self.gain_i as f64 / 2048.0
    }

    pub fn gain_q_linear(&self) -> f64 {
        self.gain_q as f64 / 2048.0
    }

    /// IQCORR is tan(alpha/2) in units of 1/2048
    pub fn phase_deg(&self) -> f64 {
        (2.0 * (self.phase as f64 / 2048.0).atan()).to_degrees()
    }

    /// DC offsets as a fraction of full scale
    pub fn dc_fs(&self) -> (f64, f64) {
        (self.dc_i as f64 / 128.0, self.dc_q as f64 / 128.0)
    }

    pub fn phase_bypassed(&self) -> bool {
        self.bypass & PH_BYP != 0
    }

    pub fn gain_bypassed(&self) -> bool {
        self.bypass & GC_BYP != 0
    }

    pub fn dc_bypassed(&self) -> bool {
        self.bypass & DC_BYP != 0
    }

    pub fn log(&self, channel: usize) {
        let flag = |b: bool| if b { " [BYPASSED]" } else { "" };
        let (gi, gq) = (self.gain_i_linear(), self.gain_q_linear());
        let (dci, dcq) = self.dc_fs();
        info!("TXTSP correctors (CH {}):", channel_name(channel));
        info!(
            "  gain: GCORRI={:4} ({:.6}, {:+6.2} dB){}, GCORRQ={:4} ({:.6}, {:+6.2} dB){}",
            self.gain_i,
            gi,
            to_db(gi),
            flag(self.gain_bypassed()),
            self.gain_q,
            gq,
            to_db(gq),
            flag(self.gain_bypassed())
        );
        info!(
            "  phase: IQCORR={:5} -> {:+8.4} deg{}",
            self.phase,
            self.phase_deg(),
            flag(self.phase_bypassed())
        );
        info!(
            "  dc: DCCORRI={:4} ({:.5} FS){}, DCCORRQ={:4} ({:.5} FS){}",
            self.dc_i,
            dci,
            flag(self.dc_bypassed()),
            self.dc_q,
            dcq,
            flag(self.dc_bypassed())
        );
    }
}

fn to_db(linear: f64) -> f64 {
    20.0 * linear.max(1e-9).log10()
}

/// Corrector values to force; `None` leaves a field alone
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManualCorrectors {
    pub gain_i: Option<i32>,
    pub gain_q: Option<i32>,
    pub phase: Option<i32>,
    pub dc_i: Option<i32>,
    pub dc_q: Option<i32>,
}

impl ManualCorrectors {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Write the given fields (clamped), then take the correctors out of bypass
    pub fn apply<D: TxDevice + ?Sized>(&self, device: &mut D, channel: usize) -> Result<()> {
        select_channel(device, channel)?;
        if let Some(gi) = self.gain_i {
            device.write_register(REG_GCORRI, gi.clamp(0, GAIN_MAX as i32) as u16)?;
        }
        if let Some(gq) = self.gain_q {
            device.write_register(REG_GCORRQ, gq.clamp(0, GAIN_MAX as i32) as u16)?;
        }
        if let Some(phase) = self.phase {
            let limit = PHASE_LIMIT as i32;
            let phase = phase.clamp(-limit, limit) as i16;
            device.write_register(REG_IQCORR, phase as u16 & PHASE_MASK)?;
        }
        if self.dc_i.is_some() || self.dc_q.is_some() {
            let mut dc = device.read_register(REG_DCCORR)?;
            if let Some(i) = self.dc_i {
                let i = i.clamp(i8::MIN as i32, i8::MAX as i32) as i8 as u8;
                dc = (dc & 0x00FF) | ((i as u16) << 8);
            }
            if let Some(q) = self.dc_q {
                let q = q.clamp(i8::MIN as i32, i8::MAX as i32) as i8 as u8;
                dc = (dc & 0xFF00) | q as u16;
            }
            device.write_register(REG_DCCORR, dc)?;
        }
        let bypass = device.read_register(REG_BYPASS)?;
        device.write_register(REG_BYPASS, bypass & !(PH_BYP | GC_BYP | DC_BYP))?;
        info!("TXTSP {}: manual correctors applied", channel_name(channel));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDevice, SimOptions};

    fn sim() -> SimDevice {
        SimDevice::open(SimOptions::default()).unwrap()
    }

    #[test]
    fn test_sign_extend() {
        assert_eq!(sign_extend_12(0x07FF), 2047);
        assert_eq!(sign_extend_12(0x0801), -2047);
        assert_eq!(sign_extend_12(0x0FFF), -1);
        assert_eq!(sign_extend_12(0xF000), 0);
    }

    #[test]
    fn test_apply_then_read_back() {
        let mut dev = sim();
        dev.write_register(REG_BYPASS, 0x00FF).unwrap();
        let manual = ManualCorrectors {
            gain_i: Some(2000),
            gain_q: Some(1900),
            phase: Some(-100),
            dc_i: Some(-5),
            dc_q: Some(7),
        };
        manual.apply(&mut dev, 0).unwrap();
        let read = TxCorrectors::read(&mut dev, 0).unwrap();
        assert_eq!(read.gain_i, 2000);
        assert_eq!(read.gain_q, 1900);
        assert_eq!(read.phase, -100);
        assert_eq!(read.dc_i, -5);
        assert_eq!(read.dc_q, 7);
        assert_eq!(read.bypass, 0x00F4);
    }

    #[test]
    fn test_values_are_clamped() {
        let mut dev = sim();
        ManualCorrectors {
            gain_i: Some(5000),
            gain_q: Some(-3),
            phase: Some(-9000),
            dc_i: Some(300),
            dc_q: Some(-300),
        }
        .apply(&mut dev, 1)
        .unwrap();
        let read = TxCorrectors::read(&mut dev, 1).unwrap();
        assert_eq!(read.gain_i, 2047);
        assert_eq!(read.gain_q, 0);
        assert_eq!(read.phase, -2047);
        assert_eq!(read.dc_i, 127);
        assert_eq!(read.dc_q, -128);
    }

    #[test]
    fn test_single_dc_field_keeps_the_other() {
        let mut dev = sim();
        dev.write_register(REG_DCCORR, 0x12_34).unwrap();
        ManualCorrectors {
            dc_q: Some(-1),
            ..Default::default()
        }
        .apply(&mut dev, 0)
        .unwrap();
        assert_eq!(dev.read_register(REG_DCCORR).unwrap(), 0x12_FF);
    }

    #[test]
    fn test_mac_selects_channel() {
        let mut dev = sim();
        dev.write_register(REG_MAC, 0xFF00).unwrap();
        TxCorrectors::read(&mut dev, 0).unwrap();
        assert_eq!(dev.read_register(REG_MAC).unwrap(), 0xFF01);
        TxCorrectors::read(&mut dev, 1).unwrap();
        assert_eq!(dev.read_register(REG_MAC).unwrap(), 0xFF02);
    }

    #[test]
    fn test_derived_units() {
        let c = TxCorrectors {
            gain_i: 2048,
            gain_q: 1024,
            phase: 2048,
            dc_i: -64,
            dc_q: 32,
            bypass: GC_BYP | DC_BYP,
        };
        assert_eq!(c.gain_i_linear(), 1.0);
        assert!((to_db(c.gain_q_linear()) + 6.0206).abs() < 1e-3);
        // tan(alpha/2) = 1
        assert!((c.phase_deg() - 90.0).abs() < 1e-9);
        assert_eq!(c.dc_fs(), (-0.5, 0.25));
        assert!(c.gain_bypassed());
        assert!(c.dc_bypassed());
        assert!(!c.phase_bypassed());
        assert!(to_db(0.0).is_finite());
    }

    #[test]
    fn test_empty() {
        assert!(ManualCorrectors::default().is_empty());
        assert!(!ManualCorrectors {
            phase: Some(0),
            ..Default::default()
        }
        .is_empty());
    }
}
