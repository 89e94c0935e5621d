//! Argument parsing for running from the command line

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::InfoLevel;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Transmitter backend
    #[clap(long, value_enum, default_value_t = Backend::Sim)]
    pub device: Backend,
    /// Backend specific device selection (SoapySDR args string, e.g. "driver=lime")
    #[clap(long, default_value = "")]
    pub device_args: String,
    /// Host sample rate (defaults to the WAV rate, or 5M)
    #[clap(long, value_parser = parse_hz)]
    pub sample_rate: Option<f64>,
    /// RF side oversampling factor
    #[clap(long, default_value_t = 8)]
    #[clap(value_parser = clap::value_parser!(u32).range(1..))]
    pub oversample: u32,
    /// TX analog low-pass bandwidth
    #[clap(long, value_parser = parse_hz, default_value = "50M")]
    pub tx_lpf_bw: f64,
    /// Local oscillator frequency
    #[clap(long, value_parser = parse_hz, default_value = "30M")]
    pub lo: f64,
    /// NCO shift; RF = LO - NCO unless --nco-upconvert
    #[clap(long, value_parser = parse_hz, default_value = "15M")]
    pub nco: f64,
    /// RF = LO + NCO
    #[clap(long)]
    pub nco_upconvert: bool,
    /// Target TX gain in dB (0..73)
    #[clap(long, default_value_t = 40, allow_hyphen_values = true)]
    pub tx_gain: i32,
    /// Gain to start at when ramping (defaults to --tx-gain)
    #[clap(long, allow_hyphen_values = true)]
    pub tx_gain_start: Option<i32>,
    /// Ramp duration, 0 jumps straight to --tx-gain
    #[clap(long, default_value_t = 0)]
    pub gain_ramp_ms: u64,
    #[clap(long, default_value_t = 20)]
    pub gain_ramp_interval_ms: u64,
    /// Run the driver's TX calibration before streaming
    #[clap(long)]
    pub calibrate: bool,
    /// Calibration bandwidth (defaults to --tx-lpf-bw)
    #[clap(long, value_parser = parse_hz)]
    pub cal_bw: Option<f64>,
    /// Reset the chip to its defaults before configuring
    #[clap(long)]
    pub reset: bool,
    /// Driver FIFO depth in samples
    #[clap(long, default_value_t = crate::FIFO_SIZE)]
    pub fifo_size: usize,
    /// Samples per pushed chunk
    #[clap(long, default_value_t = crate::CHUNK_SAMPLES)]
    pub chunk_samples: usize,
    #[clap(long, default_value_t = crate::SEND_TIMEOUT_MS)]
    pub send_timeout_ms: u64,
    /// Log the TXTSP IQ corrector registers
    #[clap(long)]
    pub print_correctors: bool,
    /// GCORRI (0..2047)
    #[clap(long)]
    pub set_gain_i: Option<i32>,
    /// GCORRQ (0..2047)
    #[clap(long)]
    pub set_gain_q: Option<i32>,
    /// IQCORR (-2047..2047)
    #[clap(long, allow_hyphen_values = true)]
    pub set_phase: Option<i32>,
    /// DCCORRI (-128..127)
    #[clap(long, allow_hyphen_values = true)]
    pub set_dc_i: Option<i32>,
    /// DCCORRQ (-128..127)
    #[clap(long, allow_hyphen_values = true)]
    pub set_dc_q: Option<i32>,
    /// First frequency of a sweep; enables sweeping
    #[clap(long, value_parser = parse_hz, requires_all = &["sweep-stop", "sweep-step"])]
    pub sweep_start: Option<f64>,
    #[clap(long, value_parser = parse_hz, requires = "sweep-start")]
    pub sweep_stop: Option<f64>,
    #[clap(long, value_parser = parse_hz, requires = "sweep-start")]
    pub sweep_step: Option<f64>,
    /// Time spent on each sweep frequency
    #[clap(long, default_value_t = 1000)]
    pub dwell_ms: u64,
    /// Let the sweep reach above the LO
    #[clap(long)]
    pub sweep_allow_upconvert: bool,
    /// Directory to dump everything the simulated device transmits into
    #[clap(long)]
    pub sim_capture: Option<PathBuf>,
    #[clap(subcommand)]
    pub source: SourceCmd,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<InfoLevel>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    /// In-memory transmitter, nothing goes on air
    Sim,
    /// SoapySDR device (build with --features soapy)
    Soapy,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum SourceCmd {
    /// Constant I, zero Q: a single carrier at the mixer output
    Dc {
        /// Fraction of full scale
        #[clap(long, default_value_t = 0.7)]
        scale: f64,
    },
    /// Sum of sine tones at baseband offsets
    Tones {
        /// Tone offset, repeat for more tones (e.g. --tone=50k --tone=-50k)
        #[clap(long = "tone", value_parser = parse_hz, allow_hyphen_values = true, required = true)]
        offsets: Vec<f64>,
        /// Fraction of full scale shared by all tones
        #[clap(long, default_value_t = 0.7)]
        amplitude: f64,
    },
    /// One complex tone (I = sin, Q = cos), a single sideband at LO ± NCO - bb
    Ssb {
        /// Baseband tone frequency
        #[clap(long = "bb-hz", value_parser = parse_hz, allow_hyphen_values = true)]
        bb_hz: f64,
        #[clap(long, default_value_t = 0.7)]
        amplitude: f64,
    },
    /// Uniform noise on I and Q
    Noise {
        #[clap(long, default_value_t = 0.5)]
        amplitude: f64,
    },
    /// 16-bit stereo PCM WAV file (left = I, right = Q)
    Wav {
        path: PathBuf,
        /// Start over at the end of the file
        #[clap(long = "loop")]
        looping: bool,
        /// Sample multiplier (0..4)
        #[clap(long, default_value_t = 1.0)]
        scale: f64,
    },
    /// Raw little-endian interleaved i16 I/Q file
    Raw {
        path: PathBuf,
        #[clap(long = "loop")]
        looping: bool,
        #[clap(long, default_value_t = 1.0)]
        scale: f64,
    },
    /// Named pipe carrying raw i16 I/Q
    Pipe {
        path: PathBuf,
        #[clap(long, default_value_t = 1.0)]
        scale: f64,
    },
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}

/// Frequency with an optional k/M/G suffix: "30M", "2.5k", "15e6", "-50k"
pub fn parse_hz(s: &str) -> Result<f64, String> {
    let t = s.trim();
    let (num, mul) = match t.chars().last() {
        Some('k' | 'K') => (&t[..t.len() - 1], 1e3),
        Some('m' | 'M') => (&t[..t.len() - 1], 1e6),
        Some('g' | 'G') => (&t[..t.len() - 1], 1e9),
        _ => (t, 1.0),
    };
    match num.trim_end().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v * mul),
        _ => Err(format!("invalid frequency '{s}' (try 30M, 2.5k or 15e6)")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_hz() {
        assert_eq!(parse_hz("30M"), Ok(30e6));
        assert_eq!(parse_hz("2.5k"), Ok(2500.0));
        assert_eq!(parse_hz("1G"), Ok(1e9));
        assert_eq!(parse_hz("15e6"), Ok(15e6));
        assert_eq!(parse_hz(" 10 m "), Ok(10e6));
        assert_eq!(parse_hz("-50k"), Ok(-50e3));
        assert!(parse_hz("").is_err());
        assert!(parse_hz("M").is_err());
        assert!(parse_hz("12x").is_err());
        assert!(parse_hz("inf").is_err());
    }

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["lime_tx", "dc"]).unwrap();
        assert_eq!(args.device, Backend::Sim);
        assert_eq!(args.lo, 30e6);
        assert_eq!(args.nco, 15e6);
        assert_eq!(args.tx_lpf_bw, 50e6);
        assert_eq!(args.oversample, 8);
        assert_eq!(args.tx_gain, 40);
        assert_eq!(args.gain_ramp_interval_ms, 20);
        assert_eq!(args.fifo_size, 1 << 17);
        assert_eq!(args.chunk_samples, 8192);
        assert_eq!(args.send_timeout_ms, 1000);
        assert_eq!(args.source, SourceCmd::Dc { scale: 0.7 });
        assert!(args.sweep_start.is_none());
    }

    #[test]
    fn test_full_command_line() {
        let args = Args::try_parse_from([
            "lime_tx",
            "--lo",
            "30M",
            "--nco",
            "10M",
            "--tx-gain",
            "50",
            "--tx-gain-start",
            "0",
            "--gain-ramp-ms",
            "2000",
            "--set-phase",
            "-12",
            "--sweep-start",
            "10M",
            "--sweep-stop",
            "30M",
            "--sweep-step",
            "1M",
            "tones",
            "--tone=50k",
            "--tone=-50k",
        ])
        .unwrap();
        assert_eq!(args.nco, 10e6);
        assert_eq!(args.tx_gain_start, Some(0));
        assert_eq!(args.gain_ramp_ms, 2000);
        assert_eq!(args.set_phase, Some(-12));
        assert_eq!(args.sweep_stop, Some(30e6));
        assert_eq!(
            args.source,
            SourceCmd::Tones {
                offsets: vec![50e3, -50e3],
                amplitude: 0.7
            }
        );
    }

    #[test]
    fn test_ssb_tone() {
        let args = Args::try_parse_from(["lime_tx", "ssb", "--bb-hz", "100k"]).unwrap();
        assert_eq!(
            args.source,
            SourceCmd::Ssb {
                bb_hz: 100e3,
                amplitude: 0.7
            }
        );
        assert!(Args::try_parse_from(["lime_tx", "ssb"]).is_err());
    }

    #[test]
    fn test_wav_loop_flag() {
        let args = Args::try_parse_from(["lime_tx", "wav", "--loop", "in.wav"]).unwrap();
        assert_eq!(
            args.source,
            SourceCmd::Wav {
                path: PathBuf::from("in.wav"),
                looping: true,
                scale: 1.0
            }
        );
    }

    #[test]
    fn test_partial_sweep_is_rejected() {
        assert!(Args::try_parse_from(["lime_tx", "--sweep-start", "10M", "dc"]).is_err());
        assert!(Args::try_parse_from(["lime_tx", "--sweep-step", "1M", "dc"]).is_err());
    }

    #[test]
    fn test_source_is_required() {
        assert!(Args::try_parse_from(["lime_tx"]).is_err());
    }
}
