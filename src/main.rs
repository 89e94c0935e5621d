use std::{
    process::ExitCode,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use clap::Parser;
use lime_tx::{
    args::{convert_filter, Args, Backend, SourceCmd},
    device::{Mixer, StreamConfig, TxDevice},
    file_source::{RawSource, Scale, WavSource},
    ramp::{GainRamp, RampConfig},
    session::{log_correctors, RfConfig, TxSession},
    sim::{SimDevice, SimOptions},
    source::{ComplexTone, ConstantDc, MultiTone, Noise, SampleSource},
    sweep::{Sweep, SweepConfig},
    txtsp::ManualCorrectors,
    Result, CHANNEL,
};
use tracing::{error, info, warn};

/// Host rate when neither the command line nor the input says otherwise
const DEFAULT_HOST_HZ: f64 = 5e6;

/// Open or build the sample source, before any device is touched.
/// Returns the source and the host rate to run at.
fn open_source(cmd: &SourceCmd, host_hz: Option<f64>) -> Result<(Box<dyn SampleSource>, f64)> {
    let mut rate = host_hz.unwrap_or(DEFAULT_HOST_HZ);
    let source: Box<dyn SampleSource> = match cmd {
        SourceCmd::Dc { scale } => Box::new(ConstantDc::new(*scale)?),
        SourceCmd::Tones { offsets, amplitude } => {
            Box::new(MultiTone::new(offsets, *amplitude, rate)?)
        }
        SourceCmd::Ssb { bb_hz, amplitude } => {
            Box::new(ComplexTone::new(*bb_hz, *amplitude, rate)?)
        }
        SourceCmd::Noise { amplitude } => Box::new(Noise::new(*amplitude)?),
        SourceCmd::Wav {
            path,
            looping,
            scale,
        } => {
            let wav = WavSource::open(path, *looping, Scale::new(*scale)?)?;
            // The file's own rate wins unless one was given explicitly
            if host_hz.is_none() {
                rate = wav.sample_rate() as f64;
            }
            Box::new(wav)
        }
        SourceCmd::Raw {
            path,
            looping,
            scale,
        } => Box::new(RawSource::file(path, *looping, Scale::new(*scale)?)?),
        SourceCmd::Pipe { path, scale } => Box::new(RawSource::pipe(path, Scale::new(*scale)?)?),
    };
    Ok((source, rate))
}

fn open_device(args: &Args) -> Result<Box<dyn TxDevice>> {
    match args.device {
        Backend::Sim => Ok(Box::new(SimDevice::open(SimOptions {
            capture_dir: args.sim_capture.clone(),
            ..Default::default()
        })?)),
        #[cfg(feature = "soapy")]
        Backend::Soapy => Ok(Box::new(lime_tx::soapy::SoapyDevice::open(
            &args.device_args,
        )?)),
        #[cfg(not(feature = "soapy"))]
        Backend::Soapy => Err(lime_tx::Error::Config(
            "this build has no SoapySDR support (enable the `soapy` feature)".to_owned(),
        )),
    }
}

fn sweep_config(args: &Args) -> Option<SweepConfig> {
    Some(SweepConfig {
        start_hz: args.sweep_start?,
        stop_hz: args.sweep_stop?,
        step_hz: args.sweep_step?,
        dwell: Duration::from_millis(args.dwell_ms),
        allow_upconvert: args.sweep_allow_upconvert,
    })
}

fn manual_correctors(args: &Args) -> ManualCorrectors {
    ManualCorrectors {
        gain_i: args.set_gain_i,
        gain_q: args.set_gain_q,
        phase: args.set_phase,
        dc_i: args.set_dc_i,
        dc_q: args.set_dc_q,
    }
}

/// Single sideband offset below the mixer output, for the `ssb` source
fn ssb_offset_hz(cmd: &SourceCmd) -> f64 {
    match cmd {
        SourceCmd::Ssb { bb_hz, .. } => *bb_hz,
        _ => 0.0,
    }
}

fn run(args: &Args, running: &AtomicBool) -> Result<()> {
    let (mut source, host_hz) = open_source(&args.source, args.sample_rate)?;

    let sweep_cfg = sweep_config(args);
    let fixed_mixer = Mixer {
        freq_hz: args.nco,
        downconvert: !args.nco_upconvert,
    };
    let rf = RfConfig {
        channel: CHANNEL,
        reset: args.reset,
        host_sample_rate_hz: host_hz,
        oversample: args.oversample,
        lpf_bandwidth_hz: args.tx_lpf_bw,
        lo_hz: args.lo,
        mixer: sweep_cfg.is_none().then_some(fixed_mixer),
        calibration_bw_hz: args
            .calibrate
            .then(|| args.cal_bw.unwrap_or(args.tx_lpf_bw)),
        print_correctors: args.print_correctors,
    };
    let mut ramp = GainRamp::new(
        RampConfig {
            start_db: args.tx_gain_start.unwrap_or(args.tx_gain),
            target_db: args.tx_gain,
            total_ms: args.gain_ramp_ms,
            interval_ms: args.gain_ramp_interval_ms,
        },
        CHANNEL,
    );

    // From here on, every way out of this function tears the device down
    let mut session = TxSession::new(open_device(args)?);
    let rate = session.configure(&rf, Some(&mut ramp))?;

    let manual = manual_correctors(args);
    if !manual.is_empty() {
        manual.apply(session.device_mut(), CHANNEL)?;
        if args.print_correctors {
            log_correctors(session.device_mut(), CHANNEL);
        }
    }

    let mut sweep = match sweep_cfg {
        Some(cfg) => {
            let mut sweep = Sweep::new(cfg, CHANNEL, args.lo, rate.rf_hz)?;
            sweep.begin(session.device_mut())?;
            Some(sweep)
        }
        None => {
            info!(
                "TX {:.6} MHz (host={:.2} Msps, rf={:.2} Msps, {}convert)",
                fixed_mixer.rf_hz(args.lo) / 1e6,
                rate.host_hz / 1e6,
                rate.rf_hz / 1e6,
                fixed_mixer.direction()
            );
            None
        }
    };
    let ssb_hz = ssb_offset_hz(&args.source);
    if ssb_hz != 0.0 {
        match &sweep {
            Some(_) => info!(
                "single sideband tone {:.3} kHz below each sweep frequency",
                ssb_hz / 1e3
            ),
            None => info!(
                "RF result: LO {} NCO - f_bb = {:.6} MHz",
                if fixed_mixer.downconvert { '-' } else { '+' },
                (fixed_mixer.rf_hz(args.lo) - ssb_hz) / 1e6
            ),
        }
    }
    info!(
        "gain: start {} dB, target {} dB, ramp {} ms every {} ms",
        ramp.start_db(),
        ramp.target_db(),
        args.gain_ramp_ms,
        args.gain_ramp_interval_ms
    );

    session.start_stream(&StreamConfig {
        channel: CHANNEL,
        fifo_size: args.fifo_size,
        chunk_samples: args.chunk_samples,
        send_timeout: Duration::from_millis(args.send_timeout_ms),
    })?;
    info!("streaming (Ctrl+C to stop)");

    // Streaming failures end the session, not the process
    let report = session.stream(source.as_mut(), Some(&mut ramp), sweep.as_mut(), running)?;
    if let Some(e) = &report.error {
        warn!("session ended early: {}", e);
    }
    if let Err(e) = session.close() {
        warn!("teardown incomplete: {}", e);
    }
    info!("done");
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Fatal errors and everything else go to stderr
    tracing_subscriber::fmt()
        .with_max_level(convert_filter(args.verbose.log_level_filter()))
        .with_writer(std::io::stderr)
        .init();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || r.store(false, Ordering::SeqCst)) {
        error!("can't install the Ctrl-C handler: {}", e);
        return ExitCode::FAILURE;
    }

    match run(&args, &running) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
