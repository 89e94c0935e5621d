//! Sample sources backed by a file or a named pipe.
//!
//! Both formats carry interleaved 16-bit I/Q. Format problems are caught when
//! the source is opened, so a bad file never gets as far as the radio.

use std::{
    fs::{File, OpenOptions},
    io::{self, BufReader, Read, Seek, SeekFrom},
    path::Path,
    time::{Duration, Instant},
};

use byte_slice_cast::AsMutByteSlice;
use hound::{SampleFormat, WavReader};
use num_complex::Complex;
use tracing::{debug, info};

use crate::{
    source::{Fill, SampleSource},
    Error, IqSample, Result,
};

/// A single read that takes longer than this is worth mentioning
const SLOW_READ: Duration = Duration::from_millis(10);

/// Gain applied to file samples, saturating at the i16 limits
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scale(f64);

impl Scale {
    pub const MAX: f64 = 4.0;

    pub fn new(scale: f64) -> Result<Self> {
        if (0.0..=Self::MAX).contains(&scale) {
            Ok(Self(scale))
        } else {
            Err(Error::Config(format!(
                "scale must be within 0..={}, got {scale}",
                Self::MAX
            )))
        }
    }

    pub fn apply(self, v: i16) -> i16 {
        if self.0 == 1.0 {
            v
        } else {
            (v as f64 * self.0).clamp(i16::MIN as f64, i16::MAX as f64) as i16
        }
    }
}

impl Default for Scale {
    fn default() -> Self {
        Self(1.0)
    }
}

/// Zero the unfilled tail, and decide what the session should do next
fn finish(chunk: &mut [IqSample], filled: usize) -> Fill {
    if filled == 0 {
        Fill::Exhausted
    } else if filled < chunk.len() {
        chunk[filled..].fill(Complex::new(0, 0));
        Fill::Last
    } else {
        Fill::More
    }
}

/// Stereo 16-bit PCM WAV, left = I, right = Q
pub struct WavSource {
    reader: WavReader<BufReader<File>>,
    path: String,
    looping: bool,
    scale: Scale,
}

impl WavSource {
    pub fn open(path: impl AsRef<Path>, looping: bool, scale: Scale) -> Result<Self> {
        let path = path.as_ref();
        let reader = WavReader::open(path)?;
        let spec = reader.spec();
        if spec.sample_format != SampleFormat::Int {
            return Err(Error::Format(format!(
                "{}: need integer PCM, got {:?}",
                path.display(),
                spec.sample_format
            )));
        }
        if spec.channels != 2 || spec.bits_per_sample != 16 {
            return Err(Error::Format(format!(
                "{}: need stereo (2ch) 16-bit; got {} ch, {} bits",
                path.display(),
                spec.channels,
                spec.bits_per_sample
            )));
        }
        if reader.duration() == 0 {
            return Err(Error::Format(format!("{}: no audio data", path.display())));
        }
        info!(
            "WAV: {} Hz, {}-bit, {} ch, {} frames",
            spec.sample_rate,
            spec.bits_per_sample,
            spec.channels,
            reader.duration()
        );
        Ok(Self {
            reader,
            path: path.display().to_string(),
            looping,
            scale,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.reader.spec().sample_rate
    }

    /// Read frames until `out` is full or the data chunk ends
    fn read_frames(&mut self, out: &mut [IqSample]) -> Result<usize> {
        let scale = self.scale;
        let mut samples = self.reader.samples::<i16>();
        let mut n = 0;
        for slot in out.iter_mut() {
            let (Some(i), Some(q)) = (samples.next(), samples.next()) else {
                break;
            };
            *slot = Complex::new(scale.apply(i?), scale.apply(q?));
            n += 1;
        }
        Ok(n)
    }
}

impl SampleSource for WavSource {
    fn fill(&mut self, chunk: &mut [IqSample]) -> Result<Fill> {
        let mut filled = 0;
        let mut rewound = false;
        while filled < chunk.len() {
            let n = self.read_frames(&mut chunk[filled..])?;
            filled += n;
            if filled == chunk.len() || !self.looping {
                break;
            }
            if n == 0 && rewound {
                return Err(Error::Format(format!("{}: nothing to loop over", self.path)));
            }
            debug!("end of {}, rewinding", self.path);
            self.reader.seek(0)?;
            rewound = true;
        }
        Ok(finish(chunk, filled))
    }

    fn describe(&self) -> String {
        format!(
            "WAV {}{}",
            self.path,
            if self.looping { " (looping)" } else { "" }
        )
    }
}

/// Headerless little-endian i16 I/Q from a file, a FIFO, or anything readable
pub struct RawSource<R> {
    reader: R,
    label: String,
    scale: Scale,
    /// Staging area the bytes land in before they become samples
    staging: Vec<i16>,
    rewind: Option<fn(&mut R) -> io::Result<()>>,
}

impl<R: Read> RawSource<R> {
    pub fn new(reader: R, label: impl Into<String>, scale: Scale) -> Self {
        Self {
            reader,
            label: label.into(),
            scale,
            staging: Vec::new(),
            rewind: None,
        }
    }

    /// Fill `out` with as many whole I/Q pairs as the reader gives before EOF
    fn read_frames(&mut self, out: &mut [IqSample]) -> Result<usize> {
        let Self {
            reader,
            staging,
            label,
            scale,
            ..
        } = self;
        staging.resize(out.len() * 2, 0);
        let bytes = staging.as_mut_byte_slice();
        let mut got = 0;
        while got < bytes.len() {
            let start = Instant::now();
            match reader.read(&mut bytes[got..]) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            let blocked = start.elapsed();
            if blocked > SLOW_READ {
                debug!("read from {} blocked {:.3} s", label, blocked.as_secs_f64());
            }
        }
        // A trailing partial pair is dropped
        let frames = got / 4;
        for (slot, pair) in out.iter_mut().zip(staging.chunks_exact(2)).take(frames) {
            *slot = Complex::new(
                scale.apply(i16::from_le(pair[0])),
                scale.apply(i16::from_le(pair[1])),
            );
        }
        Ok(frames)
    }
}

impl<R: Read + Seek> RawSource<R> {
    /// Start over from the beginning instead of ending at EOF
    pub fn looping(mut self) -> Self {
        self.rewind = Some(|r: &mut R| r.seek(SeekFrom::Start(0)).map(|_| ()));
        self
    }
}

impl RawSource<File> {
    pub fn file(path: impl AsRef<Path>, looping: bool, scale: Scale) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        if looping && file.metadata()?.len() < 4 {
            return Err(Error::Format(format!(
                "{}: nothing to loop over",
                path.display()
            )));
        }
        let source = Self::new(file, path.display().to_string(), scale);
        Ok(if looping { source.looping() } else { source })
    }

    /// Opening blocks until the other end has a writer
    pub fn pipe(path: impl AsRef<Path>, scale: Scale) -> Result<Self> {
        let path = path.as_ref();
        info!(
            "opening FIFO {} for reading (blocking until a writer connects)",
            path.display()
        );
        let fifo = OpenOptions::new().read(true).open(path)?;
        info!("FIFO opened, streaming I/Q from it");
        Ok(Self::new(fifo, path.display().to_string(), scale))
    }
}

impl<R: Read> SampleSource for RawSource<R> {
    fn fill(&mut self, chunk: &mut [IqSample]) -> Result<Fill> {
        let mut filled = 0;
        let mut rewound = false;
        while filled < chunk.len() {
            let n = self.read_frames(&mut chunk[filled..])?;
            filled += n;
            if filled == chunk.len() {
                break;
            }
            let Some(rewind) = self.rewind else {
                break;
            };
            if n == 0 && rewound {
                return Err(Error::Format(format!("{}: nothing to loop over", self.label)));
            }
            debug!("end of {}, rewinding", self.label);
            rewind(&mut self.reader)?;
            rewound = true;
        }
        if filled < chunk.len() && self.rewind.is_none() {
            info!("{}: end of input", self.label);
        }
        Ok(finish(chunk, filled))
    }

    fn describe(&self) -> String {
        format!(
            "raw I/Q {}{}",
            self.label,
            if self.rewind.is_some() { " (looping)" } else { "" }
        )
    }
}
