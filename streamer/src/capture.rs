//! WAV copy of the audio a session sends.
//!
//! Samples are written after gain, so the file holds exactly what the
//! receiver was given.

use hound::{SampleFormat, WavSpec, WavWriter};
use raop_common::pcm::{RAOP_CHANNELS, RAOP_SAMPLE_RATE};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

use crate::error::{Result, SessionError};

/// Attempts at a free file name before giving up.
const MAX_NAME_ATTEMPTS: u32 = 100;

/// An open capture file.
pub struct CaptureSink {
    // ---
    writer: WavWriter<BufWriter<File>>,
    path: PathBuf,
    frames: u64,
}

impl CaptureSink {
    // ---
    /// Creates `raop-capture-<unix ms>.wav` in `dir`, creating `dir` first.
    ///
    /// Never overwrites: a taken name gets a numeric suffix.
    pub fn create(dir: &Path) -> Result<Self> {
        // ---
        let failed = |what: &str, e: &dyn std::fmt::Display| {
            SessionError::CaptureFailed(format!("{} {}: {}", what, dir.display(), e))
        };
        fs::create_dir_all(dir).map_err(|e| failed("cannot create", &e))?;

        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = match attempt {
                0 => format!("raop-capture-{stamp}.wav"),
                n => format!("raop-capture-{stamp}-{n}.wav"),
            };
            let path = dir.join(name);

            let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(failed("cannot write in", &e)),
            };

            let writer = WavWriter::new(BufWriter::new(file), wav_spec())
                .map_err(|e| failed("cannot start WAV in", &e))?;
            info!("Capturing audio to {}", path.display());
            return Ok(Self {
                writer,
                path,
                frames: 0,
            });
        }

        Err(SessionError::CaptureFailed(format!(
            "no free capture file name in {}",
            dir.display()
        )))
    }

    /// Appends interleaved stereo samples.
    pub fn write(&mut self, pcm: &[i16]) -> hound::Result<()> {
        // ---
        for &sample in pcm {
            self.writer.write_sample(sample)?;
        }
        self.frames += (pcm.len() / RAOP_CHANNELS as usize) as u64;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Fixes up the WAV header and closes the file.
    pub fn finish(self) -> Result<PathBuf> {
        // ---
        let Self {
            writer,
            path,
            frames,
        } = self;
        writer.finalize().map_err(|e| {
            SessionError::CaptureFailed(format!("cannot finish {}: {}", path.display(), e))
        })?;

        info!("Captured {} frames to {}", frames, path.display());
        Ok(path)
    }
}

fn wav_spec() -> WavSpec {
    WavSpec {
        channels: RAOP_CHANNELS,
        sample_rate: RAOP_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    }
}
