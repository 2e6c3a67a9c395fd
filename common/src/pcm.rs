//! Decoded PCM handed from the decoder to a streaming session.

use std::sync::Arc;
use std::time::Duration;

/// Sample rate RAOP receivers expect
pub const RAOP_SAMPLE_RATE: u32 = 44_100;

/// Channel count RAOP receivers expect
pub const RAOP_CHANNELS: u16 = 2;

/// Interleaved 16-bit PCM with a read cursor.
///
/// The samples are shared; cloning a source yields an independent cursor
/// over the same audio, so a session can restart a track without the
/// decoder running again.
#[derive(Debug, Clone)]
pub struct PcmSource {
    // ---
    samples: Arc<[i16]>,
    channels: u16,
    sample_rate: u32,

    /// Next frame to hand out
    cursor: usize,
}

impl PcmSource {
    // ---
    pub fn new(samples: Vec<i16>, channels: u16, sample_rate: u32) -> Self {
        // ---
        Self {
            samples: samples.into(),
            channels: channels.max(1),
            sample_rate,
            cursor: 0,
        }
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Whether the audio is in the format a RAOP session sends.
    pub fn is_raop_format(&self) -> bool {
        self.channels == RAOP_CHANNELS && self.sample_rate == RAOP_SAMPLE_RATE
    }

    pub fn total_frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn remaining_frames(&self) -> usize {
        self.total_frames() - self.cursor
    }

    /// Total playable length.
    pub fn duration(&self) -> Duration {
        // ---
        Duration::from_secs_f64(self.total_frames() as f64 / self.sample_rate.max(1) as f64)
    }

    /// Reads up to `frames` interleaved frames, advancing the cursor.
    ///
    /// Returns `None` once the source is exhausted; the final read may be
    /// shorter than requested.
    pub fn read_frames(&mut self, frames: usize) -> Option<&[i16]> {
        // ---
        if self.cursor >= self.total_frames() {
            return None;
        }

        let start = self.cursor;
        let end = (start + frames).min(self.total_frames());
        self.cursor = end;

        let ch = self.channels as usize;
        Some(&self.samples[start * ch..end * ch])
    }
}
