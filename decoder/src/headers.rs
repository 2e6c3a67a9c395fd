//! Ogg Opus header packets (RFC 7845).
//!
//! `OpusHead` is parsed here; the comment header is only recognised by its
//! magic and handed to [`crate::tags`] for reading.

use crate::error::{DecodeError, Result};

const OPUS_HEAD_MAGIC: &[u8; 8] = b"OpusHead";
const OPUS_TAGS_MAGIC: &[u8; 8] = b"OpusTags";

/// Opus always decodes at 48 kHz; granule positions count 48 kHz samples.
pub const OPUS_RATE: u32 = 48_000;

/// Identification header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpusHead {
    // ---
    pub version: u8,
    pub channels: u8,

    /// Samples (at 48 kHz) to discard from the start of the decoded stream
    pub pre_skip: u16,

    /// Sample rate of the original input, informational only
    pub input_sample_rate: u32,

    /// Gain to apply on output, Q7.8 dB
    pub output_gain: i16,

    pub mapping_family: u8,
}

impl OpusHead {
    // ---
    pub fn is_opus_head(packet: &[u8]) -> bool {
        packet.starts_with(OPUS_HEAD_MAGIC)
    }

    pub fn parse(packet: &[u8]) -> Result<Self> {
        // ---
        if !Self::is_opus_head(packet) {
            return Err(DecodeError::UnsupportedFormat(
                "first packet is not an OpusHead".into(),
            ));
        }
        if packet.len() < 19 {
            return Err(DecodeError::MalformedData(format!(
                "OpusHead too short: {} bytes",
                packet.len()
            )));
        }

        let head = Self {
            version: packet[8],
            channels: packet[9],
            pre_skip: u16::from_le_bytes([packet[10], packet[11]]),
            input_sample_rate: u32::from_le_bytes([packet[12], packet[13], packet[14], packet[15]]),
            output_gain: i16::from_le_bytes([packet[16], packet[17]]),
            mapping_family: packet[18],
        };

        // Major version 0 is the only one defined; minor bumps stay compatible.
        if head.version >> 4 != 0 {
            return Err(DecodeError::UnsupportedFormat(format!(
                "OpusHead version {}",
                head.version
            )));
        }
        if head.channels == 0 {
            return Err(DecodeError::MalformedData("OpusHead declares 0 channels".into()));
        }
        if head.mapping_family != 0 || head.channels > 2 {
            return Err(DecodeError::UnsupportedFormat(format!(
                "channel mapping family {} with {} channels",
                head.mapping_family, head.channels
            )));
        }

        Ok(head)
    }

    /// Output gain in dB.
    pub fn output_gain_db(&self) -> f32 {
        self.output_gain as f32 / 256.0
    }
}

/// Whether the packet is a comment header.
pub fn is_opus_tags(packet: &[u8]) -> bool {
    packet.starts_with(OPUS_TAGS_MAGIC)
}
