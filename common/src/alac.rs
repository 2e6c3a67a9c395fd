//! ALAC framing in uncompressed (escape) mode.
//!
//! RAOP receivers announced with `a=rtpmap:96 AppleLossless` accept ALAC
//! frames whose escape flag is set, which carry raw big-endian PCM after a
//! short bit-packed header. This avoids running a real ALAC encoder while
//! staying inside what every receiver decodes.
//!
//! ```text
//! element(3) tag(4) unused(12) has_size(1) extra_bits(2) escape(1)
//! [frame_count(32) if has_size] samples(16 * channels * frames) END(3)
//! ```

use anyhow::Result;

/// Frames per packet announced in the SDP `fmtp` line
pub const FRAMES_PER_PACKET: usize = 352;

/// Bits per sample carried in the frame
const SAMPLE_BITS: u32 = 16;

/// ALAC element id terminating a frame
const ID_END: u32 = 7;

struct BitWriter {
    buf: Vec<u8>,
    acc: u64,
    bits: u32,
}

impl BitWriter {
    fn with_capacity(bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(bytes),
            acc: 0,
            bits: 0,
        }
    }

    fn write(&mut self, value: u32, width: u32) {
        // ---
        let mask = if width == 32 { u32::MAX } else { (1 << width) - 1 };
        self.acc = (self.acc << width) | (value & mask) as u64;
        self.bits += width;

        while self.bits >= 8 {
            self.bits -= 8;
            self.buf.push((self.acc >> self.bits) as u8);
        }
        self.acc &= (1 << self.bits) - 1;
    }

    fn finish(mut self) -> Vec<u8> {
        // ---
        if self.bits > 0 {
            let pad = 8 - self.bits;
            self.write(0, pad);
        }
        self.buf
    }
}

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read(&mut self, width: u32) -> Result<u32> {
        // ---
        let mut value: u32 = 0;
        for _ in 0..width {
            let byte = self.pos / 8;
            if byte >= self.data.len() {
                anyhow::bail!("ALAC frame truncated at bit {}", self.pos);
            }
            let bit = (self.data[byte] >> (7 - self.pos % 8)) & 1;
            value = (value << 1) | bit as u32;
            self.pos += 1;
        }
        Ok(value)
    }
}

/// Wraps interleaved 16-bit PCM into an uncompressed ALAC frame.
///
/// A frame shorter than [`FRAMES_PER_PACKET`] (the tail of a track) sets the
/// `has_size` flag and carries its own frame count.
pub fn encode_uncompressed(pcm: &[i16], channels: usize) -> Vec<u8> {
    // ---
    let frames = pcm.len() / channels.max(1);
    let has_size = frames != FRAMES_PER_PACKET;
    let mut writer = BitWriter::with_capacity(pcm.len() * 2 + 8);

    writer.write(channels.saturating_sub(1) as u32, 3);
    writer.write(0, 4);
    writer.write(0, 12);
    writer.write(has_size as u32, 1);
    writer.write(0, 2);
    writer.write(1, 1);
    if has_size {
        writer.write(frames as u32, 32);
    }

    for &sample in &pcm[..frames * channels] {
        writer.write(sample as u16 as u32, SAMPLE_BITS);
    }

    writer.write(ID_END, 3);
    writer.finish()
}

/// Extracts interleaved PCM from an uncompressed ALAC frame.
///
/// Only frames produced in escape mode are understood; compressed frames
/// are rejected.
pub fn decode_uncompressed(frame: &[u8], channels: usize) -> Result<Vec<i16>> {
    // ---
    let mut reader = BitReader::new(frame);

    let element = reader.read(3)?;
    if element != channels.saturating_sub(1) as u32 {
        anyhow::bail!("unexpected ALAC element {} for {} channels", element, channels);
    }
    reader.read(4)?;
    reader.read(12)?;
    let has_size = reader.read(1)? == 1;
    reader.read(2)?;
    if reader.read(1)? != 1 {
        anyhow::bail!("compressed ALAC frames are not supported");
    }

    let frames = if has_size {
        reader.read(32)? as usize
    } else {
        FRAMES_PER_PACKET
    };

    let mut pcm = Vec::with_capacity(frames * channels);
    for _ in 0..frames * channels {
        pcm.push(reader.read(SAMPLE_BITS)? as u16 as i16);
    }

    if reader.read(3)? != ID_END {
        anyhow::bail!("missing ALAC end element");
    }

    Ok(pcm)
}
