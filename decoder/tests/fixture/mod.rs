//! Builds small Ogg Opus files in memory for decoder tests.
//!
//! Audio is encoded with libopus and muxed with the `ogg` crate, so the
//! decoder sees the same page/packet structure opusenc would produce.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ogg::{PacketWriteEndInfo, PacketWriter};
use opus::{Application, Channels, Encoder};

/// 20 ms at 48 kHz
pub const FRAME_SAMPLES: usize = 960;

/// libopus lookahead at 48 kHz
pub const PRE_SKIP: u16 = 312;

const SERIAL: u32 = 0x5EED_0001;

/// Description of a fixture file.
pub struct OpusFixture {
    // ---
    pub channels: u8,
    pub packets: usize,
    pub comments: Vec<String>,

    /// Sine amplitude; 0 encodes silence
    pub amplitude: i16,
}

impl OpusFixture {
    // ---
    /// Silent stereo file of roughly `seconds` length.
    pub fn stereo_seconds(seconds: usize) -> Self {
        // ---
        Self {
            channels: 2,
            packets: seconds * 50,
            comments: Vec::new(),
            amplitude: 0,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        // ---
        self.comments.push(comment.into());
        self
    }

    /// Embeds a picture as a `METADATA_BLOCK_PICTURE` comment.
    ///
    /// `picture_type` is the ID3v2 APIC type (3 = front cover). `data` is
    /// stored as given, so it need not be a valid image.
    pub fn with_picture(self, picture_type: u32, mime: &str, description: &str, data: &[u8]) -> Self {
        // ---
        let mut block = Vec::with_capacity(32 + data.len());
        block.extend_from_slice(&picture_type.to_be_bytes());
        block.extend_from_slice(&(mime.len() as u32).to_be_bytes());
        block.extend_from_slice(mime.as_bytes());
        block.extend_from_slice(&(description.len() as u32).to_be_bytes());
        block.extend_from_slice(description.as_bytes());
        // width, height, depth, indexed colours: informational only
        for _ in 0..4 {
            block.extend_from_slice(&0u32.to_be_bytes());
        }
        block.extend_from_slice(&(data.len() as u32).to_be_bytes());
        block.extend_from_slice(data);

        self.with_comment(format!("METADATA_BLOCK_PICTURE={}", STANDARD.encode(block)))
    }

    /// Granule position of the last page.
    pub fn final_granule(&self) -> u64 {
        (self.packets * FRAME_SAMPLES) as u64
    }

    pub fn build(&self) -> Vec<u8> {
        // ---
        let layout = if self.channels == 1 {
            Channels::Mono
        } else {
            Channels::Stereo
        };
        let mut encoder =
            Encoder::new(48_000, layout, Application::Audio).expect("encoder creation failed");

        let mut writer = PacketWriter::new(Vec::new());
        writer
            .write_packet(self.head(), SERIAL, PacketWriteEndInfo::EndPage, 0)
            .expect("write OpusHead");
        writer
            .write_packet(self.tags(), SERIAL, PacketWriteEndInfo::EndPage, 0)
            .expect("write OpusTags");

        let ch = self.channels as usize;
        let mut pcm = vec![0i16; FRAME_SAMPLES * ch];
        let mut encoded = vec![0u8; 4000];

        for i in 0..self.packets {
            for n in 0..FRAME_SAMPLES {
                let t = (i * FRAME_SAMPLES + n) as f32 / 48_000.0;
                let value = (t * 440.0 * std::f32::consts::TAU).sin() * self.amplitude as f32;
                for c in 0..ch {
                    pcm[n * ch + c] = value as i16;
                }
            }

            let len = encoder.encode(&pcm, &mut encoded).expect("encoding failed");

            let end = if i + 1 == self.packets {
                PacketWriteEndInfo::EndStream
            } else if (i + 1) % 50 == 0 {
                PacketWriteEndInfo::EndPage
            } else {
                PacketWriteEndInfo::NormalPacket
            };
            let granule = ((i + 1) * FRAME_SAMPLES) as u64;

            writer
                .write_packet(encoded[..len].to_vec(), SERIAL, end, granule)
                .expect("write audio packet");
        }

        writer.into_inner()
    }

    fn head(&self) -> Vec<u8> {
        // ---
        let mut p = b"OpusHead".to_vec();
        p.push(1);
        p.push(self.channels);
        p.extend_from_slice(&PRE_SKIP.to_le_bytes());
        p.extend_from_slice(&48_000u32.to_le_bytes());
        p.extend_from_slice(&0i16.to_le_bytes());
        p.push(0);
        p
    }

    fn tags(&self) -> Vec<u8> {
        // ---
        let mut p = b"OpusTags".to_vec();
        let vendor = b"fixture";
        p.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
        p.extend_from_slice(vendor);
        p.extend_from_slice(&(self.comments.len() as u32).to_le_bytes());
        for c in &self.comments {
            p.extend_from_slice(&(c.len() as u32).to_le_bytes());
            p.extend_from_slice(c.as_bytes());
        }
        p
    }
}
