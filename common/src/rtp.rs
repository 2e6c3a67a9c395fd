//! RAOP RTP packet structures and serialization.
//!
//! RAOP reuses the RFC 3550 fixed header for three packet families:
//! audio data (payload type 0x60), sync packets on the control channel
//! (payload type 0x54) and NTP-style timing packets (0x52 request, 0x53 reply).

use anyhow::Result;
use std::time::{SystemTime, UNIX_EPOCH};

const RTP_VERSION: u8 = 2;

/// Size of the fixed RTP header in bytes
pub const RTP_HEADER_LEN: usize = 12;

/// Payload type used by RAOP for audio data
pub const PAYLOAD_TYPE_AUDIO: u8 = 0x60;

/// Payload type of a sync packet sent on the control channel
pub const PAYLOAD_TYPE_SYNC: u8 = 0x54;

/// Payload type of a timing request sent by the receiver
pub const PAYLOAD_TYPE_TIMING_REQUEST: u8 = 0x52;

/// Payload type of a timing reply sent by us
pub const PAYLOAD_TYPE_TIMING_REPLY: u8 = 0x53;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970)
const NTP_UNIX_OFFSET_SECS: u64 = 2_208_988_800;

const MARKER: u8 = 0x80;

fn be_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

/// One audio packet on the RAOP data channel.
///
/// Header layout is the RFC 3550 fixed header with payload type 0x60:
///
/// ```text
/// byte 0      0x80                    version 2, no padding/extension/CSRC
/// byte 1      M | 0x60                marker set on the first packet after RECORD
/// bytes 2-3   sequence                +1 per packet, wrapping
/// bytes 4-7   rtptime                 +frames per packet (352)
/// bytes 8-11  ssrc                    random per stream
/// bytes 12..  ALAC frame
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    // ---
    pub marker: bool,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Vec<u8>,
}

impl RtpPacket {
    // ---
    /// Unmarked audio packet.
    pub fn new(sequence: u16, timestamp: u32, ssrc: u32, payload: Vec<u8>) -> Self {
        // ---
        Self {
            marker: false,
            sequence,
            timestamp,
            ssrc,
            payload,
        }
    }

    pub fn with_marker(mut self, marker: bool) -> Self {
        // ---
        self.marker = marker;
        self
    }

    pub fn serialize(&self) -> Vec<u8> {
        // ---
        let marker = if self.marker { MARKER } else { 0 };
        let mut wire = Vec::with_capacity(RTP_HEADER_LEN + self.payload.len());
        wire.extend_from_slice(&[RTP_VERSION << 6, marker | PAYLOAD_TYPE_AUDIO]);
        wire.extend_from_slice(&self.sequence.to_be_bytes());
        wire.extend_from_slice(&self.timestamp.to_be_bytes());
        wire.extend_from_slice(&self.ssrc.to_be_bytes());
        wire.extend_from_slice(&self.payload);
        wire
    }

    /// Parses an audio packet; anything shorter than the fixed header, not
    /// version 2, or not payload type 0x60 is rejected.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        // ---
        let Some(header) = data.get(..RTP_HEADER_LEN) else {
            anyhow::bail!("audio packet truncated at {} bytes", data.len());
        };
        if header[0] >> 6 != RTP_VERSION {
            anyhow::bail!("RTP version {} is not 2", header[0] >> 6);
        }
        if header[1] & !MARKER != PAYLOAD_TYPE_AUDIO {
            anyhow::bail!("payload type 0x{:02x} is not audio", header[1] & !MARKER);
        }

        Ok(Self {
            marker: header[1] & MARKER != 0,
            sequence: u16::from_be_bytes([header[2], header[3]]),
            timestamp: be_u32(header, 4),
            ssrc: be_u32(header, 8),
            payload: data[RTP_HEADER_LEN..].to_vec(),
        })
    }
}

/// 64-bit NTP timestamp: seconds since 1900 plus a 32-bit binary fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NtpTimestamp {
    pub seconds: u32,
    pub fraction: u32,
}

impl NtpTimestamp {
    // ---
    /// Current wall-clock time as an NTP timestamp.
    pub fn now() -> Self {
        // ---
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let seconds = (since_epoch.as_secs() + NTP_UNIX_OFFSET_SECS) as u32;
        let fraction = ((since_epoch.subsec_nanos() as u64) << 32) / 1_000_000_000;

        Self {
            seconds,
            fraction: fraction as u32,
        }
    }

    fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.seconds.to_be_bytes());
        buf.extend_from_slice(&self.fraction.to_be_bytes());
    }

    fn read(data: &[u8]) -> Self {
        Self {
            seconds: be_u32(data, 0),
            fraction: be_u32(data, 4),
        }
    }
}

/// Sync packet announcing which RTP timestamp is currently playing.
///
/// Sent on the control channel before the first audio packet and then
/// roughly once per second.
///
/// ```text
/// 0x80|0x10 (first) | 0xd4 | 0x0007 | rtptime - latency | NTP now | rtptime
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPacket {
    // ---
    /// Set on the first sync after RECORD
    pub first: bool,

    /// RTP timestamp the receiver should be playing now
    pub playing_rtptime: u32,

    /// Wall-clock time the sync was generated
    pub ntp: NtpTimestamp,

    /// RTP timestamp of the next audio packet
    pub next_rtptime: u32,
}

impl SyncPacket {
    // ---
    pub const LEN: usize = 20;

    pub fn new(next_rtptime: u32, latency_frames: u32, first: bool) -> Self {
        // ---
        Self {
            first,
            playing_rtptime: next_rtptime.wrapping_sub(latency_frames),
            ntp: NtpTimestamp::now(),
            next_rtptime,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        // ---
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.push(if self.first { 0x90 } else { 0x80 });
        buf.push(MARKER | PAYLOAD_TYPE_SYNC);
        buf.extend_from_slice(&7u16.to_be_bytes());
        buf.extend_from_slice(&self.playing_rtptime.to_be_bytes());
        self.ntp.write(&mut buf);
        buf.extend_from_slice(&self.next_rtptime.to_be_bytes());
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        // ---
        if data.len() < Self::LEN {
            anyhow::bail!("sync packet too small: {} bytes", data.len());
        }
        if data[1] & !MARKER != PAYLOAD_TYPE_SYNC {
            anyhow::bail!("not a sync packet: 0x{:02x}", data[1]);
        }

        Ok(Self {
            first: data[0] & 0x10 != 0,
            playing_rtptime: be_u32(data, 4),
            ntp: NtpTimestamp::read(&data[8..16]),
            next_rtptime: be_u32(data, 16),
        })
    }
}

/// Timing packet exchanged on the timing channel.
///
/// The receiver sends a request carrying its transmit time; we answer with
/// that time as the reference plus our own receive and transmit times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingPacket {
    // ---
    pub payload_type: u8,
    pub reference: NtpTimestamp,
    pub received: NtpTimestamp,
    pub transmitted: NtpTimestamp,
}

impl TimingPacket {
    // ---
    pub const LEN: usize = 32;

    /// Builds a timing request, as a receiver would send it.
    pub fn request(now: NtpTimestamp) -> Self {
        // ---
        Self {
            payload_type: PAYLOAD_TYPE_TIMING_REQUEST,
            reference: NtpTimestamp::default(),
            received: NtpTimestamp::default(),
            transmitted: now,
        }
    }

    /// Builds the reply to `self`, stamped with the current time.
    pub fn reply(&self) -> Self {
        // ---
        let now = NtpTimestamp::now();
        Self {
            payload_type: PAYLOAD_TYPE_TIMING_REPLY,
            reference: self.transmitted,
            received: now,
            transmitted: now,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        // ---
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.extend_from_slice(&[RTP_VERSION << 6, MARKER | self.payload_type]);
        buf.extend_from_slice(&7u16.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        self.reference.write(&mut buf);
        self.received.write(&mut buf);
        self.transmitted.write(&mut buf);
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        // ---
        if data.len() < Self::LEN {
            anyhow::bail!("timing packet too small: {} bytes", data.len());
        }

        let payload_type = data[1] & !MARKER;
        if payload_type != PAYLOAD_TYPE_TIMING_REQUEST && payload_type != PAYLOAD_TYPE_TIMING_REPLY
        {
            anyhow::bail!("not a timing packet: 0x{:02x}", payload_type);
        }

        Ok(Self {
            payload_type,
            reference: NtpTimestamp::read(&data[8..16]),
            received: NtpTimestamp::read(&data[16..24]),
            transmitted: NtpTimestamp::read(&data[24..32]),
        })
    }
}
