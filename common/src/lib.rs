//! Common RAOP utilities shared between the decoder, discovery and streamer crates.
//!
//! This crate provides the RTP/ALAC wire format, the PCM sample source handed
//! from the decoder to a streaming session, gain helpers, and the ambient
//! plumbing (tracing, CLI color policy, metrics, settings) every binary uses.

pub mod alac;
pub mod cli;
pub mod gain;
pub mod observability;
pub mod pcm;
pub mod rtp;
pub mod settings;

pub use cli::ColorWhen;
pub use gain::{db_to_linear, GainControl, SessionLink};
pub use observability::{init_tracing, MetricsContext, MetricsServerConfig};
pub use pcm::PcmSource;
pub use rtp::{NtpTimestamp, RtpPacket, SyncPacket, TimingPacket};
