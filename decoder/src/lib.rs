//! Ogg Opus decoder for the RAOP streamer.
//!
//! Turns an Ogg Opus file (or an in-memory copy of one) into 44.1 kHz
//! stereo PCM plus the tags and cover art the player displays. Metadata and
//! audio come out of the same demux pass.

pub mod convert;
pub mod error;
pub mod headers;
pub mod opus_file;
pub mod tags;

pub use error::DecodeError;
pub use headers::OpusHead;
pub use opus_file::{OpusDecoder, Track};
pub use tags::{AlbumArt, TrackTags};
pub use raop_common::PcmSource;
