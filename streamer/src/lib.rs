//! RAOP (AirPlay 1) streaming session.
//!
//! A [`StreamingSession`] negotiates with a receiver over RTSP, then sends
//! 44.1 kHz stereo PCM as uncompressed ALAC frames over RTP/UDP, paced by a
//! monotonic clock. Gain can change while streaming, a start that is still
//! connecting can be cancelled, and the receiver can be told to play via
//! its DACP control service. The outgoing audio can be captured to WAV.

pub mod capture;
pub mod clock;
pub mod config;
pub mod control;
pub mod error;
pub mod handshake;
pub mod network;
pub mod power;
pub mod rtsp;
pub mod session;
pub mod settings;

pub use capture::CaptureSink;
pub use clock::{cleanup_default_stale_lock, cleanup_stale_lock, default_lock_path, PacingClock};
pub use config::{SessionConfig, DEFAULT_DACP_PORT, DEFAULT_RAOP_PORT};
pub use error::SessionError;
pub use power::{SleepInhibitor, SleepLease};
pub use session::{SessionResources, SessionState, StreamingSession};
pub use settings::Settings;

pub use raop_common::PcmSource;
pub use tokio_util::sync::CancellationToken;
