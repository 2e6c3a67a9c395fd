//! Session tuning knobs.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::clock::default_lock_path;

/// Default RAOP/RTSP port receivers listen on.
pub const DEFAULT_RAOP_PORT: u16 = 7000;

/// Port of the DACP/DMAP control service.
pub const DEFAULT_DACP_PORT: u16 = 3689;

/// Settings for a [`crate::StreamingSession`].
///
/// All durations are in milliseconds so the struct maps one-to-one onto
/// TOML keys and `RAOP__SESSION__*` environment variables.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    // ---
    /// Upper bound on OPTIONS → RECORD
    pub negotiation_timeout_ms: u64,

    /// Upper bound on the TEARDOWN round trip when stopping
    pub teardown_timeout_ms: u64,

    /// Upper bound on a DACP transport command
    pub command_timeout_ms: u64,

    /// How far ahead of real time packets are sent
    pub lead_ms: u64,

    pub dacp_port: u16,

    /// Lock artifact guarding the pacing clock. `None` uses the system
    /// temp directory.
    pub lock_path: Option<PathBuf>,

    /// Hold a sleep-prevention lease while streaming
    pub inhibit_sleep: bool,

    /// Replaces the platform's sleep-prevention command. `{pid}` is
    /// substituted with the current process id.
    pub sleep_command: Option<Vec<String>>,

    /// Capture every stream's audio to a WAV file in this directory
    pub capture_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        // ---
        Self {
            negotiation_timeout_ms: 5_000,
            teardown_timeout_ms: 1_000,
            command_timeout_ms: 2_000,
            lead_ms: 100,
            dacp_port: DEFAULT_DACP_PORT,
            lock_path: None,
            inhibit_sleep: true,
            sleep_command: None,
            capture_dir: None,
        }
    }
}

impl SessionConfig {
    // ---
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn lead(&self) -> Duration {
        Duration::from_millis(self.lead_ms)
    }

    pub fn resolved_lock_path(&self) -> PathBuf {
        self.lock_path.clone().unwrap_or_else(default_lock_path)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn defaults() {
        // ---
        let cfg = SessionConfig::default();
        assert_eq!(cfg.dacp_port, 3689);
        assert_eq!(cfg.negotiation_timeout(), Duration::from_secs(5));
        assert!(cfg.inhibit_sleep);
        assert!(cfg.capture_dir.is_none());
        assert_eq!(cfg.resolved_lock_path(), default_lock_path());
    }

    #[test]
    fn explicit_lock_path_wins() {
        // ---
        let cfg = SessionConfig {
            lock_path: Some(PathBuf::from("/tmp/other.lock")),
            ..Default::default()
        };
        assert_eq!(cfg.resolved_lock_path(), PathBuf::from("/tmp/other.lock"));
    }
}
