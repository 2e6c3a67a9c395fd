//! Log subscriber setup for the CLI.

use crate::ColorWhen;
use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
///
/// The mDNS daemon logs every malformed packet on the network at `info`,
/// which drowns the streaming log on a busy LAN.
pub const DEFAULT_LOG_FILTER: &str = "info,mdns_sd=warn";

/// Installs the global `fmt` subscriber writing to stderr.
///
/// `RUST_LOG` overrides [`DEFAULT_LOG_FILTER`]. A second call fails instead
/// of panicking, so tests may call it freely.
pub fn init_tracing(color: ColorWhen) -> Result<()> {
    // ---
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(DEFAULT_LOG_FILTER),
    };

    fmt()
        .with_writer(std::io::stderr)
        .with_ansi(color.should_color_stderr())
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("tracing already initialized: {e}"))
}
