//! Settings for the `streamer` binary.

use discovery::DiscoveryConfig;
use raop_common::settings::ConfigError;
use raop_common::ColorWhen;
use serde::Deserialize;
use std::path::Path;

use crate::config::SessionConfig;

/// Top-level settings file layout.
///
/// ```toml
/// color = "never"
/// metrics_bind = "127.0.0.1:9100"
///
/// [session]
/// negotiation_timeout_ms = 3000
/// dacp_port = 3689
///
/// [discovery]
/// service_types = ["_raop._tcp.local."]
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    // ---
    pub color: ColorWhen,

    /// Prometheus endpoint; `None` disables it
    pub metrics_bind: Option<String>,

    pub session: SessionConfig,
    pub discovery: DiscoveryConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            color: ColorWhen::Auto,
            metrics_bind: None,
            session: SessionConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl Settings {
    // ---
    /// Loads from `path` if given, otherwise from the default location,
    /// with `RAOP__*` environment overrides on top.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        // ---
        match path {
            Some(path) => raop_common::settings::load_from(Some(path)),
            None => raop_common::settings::load(),
        }
    }
}
