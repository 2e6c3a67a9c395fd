//! Layered settings loading.
//!
//! Settings come from struct defaults, then an optional TOML file, then
//! environment variables (`RAOP__SECTION__KEY=value`), later layers winning.

pub use config::ConfigError;
use serde::de::DeserializeOwned;
use std::env;
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "RAOP_CONFIG_PATH";

/// Prefix for per-key environment overrides.
pub const ENV_PREFIX: &str = "RAOP";

/// Directory name under the user's config/data directories.
pub const APP_DIR: &str = "raop-streamer";

/// Loads settings of type `T` from the default file location and environment.
///
/// `T` should carry `#[serde(default)]` so that any key missing from every
/// layer falls back to its `Default` value.
pub fn load<T: DeserializeOwned>() -> Result<T, ConfigError> {
    // ---
    load_from(resolve_config_path().as_deref())
}

/// Loads settings with an explicit (optional) config file.
pub fn load_from<T: DeserializeOwned>(path: Option<&Path>) -> Result<T, ConfigError> {
    // ---
    let mut builder = config::Config::builder();

    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path).required(false));
    }

    builder = builder.add_source(
        config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

/// Resolve the config path from `RAOP_CONFIG_PATH` or XDG defaults.
pub fn resolve_config_path() -> Option<PathBuf> {
    // ---
    if let Some(p) = env::var_os(CONFIG_PATH_ENV) {
        return Some(PathBuf::from(p));
    }
    default_config_path()
}

/// `$XDG_CONFIG_HOME/raop-streamer/config.toml`, or `~/.config/...` when
/// `XDG_CONFIG_HOME` is not set.
pub fn default_config_path() -> Option<PathBuf> {
    // ---
    let config_home = if let Some(xdg) = env::var_os("XDG_CONFIG_HOME") {
        Some(PathBuf::from(xdg))
    } else {
        env::var_os("HOME").map(|home| PathBuf::from(home).join(".config"))
    };

    config_home.map(|d| d.join(APP_DIR).join("config.toml"))
}
