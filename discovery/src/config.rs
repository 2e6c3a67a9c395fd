use serde::Deserialize;
use std::path::PathBuf;

use raop_common::settings::APP_DIR;

/// DNS-SD service type RAOP receivers advertise.
pub const RAOP_SERVICE_TYPE: &str = "_raop._tcp.local.";

const RECORD_FILE_NAME: &str = "discovered_devices.txt";

/// Settings for [`crate::Discovery`].
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DiscoveryConfig {
    // ---
    /// Fully qualified service types to browse
    pub service_types: Vec<String>,

    /// Where newly seen receivers are appended. `None` uses the per-user
    /// data directory.
    pub record_path: Option<PathBuf>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_types: vec![RAOP_SERVICE_TYPE.to_string()],
            record_path: None,
        }
    }
}

impl DiscoveryConfig {
    // ---
    /// Record file used by this configuration, if one can be located.
    pub fn resolved_record_path(&self) -> Option<PathBuf> {
        // ---
        self.record_path.clone().or_else(default_record_path)
    }
}

/// `<data_local_dir>/raop-streamer/discovered_devices.txt`
pub fn default_record_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join(APP_DIR).join(RECORD_FILE_NAME))
}
