//! RAOP receiver discovery over mDNS / DNS-SD.
//!
//! [`Discovery`] browses for `_raop._tcp` advertisements, keeps a
//! deduplicated set of receiver addresses and appends each new one to a
//! local record file.

pub mod browser;
pub mod config;
pub mod device;
pub mod error;

pub use browser::Discovery;
pub use config::{default_record_path, DiscoveryConfig, RAOP_SERVICE_TYPE};
pub use device::{friendly_name, Device};
pub use error::DiscoveryError;
