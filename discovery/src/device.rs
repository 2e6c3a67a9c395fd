use std::fmt;
use std::net::IpAddr;

/// A receiver seen on the network.
///
/// Equality and set membership are by address only; the same receiver
/// announced under a new name is still the same receiver.
#[derive(Debug, Clone)]
pub struct Device {
    // ---
    pub address: IpAddr,
    pub port: u16,
    pub name: String,
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Device {}

impl Device {
    // ---
    pub fn new(address: IpAddr, port: u16, name: impl Into<String>) -> Self {
        // ---
        Self {
            address,
            port,
            name: name.into(),
        }
    }

    /// Ordering key for picking one address when a receiver is announced
    /// on several: IPv4 first, then routable IPv6, then link-local.
    ///
    /// Link-local IPv6 needs a scope id to connect, which the record does
    /// not carry.
    pub fn reachability_rank(&self) -> u8 {
        // ---
        match self.address {
            IpAddr::V4(_) => 0,
            IpAddr::V6(v6) if v6.segments()[0] & 0xffc0 == 0xfe80 => 2,
            IpAddr::V6(_) => 1,
        }
    }

    /// Line written to the record file.
    pub fn record_line(&self) -> String {
        format!("{} {} {}", self.address, self.port, self.name)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.address, self.port)
    }
}

/// Human-readable receiver name from a DNS-SD full name.
///
/// RAOP instances are named `<MAC>@<friendly name>`; the part after `@`
/// is what people recognise. Returns `None` when the full name does not
/// belong to `service_type` or the instance part is empty.
pub fn friendly_name(fullname: &str, service_type: &str) -> Option<String> {
    // ---
    let instance = fullname
        .strip_suffix(service_type)?
        .trim_end_matches('.');
    if instance.is_empty() {
        return None;
    }

    let name = match instance.split_once('@') {
        Some((_, name)) if !name.is_empty() => name,
        _ => instance,
    };
    Some(name.to_string())
}
