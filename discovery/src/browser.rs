//! mDNS browsing and the deduplicated receiver set.

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use raop_common::MetricsContext;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;
use crate::device::{friendly_name, Device};
use crate::error::{DiscoveryError, Result};

/// State shared with the listener tasks.
struct Shared {
    // ---
    devices: RwLock<HashMap<IpAddr, Device>>,
    record_path: Option<PathBuf>,
    metrics: Option<MetricsContext>,
}

/// A running browse: the daemon plus one listener per service type.
struct Browser {
    // ---
    daemon: ServiceDaemon,
    cancel: CancellationToken,
    listeners: Vec<JoinHandle<()>>,
}

/// Finds RAOP receivers on the local network.
///
/// Every resolved advertisement contributes its addresses to a set keyed by
/// IP address. Addresses seen for the first time are appended to a record
/// file; failures to write it are logged and otherwise ignored.
///
/// The set survives [`Discovery::stop`], so a caller can stop browsing and
/// still pick a receiver from what was found.
pub struct Discovery {
    // ---
    config: DiscoveryConfig,
    shared: Arc<Shared>,
    browser: Mutex<Option<Browser>>,
}

impl Discovery {
    // ---
    pub fn new(config: DiscoveryConfig) -> Self {
        // ---
        Self::build(config, None)
    }

    /// Like [`Discovery::new`], reporting the set size into `metrics`.
    pub fn with_metrics(config: DiscoveryConfig, metrics: MetricsContext) -> Self {
        // ---
        Self::build(config, Some(metrics))
    }

    fn build(config: DiscoveryConfig, metrics: Option<MetricsContext>) -> Self {
        // ---
        let shared = Arc::new(Shared {
            devices: RwLock::new(HashMap::new()),
            record_path: config.resolved_record_path(),
            metrics,
        });

        Self {
            config,
            shared,
            browser: Mutex::new(None),
        }
    }

    /// Starts browsing. Calling it again while running does nothing.
    ///
    /// Must be called from within a Tokio runtime; the listeners run as tasks
    /// on it.
    pub fn start(&self) -> Result<()> {
        // ---
        let mut browser = self.lock_browser();
        if browser.is_some() {
            debug!("Discovery already running");
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| DiscoveryError::NoRuntime)?;
        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::Daemon(e.to_string()))?;
        let cancel = CancellationToken::new();
        let mut listeners = Vec::with_capacity(self.config.service_types.len());

        for service_type in &self.config.service_types {
            let receiver = match daemon.browse(service_type) {
                Ok(receiver) => receiver,
                Err(e) => {
                    cancel.cancel();
                    if let Err(e) = daemon.shutdown() {
                        debug!("mDNS daemon shutdown after failed browse: {}", e);
                    }
                    return Err(DiscoveryError::Browse {
                        service_type: service_type.clone(),
                        reason: e.to_string(),
                    });
                }
            };

            let shared = self.shared.clone();
            let cancel = cancel.child_token();
            let service_type = service_type.clone();

            listeners.push(runtime.spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!("Listener for {} shutting down", service_type);
                            break;
                        }
                        event = receiver.recv_async() => match event {
                            Ok(ServiceEvent::ServiceResolved(info)) => {
                                shared.resolved(&info, &service_type);
                            }
                            Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                                // Receivers stay in the set until the process exits
                                debug!("Service removed: {}", fullname);
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!("mDNS event channel for {} closed: {}", service_type, e);
                                break;
                            }
                        }
                    }
                }
            }));
        }

        info!(
            "Browsing for receivers: {}",
            self.config.service_types.join(", ")
        );
        *browser = Some(Browser {
            daemon,
            cancel,
            listeners,
        });
        Ok(())
    }

    /// Stops browsing and shuts the daemon down. The device set is kept.
    pub fn stop(&self) {
        // ---
        let Some(browser) = self.lock_browser().take() else {
            return;
        };

        for service_type in &self.config.service_types {
            if let Err(e) = browser.daemon.stop_browse(service_type) {
                debug!("stop_browse({}) failed: {}", service_type, e);
            }
        }
        browser.cancel.cancel();
        if let Err(e) = browser.daemon.shutdown() {
            warn!("mDNS daemon shutdown failed: {}", e);
        }
        for listener in browser.listeners {
            // Listeners exit on cancel; abort covers one stuck mid-event
            listener.abort();
        }

        info!("Discovery stopped with {} receiver(s) known", self.len());
    }

    pub fn is_running(&self) -> bool {
        self.lock_browser().is_some()
    }

    /// Removes the record file. A file that does not exist is not an error.
    pub fn cleanup_record_file(&self) -> Result<()> {
        // ---
        let Some(path) = self.shared.record_path.as_deref() else {
            return Ok(());
        };

        match fs::remove_file(path) {
            Ok(()) => {
                info!("Removed record file {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(DiscoveryError::RecordFile {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    /// Friendly names of every known receiver, sorted.
    pub fn discovered_devices(&self) -> Vec<String> {
        // ---
        let mut names: Vec<String> = self
            .shared
            .read_devices()
            .values()
            .map(|d| d.name.clone())
            .collect();
        names.sort();
        // One receiver announced on IPv4 and IPv6 is listed once
        names.dedup();
        names
    }

    /// Known receivers, sorted by name, then by reachability, then address.
    pub fn devices(&self) -> Vec<Device> {
        // ---
        let mut devices: Vec<Device> = self.shared.read_devices().values().cloned().collect();
        devices.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then(a.reachability_rank().cmp(&b.reachability_rank()))
                .then(a.address.cmp(&b.address))
        });
        devices
    }

    /// Looks a receiver up by friendly name or address string.
    ///
    /// When a name matches several addresses the most reachable one wins
    /// (see [`Device::reachability_rank`]), so the answer does not depend
    /// on map iteration order.
    pub fn find(&self, needle: &str) -> Option<Device> {
        // ---
        self.shared
            .read_devices()
            .values()
            .filter(|d| d.name == needle || d.address.to_string() == needle)
            .min_by_key(|d| (d.reachability_rank(), d.address))
            .cloned()
    }

    /// Where discovered receivers are appended, if anywhere.
    pub fn record_path(&self) -> Option<&Path> {
        self.shared.record_path.as_deref()
    }

    /// Inserts a receiver. Returns `true` if its address was new.
    pub fn record(&self, device: Device) -> bool {
        self.shared.record(device)
    }

    pub fn len(&self) -> usize {
        self.shared.read_devices().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_browser(&self) -> MutexGuard<'_, Option<Browser>> {
        self.browser.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    // ---
    fn resolved(&self, info: &ServiceInfo, service_type: &str) {
        // ---
        let fullname = info.get_fullname();
        let Some(name) = friendly_name(fullname, service_type) else {
            warn!("Dropping advertisement with unusable name: {}", fullname);
            return;
        };

        let addresses = info.get_addresses();
        if addresses.is_empty() {
            debug!("Resolved {} without addresses", fullname);
            return;
        }

        for addr in addresses.iter() {
            self.record(Device::new(IpAddr::from(*addr), info.get_port(), name.clone()));
        }
    }

    fn record(&self, device: Device) -> bool {
        // ---
        let count = {
            let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
            if devices.contains_key(&device.address) {
                return false;
            }
            devices.insert(device.address, device.clone());
            devices.len()
        };

        info!("Discovered receiver {}", device);
        if let Some(metrics) = &self.metrics {
            metrics.devices_discovered.set(count as i64);
        }
        if let Some(path) = &self.record_path {
            if let Err(e) = append_record(path, &device) {
                warn!("Failed to append {} to {}: {}", device.address, path.display(), e);
            }
        }
        true
    }

    fn read_devices(&self) -> RwLockReadGuard<'_, HashMap<IpAddr, Device>> {
        self.devices.read().unwrap_or_else(|e| e.into_inner())
    }
}

fn append_record(path: &Path, device: &Device) -> io::Result<()> {
    // ---
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", device.record_line())
}
