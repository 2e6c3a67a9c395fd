use thiserror::Error;

/// Failures of the discovery component itself.
///
/// Problems with a single advertisement never show up here; they are logged
/// and the advertisement is dropped.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("mDNS daemon unavailable: {0}")]
    Daemon(String),

    #[error("failed to browse for {service_type}: {reason}")]
    Browse {
        service_type: String,
        reason: String,
    },

    #[error("discovery must be started from within a Tokio runtime")]
    NoRuntime,

    #[error("record file {path}: {source}")]
    RecordFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;
