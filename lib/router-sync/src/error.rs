use router_bus::BusError;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoordinatorError>;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    #[error("Invalid value for {key}: {value:?}")]
    ConfigValue { key: String, value: String },

    #[error("Could not determine local host address: {0}")]
    HostAddress(#[source] std::io::Error),

    #[error("Failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        source: serde_json::Error,
    },

    #[error("Failed to compress snapshot: {0}")]
    Compress(#[source] std::io::Error),

    #[error("Failed to publish initial heartbeat: {0}")]
    InitialHeartbeat(#[source] BusError),

    #[error("Failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Server error: {0}")]
    Serve(anyhow::Error),
}
