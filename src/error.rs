use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Invalid cluster topology entry {0:?}, expected <id>=<port>")]
    InvalidTopologyEntry(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Node {0} is already running")]
    AlreadyRunning(String),

    #[error("Node {0} is not running")]
    NotRunning(String),

    #[error("Node {node_id} did not become healthy at {url} within {timeout:?}")]
    NotReady {
        node_id: String,
        url: String,
        timeout: Duration,
    },

    #[error("Unexpected HTTP status {status} from {url}")]
    UnexpectedStatus { url: String, status: u16 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Malformed metrics at line {line}: {message}")]
    MetricsParse { line: usize, message: String },

    #[error("Dial to {addr} timed out after {timeout:?}")]
    DialTimeout { addr: String, timeout: Duration },

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Storage client error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("Node {0} has no security context configured")]
    SecurityNotConfigured(String),

    #[error("Security error: {0}")]
    Security(String),

    #[error("Certificate error: {0}")]
    Certificate(#[from] rcgen::Error),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, HarnessError>;
