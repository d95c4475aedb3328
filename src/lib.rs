//! Test-node controller for scheduler clusters.
//!
//! [`SchedulerNode`] drives one cluster member through its whole life in an
//! integration test: reserve ports, write configuration, launch the process,
//! wait for health, hand out gRPC clients (plain or mTLS), scrape metrics and
//! finally stop everything again.

pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod node;
pub mod ports;
pub mod process;
pub mod security;
pub mod shutdown;
pub mod tls;

pub use client::{MtlsClient, NodeClient};
pub use config::{ClusterTopology, NodeConfig, NodeOptions};
pub use error::{HarnessError, Result};
pub use metrics::MetricsSnapshot;
pub use node::SchedulerNode;
pub use process::{ExecProcess, LaunchSpec, ProcessSupervisor};
