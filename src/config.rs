//! Node configuration: overridable options and the resolved, immutable config.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{HarnessError, Result};
use crate::ports::Ports;
use crate::process::ProcessSupervisor;
use crate::security::CertificateAuthority;

pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_LISTEN_ADDRESS: &str = "localhost";
pub const NAMESPACE_ENV: &str = "NAMESPACE";

/// Ports reserved per node: peer, service, health, metrics, storage client.
pub const RESERVED_PORTS: usize = 5;

pub const READINESS_TIMEOUT: Duration = Duration::from_secs(15);
pub const READINESS_INTERVAL: Duration = Duration::from_millis(10);

/// Overrides applied on top of the defaults when a node is constructed.
///
/// Anything left unset is filled in from freshly reserved ports, a generated
/// node id and a temporary data directory.
#[derive(Clone)]
pub struct NodeOptions {
    pub id: Option<String>,
    pub log_level: String,
    pub replica_count: u32,
    pub listen_address: String,
    pub namespace: String,
    pub port: Option<u16>,
    pub healthz_port: Option<u16>,
    pub metrics_port: Option<u16>,
    /// `id=url` entries, comma separated.
    pub initial_cluster: Option<String>,
    /// `id=port` entries.
    pub etcd_client_ports: Option<Vec<String>>,
    pub data_dir: Option<PathBuf>,
    pub authority: Option<Arc<dyn CertificateAuthority>>,
    pub exec: ExecOptions,
    pub readiness_timeout: Duration,
    pub readiness_interval: Duration,
}

/// How the scheduler process is launched.
#[derive(Clone, Default)]
pub struct ExecOptions {
    /// Binary to run. Falls back to `SCHEDULER_BINARY`, then `scheduler`.
    pub binary: Option<PathBuf>,
    pub envs: Vec<(String, String)>,
    /// Forward process output to the test's stdout/stderr.
    pub inherit_output: bool,
    pub supervisor: Option<Arc<dyn ProcessSupervisor>>,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            id: None,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            replica_count: 1,
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            port: None,
            healthz_port: None,
            metrics_port: None,
            initial_cluster: None,
            etcd_client_ports: None,
            data_dir: None,
            authority: None,
            exec: ExecOptions::default(),
            readiness_timeout: READINESS_TIMEOUT,
            readiness_interval: READINESS_INTERVAL,
        }
    }
}

impl NodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn with_replica_count(mut self, count: u32) -> Self {
        self.replica_count = count;
        self
    }

    pub fn with_listen_address(mut self, address: impl Into<String>) -> Self {
        self.listen_address = address.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_healthz_port(mut self, port: u16) -> Self {
        self.healthz_port = Some(port);
        self
    }

    pub fn with_metrics_port(mut self, port: u16) -> Self {
        self.metrics_port = Some(port);
        self
    }

    pub fn with_initial_cluster(mut self, initial_cluster: impl Into<String>) -> Self {
        self.initial_cluster = Some(initial_cluster.into());
        self
    }

    pub fn with_etcd_client_ports<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.etcd_client_ports = Some(entries.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_authority(mut self, authority: Arc<dyn CertificateAuthority>) -> Self {
        self.authority = Some(authority);
        self
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.exec.binary = Some(binary.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.exec.envs.push((key.into(), value.into()));
        self
    }

    pub fn with_inherited_output(mut self) -> Self {
        self.exec.inherit_output = true;
        self
    }

    pub fn with_supervisor(mut self, supervisor: Arc<dyn ProcessSupervisor>) -> Self {
        self.exec.supervisor = Some(supervisor);
        self
    }

    pub fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = timeout;
        self
    }

    pub fn with_readiness_interval(mut self, interval: Duration) -> Self {
        self.readiness_interval = interval;
        self
    }
}

/// TLS flags handed to a node when a certificate authority is configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityArgs {
    pub sentry_address: String,
    pub trust_anchors_file: PathBuf,
    pub trust_domain: String,
}

/// Fully resolved configuration of one node. Built once, never mutated.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub id: String,
    pub namespace: String,
    pub log_level: String,
    pub replica_count: u32,
    pub listen_address: String,
    pub port: u16,
    pub healthz_port: u16,
    pub metrics_port: u16,
    pub initial_cluster: String,
    /// Parsed `initial_cluster`: node id to peer URL.
    pub peers: BTreeMap<String, String>,
    pub etcd_client_ports: Vec<String>,
    pub topology: ClusterTopology,
    pub data_dir: PathBuf,
    pub security: Option<SecurityArgs>,
    pub readiness_timeout: Duration,
    pub readiness_interval: Duration,
}

impl NodeConfig {
    /// Resolve `options` against freshly reserved `ports`.
    ///
    /// Exactly [`RESERVED_PORTS`] ports are claimed regardless of overrides so
    /// that port assignment does not depend on which overrides are set.
    pub fn resolve(
        options: &NodeOptions,
        ports: &mut Ports,
        id: String,
        data_dir: PathBuf,
        security: Option<SecurityArgs>,
    ) -> Result<Self> {
        let peer_port = ports.port()?;
        let port = ports.port()?;
        let healthz_port = ports.port()?;
        let metrics_port = ports.port()?;
        let client_port = ports.port()?;

        let initial_cluster = options
            .initial_cluster
            .clone()
            .unwrap_or_else(|| format!("{}=http://127.0.0.1:{}", id, peer_port));
        let etcd_client_ports = options
            .etcd_client_ports
            .clone()
            .unwrap_or_else(|| vec![format!("{}={}", id, client_port)]);

        let peers = parse_initial_cluster(&initial_cluster, &id)?;
        let topology = ClusterTopology::from_entries(&etcd_client_ports)?;

        Ok(Self {
            id,
            namespace: options.namespace.clone(),
            log_level: options.log_level.clone(),
            replica_count: options.replica_count,
            listen_address: options.listen_address.clone(),
            port: options.port.unwrap_or(port),
            healthz_port: options.healthz_port.unwrap_or(healthz_port),
            metrics_port: options.metrics_port.unwrap_or(metrics_port),
            initial_cluster,
            peers,
            etcd_client_ports,
            topology,
            data_dir,
            security,
            readiness_timeout: options.readiness_timeout,
            readiness_interval: options.readiness_interval,
        })
    }

    /// Command line flags for the scheduler binary.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--log-level={}", self.log_level),
            format!("--id={}", self.id),
            format!("--replica-count={}", self.replica_count),
            format!("--port={}", self.port),
            format!("--healthz-port={}", self.healthz_port),
            format!("--metrics-port={}", self.metrics_port),
            format!("--initial-cluster={}", self.initial_cluster),
            format!("--etcd-data-dir={}", self.data_dir.display()),
            format!("--etcd-client-ports={}", self.etcd_client_ports.join(",")),
            format!("--listen-address={}", self.listen_address),
        ];

        if let Some(security) = &self.security {
            args.push("--tls-enabled=true".to_string());
            args.push(format!("--sentry-address={}", security.sentry_address));
            args.push(format!(
                "--trust-anchors-file={}",
                security.trust_anchors_file.display()
            ));
            args.push(format!("--trust-domain={}", security.trust_domain));
        }

        args
    }

    /// Every port this node binds, in flag order.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports = vec![self.port, self.healthz_port, self.metrics_port];
        ports.extend(self.topology.client_port(&self.id));
        ports
    }
}

/// Parse `id=url[,id=url...]` and check `id` appears exactly once.
fn parse_initial_cluster(initial_cluster: &str, id: &str) -> Result<BTreeMap<String, String>> {
    let mut peers = BTreeMap::new();
    let mut own_entries = 0;

    for entry in initial_cluster.split(',') {
        let (peer_id, url) = entry
            .split_once('=')
            .ok_or_else(|| HarnessError::Config(format!("invalid initial cluster entry {:?}", entry)))?;
        let peer_id = peer_id.trim();
        if peer_id == id {
            own_entries += 1;
        }
        peers.insert(peer_id.to_string(), url.trim().to_string());
    }

    if own_entries != 1 {
        return Err(HarnessError::Config(format!(
            "node id {} appears {} times in initial cluster {:?}",
            id, own_entries, initial_cluster
        )));
    }

    Ok(peers)
}

/// Storage client port of every node in the cluster, keyed by node id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterTopology {
    client_ports: BTreeMap<String, u16>,
}

impl ClusterTopology {
    /// Parse individual `id=port` entries. An entry without exactly one `=`,
    /// or with a port that is not a number, is rejected.
    pub fn from_entries<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut client_ports = BTreeMap::new();

        for entry in entries {
            let entry = entry.as_ref();
            let parts: Vec<&str> = entry.split('=').collect();
            if parts.len() != 2 {
                return Err(HarnessError::InvalidTopologyEntry(entry.to_string()));
            }

            let node_id = parts[0].trim();
            let port: u16 = parts[1]
                .trim()
                .parse()
                .map_err(|_| HarnessError::InvalidTopologyEntry(entry.to_string()))?;
            client_ports.insert(node_id.to_string(), port);
        }

        Ok(Self { client_ports })
    }

    pub fn client_port(&self, node_id: &str) -> Option<u16> {
        self.client_ports.get(node_id).copied()
    }

    pub fn len(&self) -> usize {
        self.client_ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.client_ports.is_empty()
    }
}

impl FromStr for ClusterTopology {
    type Err = HarnessError;

    /// Parse a comma-separated `id=port` list. Blank input is an empty topology.
    fn from_str(s: &str) -> Result<Self> {
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        Self::from_entries(s.split(','))
    }
}

impl fmt::Display for ClusterTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries: Vec<String> = self
            .client_ports
            .iter()
            .map(|(id, port)| format!("{}={}", id, port))
            .collect();
        f.write_str(&entries.join(","))
    }
}
