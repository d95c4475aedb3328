use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::client::{MtlsClient, NodeClient};
use crate::config::{NodeConfig, NodeOptions, SecurityArgs, NAMESPACE_ENV, RESERVED_PORTS};
use crate::error::{HarnessError, Result};
use crate::health;
use crate::metrics::{self, MetricsSnapshot};
use crate::ports::Ports;
use crate::process::{default_binary, ExecProcess, LaunchSpec, ProcessSupervisor};
use crate::security::{CertificateAuthority, IdentityRequest, PeerIdentity, SecuritySession};

const TRUST_ANCHORS_FILE: &str = "ca.pem";

/// Upper bound on connecting to the node's embedded storage.
pub const ETCD_DIAL_TIMEOUT: Duration = Duration::from_secs(40);

/// One scheduler cluster member under test.
///
/// Construction reserves ports and prepares configuration but starts
/// nothing. [`run`](Self::run) releases the ports and launches the process,
/// [`cleanup`](Self::cleanup) stops it. Both are safe to call from concurrent
/// tasks: only the first `run` launches, and only the first `cleanup` after
/// it stops.
pub struct SchedulerNode {
    config: NodeConfig,
    launch: LaunchSpec,
    supervisor: Arc<dyn ProcessSupervisor>,
    authority: Option<Arc<dyn CertificateAuthority>>,
    ports: Mutex<Ports>,
    running: AtomicBool,
    http: reqwest::Client,
    // Removed on drop.
    _data_dir: Option<TempDir>,
    _security_dir: Option<TempDir>,
}

impl SchedulerNode {
    pub fn new(options: NodeOptions) -> Result<Self> {
        let id = options
            .id
            .clone()
            .unwrap_or_else(|| format!("{}-0", Uuid::new_v4()));

        let mut ports = Ports::reserve(RESERVED_PORTS)?;

        let (data_dir_path, data_dir) = match &options.data_dir {
            Some(dir) => (dir.clone(), None),
            None => {
                let dir = tempfile::Builder::new()
                    .prefix("scheduler-data-")
                    .tempdir()?;
                set_mode(dir.path(), 0o700)?;
                (dir.path().to_path_buf(), Some(dir))
            }
        };

        let (security, security_dir) = match &options.authority {
            Some(authority) => {
                let dir = tempfile::Builder::new()
                    .prefix("scheduler-security-")
                    .tempdir()?;
                let anchors = dir.path().join(TRUST_ANCHORS_FILE);
                std::fs::write(&anchors, authority.trust_anchors())?;
                set_mode(&anchors, 0o600)?;

                let args = SecurityArgs {
                    sentry_address: authority.address(),
                    trust_anchors_file: anchors,
                    trust_domain: authority.trust_domain(),
                };
                (Some(args), Some(dir))
            }
            None => (None, None),
        };

        let config = NodeConfig::resolve(&options, &mut ports, id, data_dir_path, security)?;

        let mut envs = vec![(NAMESPACE_ENV.to_string(), config.namespace.clone())];
        envs.extend(options.exec.envs.iter().cloned());

        let launch = LaunchSpec {
            program: options.exec.binary.clone().unwrap_or_else(default_binary),
            args: config.args(),
            envs,
        };

        let supervisor = match &options.exec.supervisor {
            Some(supervisor) => supervisor.clone(),
            None => Arc::new(ExecProcess::new().inherit_output(options.exec.inherit_output)),
        };

        tracing::info!(
            node_id = %config.id,
            port = config.port,
            healthz_port = config.healthz_port,
            metrics_port = config.metrics_port,
            tls = config.security.is_some(),
            "Configured scheduler node"
        );

        Ok(Self {
            config,
            launch,
            supervisor,
            authority: options.authority,
            ports: Mutex::new(ports),
            running: AtomicBool::new(false),
            http: health::http_client()?,
            _data_dir: data_dir,
            _security_dir: security_dir,
        })
    }

    /// Release the reserved ports and launch the process.
    ///
    /// A second call fails with [`HarnessError::AlreadyRunning`]. If the
    /// launch fails the node stays marked as running so that
    /// [`cleanup`](Self::cleanup) still reaps anything that was started.
    pub async fn run(&self) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(HarnessError::AlreadyRunning(self.config.id.clone()));
        }

        self.ports.lock().await.free();

        tracing::info!(
            node_id = %self.config.id,
            program = %self.launch.program.display(),
            "Starting scheduler"
        );
        self.supervisor.start(&self.launch).await
    }

    /// Stop the process. Only the first call after [`run`](Self::run) does
    /// anything.
    pub async fn cleanup(&self) -> Result<()> {
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        tracing::info!(node_id = %self.config.id, "Stopping scheduler");
        self.supervisor.stop().await
    }

    /// Poll `/healthz` until it answers 200.
    pub async fn wait_until_running(&self) -> Result<()> {
        self.ensure_running()?;
        health::wait_until_healthy(
            &self.http,
            &self.config.id,
            &self.healthz_url(),
            self.config.readiness_timeout,
            self.config.readiness_interval,
        )
        .await
    }

    /// Plain gRPC connection to the node's service port.
    pub async fn client(&self) -> Result<NodeClient> {
        self.ensure_running()?;
        NodeClient::connect(&self.address()).await
    }

    /// Mutually authenticated connection as workload `app_id`.
    ///
    /// The returned client owns a credential refresh task and must be closed
    /// with [`MtlsClient::close`].
    pub async fn client_mtls(&self, app_id: &str) -> Result<MtlsClient> {
        let authority = self
            .authority
            .clone()
            .ok_or_else(|| HarnessError::SecurityNotConfigured(self.config.id.clone()))?;
        self.ensure_running()?;

        let peer = PeerIdentity::scheduler(authority.trust_domain(), &self.config.namespace)?;
        let session = SecuritySession::start(
            authority,
            IdentityRequest::new(app_id, &self.config.namespace),
        );
        MtlsClient::connect(&self.address(), peer, session).await
    }

    /// Scrape and flatten `/metrics`.
    pub async fn metrics(&self) -> Result<MetricsSnapshot> {
        metrics::scrape(&self.http, &self.metrics_address()).await
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.config.port)
    }

    pub fn healthz_port(&self) -> u16 {
        self.config.healthz_port
    }

    pub fn healthz_url(&self) -> String {
        format!("http://127.0.0.1:{}/healthz", self.config.healthz_port)
    }

    pub fn metrics_port(&self) -> u16 {
        self.config.metrics_port
    }

    pub fn metrics_address(&self) -> String {
        format!("127.0.0.1:{}", self.config.metrics_port)
    }

    pub fn initial_cluster(&self) -> &str {
        &self.config.initial_cluster
    }

    /// This node's entry in the storage client port list.
    pub fn etcd_client_port(&self) -> Option<u16> {
        self.config.topology.client_port(&self.config.id)
    }

    pub fn etcd_client_address(&self) -> Option<String> {
        self.etcd_client_port()
            .map(|port| format!("127.0.0.1:{}", port))
    }

    /// Connect to the node's embedded storage to inspect what it persisted.
    pub async fn etcd_client(&self) -> Result<etcd_client::Client> {
        self.ensure_running()?;
        let addr = self.etcd_client_address().ok_or_else(|| {
            HarnessError::Config(format!(
                "node {} has no entry in its storage client ports",
                self.config.id
            ))
        })?;

        let options = etcd_client::ConnectOptions::new().with_connect_timeout(ETCD_DIAL_TIMEOUT);
        let connect = etcd_client::Client::connect([addr.as_str()], Some(options));
        match tokio::time::timeout(ETCD_DIAL_TIMEOUT, connect).await {
            Ok(connected) => {
                tracing::debug!(node_id = %self.config.id, addr = %addr, "Connected to storage");
                Ok(connected?)
            }
            Err(_) => Err(HarnessError::DialTimeout {
                addr,
                timeout: ETCD_DIAL_TIMEOUT,
            }),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    pub fn trust_anchors_file(&self) -> Option<&Path> {
        self.config
            .security
            .as_ref()
            .map(|s| s.trust_anchors_file.as_path())
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn launch_spec(&self) -> &LaunchSpec {
        &self.launch
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(HarnessError::NotRunning(self.config.id.clone()))
        }
    }
}

impl Drop for SchedulerNode {
    fn drop(&mut self) {
        if self.is_running() {
            tracing::warn!(node_id = %self.config.id, "Scheduler node dropped without cleanup");
        }
    }
}

impl std::fmt::Debug for SchedulerNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerNode")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::LocalAuthority;
    use std::collections::HashSet;
    use std::path::PathBuf;

    #[derive(Default)]
    struct NoopSupervisor {
        starts: std::sync::atomic::AtomicUsize,
        stops: std::sync::atomic::AtomicUsize,
    }

    #[tonic::async_trait]
    impl ProcessSupervisor for NoopSupervisor {
        async fn start(&self, _spec: &LaunchSpec) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn node_with(supervisor: Arc<NoopSupervisor>) -> SchedulerNode {
        SchedulerNode::new(NodeOptions::new().with_supervisor(supervisor)).unwrap()
    }

    #[test]
    fn defaults() {
        let node = SchedulerNode::new(NodeOptions::new()).unwrap();

        assert!(node.id().ends_with("-0"));
        assert_eq!(node.namespace(), "default");
        assert_eq!(node.config().log_level, "info");
        assert_eq!(node.config().replica_count, 1);
        assert_eq!(node.config().listen_address, "localhost");
        assert!(!node.is_running());

        let ports: HashSet<u16> = node.config().ports().into_iter().collect();
        assert_eq!(ports.len(), 4);

        let expected = format!("{}=http://127.0.0.1:", node.id());
        assert!(node.initial_cluster().starts_with(&expected));
        assert!(node.etcd_client_port().is_some());
        assert_eq!(node.address(), format!("127.0.0.1:{}", node.port()));
    }

    #[test]
    fn random_ids_are_unique() {
        let a = SchedulerNode::new(NodeOptions::new()).unwrap();
        let b = SchedulerNode::new(NodeOptions::new()).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[cfg(unix)]
    #[test]
    fn data_dir_is_private_and_removed_on_drop() {
        use std::os::unix::fs::PermissionsExt;

        let node = SchedulerNode::new(NodeOptions::new()).unwrap();
        let dir = node.data_dir().to_path_buf();
        let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);

        drop(node);
        assert!(!dir.exists());
    }

    #[test]
    fn explicit_data_dir_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let node = SchedulerNode::new(NodeOptions::new().with_data_dir(dir.path())).unwrap();
        assert_eq!(node.data_dir(), dir.path());
        drop(node);
        assert!(dir.path().exists());
    }

    #[test]
    fn launch_spec_carries_flags_and_namespace() {
        let node = SchedulerNode::new(
            NodeOptions::new()
                .with_id("node-a")
                .with_namespace("ns1")
                .with_binary("/opt/scheduler")
                .with_env("EXTRA", "1"),
        )
        .unwrap();

        let spec = node.launch_spec();
        assert_eq!(spec.program, PathBuf::from("/opt/scheduler"));
        assert_eq!(spec.env(NAMESPACE_ENV), Some("ns1"));
        assert_eq!(spec.env("EXTRA"), Some("1"));
        assert_eq!(spec.flag("id"), Some("node-a"));
        assert_eq!(spec.flag("port"), Some(node.port().to_string().as_str()));
        assert!(spec.flag("tls-enabled").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn security_writes_private_trust_anchors() {
        use std::os::unix::fs::PermissionsExt;

        let authority = Arc::new(LocalAuthority::new("public", "default").unwrap());
        let node =
            SchedulerNode::new(NodeOptions::new().with_authority(authority.clone())).unwrap();

        let file = node.trust_anchors_file().unwrap();
        assert_eq!(std::fs::read(file).unwrap(), authority.trust_anchors());
        let mode = std::fs::metadata(file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let spec = node.launch_spec();
        assert_eq!(spec.flag("tls-enabled"), Some("true"));
        assert_eq!(spec.flag("trust-domain"), Some("public"));
        assert_eq!(spec.flag("sentry-address"), Some("localhost:50001"));
    }

    #[test]
    fn malformed_topology_fails_construction() {
        let result = SchedulerNode::new(
            NodeOptions::new()
                .with_id("a")
                .with_etcd_client_ports(["a=1", "b"]),
        );
        assert!(matches!(result, Err(HarnessError::InvalidTopologyEntry(_))));
    }

    #[tokio::test]
    async fn run_twice_fails_and_cleanup_is_idempotent() {
        let supervisor = Arc::new(NoopSupervisor::default());
        let node = node_with(supervisor.clone());

        node.run().await.unwrap();
        assert!(node.is_running());
        assert!(matches!(node.run().await, Err(HarnessError::AlreadyRunning(_))));
        assert_eq!(supervisor.starts.load(Ordering::SeqCst), 1);

        node.cleanup().await.unwrap();
        node.cleanup().await.unwrap();
        assert!(!node.is_running());
        assert_eq!(supervisor.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cleanup_before_run_is_a_noop() {
        let supervisor = Arc::new(NoopSupervisor::default());
        let node = node_with(supervisor.clone());
        node.cleanup().await.unwrap();
        assert_eq!(supervisor.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn run_releases_reserved_ports() {
        let node = node_with(Arc::new(NoopSupervisor::default()));
        assert!(std::net::TcpListener::bind(("127.0.0.1", node.port())).is_err());

        node.run().await.unwrap();
        assert!(std::net::TcpListener::bind(("127.0.0.1", node.port())).is_ok());
        node.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn operations_before_run_are_rejected() {
        let authority = Arc::new(LocalAuthority::new("public", "default").unwrap());
        let node = SchedulerNode::new(
            NodeOptions::new()
                .with_authority(authority)
                .with_supervisor(Arc::new(NoopSupervisor::default())),
        )
        .unwrap();

        assert!(matches!(node.wait_until_running().await, Err(HarnessError::NotRunning(_))));
        assert!(matches!(node.client().await, Err(HarnessError::NotRunning(_))));
        assert!(matches!(
            node.client_mtls("app").await,
            Err(HarnessError::NotRunning(_))
        ));
        assert!(matches!(node.etcd_client().await, Err(HarnessError::NotRunning(_))));
    }

    #[tokio::test]
    async fn etcd_client_needs_own_client_port() {
        let node = SchedulerNode::new(
            NodeOptions::new()
                .with_id("a")
                .with_etcd_client_ports(["b=2379"])
                .with_supervisor(Arc::new(NoopSupervisor::default())),
        )
        .unwrap();
        assert_eq!(node.etcd_client_address(), None);

        node.run().await.unwrap();
        assert!(matches!(node.etcd_client().await, Err(HarnessError::Config(_))));
        node.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn mtls_client_requires_security() {
        let node = node_with(Arc::new(NoopSupervisor::default()));
        node.run().await.unwrap();
        assert!(matches!(
            node.client_mtls("app").await,
            Err(HarnessError::SecurityNotConfigured(_))
        ));
        node.cleanup().await.unwrap();
    }
}
