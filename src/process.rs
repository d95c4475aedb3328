//! Supervision of the external scheduler process.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::error::{HarnessError, Result};

/// Environment variable consulted for the scheduler binary path.
pub const BINARY_ENV: &str = "SCHEDULER_BINARY";

const DEFAULT_BINARY: &str = "scheduler";
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything needed to launch one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl LaunchSpec {
    /// Value of a `--name=value` argument, if present.
    pub fn flag(&self, name: &str) -> Option<&str> {
        let prefix = format!("--{}=", name);
        self.args.iter().find_map(|arg| arg.strip_prefix(&prefix))
    }

    pub fn env(&self, key: &str) -> Option<&str> {
        self.envs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Resolve the scheduler binary: `SCHEDULER_BINARY` if set, else `scheduler` on `PATH`.
pub fn default_binary() -> PathBuf {
    std::env::var_os(BINARY_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BINARY))
}

/// Starts and stops the process behind a test node.
///
/// Implementations are shared with the controller through an `Arc`, so both
/// methods take `&self`.
#[tonic::async_trait]
pub trait ProcessSupervisor: Send + Sync {
    async fn start(&self, spec: &LaunchSpec) -> Result<()>;

    /// Terminate and reap the process. Stopping a supervisor with nothing
    /// running is a no-op.
    async fn stop(&self) -> Result<()>;
}

/// Runs the process as a child of the test binary.
///
/// The child is killed when the supervisor is dropped, so an aborted test
/// does not leave a stray scheduler behind.
#[derive(Debug, Default)]
pub struct ExecProcess {
    child: Mutex<Option<Child>>,
    inherit_output: bool,
}

impl ExecProcess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward the child's stdout/stderr to the test output instead of
    /// discarding it.
    pub fn inherit_output(mut self, inherit: bool) -> Self {
        self.inherit_output = inherit;
        self
    }

    /// OS process id of the running child.
    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(Child::id)
    }

    pub async fn is_alive(&self) -> bool {
        match self.child.lock().await.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn stdio(&self) -> Stdio {
        if self.inherit_output {
            Stdio::inherit()
        } else {
            Stdio::null()
        }
    }
}

#[tonic::async_trait]
impl ProcessSupervisor for ExecProcess {
    async fn start(&self, spec: &LaunchSpec) -> Result<()> {
        let mut slot = self.child.lock().await;
        if slot.is_some() {
            return Err(HarnessError::AlreadyRunning(
                spec.program.display().to_string(),
            ));
        }

        let child = Command::new(&spec.program)
            .args(&spec.args)
            .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(self.stdio())
            .stderr(self.stdio())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| HarnessError::Spawn {
                program: spec.program.display().to_string(),
                source,
            })?;

        tracing::info!(
            program = %spec.program.display(),
            pid = ?child.id(),
            "Started process"
        );

        *slot = Some(child);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        let pid = child.id();
        // Already exited is fine; we only care that it is gone.
        if let Err(e) = child.start_kill() {
            tracing::debug!(pid = ?pid, error = %e, "Kill signal not delivered");
        }

        match tokio::time::timeout(STOP_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(pid = ?pid, %status, "Process stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(HarnessError::Io(e)),
            Err(_) => {
                tracing::warn!(pid = ?pid, timeout = ?STOP_TIMEOUT, "Process did not exit after kill");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(args: &[&str]) -> LaunchSpec {
        LaunchSpec {
            program: PathBuf::from("scheduler"),
            args: args.iter().map(|a| a.to_string()).collect(),
            envs: vec![("NAMESPACE".to_string(), "default".to_string())],
        }
    }

    #[test]
    fn flag_lookup_matches_whole_name() {
        let spec = spec(&["--port=1", "--healthz-port=2", "--metrics-port=3"]);
        assert_eq!(spec.flag("port"), Some("1"));
        assert_eq!(spec.flag("healthz-port"), Some("2"));
        assert_eq!(spec.flag("missing"), None);
    }

    #[test]
    fn env_lookup() {
        let spec = spec(&[]);
        assert_eq!(spec.env("NAMESPACE"), Some("default"));
        assert_eq!(spec.env("OTHER"), None);
    }

    #[tokio::test]
    async fn stop_without_start_is_noop() {
        let process = ExecProcess::new();
        process.stop().await.unwrap();
        assert!(!process.is_alive().await);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let process = ExecProcess::new();
        let spec = LaunchSpec {
            program: PathBuf::from("/nonexistent/scheduler-binary"),
            args: Vec::new(),
            envs: Vec::new(),
        };

        let result = process.start(&spec).await;
        assert!(matches!(result, Err(HarnessError::Spawn { .. })));
        assert!(!process.is_alive().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_and_stop_child() {
        let process = ExecProcess::new();
        let spec = LaunchSpec {
            program: PathBuf::from("sleep"),
            args: vec!["30".to_string()],
            envs: Vec::new(),
        };

        process.start(&spec).await.unwrap();
        assert!(process.is_alive().await);
        assert!(process.pid().await.is_some());

        let again = process.start(&spec).await;
        assert!(matches!(again, Err(HarnessError::AlreadyRunning(_))));

        process.stop().await.unwrap();
        assert!(!process.is_alive().await);
        process.stop().await.unwrap();
    }
}
