//! Background credential refresh for one workload identity.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{CertificateAuthority, IdentityRequest, WorkloadCredentials};
use crate::error::{HarnessError, Result};

const CREDENTIALS_TIMEOUT: Duration = Duration::from_secs(15);

/// A workload's credentials, kept fresh by a background task.
///
/// The refresh task runs until [`SecuritySession::shutdown`] cancels it and
/// waits for it to finish. A task failure surfaces exactly once: from
/// [`SecuritySession::credentials`] if no credentials were ever issued,
/// otherwise from [`SecuritySession::join`].
pub struct SecuritySession {
    request: IdentityRequest,
    cancel: CancellationToken,
    handle: Option<JoinHandle<Result<()>>>,
    credentials: watch::Receiver<Option<WorkloadCredentials>>,
}

impl SecuritySession {
    /// Spawn the refresh task for `request`. Must be called within a tokio runtime.
    ///
    /// Requests that do not name a control-plane namespace get the
    /// authority's own.
    pub fn start(authority: Arc<dyn CertificateAuthority>, mut request: IdentityRequest) -> Self {
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(None);

        let control_plane = request
            .control_plane_namespace
            .get_or_insert_with(|| authority.namespace())
            .clone();
        tracing::debug!(
            app_id = %request.app_id,
            namespace = %request.namespace,
            control_plane = %control_plane,
            "Starting security session"
        );

        let handle = tokio::spawn(refresh_loop(
            authority,
            request.clone(),
            tx,
            cancel.clone(),
        ));

        Self {
            request,
            cancel,
            handle: Some(handle),
            credentials: rx,
        }
    }

    pub fn request(&self) -> &IdentityRequest {
        &self.request
    }

    /// Wait for the first credentials, or return the latest ones.
    pub async fn credentials(&mut self) -> Result<WorkloadCredentials> {
        let waited = tokio::time::timeout(
            CREDENTIALS_TIMEOUT,
            self.credentials.wait_for(Option::is_some),
        )
        .await
        .map(|received| received.map(|creds| (*creds).clone()));

        match waited {
            Ok(Ok(Some(creds))) => Ok(creds),
            Ok(Ok(None)) => Err(HarnessError::Security("credentials vanished".to_string())),
            Ok(Err(_)) => {
                // Sender dropped: the refresh task has exited. Collect its result.
                self.join_task().await?;
                Err(HarnessError::Security(format!(
                    "refresh task for {} exited before issuing credentials",
                    self.request.app_id
                )))
            }
            Err(_) => Err(HarnessError::Security(format!(
                "no credentials for {} within {:?}",
                self.request.app_id, CREDENTIALS_TIMEOUT
            ))),
        }
    }

    /// Signal the refresh task to stop. Does not wait for it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the refresh task to finish and return its result.
    pub async fn join(mut self) -> Result<()> {
        self.join_task().await
    }

    /// Cancel the refresh task, then wait for it to acknowledge.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel();
        self.join().await
    }

    async fn join_task(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => handle.await?,
            None => Ok(()),
        }
    }
}

impl Drop for SecuritySession {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            if !handle.is_finished() {
                tracing::warn!(
                    app_id = %self.request.app_id,
                    "Security session dropped without shutdown, cancelling refresh task"
                );
            }
            self.cancel.cancel();
        }
    }
}

async fn refresh_loop(
    authority: Arc<dyn CertificateAuthority>,
    request: IdentityRequest,
    tx: watch::Sender<Option<WorkloadCredentials>>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let creds = tokio::select! {
            _ = cancel.cancelled() => break,
            signed = authority.sign(&request) => signed?,
        };

        let refresh_in = creds.refresh_after();
        tracing::debug!(
            identity = %creds.identity,
            refresh_in = ?refresh_in,
            "Workload credentials refreshed"
        );
        tx.send_replace(Some(creds));

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(refresh_in) => {}
        }
    }

    tracing::debug!(app_id = %request.app_id, "Security session stopped");
    Ok(())
}
