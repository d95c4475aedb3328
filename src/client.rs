//! gRPC connections to a running node.
//!
//! Both clients hand out the raw tonic [`Channel`], which generated service
//! stubs wrap directly (`SchedulerClient::new(client.channel())`). The health
//! service is always available through [`NodeClient::check_health`].

use std::time::Duration;

use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;

use crate::error::{HarnessError, Result};
use crate::security::{PeerIdentity, SecuritySession};

/// Upper bound on establishing a connection, including the TLS handshake.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Plain gRPC client. Dropping it closes the connection.
#[derive(Debug, Clone)]
pub struct NodeClient {
    channel: Channel,
}

impl NodeClient {
    /// Eagerly connect to `addr` (`host:port`) without TLS.
    pub async fn connect(addr: &str) -> Result<Self> {
        let endpoint = Endpoint::from_shared(format!("http://{}", addr))?;
        let channel = dial(addr, endpoint).await?;
        Ok(Self { channel })
    }

    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// Query the standard gRPC health service. An empty `service` asks about
    /// the server as a whole.
    pub async fn check_health(&self, service: &str) -> Result<ServingStatus> {
        check_health(self.channel.clone(), service).await
    }
}

/// Mutually authenticated gRPC client.
///
/// Owns the security session that keeps its credentials fresh. Call
/// [`MtlsClient::close`] to tear it down. Dropping the client instead closes
/// the channel and only signals the refresh task to stop.
pub struct MtlsClient {
    // Field order is drop order: the channel goes before its credentials.
    channel: Channel,
    session: SecuritySession,
    peer: PeerIdentity,
}

impl MtlsClient {
    /// Wait for the session's first credentials, then dial `addr` expecting
    /// the server to present `peer`. On any failure the session is shut down
    /// before the error is returned.
    pub async fn connect(
        addr: &str,
        peer: PeerIdentity,
        mut session: SecuritySession,
    ) -> Result<Self> {
        let dialed = async {
            let creds = session.credentials().await?;
            let tls: ClientTlsConfig = creds.tls_identity().client_tls_config(&peer.dns_name());
            let endpoint = Endpoint::from_shared(format!("https://{}", addr))?.tls_config(tls)?;
            dial(addr, endpoint).await
        }
        .await;

        match dialed {
            Ok(channel) => {
                tracing::debug!(addr = %addr, peer = %peer, "Connected with mTLS");
                Ok(Self {
                    channel,
                    session,
                    peer,
                })
            }
            Err(e) => {
                if let Err(shutdown_err) = session.shutdown().await {
                    tracing::warn!(error = %shutdown_err, "Security session failed during dial teardown");
                }
                Err(e)
            }
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    pub async fn check_health(&self, service: &str) -> Result<ServingStatus> {
        check_health(self.channel(), service).await
    }

    /// Identity the server was verified against.
    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    /// Close the connection, then stop the credential refresh task and wait
    /// for it. A refresh failure is returned here.
    pub async fn close(self) -> Result<()> {
        let Self {
            channel,
            session,
            peer,
        } = self;
        drop(channel);
        tracing::debug!(peer = %peer, "Closing mTLS client");
        session.shutdown().await
    }
}

impl std::fmt::Debug for MtlsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MtlsClient")
            .field("peer", &self.peer.spiffe_id())
            .finish_non_exhaustive()
    }
}

async fn dial(addr: &str, endpoint: Endpoint) -> Result<Channel> {
    let endpoint = endpoint.connect_timeout(DIAL_TIMEOUT);
    match tokio::time::timeout(DIAL_TIMEOUT, endpoint.connect()).await {
        Ok(connected) => Ok(connected?),
        Err(_) => Err(HarnessError::DialTimeout {
            addr: addr.to_string(),
            timeout: DIAL_TIMEOUT,
        }),
    }
}

async fn check_health(channel: Channel, service: &str) -> Result<ServingStatus> {
    let mut client = HealthClient::new(channel);
    let resp = client
        .check(HealthCheckRequest {
            service: service.to_string(),
        })
        .await?;
    Ok(ServingStatus::try_from(resp.into_inner().status).unwrap_or(ServingStatus::Unknown))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let mut ports = crate::ports::Ports::reserve(1).unwrap();
        let port = ports.port().unwrap();
        ports.free();

        let result = NodeClient::connect(&format!("127.0.0.1:{}", port)).await;
        assert!(matches!(
            result,
            Err(HarnessError::Transport(_)) | Err(HarnessError::DialTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_address_is_rejected() {
        let result = NodeClient::connect("not a uri").await;
        assert!(result.is_err());
    }
}
