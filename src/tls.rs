//! TLS material for tonic clients and servers.
//!
//! This module turns PEM encoded workload credentials into the tonic types
//! used to configure mutual TLS on either end of a connection.

use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

/// Loaded TLS materials ready for use with tonic.
///
/// Contains both the workload's identity (certificate chain + private key)
/// and the trust anchors used to verify the peer.
#[derive(Clone)]
pub struct TlsIdentity {
    identity: Identity,
    ca_cert: Certificate,
}

impl TlsIdentity {
    pub fn from_pem(
        cert_chain_pem: impl AsRef<[u8]>,
        private_key_pem: impl AsRef<[u8]>,
        trust_anchors_pem: impl AsRef<[u8]>,
    ) -> Self {
        Self {
            identity: Identity::from_pem(cert_chain_pem, private_key_pem),
            ca_cert: Certificate::from_pem(trust_anchors_pem),
        }
    }

    /// Create server TLS config with client certificate verification (mTLS).
    ///
    /// The returned config:
    /// - Presents this workload's certificate to clients
    /// - Requires clients to present a certificate signed by the trust anchors
    pub fn server_tls_config(&self) -> ServerTlsConfig {
        ServerTlsConfig::new()
            .identity(self.identity.clone())
            .client_ca_root(self.ca_cert.clone())
    }

    /// Create client TLS config for dialing a peer whose certificate must
    /// carry `server_name`.
    pub fn client_tls_config(&self, server_name: &str) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .domain_name(server_name)
            .ca_certificate(self.ca_cert.clone())
            .identity(self.identity.clone())
    }
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity").finish_non_exhaustive()
    }
}
