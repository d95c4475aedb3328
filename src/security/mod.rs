//! Workload identity and mutual-TLS credentials.
//!
//! The identity-issuing service is an external collaborator reached through
//! [`CertificateAuthority`]. [`LocalAuthority`] implements it in-process for
//! tests, and [`SecuritySession`] keeps a workload's credentials fresh in the
//! background for as long as a client needs them.

mod authority;
mod session;

pub use authority::LocalAuthority;
pub use session::SecuritySession;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{HarnessError, Result};
use crate::tls::TlsIdentity;

/// App id the scheduler presents in its own workload identity.
pub const SCHEDULER_APP_ID: &str = "scheduler";

const MIN_REFRESH: Duration = Duration::from_millis(50);

/// Issues workload identities and publishes the trust anchors that verify them.
#[tonic::async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Address the scheduler process dials to request its own identity.
    fn address(&self) -> String;

    fn trust_domain(&self) -> String;

    /// Namespace the authority itself runs in. Sessions name it in every
    /// request as the control-plane namespace.
    fn namespace(&self) -> String;

    /// PEM bundle of root certificates.
    fn trust_anchors(&self) -> Vec<u8>;

    async fn sign(&self, request: &IdentityRequest) -> Result<WorkloadCredentials>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRequest {
    pub app_id: String,
    pub namespace: String,
    /// Namespace the requester expects the authority to run in.
    pub control_plane_namespace: Option<String>,
}

impl IdentityRequest {
    pub fn new(app_id: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            namespace: namespace.into(),
            control_plane_namespace: None,
        }
    }

    pub fn with_control_plane_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.control_plane_namespace = Some(namespace.into());
        self
    }
}

/// SPIFFE-style identity of a workload: `spiffe://<td>/ns/<namespace>/<app>`.
///
/// Certificates carry the DNS form `<app>.<namespace>.<td>` as their subject
/// alternative name, which is what TLS server-name verification checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerIdentity {
    trust_domain: String,
    namespace: String,
    app_id: String,
}

impl PeerIdentity {
    pub fn new(
        trust_domain: impl Into<String>,
        namespace: impl Into<String>,
        app_id: impl Into<String>,
    ) -> Result<Self> {
        let identity = Self {
            trust_domain: trust_domain.into(),
            namespace: namespace.into(),
            app_id: app_id.into(),
        };

        for (what, segment) in [
            ("trust domain", &identity.trust_domain),
            ("namespace", &identity.namespace),
            ("app id", &identity.app_id),
        ] {
            if segment.is_empty() || segment.contains(|c: char| c == '/' || c.is_whitespace()) {
                return Err(HarnessError::Security(format!(
                    "invalid {} {:?} in workload identity",
                    what, segment
                )));
            }
        }

        Ok(identity)
    }

    /// Identity the scheduler in `namespace` is expected to present.
    pub fn scheduler(trust_domain: impl Into<String>, namespace: impl Into<String>) -> Result<Self> {
        Self::new(trust_domain, namespace, SCHEDULER_APP_ID)
    }

    pub fn spiffe_id(&self) -> String {
        format!(
            "spiffe://{}/ns/{}/{}",
            self.trust_domain, self.namespace, self.app_id
        )
    }

    pub fn dns_name(&self) -> String {
        format!("{}.{}.{}", self.app_id, self.namespace, self.trust_domain)
    }

    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.spiffe_id())
    }
}

/// A signed workload certificate with its key and trust anchors.
#[derive(Clone)]
pub struct WorkloadCredentials {
    pub identity: PeerIdentity,
    pub cert_chain_pem: String,
    pub private_key_pem: String,
    pub trust_anchors_pem: String,
    pub expires_at: DateTime<Utc>,
}

impl WorkloadCredentials {
    /// How long to wait before requesting a replacement: half the remaining
    /// lifetime, never less than a short floor.
    pub fn refresh_after(&self) -> Duration {
        let remaining = (self.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        (remaining / 2).max(MIN_REFRESH)
    }

    pub fn tls_identity(&self) -> TlsIdentity {
        TlsIdentity::from_pem(
            &self.cert_chain_pem,
            &self.private_key_pem,
            &self.trust_anchors_pem,
        )
    }
}

impl fmt::Debug for WorkloadCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkloadCredentials")
            .field("identity", &self.identity.spiffe_id())
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_identity_forms() {
        let id = PeerIdentity::scheduler("public", "default").unwrap();
        assert_eq!(id.spiffe_id(), "spiffe://public/ns/default/scheduler");
        assert_eq!(id.dns_name(), "scheduler.default.public");
        assert_eq!(id.to_string(), id.spiffe_id());
    }

    #[test]
    fn rejects_empty_or_slashed_segments() {
        assert!(PeerIdentity::new("", "default", "app").is_err());
        assert!(PeerIdentity::new("public", "a/b", "app").is_err());
        assert!(PeerIdentity::new("public", "default", "").is_err());
    }

    #[test]
    fn refresh_after_is_half_remaining_lifetime() {
        let creds = WorkloadCredentials {
            identity: PeerIdentity::new("public", "default", "app").unwrap(),
            cert_chain_pem: String::new(),
            private_key_pem: String::new(),
            trust_anchors_pem: String::new(),
            expires_at: Utc::now() + chrono::Duration::seconds(60),
        };
        let refresh = creds.refresh_after();
        assert!(refresh <= Duration::from_secs(30));
        assert!(refresh > Duration::from_secs(25));
    }

    #[test]
    fn expired_credentials_refresh_at_floor() {
        let creds = WorkloadCredentials {
            identity: PeerIdentity::new("public", "default", "app").unwrap(),
            cert_chain_pem: String::new(),
            private_key_pem: String::new(),
            trust_anchors_pem: String::new(),
            expires_at: Utc::now() - chrono::Duration::seconds(5),
        };
        assert_eq!(creds.refresh_after(), MIN_REFRESH);
    }
}
