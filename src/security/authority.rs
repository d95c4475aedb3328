//! In-process certificate authority backed by rcgen.

use std::time::Duration;

use chrono::Utc;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};

use super::{CertificateAuthority, IdentityRequest, PeerIdentity, WorkloadCredentials};
use crate::error::{HarnessError, Result};

const DEFAULT_TTL: Duration = Duration::from_secs(3600);
const DEFAULT_ADDRESS: &str = "localhost:50001";

/// An in-process certificate authority.
///
/// Generates a self-signed root on construction and signs workload
/// certificates on request. Certificates carry the workload's DNS identity
/// and are valid for both server and client authentication.
pub struct LocalAuthority {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    ca_pem: String,
    trust_domain: String,
    namespace: String,
    address: String,
    ttl: Duration,
}

impl LocalAuthority {
    pub fn new(trust_domain: impl Into<String>, namespace: impl Into<String>) -> Result<Self> {
        let trust_domain = trust_domain.into();

        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(
            DnType::CommonName,
            DnValue::Utf8String(format!("{} root", trust_domain)),
        );

        let ca_key = KeyPair::generate()?;
        let ca_cert = params.self_signed(&ca_key)?;
        let ca_pem = ca_cert.pem();

        Ok(Self {
            ca_cert,
            ca_key,
            ca_pem,
            trust_domain,
            namespace: namespace.into(),
            address: DEFAULT_ADDRESS.to_string(),
            ttl: DEFAULT_TTL,
        })
    }

    /// Address advertised to scheduler processes as their identity endpoint.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Lifetime used to schedule credential refreshes.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sign a certificate for `request` without going through the async trait.
    ///
    /// A request that names a control-plane namespace other than this
    /// authority's is refused.
    pub fn issue(&self, request: &IdentityRequest) -> Result<WorkloadCredentials> {
        if let Some(expected) = &request.control_plane_namespace {
            if *expected != self.namespace {
                return Err(HarnessError::Security(format!(
                    "{} expects the authority in namespace {}, it runs in {}",
                    request.app_id, expected, self.namespace
                )));
            }
        }

        let identity = PeerIdentity::new(&self.trust_domain, &request.namespace, &request.app_id)?;

        let mut params = CertificateParams::new(vec![identity.dns_name()])?;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(
            DnType::CommonName,
            DnValue::Utf8String(identity.app_id().to_string()),
        );
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key)?;

        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| HarnessError::Security(format!("invalid credential ttl: {}", e)))?;

        tracing::debug!(identity = %identity, "Issued workload certificate");

        Ok(WorkloadCredentials {
            identity,
            cert_chain_pem: cert.pem(),
            private_key_pem: key.serialize_pem(),
            trust_anchors_pem: self.ca_pem.clone(),
            expires_at: Utc::now() + ttl,
        })
    }
}

#[tonic::async_trait]
impl CertificateAuthority for LocalAuthority {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn trust_domain(&self) -> String {
        self.trust_domain.clone()
    }

    fn namespace(&self) -> String {
        self.namespace.clone()
    }

    fn trust_anchors(&self) -> Vec<u8> {
        self.ca_pem.as_bytes().to_vec()
    }

    async fn sign(&self, request: &IdentityRequest) -> Result<WorkloadCredentials> {
        self.issue(request)
    }
}
