//! Identity issuance service.
//!
//! Orchestrates entry lookup, evidence verification, policy evaluation and
//! credential minting. The service holds only read-only state (policy,
//! entries, CA), so concurrent calls need no locking.
//!
//! # Attested claims
//!
//! Claims are attached to a response only when all of these hold:
//!
//! 1. the unified identity feature gate is enabled,
//! 2. evidence was submitted,
//! 3. the verifier and the policy engine both accepted it.
//!
//! Evidence that was submitted but could not be verified never turns into an
//! unattested credential.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::claims::AttestedClaims;
use crate::evidence::{EvidenceBundle, EvidenceError};
use crate::pki::{CaError, CertificateAuthority, Credential, ParsedCsr};
use crate::policy::PolicyEngine;
use crate::registry::EntryStore;
use crate::verifier::{AttestationVerifier, VerifierError};

/// Default time allowed for one verifier round trip.
pub const DEFAULT_VERIFIER_TIMEOUT: Duration = Duration::from_secs(60);

/// Default credential lifetime.
pub const DEFAULT_CREDENTIAL_TTL: Duration = Duration::from_secs(3600);

/// Per-item outcome reported by the issuance RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssuanceStatus {
    Ok,
    NotFound,
    PermissionDenied,
    InvalidArgument,
    Internal,
}

#[derive(Debug, Error)]
pub enum IssuanceError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("registration entry not found: {0}")]
    EntryNotFound(String),

    #[error("malformed evidence: {0}")]
    MalformedEvidence(#[from] EvidenceError),

    #[error("stale or replayed nonce: {0}")]
    StaleNonce(String),

    #[error("attestation failed: {0}")]
    AttestationFailed(String),

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("attestation verifier unavailable: {0}")]
    VerifierUnavailable(String),

    #[error("credential minting failed: {0}")]
    Minting(String),
}

impl IssuanceError {
    pub fn status(&self) -> IssuanceStatus {
        match self {
            IssuanceError::InvalidRequest(_) => IssuanceStatus::InvalidArgument,
            IssuanceError::EntryNotFound(_) => IssuanceStatus::NotFound,
            IssuanceError::MalformedEvidence(_)
            | IssuanceError::StaleNonce(_)
            | IssuanceError::AttestationFailed(_)
            | IssuanceError::PolicyViolation(_) => IssuanceStatus::PermissionDenied,
            IssuanceError::VerifierUnavailable(_) | IssuanceError::Minting(_) => {
                IssuanceStatus::Internal
            }
        }
    }
}

impl From<VerifierError> for IssuanceError {
    fn from(err: VerifierError) -> Self {
        match err {
            VerifierError::Rejected(reason) => IssuanceError::AttestationFailed(reason),
            other => IssuanceError::VerifierUnavailable(other.to_string()),
        }
    }
}

impl From<CaError> for IssuanceError {
    fn from(err: CaError) -> Self {
        match err {
            CaError::InvalidCsr(reason) => IssuanceError::InvalidRequest(format!("CSR: {}", reason)),
            other => IssuanceError::Minting(other.to_string()),
        }
    }
}

/// Constructor-injected switches; nothing is read from globals.
#[derive(Debug, Clone)]
pub struct IssuanceConfig {
    /// Feature gate for attested issuance.
    pub unified_identity_enabled: bool,
    pub verifier_timeout: Duration,
    pub default_ttl: Duration,
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        Self {
            unified_identity_enabled: false,
            verifier_timeout: DEFAULT_VERIFIER_TIMEOUT,
            default_ttl: DEFAULT_CREDENTIAL_TTL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IssuanceRequest {
    pub entry_id: String,
    pub csr: Vec<u8>,
    pub evidence: Option<EvidenceBundle>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IssuedCredential {
    pub credential: Credential,
    pub attested_claims: Option<AttestedClaims>,
}

pub struct IssuanceService {
    config: IssuanceConfig,
    verifier: Arc<dyn AttestationVerifier>,
    policy: PolicyEngine,
    entries: Arc<dyn EntryStore>,
    ca: Arc<CertificateAuthority>,
}

impl IssuanceService {
    pub fn new(
        config: IssuanceConfig,
        verifier: Arc<dyn AttestationVerifier>,
        policy: PolicyEngine,
        entries: Arc<dyn EntryStore>,
        ca: Arc<CertificateAuthority>,
    ) -> Self {
        info!(
            "STATUS: IssuanceService :: unified identity {}",
            if config.unified_identity_enabled { "ENABLED" } else { "DISABLED" }
        );
        Self {
            config,
            verifier,
            policy,
            entries,
            ca,
        }
    }

    pub fn feature_gate_enabled(&self) -> bool {
        self.config.unified_identity_enabled
    }

    pub fn certificate_authority(&self) -> &CertificateAuthority {
        &self.ca
    }

    /// Issue a credential for `entry_id`, attested when evidence is present
    /// and the feature gate is on.
    #[instrument(skip(self, csr, evidence), fields(entry_id = %entry_id))]
    pub async fn issue_x509(
        &self,
        entry_id: &str,
        csr: &[u8],
        evidence: Option<&EvidenceBundle>,
    ) -> Result<IssuedCredential, IssuanceError> {
        if entry_id.is_empty() {
            return Err(IssuanceError::InvalidRequest("missing entry id".into()));
        }
        if csr.is_empty() {
            return Err(IssuanceError::InvalidRequest("missing CSR".into()));
        }
        let entry = self
            .entries
            .fetch(entry_id)
            .ok_or_else(|| IssuanceError::EntryNotFound(entry_id.to_string()))?;
        let csr = ParsedCsr::from_der(csr)?;

        let claims = match evidence {
            Some(bundle) if self.feature_gate_enabled() => Some(self.attest(bundle).await?),
            Some(_) => {
                debug!("IssuanceService :: feature gate off, ignoring evidence");
                None
            }
            None => None,
        };

        let ttl = entry.ttl.unwrap_or(self.config.default_ttl);
        self.mint(&entry.spiffe_id, csr, ttl, claims)
    }

    /// Process each request on its own; one denial never affects siblings.
    pub async fn batch_issue(
        &self,
        requests: &[IssuanceRequest],
    ) -> Vec<Result<IssuedCredential, IssuanceError>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let result = self
                .issue_x509(&request.entry_id, &request.csr, request.evidence.as_ref())
                .await;
            if let Err(e) = &result {
                warn!(
                    "IssuanceService :: entry {} denied ({:?}): {}",
                    request.entry_id,
                    e.status(),
                    e
                );
            }
            results.push(result);
        }
        results
    }

    /// Verify evidence and apply policy. Fails closed on every error path.
    pub async fn attest(&self, bundle: &EvidenceBundle) -> Result<AttestedClaims, IssuanceError> {
        bundle.validate()?;

        let claims = match tokio::time::timeout(
            self.config.verifier_timeout,
            self.verifier.verify_evidence(bundle),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    "IssuanceService :: verifier timed out after {:?}, failing closed",
                    self.config.verifier_timeout
                );
                return Err(VerifierError::Timeout(self.config.verifier_timeout).into());
            }
        };

        let decision = self.policy.evaluate(&claims);
        if !decision.allowed {
            warn!("IssuanceService :: policy denied: {}", decision.reason);
            return Err(IssuanceError::PolicyViolation(decision.reason));
        }
        Ok(claims)
    }

    pub(crate) fn mint(
        &self,
        identity_uri: &str,
        csr: ParsedCsr,
        ttl: Duration,
        claims: Option<AttestedClaims>,
    ) -> Result<IssuedCredential, IssuanceError> {
        let credential = self.ca.mint(identity_uri, csr, ttl, claims.as_ref())?;
        info!(
            "IssuanceService :: minted {} serial={} attested={}",
            identity_uri,
            credential.serial,
            claims.is_some()
        );
        Ok(IssuedCredential {
            credential,
            attested_claims: claims,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::HostIntegrityStatus;
    use crate::evidence::generate_nonce;
    use crate::registry::{RegistrationEntry, StaticEntryStore};
    use async_trait::async_trait;
    use sovereign_core::PolicyConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedVerifier {
        claims: AttestedClaims,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AttestationVerifier for FixedVerifier {
        async fn verify_evidence(&self, _: &EvidenceBundle) -> Result<AttestedClaims, VerifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.claims.clone())
        }
    }

    fn bundle() -> EvidenceBundle {
        EvidenceBundle {
            tpm_signed_quote: vec![1, 2, 3],
            challenge_nonce: generate_nonce(),
            app_key_public: rcgen::KeyPair::generate().unwrap().public_key_pem(),
            app_key_certificate: None,
            workload_code_hash: "sha256:abc".to_string(),
        }
    }

    fn csr() -> Vec<u8> {
        let key = rcgen::KeyPair::generate().unwrap();
        rcgen::CertificateParams::default()
            .serialize_request(&key)
            .unwrap()
            .der()
            .to_vec()
    }

    fn service(gate: bool, geo: &str) -> (IssuanceService, Arc<FixedVerifier>) {
        let verifier = Arc::new(FixedVerifier {
            claims: AttestedClaims {
                geolocation: Some(geo.to_string()),
                host_integrity_status: HostIntegrityStatus::PassedAllChecks,
                accelerator_health: None,
            },
            calls: AtomicUsize::new(0),
        });
        let entries = StaticEntryStore::new([RegistrationEntry {
            id: "workload-007".to_string(),
            spiffe_id: "spiffe://sovereign.example/workload/007".to_string(),
            parent_id: "spiffe://sovereign.example/spire/agent/a1".to_string(),
            selectors: vec![],
            ttl: None,
        }]);
        let ca = CertificateAuthority::generate("Test CA", "sovereign.example").unwrap();
        let service = IssuanceService::new(
            IssuanceConfig {
                unified_identity_enabled: gate,
                ..Default::default()
            },
            verifier.clone(),
            PolicyEngine::new(PolicyConfig {
                allowed_geolocations: vec!["Spain:*".to_string()],
                ..Default::default()
            }),
            Arc::new(entries),
            Arc::new(ca),
        );
        (service, verifier)
    }

    #[tokio::test]
    async fn test_gate_off_ignores_evidence() {
        let (service, verifier) = service(false, "Germany: Berlin");
        let issued = service
            .issue_x509("workload-007", &csr(), Some(&bundle()))
            .await
            .unwrap();
        assert!(issued.attested_claims.is_none());
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_gate_on_without_evidence() {
        let (service, _) = service(true, "Spain: Madrid");
        let issued = service.issue_x509("workload-007", &csr(), None).await.unwrap();
        assert!(issued.attested_claims.is_none());
    }

    #[tokio::test]
    async fn test_missing_fields_are_invalid() {
        let (service, _) = service(true, "Spain: Madrid");
        let err = service.issue_x509("", &csr(), None).await.unwrap_err();
        assert_eq!(err.status(), IssuanceStatus::InvalidArgument);
        let err = service.issue_x509("workload-007", &[], None).await.unwrap_err();
        assert_eq!(err.status(), IssuanceStatus::InvalidArgument);
        let err = service.issue_x509("workload-007", b"junk", None).await.unwrap_err();
        assert_eq!(err.status(), IssuanceStatus::InvalidArgument);
    }

    #[tokio::test]
    async fn test_unknown_entry() {
        let (service, _) = service(true, "Spain: Madrid");
        let err = service.issue_x509("workload-999", &csr(), None).await.unwrap_err();
        assert_eq!(err.status(), IssuanceStatus::NotFound);
    }

    #[tokio::test]
    async fn test_policy_violation_is_permission_denied() {
        let (service, _) = service(true, "Germany: Berlin");
        let err = service
            .issue_x509("workload-007", &csr(), Some(&bundle()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), IssuanceStatus::PermissionDenied);
        assert!(err.to_string().starts_with("policy violation"));
        assert!(err.to_string().contains("geolocation"));
    }

    #[tokio::test]
    async fn test_malformed_evidence_not_sent_to_verifier() {
        let (service, verifier) = service(true, "Spain: Madrid");
        let mut evidence = bundle();
        evidence.challenge_nonce = "short".into();
        let err = service
            .issue_x509("workload-007", &csr(), Some(&evidence))
            .await
            .unwrap_err();
        assert_eq!(err.status(), IssuanceStatus::PermissionDenied);
        assert!(err.to_string().starts_with("malformed evidence"));
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_verifier_error_mapping() {
        let denied: IssuanceError = VerifierError::Rejected("bad quote".into()).into();
        assert_eq!(denied.status(), IssuanceStatus::PermissionDenied);
        let down: IssuanceError = VerifierError::Unreachable("refused".into()).into();
        assert_eq!(down.status(), IssuanceStatus::Internal);
    }
}
