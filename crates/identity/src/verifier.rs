//! Attestation verifier client.
//!
//! Cryptographic validation of evidence (quote signature, freshness,
//! measurements against a baseline) is delegated to an external verifier.
//! Every failure mode here is a denial or an error; none of them degrades
//! into a permissive result.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sovereign_core::VerifierConfig;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::claims::{AcceleratorHealth, AttestedClaims, HostIntegrityStatus};
use crate::evidence::{nonce_fingerprint, EvidenceBundle};
use crate::tpm::SoftwareQuote;

const VERIFY_PATH: &str = "/v2.4/verify/evidence";
const SUBMISSION_TYPE: &str = "PoR/tpm-app-key";

#[derive(Debug, Error)]
pub enum VerifierError {
    #[error("attestation verifier unreachable: {0}")]
    Unreachable(String),

    #[error("attestation verifier timed out after {0:?}")]
    Timeout(Duration),

    /// The verifier examined the evidence and refused it.
    #[error("attestation rejected: {0}")]
    Rejected(String),

    #[error("invalid verifier response: {0}")]
    InvalidResponse(String),

    #[error("verifier client configuration error: {0}")]
    Config(String),
}

impl VerifierError {
    /// True when the verifier never produced a verdict.
    pub fn is_transport(&self) -> bool {
        !matches!(self, VerifierError::Rejected(_))
    }
}

/// Produces attested claims from evidence, or refuses.
#[async_trait]
pub trait AttestationVerifier: Send + Sync {
    async fn verify_evidence(&self, bundle: &EvidenceBundle)
        -> Result<AttestedClaims, VerifierError>;
}

#[derive(Debug, Serialize)]
struct VerifyRequest<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: EvidenceData<'a>,
    metadata: SubmissionMetadata<'a>,
}

#[derive(Debug, Serialize)]
struct EvidenceData<'a> {
    nonce: &'a str,
    quote: String,
    hash_alg: &'static str,
    app_key_public: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    app_key_certificate: Option<String>,
    workload_code_hash: &'a str,
}

#[derive(Debug, Serialize)]
struct SubmissionMetadata<'a> {
    source: &'a str,
    submission_type: &'static str,
    audit_id: String,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    results: VerifyResults,
}

#[derive(Debug, Deserialize)]
struct VerifyResults {
    verified: bool,
    #[serde(default)]
    verification_details: Option<serde_json::Value>,
    #[serde(default)]
    attested_claims: Option<WireClaims>,
    #[serde(default)]
    audit_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireClaims {
    #[serde(default)]
    geolocation: Option<String>,
    #[serde(default)]
    host_integrity_status: Option<String>,
    #[serde(default)]
    gpu_metrics_health: Option<WireAcceleratorHealth>,
}

#[derive(Debug, Deserialize)]
struct WireAcceleratorHealth {
    status: String,
    #[serde(default)]
    utilization_pct: f64,
    #[serde(default)]
    memory_mb: i64,
}

impl From<WireClaims> for AttestedClaims {
    fn from(wire: WireClaims) -> Self {
        AttestedClaims {
            geolocation: wire.geolocation.filter(|g| !g.is_empty()),
            host_integrity_status: wire
                .host_integrity_status
                .as_deref()
                .map(HostIntegrityStatus::parse)
                .unwrap_or_default(),
            accelerator_health: wire.gpu_metrics_health.map(|gpu| AcceleratorHealth {
                status: gpu.status,
                utilization_pct: gpu.utilization_pct,
                memory_mb: gpu.memory_mb,
            }),
        }
    }
}

/// HTTP client for the external verifier.
pub struct RemoteVerifier {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
    source: String,
}

impl RemoteVerifier {
    pub fn new(config: &VerifierConfig) -> Result<Self, VerifierError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let mut builder = reqwest::Client::builder().timeout(timeout);

        if let Some(path) = &config.ca_cert_path {
            let pem = std::fs::read(path)
                .map_err(|e| VerifierError::Config(format!("{}: {}", path.display(), e)))?;
            let ca = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| VerifierError::Config(format!("CA bundle: {}", e)))?;
            builder = builder.add_root_certificate(ca);
        }
        if let Some(path) = &config.client_identity_path {
            let pem = std::fs::read(path)
                .map_err(|e| VerifierError::Config(format!("{}: {}", path.display(), e)))?;
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| VerifierError::Config(format!("client identity: {}", e)))?;
            builder = builder.identity(identity);
        }

        let client = builder
            .build()
            .map_err(|e| VerifierError::Config(e.to_string()))?;
        let endpoint = format!("{}{}", config.base_url.trim_end_matches('/'), VERIFY_PATH);
        info!("STATUS: RemoteVerifier :: {} :: CONFIGURED", endpoint);

        Ok(Self {
            client,
            endpoint,
            timeout,
            source: "sovereign-issuance".to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn transport_error(&self, e: reqwest::Error) -> VerifierError {
        if e.is_timeout() {
            VerifierError::Timeout(self.timeout)
        } else {
            VerifierError::Unreachable(e.to_string())
        }
    }
}

#[async_trait]
impl AttestationVerifier for RemoteVerifier {
    #[instrument(skip(self, bundle), fields(nonce = %bundle.nonce_fingerprint()))]
    async fn verify_evidence(
        &self,
        bundle: &EvidenceBundle,
    ) -> Result<AttestedClaims, VerifierError> {
        let request = VerifyRequest {
            kind: "tpm",
            data: EvidenceData {
                nonce: &bundle.challenge_nonce,
                quote: BASE64.encode(&bundle.tpm_signed_quote),
                hash_alg: "sha256",
                app_key_public: &bundle.app_key_public,
                app_key_certificate: bundle.app_key_certificate.as_ref().map(|c| BASE64.encode(c)),
                workload_code_hash: &bundle.workload_code_hash,
            },
            metadata: SubmissionMetadata {
                source: &self.source,
                submission_type: SUBMISSION_TYPE,
                audit_id: format!("audit-{}", nonce_fingerprint(&bundle.challenge_nonce)),
            },
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(VerifierError::Unreachable(format!("verifier returned HTTP {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VerifierError::Rejected(format!("HTTP {}: {}", status, body)));
        }

        let body: VerifyResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                VerifierError::Timeout(self.timeout)
            } else {
                VerifierError::InvalidResponse(e.to_string())
            }
        })?;
        let results = body.results;
        if !results.verified {
            let details = results
                .verification_details
                .map(|d| d.to_string())
                .unwrap_or_else(|| "no details".to_string());
            warn!("RemoteVerifier :: evidence rejected :: {}", details);
            return Err(VerifierError::Rejected(details));
        }

        let claims = results.attested_claims.ok_or_else(|| {
            VerifierError::Rejected("verifier returned no attested claims".to_string())
        })?;
        info!(
            audit_id = results.audit_id.as_deref().unwrap_or("-"),
            "RemoteVerifier :: evidence verified"
        );
        Ok(claims.into())
    }
}

/// Verifies quotes from the software TPM device and reports fixed claims.
///
/// Development use only; it checks the quote signature against the
/// submitted app key and the binding to the challenge nonce.
pub struct SoftwareQuoteVerifier {
    claims: AttestedClaims,
}

impl SoftwareQuoteVerifier {
    pub fn new(claims: AttestedClaims) -> Self {
        warn!("STATUS: SoftwareQuoteVerifier :: Attestation Verifier :: STUBBED");
        Self { claims }
    }
}

#[async_trait]
impl AttestationVerifier for SoftwareQuoteVerifier {
    async fn verify_evidence(
        &self,
        bundle: &EvidenceBundle,
    ) -> Result<AttestedClaims, VerifierError> {
        let quote = SoftwareQuote::from_bytes(&bundle.tpm_signed_quote)
            .map_err(|e| VerifierError::Rejected(e.to_string()))?;
        if !quote.verify(&bundle.app_key_public, &bundle.challenge_nonce) {
            return Err(VerifierError::Rejected("quote verification failed".into()));
        }
        Ok(self.claims.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_claims_conversion() {
        let wire: WireClaims = serde_json::from_str(
            r#"{"geolocation":"Spain: Madrid","host_integrity_status":"passed_all_checks",
                "gpu_metrics_health":{"status":"healthy","utilization_pct":15.0,"memory_mb":10240}}"#,
        )
        .unwrap();
        let claims: AttestedClaims = wire.into();
        assert_eq!(claims.geolocation.as_deref(), Some("Spain: Madrid"));
        assert_eq!(claims.host_integrity_status, HostIntegrityStatus::PassedAllChecks);
        assert_eq!(claims.accelerator_health.unwrap().memory_mb, 10240);
    }

    #[test]
    fn test_empty_geolocation_is_absent() {
        let wire: WireClaims = serde_json::from_str(r#"{"geolocation":""}"#).unwrap();
        let claims: AttestedClaims = wire.into();
        assert!(claims.geolocation.is_none());
        assert_eq!(claims.host_integrity_status, HostIntegrityStatus::Unspecified);
    }

    #[test]
    fn test_endpoint_joins_base_url() {
        let config = VerifierConfig {
            base_url: "http://verifier.local:8881/".to_string(),
            ..Default::default()
        };
        let verifier = RemoteVerifier::new(&config).unwrap();
        assert_eq!(verifier.endpoint(), "http://verifier.local:8881/v2.4/verify/evidence");
    }

    #[test]
    fn test_rejection_is_not_transport() {
        assert!(!VerifierError::Rejected("x".into()).is_transport());
        assert!(VerifierError::Timeout(Duration::from_secs(1)).is_transport());
        assert!(VerifierError::Unreachable("x".into()).is_transport());
    }
}
