//! Attestation evidence bundles and their agent-side assembly.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use x509_parser::prelude::FromDer;
use x509_parser::x509::SubjectPublicKeyInfo;

use crate::tpm::{TpmBridge, TpmError};

/// Challenge nonce length in bytes.
pub const NONCE_LEN: usize = 32;

/// Structural problems with submitted evidence.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EvidenceError {
    #[error("TPM quote is empty")]
    EmptyQuote,

    #[error("challenge nonce must be {} hex characters", NONCE_LEN * 2)]
    InvalidNonce,

    #[error("app key is not a PEM public key: {0}")]
    InvalidAppKey(String),

    #[error("{field} could not be decoded: {reason}")]
    Decode { field: &'static str, reason: String },
}

/// Evidence for one attestation attempt. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub tpm_signed_quote: Vec<u8>,
    /// Hex-encoded 32-byte nonce.
    pub challenge_nonce: String,
    pub app_key_public: String,
    pub app_key_certificate: Option<Vec<u8>>,
    pub workload_code_hash: String,
}

impl EvidenceBundle {
    /// Structural checks only; cryptographic validation belongs to the verifier.
    pub fn validate(&self) -> Result<(), EvidenceError> {
        if self.tpm_signed_quote.is_empty() {
            return Err(EvidenceError::EmptyQuote);
        }
        if !is_valid_nonce(&self.challenge_nonce) {
            return Err(EvidenceError::InvalidNonce);
        }
        validate_public_key_pem(&self.app_key_public)
    }

    pub fn nonce_fingerprint(&self) -> String {
        nonce_fingerprint(&self.challenge_nonce)
    }
}

/// Fresh hex-encoded nonce from the OS RNG.
pub fn generate_nonce() -> String {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    hex::encode(nonce)
}

pub fn is_valid_nonce(nonce: &str) -> bool {
    nonce.len() == NONCE_LEN * 2 && nonce.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Short BLAKE3 fingerprint used when a nonce has to appear in logs.
pub fn nonce_fingerprint(nonce: &str) -> String {
    let digest = blake3::hash(nonce.as_bytes());
    hex::encode(&digest.as_bytes()[..8])
}

fn validate_public_key_pem(pem: &str) -> Result<(), EvidenceError> {
    let (_, parsed) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
        .map_err(|e| EvidenceError::InvalidAppKey(e.to_string()))?;
    if parsed.label != "PUBLIC KEY" {
        return Err(EvidenceError::InvalidAppKey(format!(
            "unexpected PEM label '{}'",
            parsed.label
        )));
    }
    SubjectPublicKeyInfo::from_der(&parsed.contents)
        .map_err(|e| EvidenceError::InvalidAppKey(e.to_string()))?;
    Ok(())
}

/// Packages TPM output into evidence bundles.
///
/// Holds no state beyond the app key cached by the bridge and makes no
/// network calls other than through the bridge.
pub struct EvidenceAssembler {
    bridge: Arc<TpmBridge>,
    pcr_selector: String,
    certification_endpoint: String,
}

impl EvidenceAssembler {
    pub fn new(bridge: Arc<TpmBridge>, pcr_selector: impl Into<String>) -> Self {
        Self {
            bridge,
            pcr_selector: pcr_selector.into(),
            certification_endpoint: String::new(),
        }
    }

    /// Endpoint passed to the fallback certificate request.
    pub fn with_certification_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.certification_endpoint = endpoint.into();
        self
    }

    /// Self-chosen nonce for workload-only flows.
    pub fn fresh_nonce() -> String {
        generate_nonce()
    }

    pub fn bridge(&self) -> &Arc<TpmBridge> {
        &self.bridge
    }

    /// Make sure the app key exists, creating it if needed.
    pub async fn ensure_app_key(&self) -> Result<(), TpmError> {
        self.bridge.generate_app_key(false).await.map(|_| ())
    }

    /// Quote over `nonce` and package the evidence bundle.
    pub async fn assemble(
        &self,
        nonce: &str,
        workload_code_hash: &str,
    ) -> Result<EvidenceBundle, TpmError> {
        let output = self.bridge.generate_quote(nonce, &self.pcr_selector).await?;
        let app_key = self.bridge.app_key().await.ok_or(TpmError::MissingAppKey)?;

        let app_key_certificate = match output.certificate {
            Some(certificate) => Some(certificate),
            None => match self
                .bridge
                .request_certificate(
                    &app_key.public_key_pem,
                    &app_key.key_handle,
                    &self.certification_endpoint,
                )
                .await
            {
                Ok(certificate) => Some(certificate),
                Err(TpmError::Unavailable(reason)) => return Err(TpmError::Unavailable(reason)),
                Err(e) => {
                    warn!("EvidenceAssembler :: continuing without app key certificate: {}", e);
                    None
                }
            },
        };

        debug!(
            "EvidenceAssembler :: bundle ready (nonce {}, certificate: {})",
            nonce_fingerprint(nonce),
            app_key_certificate.is_some()
        );
        Ok(EvidenceBundle {
            tpm_signed_quote: output.quote,
            challenge_nonce: nonce.to_string(),
            app_key_public: app_key.public_key_pem,
            app_key_certificate,
            workload_code_hash: workload_code_hash.to_string(),
        })
    }
}
