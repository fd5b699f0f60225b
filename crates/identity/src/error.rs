//! Error types for sovereign identity operations.
//!
//! Each component keeps its own error enum; `IdentityError` folds them for
//! callers that drive several components at once (the node binary, the
//! agent loop).

use thiserror::Error;

/// Errors that can occur in identity operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// TPM bridge errors
    #[error("TPM error: {0}")]
    Tpm(#[from] crate::tpm::TpmError),

    /// Evidence structure errors
    #[error("Evidence error: {0}")]
    Evidence(#[from] crate::evidence::EvidenceError),

    /// Attestation verifier errors
    #[error("Verifier error: {0}")]
    Verifier(#[from] crate::verifier::VerifierError),

    /// Certificate Authority errors
    #[error("CA error: {0}")]
    CertificateAuthority(#[from] crate::pki::CaError),

    /// Nonce protocol errors
    #[error("Bootstrap error: {0}")]
    Bootstrap(#[from] crate::bootstrap::BootstrapError),

    /// Issuance denials
    #[error("Issuance error: {0}")]
    Issuance(#[from] crate::issuance::IssuanceError),

    /// Agent-side failures
    #[error("Agent error: {0}")]
    Agent(#[from] crate::agent::AgentError),

    /// Core errors
    #[error("Core error: {0}")]
    Core(#[from] sovereign_core::CoreError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for identity operations.
pub type IdentityResult<T> = Result<T, IdentityError>;
