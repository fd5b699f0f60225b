//! Sovereign attestation and identity issuance.
//!
//! This crate binds X.509 workload and agent credentials to hardware
//! evidence. A node quotes its platform state through a TPM-resident app key,
//! a remote verifier turns the quote into attested claims (geolocation, host
//! integrity, accelerator health), a local policy decides, and the issuing
//! CA embeds the accepted claims in the credential.
//!
//! # Flow
//!
//! ```text
//! TpmBridge ─▶ EvidenceAssembler ─▶ IssuanceService ─▶ AttestationVerifier
//!                                         │
//!                                         ├─▶ PolicyEngine
//!                                         └─▶ CertificateAuthority (claims extension)
//! ```
//!
//! Agents use the two-leg nonce handshake in [`bootstrap`]; workloads submit
//! evidence alongside their CSR in a batch issuance call.
//!
//! # Security Model
//!
//! - Fail closed: submitted evidence that cannot be verified never yields a
//!   credential, attested or not
//! - Nonces are single-use and expire
//! - The unified identity feature gate is injected at construction; with it
//!   off, evidence is ignored and credentials carry no claims

pub mod agent;
pub mod bootstrap;
pub mod claims;
pub mod error;
pub mod evidence;
#[cfg(feature = "grpc-server")]
pub mod grpc_server;
pub mod issuance;
pub mod pki;
pub mod policy;
pub mod registry;
pub mod tpm;
pub mod verifier;

pub use agent::{AgentAttestor, AgentError, BootstrapTransport};
pub use bootstrap::{
    BootstrapError, BootstrapProtocol, BootstrapResponse, BootstrapService, BootstrapState,
    DEFAULT_NONCE_TTL_MS,
};
pub use claims::{AcceleratorHealth, AttestedClaims, HostIntegrityStatus, ATTESTED_CLAIMS_OID};
pub use error::{IdentityError, IdentityResult};
pub use evidence::{EvidenceAssembler, EvidenceBundle, EvidenceError};
pub use issuance::{
    IssuanceConfig, IssuanceError, IssuanceRequest, IssuanceService, IssuanceStatus,
    IssuedCredential,
};
pub use pki::{extract_attested_claims, CaError, CertificateAuthority, Credential, ParsedCsr};
pub use policy::{PolicyDecision, PolicyEngine};
pub use registry::{EntryStore, RegistrationEntry, StaticEntryStore};
pub use tpm::{
    AppKey, CertificationMode, SoftwareTpmDevice, TpmBridge, TpmDevice, TpmError, UdsTpmDevice,
};
pub use verifier::{AttestationVerifier, RemoteVerifier, SoftwareQuoteVerifier, VerifierError};
