//! Agent-side bootstrap.
//!
//! The agent owns a freshly generated keypair and a CSR for it. It asks the
//! server for a credential, and when challenged quotes over the returned
//! nonce and asks again with the evidence attached.

use async_trait::async_trait;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use thiserror::Error;
use tracing::{info, warn};

use crate::bootstrap::{BootstrapResponse, BootstrapService};
use crate::evidence::{nonce_fingerprint, EvidenceAssembler, EvidenceBundle};
use crate::issuance::{IssuanceStatus, IssuedCredential};
use crate::tpm::TpmError;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("TPM error: {0}")]
    Tpm(#[from] TpmError),

    #[error("server rejected attestation ({status:?}): {message}")]
    Rejected {
        status: IssuanceStatus,
        message: String,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),
}

/// How an agent reaches the bootstrap service.
#[async_trait]
pub trait BootstrapTransport: Send + Sync {
    async fn attest_agent(
        &self,
        agent_id: &str,
        csr_der: &[u8],
        evidence: Option<&EvidenceBundle>,
    ) -> Result<BootstrapResponse, AgentError>;
}

/// In-process transport, used when agent and server share a binary.
#[async_trait]
impl BootstrapTransport for BootstrapService {
    async fn attest_agent(
        &self,
        agent_id: &str,
        csr_der: &[u8],
        evidence: Option<&EvidenceBundle>,
    ) -> Result<BootstrapResponse, AgentError> {
        BootstrapService::attest_agent(self, agent_id, csr_der, evidence)
            .await
            .map_err(|e| AgentError::Rejected {
                status: e.status(),
                message: e.to_string(),
            })
    }
}

pub struct AgentAttestor {
    agent_id: String,
    assembler: EvidenceAssembler,
    workload_code_hash: String,
    key_pair: KeyPair,
    csr_der: Vec<u8>,
}

impl AgentAttestor {
    pub fn new(
        agent_id: impl Into<String>,
        assembler: EvidenceAssembler,
        workload_code_hash: impl Into<String>,
    ) -> Result<Self, AgentError> {
        let agent_id = agent_id.into();
        let key_pair = KeyPair::generate().map_err(|e| AgentError::KeyGeneration(e.to_string()))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, agent_id.as_str());
        params.distinguished_name = dn;
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| AgentError::KeyGeneration(e.to_string()))?;

        Ok(Self {
            agent_id,
            assembler,
            workload_code_hash: workload_code_hash.into(),
            key_pair,
            csr_der: csr.der().to_vec(),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn csr_der(&self) -> &[u8] {
        &self.csr_der
    }

    /// PEM of the private key matching the issued credential.
    pub fn private_key_pem(&self) -> String {
        self.key_pair.serialize_pem()
    }

    /// Run the handshake to completion.
    pub async fn attest(
        &self,
        transport: &dyn BootstrapTransport,
    ) -> Result<IssuedCredential, AgentError> {
        // Without an app key there is nothing to attest with; stop before
        // contacting the server.
        self.assembler.ensure_app_key().await?;

        let nonce = match transport
            .attest_agent(&self.agent_id, &self.csr_der, None)
            .await?
        {
            BootstrapResponse::Credential(issued) => {
                info!(
                    "Agent :: {} received credential without attestation",
                    self.agent_id
                );
                return Ok(issued);
            }
            BootstrapResponse::Challenge { nonce } => nonce,
        };
        info!(
            "Agent :: {} challenged (nonce {})",
            self.agent_id,
            nonce_fingerprint(&nonce)
        );

        let evidence = self
            .assembler
            .assemble(&nonce, &self.workload_code_hash)
            .await?;

        match transport
            .attest_agent(&self.agent_id, &self.csr_der, Some(&evidence))
            .await
        {
            Ok(BootstrapResponse::Credential(issued)) => {
                info!(
                    "STATUS: Agent :: {} :: ATTESTED (serial {})",
                    self.agent_id, issued.credential.serial
                );
                Ok(issued)
            }
            Ok(BootstrapResponse::Challenge { .. }) => Err(AgentError::Protocol(
                "server issued a second challenge instead of a credential".into(),
            )),
            Err(e) => {
                warn!("Agent :: {} attestation failed: {}", self.agent_id, e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::ParsedCsr;
    use crate::tpm::{SoftwareTpmDevice, TpmBridge};
    use std::sync::Arc;

    fn attestor() -> AgentAttestor {
        let bridge = Arc::new(TpmBridge::new(SoftwareTpmDevice::new()));
        let assembler = EvidenceAssembler::new(bridge, "sha256:0,1,2,3,4,5,6,7");
        AgentAttestor::new("agent-001", assembler, "sha256:abc").unwrap()
    }

    #[test]
    fn test_csr_is_parseable() {
        let attestor = attestor();
        assert!(ParsedCsr::from_der(attestor.csr_der()).is_ok());
        assert!(attestor.private_key_pem().contains("PRIVATE KEY"));
    }

    struct AlwaysChallenge;

    #[async_trait]
    impl BootstrapTransport for AlwaysChallenge {
        async fn attest_agent(
            &self,
            _: &str,
            _: &[u8],
            _: Option<&EvidenceBundle>,
        ) -> Result<BootstrapResponse, AgentError> {
            Ok(BootstrapResponse::Challenge {
                nonce: crate::evidence::generate_nonce(),
            })
        }
    }

    #[tokio::test]
    async fn test_second_challenge_is_protocol_error() {
        let err = attestor().attest(&AlwaysChallenge).await.unwrap_err();
        assert!(matches!(err, AgentError::Protocol(_)));
    }
}
