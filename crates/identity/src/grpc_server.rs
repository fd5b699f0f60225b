//! gRPC surface for credential issuance and agent bootstrap.
//!
//! # Security Model
//!
//! - Every batch item carries its own status; one denial never fails the RPC
//! - Evidence that cannot be decoded counts as malformed and is denied,
//!   never downgraded to an unattested credential
//! - The bootstrap RPC maps issuance errors onto gRPC status codes

use base64::Engine;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint, Server};
use tonic::{Code, Request, Response, Status};

pub mod proto {
    tonic::include_proto!("sovereign.identity");
}

use proto::agent_bootstrap_client::AgentBootstrapClient;
use proto::agent_bootstrap_server::{AgentBootstrap, AgentBootstrapServer};
use proto::identity_issuance_server::{IdentityIssuance, IdentityIssuanceServer};

use crate::agent::{AgentError, BootstrapTransport};
use crate::bootstrap::{BootstrapResponse, BootstrapService};
use crate::claims::{AcceleratorHealth, AttestedClaims, HostIntegrityStatus};
use crate::evidence::{EvidenceBundle, EvidenceError};
use crate::issuance::{
    IssuanceError, IssuanceRequest, IssuanceService, IssuanceStatus, IssuedCredential,
};
use crate::pki::{self, Credential};

/// Decode wire evidence. The quote travels base64-encoded.
pub fn evidence_from_proto(
    attestation: proto::SovereignAttestation,
) -> Result<EvidenceBundle, EvidenceError> {
    let quote = base64::engine::general_purpose::STANDARD
        .decode(attestation.tpm_signed_quote.as_bytes())
        .map_err(|e| EvidenceError::Decode {
            field: "tpm_signed_quote",
            reason: e.to_string(),
        })?;
    Ok(EvidenceBundle {
        tpm_signed_quote: quote,
        challenge_nonce: attestation.challenge_nonce,
        app_key_public: attestation.app_key_public,
        app_key_certificate: Some(attestation.app_key_certificate).filter(|c| !c.is_empty()),
        workload_code_hash: attestation.workload_code_hash,
    })
}

pub fn evidence_to_proto(bundle: &EvidenceBundle) -> proto::SovereignAttestation {
    proto::SovereignAttestation {
        tpm_signed_quote: base64::engine::general_purpose::STANDARD.encode(&bundle.tpm_signed_quote),
        challenge_nonce: bundle.challenge_nonce.clone(),
        app_key_public: bundle.app_key_public.clone(),
        app_key_certificate: bundle.app_key_certificate.clone().unwrap_or_default(),
        workload_code_hash: bundle.workload_code_hash.clone(),
    }
}

pub fn claims_to_proto(claims: &AttestedClaims) -> proto::AttestedClaims {
    let integrity = match claims.host_integrity_status {
        HostIntegrityStatus::Unspecified => proto::HostIntegrityStatus::Unspecified,
        HostIntegrityStatus::PassedAllChecks => proto::HostIntegrityStatus::PassedAllChecks,
        HostIntegrityStatus::Failed => proto::HostIntegrityStatus::Failed,
        HostIntegrityStatus::Degraded => proto::HostIntegrityStatus::Degraded,
    };
    proto::AttestedClaims {
        geolocation: claims.geolocation.clone(),
        host_integrity_status: integrity as i32,
        accelerator_health: claims
            .accelerator_health
            .as_ref()
            .map(|health| proto::AcceleratorHealth {
                status: health.status.clone(),
                utilization_pct: health.utilization_pct,
                memory_mb: health.memory_mb,
            }),
    }
}

pub fn claims_from_proto(claims: proto::AttestedClaims) -> AttestedClaims {
    let host_integrity_status = match claims.host_integrity_status() {
        proto::HostIntegrityStatus::Unspecified => HostIntegrityStatus::Unspecified,
        proto::HostIntegrityStatus::PassedAllChecks => HostIntegrityStatus::PassedAllChecks,
        proto::HostIntegrityStatus::Failed => HostIntegrityStatus::Failed,
        proto::HostIntegrityStatus::Degraded => HostIntegrityStatus::Degraded,
    };
    AttestedClaims {
        geolocation: claims.geolocation,
        host_integrity_status,
        accelerator_health: claims.accelerator_health.map(|health| AcceleratorHealth {
            status: health.status,
            utilization_pct: health.utilization_pct,
            memory_mb: health.memory_mb,
        }),
    }
}

fn status_code(status: IssuanceStatus) -> proto::StatusCode {
    match status {
        IssuanceStatus::Ok => proto::StatusCode::Ok,
        IssuanceStatus::NotFound => proto::StatusCode::NotFound,
        IssuanceStatus::PermissionDenied => proto::StatusCode::PermissionDenied,
        IssuanceStatus::InvalidArgument => proto::StatusCode::InvalidArgument,
        IssuanceStatus::Internal => proto::StatusCode::Internal,
    }
}

fn credential_result(result: Result<IssuedCredential, IssuanceError>) -> proto::X509CredentialResult {
    match result {
        Ok(issued) => proto::X509CredentialResult {
            status: Some(proto::IssuanceStatus {
                code: proto::StatusCode::Ok as i32,
                message: String::new(),
            }),
            cert_chain: issued.credential.cert_chain,
            expires_at: issued.credential.expires_at as i64,
            attested_claims: issued.attested_claims.as_ref().map(claims_to_proto),
        },
        Err(e) => proto::X509CredentialResult {
            status: Some(proto::IssuanceStatus {
                code: status_code(e.status()) as i32,
                message: e.to_string(),
            }),
            cert_chain: Vec::new(),
            expires_at: 0,
            attested_claims: None,
        },
    }
}

fn grpc_status(err: &IssuanceError) -> Status {
    let code = match err.status() {
        IssuanceStatus::Ok => Code::Ok,
        IssuanceStatus::NotFound => Code::NotFound,
        IssuanceStatus::PermissionDenied => Code::PermissionDenied,
        IssuanceStatus::InvalidArgument => Code::InvalidArgument,
        IssuanceStatus::Internal => Code::Internal,
    };
    Status::new(code, err.to_string())
}

/// Decode evidence only when it will be used. With the gate off evidence is
/// ignored entirely, including undecodable evidence.
fn decode_evidence(
    attestation: Option<proto::SovereignAttestation>,
    gate_enabled: bool,
) -> Result<Option<EvidenceBundle>, IssuanceError> {
    match attestation {
        Some(attestation) if gate_enabled => Ok(Some(evidence_from_proto(attestation)?)),
        _ => Ok(None),
    }
}

/// Issuance RPC service.
pub struct IdentityIssuanceService {
    issuance: Arc<IssuanceService>,
}

impl IdentityIssuanceService {
    pub fn new(issuance: Arc<IssuanceService>) -> Self {
        Self { issuance }
    }
}

#[tonic::async_trait]
impl IdentityIssuance for IdentityIssuanceService {
    async fn batch_new_x509_credential(
        &self,
        request: Request<proto::BatchNewX509CredentialRequest>,
    ) -> Result<Response<proto::BatchNewX509CredentialResponse>, Status> {
        let req = request.into_inner();
        let gate = self.issuance.feature_gate_enabled();
        tracing::debug!("IdentityIssuance :: batch of {} request(s)", req.params.len());

        // Items whose evidence failed to decode keep their slot in the response.
        let mut decode_failures = Vec::with_capacity(req.params.len());
        let mut requests = Vec::with_capacity(req.params.len());
        for params in req.params {
            match decode_evidence(params.attestation, gate) {
                Ok(evidence) => {
                    decode_failures.push(None);
                    requests.push(IssuanceRequest {
                        entry_id: params.entry_id,
                        csr: params.csr,
                        evidence,
                    });
                }
                Err(e) => {
                    tracing::warn!("IdentityIssuance :: entry {} denied: {}", params.entry_id, e);
                    decode_failures.push(Some(e));
                }
            }
        }

        let mut issued = self.issuance.batch_issue(&requests).await.into_iter();
        let results = decode_failures
            .into_iter()
            .map(|failure| match failure {
                Some(e) => credential_result(Err(e)),
                None => credential_result(issued.next().unwrap_or_else(|| {
                    Err(IssuanceError::Minting("batch result missing".into()))
                })),
            })
            .collect();

        Ok(Response::new(proto::BatchNewX509CredentialResponse { results }))
    }
}

/// Agent bootstrap RPC service.
pub struct AgentBootstrapService {
    bootstrap: Arc<BootstrapService>,
}

impl AgentBootstrapService {
    pub fn new(bootstrap: Arc<BootstrapService>) -> Self {
        Self { bootstrap }
    }
}

#[tonic::async_trait]
impl AgentBootstrap for AgentBootstrapService {
    async fn attest_agent(
        &self,
        request: Request<proto::AttestAgentRequest>,
    ) -> Result<Response<proto::AttestAgentResponse>, Status> {
        let req = request.into_inner();
        let evidence = decode_evidence(req.attestation, self.bootstrap.feature_gate_enabled())
            .map_err(|e| grpc_status(&e))?;

        let response = self
            .bootstrap
            .attest_agent(&req.agent_id, &req.csr, evidence.as_ref())
            .await
            .map_err(|e| grpc_status(&e))?;

        Ok(Response::new(match response {
            BootstrapResponse::Challenge { nonce } => proto::AttestAgentResponse {
                challenge_nonce: nonce,
                cert_chain: Vec::new(),
                expires_at: 0,
                attested_claims: None,
            },
            BootstrapResponse::Credential(issued) => proto::AttestAgentResponse {
                challenge_nonce: String::new(),
                cert_chain: issued.credential.cert_chain,
                expires_at: issued.credential.expires_at as i64,
                attested_claims: issued.attested_claims.as_ref().map(claims_to_proto),
            },
        }))
    }
}

/// Router with both services mounted, for callers that supply their own
/// listener.
pub fn router(
    issuance: Arc<IssuanceService>,
    bootstrap: Arc<BootstrapService>,
) -> tonic::transport::server::Router {
    Server::builder()
        .add_service(IdentityIssuanceServer::new(IdentityIssuanceService::new(issuance)))
        .add_service(AgentBootstrapServer::new(AgentBootstrapService::new(bootstrap)))
}

/// Serve issuance and bootstrap on `addr` until `shutdown` resolves.
pub async fn start_grpc_server(
    addr: SocketAddr,
    issuance: Arc<IssuanceService>,
    bootstrap: Arc<BootstrapService>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), tonic::transport::Error> {
    tracing::info!("Sovereign identity gRPC server listening on {}", addr);
    router(issuance, bootstrap)
        .serve_with_shutdown(addr, shutdown)
        .await
}

/// Bootstrap transport over gRPC.
#[derive(Clone)]
pub struct GrpcBootstrapTransport {
    client: AgentBootstrapClient<Channel>,
}

impl GrpcBootstrapTransport {
    /// Connect to `server_addr`. `timeout` bounds both the connection attempt
    /// and every bootstrap round trip.
    pub async fn connect(
        server_addr: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, AgentError> {
        let channel = Endpoint::from_shared(server_addr.into())
            .map_err(|e| AgentError::Transport(e.to_string()))?
            .connect_timeout(timeout)
            .timeout(timeout)
            .connect()
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;
        Ok(Self::new(channel))
    }

    pub fn new(channel: Channel) -> Self {
        Self {
            client: AgentBootstrapClient::new(channel),
        }
    }
}

fn agent_error(status: Status) -> AgentError {
    let issuance_status = match status.code() {
        Code::NotFound => IssuanceStatus::NotFound,
        Code::PermissionDenied => IssuanceStatus::PermissionDenied,
        Code::InvalidArgument => IssuanceStatus::InvalidArgument,
        Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled => {
            return AgentError::Transport(status.message().to_string())
        }
        _ => IssuanceStatus::Internal,
    };
    AgentError::Rejected {
        status: issuance_status,
        message: status.message().to_string(),
    }
}

#[async_trait::async_trait]
impl BootstrapTransport for GrpcBootstrapTransport {
    async fn attest_agent(
        &self,
        agent_id: &str,
        csr_der: &[u8],
        evidence: Option<&EvidenceBundle>,
    ) -> Result<BootstrapResponse, AgentError> {
        let mut client = self.client.clone();
        let response = client
            .attest_agent(proto::AttestAgentRequest {
                agent_id: agent_id.to_string(),
                csr: csr_der.to_vec(),
                attestation: evidence.map(evidence_to_proto),
            })
            .await
            .map_err(agent_error)?
            .into_inner();

        if !response.challenge_nonce.is_empty() {
            return Ok(BootstrapResponse::Challenge {
                nonce: response.challenge_nonce,
            });
        }
        let leaf = response
            .cert_chain
            .first()
            .ok_or_else(|| AgentError::Protocol("response carried neither nonce nor credential".into()))?;
        let serial = pki::serial_number(leaf).map_err(|e| AgentError::Protocol(e.to_string()))?;

        Ok(BootstrapResponse::Credential(IssuedCredential {
            credential: Credential {
                expires_at: response.expires_at.max(0) as u64,
                serial,
                cert_chain: response.cert_chain,
            },
            attested_claims: response.attested_claims.map(claims_from_proto),
        }))
    }
}
