//! Agent bootstrap handshake tests
//!
//! Tests cover:
//! - Full two-leg handshake with a software TPM and in-process transport
//! - Feature gate off: single-leg unattested agent credential
//! - Nonce replay and stale nonce rejection
//! - TPM unavailable before any request is sent

use sovereign_core::PolicyConfig;
use sovereign_identity::{
    extract_attested_claims, AgentAttestor, AgentError, AttestedClaims, BootstrapResponse,
    BootstrapService, BootstrapState, CertificateAuthority, EvidenceAssembler, HostIntegrityStatus,
    IssuanceConfig, IssuanceService, IssuanceStatus, PolicyEngine, SoftwareQuoteVerifier,
    SoftwareTpmDevice, StaticEntryStore, TpmBridge, UdsTpmDevice,
};
use std::sync::Arc;
use std::time::Duration;

const TRUST_DOMAIN: &str = "sovereign.example";

fn claims(geolocation: &str) -> AttestedClaims {
    AttestedClaims {
        geolocation: Some(geolocation.into()),
        host_integrity_status: HostIntegrityStatus::PassedAllChecks,
        accelerator_health: None,
    }
}

fn bootstrap_service(gate: bool, verified: AttestedClaims) -> BootstrapService {
    let issuance = IssuanceService::new(
        IssuanceConfig {
            unified_identity_enabled: gate,
            ..Default::default()
        },
        Arc::new(SoftwareQuoteVerifier::new(verified)),
        PolicyEngine::new(PolicyConfig {
            allowed_geolocations: vec!["Spain: *".into()],
            require_integrity: true,
            ..Default::default()
        }),
        Arc::new(StaticEntryStore::default()),
        Arc::new(CertificateAuthority::generate("Sovereign Test CA", TRUST_DOMAIN).unwrap()),
    );
    BootstrapService::new(
        Arc::new(issuance),
        TRUST_DOMAIN,
        Duration::from_secs(30),
        Duration::from_secs(3600),
    )
}

fn software_assembler() -> EvidenceAssembler {
    let bridge = Arc::new(TpmBridge::new(SoftwareTpmDevice::new()));
    EvidenceAssembler::new(bridge, "sha256:0,1,2,3,4,5,6,7")
}

fn attestor(agent_id: &str) -> AgentAttestor {
    AgentAttestor::new(agent_id, software_assembler(), "sha256:agent").unwrap()
}

#[tokio::test]
async fn test_full_handshake_issues_attested_agent_credential() {
    let service = bootstrap_service(true, claims("Spain: Madrid"));
    let agent = attestor("agent-001");

    let issued = agent.attest(&service).await.unwrap();

    let leaf = issued.credential.leaf();
    assert_eq!(
        sovereign_identity::pki::identity_uri(leaf).unwrap().as_deref(),
        Some("spiffe://sovereign.example/spire/agent/agent-001")
    );
    let embedded = extract_attested_claims(leaf).unwrap().unwrap();
    assert_eq!(embedded.geolocation.as_deref(), Some("Spain: Madrid"));
    assert!(matches!(
        service.protocol().state("agent-001"),
        BootstrapState::Verified { .. }
    ));
}

#[tokio::test]
async fn test_policy_denial_marks_agent_denied() {
    let service = bootstrap_service(true, claims("Germany: Berlin"));
    let agent = attestor("agent-002");

    let err = agent.attest(&service).await.unwrap_err();
    assert!(matches!(
        err,
        AgentError::Rejected {
            status: IssuanceStatus::PermissionDenied,
            ..
        }
    ));
    match service.protocol().state("agent-002") {
        BootstrapState::Denied { reason, .. } => assert!(reason.contains("geolocation")),
        other => panic!("unexpected state {:?}", other),
    }
}

#[tokio::test]
async fn test_gate_off_single_leg() {
    let service = bootstrap_service(false, claims("Spain: Madrid"));
    let agent = attestor("agent-003");

    let response = service.attest_agent("agent-003", agent.csr_der(), None).await.unwrap();
    let BootstrapResponse::Credential(issued) = response else {
        panic!("expected a credential without a challenge");
    };
    assert!(issued.attested_claims.is_none());
    assert!(extract_attested_claims(issued.credential.leaf()).unwrap().is_none());
}

#[tokio::test]
async fn test_nonce_replay_rejected() {
    let service = bootstrap_service(true, claims("Spain: Madrid"));
    let assembler = software_assembler();
    assembler.ensure_app_key().await.unwrap();
    let agent = attestor("agent-004");

    let BootstrapResponse::Challenge { nonce } =
        service.attest_agent("agent-004", agent.csr_der(), None).await.unwrap()
    else {
        panic!("expected a challenge");
    };
    let evidence = assembler.assemble(&nonce, "sha256:agent").await.unwrap();

    service
        .attest_agent("agent-004", agent.csr_der(), Some(&evidence))
        .await
        .unwrap();

    let err = service
        .attest_agent("agent-004", agent.csr_der(), Some(&evidence))
        .await
        .unwrap_err();
    assert_eq!(err.status(), IssuanceStatus::PermissionDenied);
    assert!(err.to_string().contains("replay"));
}

#[tokio::test]
async fn test_stale_nonce_rejected() {
    let service = bootstrap_service(true, claims("Spain: Madrid"));
    let assembler = software_assembler();
    assembler.ensure_app_key().await.unwrap();
    let agent = attestor("agent-005");

    service.attest_agent("agent-005", agent.csr_der(), None).await.unwrap();
    let evidence = assembler
        .assemble(&EvidenceAssembler::fresh_nonce(), "sha256:agent")
        .await
        .unwrap();

    let err = service
        .attest_agent("agent-005", agent.csr_der(), Some(&evidence))
        .await
        .unwrap_err();
    assert_eq!(err.status(), IssuanceStatus::PermissionDenied);
    assert!(matches!(
        service.protocol().state("agent-005"),
        BootstrapState::ChallengeIssued { .. }
    ));
}

#[tokio::test]
async fn test_expired_challenge_rejected() {
    let issuance = IssuanceService::new(
        IssuanceConfig {
            unified_identity_enabled: true,
            ..Default::default()
        },
        Arc::new(SoftwareQuoteVerifier::new(claims("Spain: Madrid"))),
        PolicyEngine::new(PolicyConfig::default()),
        Arc::new(StaticEntryStore::default()),
        Arc::new(CertificateAuthority::generate("Sovereign Test CA", TRUST_DOMAIN).unwrap()),
    );
    let service = BootstrapService::new(
        Arc::new(issuance),
        TRUST_DOMAIN,
        Duration::from_millis(50),
        Duration::from_secs(3600),
    );
    let assembler = software_assembler();
    assembler.ensure_app_key().await.unwrap();
    let agent = attestor("agent-006");

    let BootstrapResponse::Challenge { nonce } =
        service.attest_agent("agent-006", agent.csr_der(), None).await.unwrap()
    else {
        panic!("expected a challenge");
    };
    let evidence = assembler.assemble(&nonce, "sha256:agent").await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let err = service
        .attest_agent("agent-006", agent.csr_der(), Some(&evidence))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("expired"));
    assert_eq!(service.protocol().state("agent-006"), BootstrapState::AwaitingChallenge);
}

#[tokio::test]
async fn test_tpm_unavailable_is_fatal_before_request() {
    let service = bootstrap_service(true, claims("Spain: Madrid"));
    let device =
        UdsTpmDevice::new("unix:///nonexistent/tpm-plugin.sock", "/tmp", Duration::from_secs(1)).unwrap();
    let assembler = EvidenceAssembler::new(Arc::new(TpmBridge::new(device)), "sha256:0");
    let agent = AgentAttestor::new("agent-007", assembler, "sha256:agent").unwrap();

    let err = agent.attest(&service).await.unwrap_err();
    assert!(matches!(err, AgentError::Tpm(_)));
    assert_eq!(service.protocol().state("agent-007"), BootstrapState::AwaitingChallenge);
}
