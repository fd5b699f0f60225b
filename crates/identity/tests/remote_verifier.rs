//! Remote verifier client tests against a mock verifier service

use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use sovereign_core::VerifierConfig;
use sovereign_identity::{
    AttestationVerifier, EvidenceBundle, HostIntegrityStatus, RemoteVerifier, VerifierError,
};
use std::time::Duration;

const NONCE_GOOD: &str = "aa";
const NONCE_REJECTED: &str = "bb";
const NONCE_SERVER_ERROR: &str = "cc";
const NONCE_NO_CLAIMS: &str = "dd";
const NONCE_SLOW: &str = "ee";

async fn verify(Json(request): Json<Value>) -> (StatusCode, Json<Value>) {
    assert_eq!(request["type"], "tpm");
    assert_eq!(request["metadata"]["submission_type"], "PoR/tpm-app-key");
    let nonce = request["data"]["nonce"].as_str().unwrap_or_default().to_string();

    match &nonce[..2] {
        NONCE_GOOD => (
            StatusCode::OK,
            Json(json!({
                "results": {
                    "verified": true,
                    "audit_id": "audit-1",
                    "attested_claims": {
                        "geolocation": "Spain: Madrid",
                        "host_integrity_status": "PASSED_ALL_CHECKS",
                        "gpu_metrics_health": {"status": "healthy", "utilization_pct": 15.0, "memory_mb": 10240}
                    }
                }
            })),
        ),
        NONCE_REJECTED => (
            StatusCode::OK,
            Json(json!({"results": {"verified": false, "verification_details": {"reason": "quote signature"}}})),
        ),
        NONCE_SERVER_ERROR => (StatusCode::SERVICE_UNAVAILABLE, Json(json!({}))),
        NONCE_NO_CLAIMS => (StatusCode::OK, Json(json!({"results": {"verified": true}}))),
        NONCE_SLOW => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            (StatusCode::OK, Json(json!({})))
        }
        _ => (StatusCode::BAD_REQUEST, Json(json!({"error": "unknown nonce"}))),
    }
}

async fn start_mock_verifier() -> String {
    let app = Router::new().route("/v2.4/verify/evidence", post(verify));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn bundle(nonce_prefix: &str) -> EvidenceBundle {
    EvidenceBundle {
        tpm_signed_quote: b"quote".to_vec(),
        challenge_nonce: nonce_prefix.repeat(32),
        app_key_public: rcgen::KeyPair::generate().unwrap().public_key_pem(),
        app_key_certificate: Some(b"cert".to_vec()),
        workload_code_hash: "sha256:code".into(),
    }
}

fn verifier(base_url: String, timeout_secs: u64) -> RemoteVerifier {
    RemoteVerifier::new(&VerifierConfig {
        base_url,
        timeout_secs,
        ..Default::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_verified_evidence_yields_claims() {
    let verifier = verifier(start_mock_verifier().await, 5);
    let claims = verifier.verify_evidence(&bundle(NONCE_GOOD)).await.unwrap();

    assert_eq!(claims.geolocation.as_deref(), Some("Spain: Madrid"));
    assert_eq!(claims.host_integrity_status, HostIntegrityStatus::PassedAllChecks);
    assert_eq!(claims.accelerator_health.unwrap().memory_mb, 10240);
}

#[tokio::test]
async fn test_unverified_evidence_rejected() {
    let verifier = verifier(start_mock_verifier().await, 5);
    let err = verifier.verify_evidence(&bundle(NONCE_REJECTED)).await.unwrap_err();
    assert!(matches!(err, VerifierError::Rejected(_)));
}

#[tokio::test]
async fn test_missing_claims_rejected() {
    let verifier = verifier(start_mock_verifier().await, 5);
    let err = verifier.verify_evidence(&bundle(NONCE_NO_CLAIMS)).await.unwrap_err();
    assert!(matches!(err, VerifierError::Rejected(_)));
}

#[tokio::test]
async fn test_server_error_is_transport_failure() {
    let verifier = verifier(start_mock_verifier().await, 5);
    let err = verifier.verify_evidence(&bundle(NONCE_SERVER_ERROR)).await.unwrap_err();
    assert!(err.is_transport());

    let err = verifier.verify_evidence(&bundle("ff")).await.unwrap_err();
    assert!(matches!(err, VerifierError::Rejected(_)));
}

#[tokio::test]
async fn test_slow_verifier_times_out() {
    let verifier = verifier(start_mock_verifier().await, 1);
    let err = verifier.verify_evidence(&bundle(NONCE_SLOW)).await.unwrap_err();
    assert!(matches!(err, VerifierError::Timeout(_)));
}

#[tokio::test]
async fn test_unreachable_verifier() {
    let verifier = verifier("http://127.0.0.1:1".to_string(), 2);
    let err = verifier.verify_evidence(&bundle(NONCE_GOOD)).await.unwrap_err();
    assert!(err.is_transport());
}
