//! Bootstrap nonce protocol for agent attestation.
//!
//! A two-phase handshake binds an agent's TPM quote to a server-chosen nonce:
//!
//! 1. Agent → Server: attest request without evidence
//! 2. Server → Agent: fresh challenge nonce (`ChallengeIssued`)
//! 3. Agent → Server: evidence quoted over that nonce (`EvidenceSubmitted`)
//! 4. Server: verify and apply policy, then `Verified` (credential + claims)
//!    or `Denied` (nothing issued)
//!
//! # Freshness
//!
//! - Only the most recently issued nonce for an agent is accepted
//! - Nonces are single-use; consumed nonces are remembered to report replays
//! - A challenge older than the expiry window is rejected and the agent's
//!   state resets to `AwaitingChallenge`
//!
//! # Retention
//!
//! Every challenge sweeps the tables: expired challenges are dropped, and
//! finished handshakes and consumed nonces are forgotten after
//! `CONSUMED_RETENTION_FACTOR` expiry windows. Memory is bounded by the
//! number of agents active within that window.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use sovereign_core::current_timestamp_ms;

use crate::evidence::{generate_nonce, nonce_fingerprint, EvidenceBundle};
use crate::issuance::{IssuanceError, IssuanceService, IssuedCredential};
use crate::pki::ParsedCsr;

/// Default challenge expiry (milliseconds).
pub const DEFAULT_NONCE_TTL_MS: u64 = 30_000;

/// Consumed nonces and finished handshakes are kept this many expiry windows.
const CONSUMED_RETENTION_FACTOR: u64 = 10;

/// Per-agent handshake state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapState {
    /// No challenge outstanding
    AwaitingChallenge,
    /// Nonce handed out, waiting for evidence
    ChallengeIssued { nonce: String, issued_at: u64 },
    /// Evidence accepted for verification
    EvidenceSubmitted { nonce: String, submitted_at: u64 },
    /// Credential issued
    Verified { verified_at: u64 },
    /// Verification or policy refused the evidence
    Denied { reason: String, denied_at: u64 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BootstrapError {
    #[error("no challenge outstanding for agent {0}")]
    NoChallenge(String),

    #[error("challenge for agent {0} expired")]
    Expired(String),

    #[error("nonce already consumed (replay) for agent {0}")]
    Replayed(String),

    #[error("evidence bound to a stale nonce for agent {0}")]
    Stale(String),
}

impl From<BootstrapError> for IssuanceError {
    fn from(err: BootstrapError) -> Self {
        IssuanceError::StaleNonce(err.to_string())
    }
}

struct ProtocolState {
    agents: HashMap<String, BootstrapState>,
    /// nonce → consumed at (ms)
    consumed: HashMap<String, u64>,
}

/// Nonce bookkeeping for all agents.
pub struct BootstrapProtocol {
    nonce_ttl_ms: u64,
    state: Mutex<ProtocolState>,
}

impl BootstrapProtocol {
    pub fn new(nonce_ttl: Duration) -> Self {
        Self {
            nonce_ttl_ms: nonce_ttl.as_millis() as u64,
            state: Mutex::new(ProtocolState {
                agents: HashMap::new(),
                consumed: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProtocolState> {
        // State stays consistent across a panic; recover the guard.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Issue a fresh nonce for `agent_id`, replacing any outstanding one.
    pub fn issue_challenge(&self, agent_id: &str) -> String {
        self.issue_challenge_at(agent_id, current_timestamp_ms())
    }

    fn issue_challenge_at(&self, agent_id: &str, now: u64) -> String {
        let mut state = self.lock();
        self.cleanup(&mut state, now);

        if let Some(BootstrapState::ChallengeIssued { nonce, .. }) = state.agents.get(agent_id) {
            let superseded = nonce.clone();
            state.consumed.insert(superseded, now);
        }
        let nonce = generate_nonce();
        state.agents.insert(
            agent_id.to_string(),
            BootstrapState::ChallengeIssued {
                nonce: nonce.clone(),
                issued_at: now,
            },
        );
        info!(
            "Bootstrap :: challenge issued to {} (nonce {})",
            agent_id,
            nonce_fingerprint(&nonce)
        );
        nonce
    }

    /// Accept evidence bound to `nonce`, consuming it.
    pub fn submit_evidence(&self, agent_id: &str, nonce: &str) -> Result<(), BootstrapError> {
        self.submit_evidence_at(agent_id, nonce, current_timestamp_ms())
    }

    fn submit_evidence_at(&self, agent_id: &str, nonce: &str, now: u64) -> Result<(), BootstrapError> {
        let mut state = self.lock();

        if state.consumed.contains_key(nonce) {
            warn!(
                "Bootstrap :: replayed nonce {} from {}",
                nonce_fingerprint(nonce),
                agent_id
            );
            return Err(BootstrapError::Replayed(agent_id.to_string()));
        }

        let (expected, issued_at) = match state.agents.get(agent_id) {
            Some(BootstrapState::ChallengeIssued { nonce, issued_at }) => (nonce.clone(), *issued_at),
            _ => return Err(BootstrapError::NoChallenge(agent_id.to_string())),
        };

        if now.saturating_sub(issued_at) > self.nonce_ttl_ms {
            state.consumed.insert(expected, now);
            state.agents.remove(agent_id);
            warn!("Bootstrap :: challenge for {} expired", agent_id);
            return Err(BootstrapError::Expired(agent_id.to_string()));
        }
        if expected != nonce {
            return Err(BootstrapError::Stale(agent_id.to_string()));
        }

        state.consumed.insert(expected.clone(), now);
        state.agents.insert(
            agent_id.to_string(),
            BootstrapState::EvidenceSubmitted {
                nonce: expected,
                submitted_at: now,
            },
        );
        Ok(())
    }

    /// Record the verification outcome for an agent.
    pub fn complete(&self, agent_id: &str, outcome: Result<(), String>) {
        self.complete_at(agent_id, outcome, current_timestamp_ms())
    }

    fn complete_at(&self, agent_id: &str, outcome: Result<(), String>, now: u64) {
        let next = match outcome {
            Ok(()) => BootstrapState::Verified { verified_at: now },
            Err(reason) => BootstrapState::Denied {
                reason,
                denied_at: now,
            },
        };
        self.lock().agents.insert(agent_id.to_string(), next);
    }

    pub fn state(&self, agent_id: &str) -> BootstrapState {
        self.lock()
            .agents
            .get(agent_id)
            .cloned()
            .unwrap_or(BootstrapState::AwaitingChallenge)
    }

    /// Number of agents with handshake state held in memory.
    pub fn tracked_agents(&self) -> usize {
        self.lock().agents.len()
    }

    fn cleanup(&self, state: &mut ProtocolState, now: u64) {
        let ttl = self.nonce_ttl_ms;
        let retention = ttl.saturating_mul(CONSUMED_RETENTION_FACTOR);
        let mut expired = Vec::new();

        state.agents.retain(|agent_id, agent_state| match agent_state {
            BootstrapState::AwaitingChallenge => false,
            BootstrapState::ChallengeIssued { nonce, issued_at } => {
                if now.saturating_sub(*issued_at) <= ttl {
                    return true;
                }
                info!("Bootstrap :: challenge for {} expired during cleanup", agent_id);
                expired.push((std::mem::take(nonce), issued_at.saturating_add(ttl)));
                false
            }
            BootstrapState::EvidenceSubmitted { submitted_at: at, .. }
            | BootstrapState::Verified { verified_at: at }
            | BootstrapState::Denied { denied_at: at, .. } => now.saturating_sub(*at) <= retention,
        });
        state.consumed.extend(expired);

        state
            .consumed
            .retain(|_, consumed_at| now.saturating_sub(*consumed_at) <= retention);
    }
}

/// Response to one bootstrap call.
#[derive(Debug, Clone, PartialEq)]
pub enum BootstrapResponse {
    /// First leg: evidence must be rebuilt over this nonce.
    Challenge { nonce: String },
    /// Second leg (or feature gate off): the agent credential.
    Credential(IssuedCredential),
}

/// Server side of agent bootstrap.
pub struct BootstrapService {
    issuance: Arc<IssuanceService>,
    protocol: BootstrapProtocol,
    trust_domain: String,
    agent_ttl: Duration,
}

impl BootstrapService {
    pub fn new(
        issuance: Arc<IssuanceService>,
        trust_domain: impl Into<String>,
        nonce_ttl: Duration,
        agent_ttl: Duration,
    ) -> Self {
        Self {
            issuance,
            protocol: BootstrapProtocol::new(nonce_ttl),
            trust_domain: trust_domain.into(),
            agent_ttl,
        }
    }

    pub fn feature_gate_enabled(&self) -> bool {
        self.issuance.feature_gate_enabled()
    }

    pub fn protocol(&self) -> &BootstrapProtocol {
        &self.protocol
    }

    pub fn agent_identity(&self, agent_id: &str) -> String {
        format!("spiffe://{}/spire/agent/{}", self.trust_domain, agent_id)
    }

    pub async fn attest_agent(
        &self,
        agent_id: &str,
        csr: &[u8],
        evidence: Option<&EvidenceBundle>,
    ) -> Result<BootstrapResponse, IssuanceError> {
        if agent_id.is_empty() || agent_id.contains('/') {
            return Err(IssuanceError::InvalidRequest(format!("invalid agent id '{}'", agent_id)));
        }
        let csr = ParsedCsr::from_der(csr)?;
        let identity = self.agent_identity(agent_id);

        if !self.issuance.feature_gate_enabled() {
            let issued = self.issuance.mint(&identity, csr, self.agent_ttl, None)?;
            return Ok(BootstrapResponse::Credential(issued));
        }

        let Some(bundle) = evidence else {
            let nonce = self.protocol.issue_challenge(agent_id);
            return Ok(BootstrapResponse::Challenge { nonce });
        };

        bundle.validate()?;
        self.protocol.submit_evidence(agent_id, &bundle.challenge_nonce)?;

        let issued = match self.issuance.attest(bundle).await {
            Ok(claims) => self.issuance.mint(&identity, csr, self.agent_ttl, Some(claims)),
            Err(e) => Err(e),
        };
        match &issued {
            Ok(_) => {
                self.protocol.complete(agent_id, Ok(()));
                info!("STATUS: Bootstrap :: {} :: VERIFIED", agent_id);
            }
            Err(e) => {
                self.protocol.complete(agent_id, Err(e.to_string()));
                warn!("STATUS: Bootstrap :: {} :: DENIED ({})", agent_id, e);
            }
        }
        issued.map(BootstrapResponse::Credential)
    }
}
