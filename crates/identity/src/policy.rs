//! Policy decision point for attested claims.
//!
//! Evaluation is deterministic and side-effect free. Configured checks are
//! ANDed; the first failing check names the denial reason.

use serde::{Deserialize, Serialize};
use sovereign_core::PolicyConfig;

use crate::claims::{AttestedClaims, HostIntegrityStatus};

/// Accelerator status required by `require_healthy_accelerator`.
pub const HEALTHY_ACCELERATOR_STATUS: &str = "healthy";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: String,
}

impl PolicyDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: "all policy checks passed".to_string(),
        }
    }

    fn deny(reason: String) -> Self {
        Self {
            allowed: false,
            reason,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
    config: PolicyConfig,
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn evaluate(&self, claims: &AttestedClaims) -> PolicyDecision {
        let checks = [
            self.check_geolocation(claims),
            self.check_integrity(claims),
            self.check_accelerator(claims),
        ];
        match checks.into_iter().flatten().next() {
            Some(reason) => PolicyDecision::deny(reason),
            None => PolicyDecision::allow(),
        }
    }

    fn check_geolocation(&self, claims: &AttestedClaims) -> Option<String> {
        let allowed = &self.config.allowed_geolocations;
        if allowed.is_empty() {
            return None;
        }
        match claims.geolocation.as_deref().filter(|g| !g.is_empty()) {
            None => Some("geolocation missing but an allow-list is configured".to_string()),
            Some(geo) if allowed.iter().any(|p| geolocation_matches(p, geo)) => None,
            Some(geo) => Some(format!("geolocation {} not in allowed list", geo)),
        }
    }

    fn check_integrity(&self, claims: &AttestedClaims) -> Option<String> {
        if self.config.require_integrity
            && claims.host_integrity_status != HostIntegrityStatus::PassedAllChecks
        {
            return Some(format!(
                "host integrity status is {}, required {}",
                claims.host_integrity_status,
                HostIntegrityStatus::PassedAllChecks
            ));
        }
        None
    }

    fn accelerator_checks_configured(&self) -> bool {
        self.config.require_healthy_accelerator
            || self.config.min_accelerator_utilization_pct.is_some()
            || self.config.max_accelerator_utilization_pct.is_some()
            || self.config.min_accelerator_memory_mb.is_some()
    }

    fn check_accelerator(&self, claims: &AttestedClaims) -> Option<String> {
        if !self.accelerator_checks_configured() {
            return None;
        }
        let Some(health) = &claims.accelerator_health else {
            return Some("accelerator health missing but accelerator checks are configured".to_string());
        };

        if self.config.require_healthy_accelerator && health.status != HEALTHY_ACCELERATOR_STATUS {
            return Some(format!(
                "accelerator status is {}, required {}",
                health.status, HEALTHY_ACCELERATOR_STATUS
            ));
        }
        if let Some(min) = self.config.min_accelerator_utilization_pct {
            if health.utilization_pct < min {
                return Some(format!(
                    "accelerator utilization {:.1}% below minimum {:.1}%",
                    health.utilization_pct, min
                ));
            }
        }
        if let Some(max) = self.config.max_accelerator_utilization_pct {
            if health.utilization_pct > max {
                return Some(format!(
                    "accelerator utilization {:.1}% above maximum {:.1}%",
                    health.utilization_pct, max
                ));
            }
        }
        if let Some(min) = self.config.min_accelerator_memory_mb {
            if health.memory_mb < min {
                return Some(format!(
                    "accelerator memory {} MB below minimum {} MB",
                    health.memory_mb, min
                ));
            }
        }
        None
    }
}

/// Exact match, or `Prefix:*` / `Prefix: *` matching anything under `Prefix:`.
pub fn geolocation_matches(pattern: &str, geolocation: &str) -> bool {
    let prefix = pattern
        .strip_suffix(":*")
        .or_else(|| pattern.strip_suffix(": *"));
    match prefix {
        Some(prefix) => geolocation.starts_with(&format!("{}:", prefix)),
        None => pattern == geolocation,
    }
}
