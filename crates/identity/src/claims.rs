//! Attested claims carried by issued credentials.
//!
//! Claims are a record of independently optional facts. Callers check which
//! facts are populated through [`AttestedClaims::populated`] instead of
//! inspecting variants at runtime.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Private OID of the non-critical attested claims certificate extension.
pub const ATTESTED_CLAIMS_OID: &[u64] = &[1, 3, 6, 1, 4, 1, 99999, 1];

/// Dotted form of [`ATTESTED_CLAIMS_OID`].
pub const ATTESTED_CLAIMS_OID_STR: &str = "1.3.6.1.4.1.99999.1";

/// Host integrity verdict reported by the attestation verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HostIntegrityStatus {
    #[default]
    Unspecified,
    PassedAllChecks,
    Failed,
    Degraded,
}

impl HostIntegrityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostIntegrityStatus::Unspecified => "UNSPECIFIED",
            HostIntegrityStatus::PassedAllChecks => "PASSED_ALL_CHECKS",
            HostIntegrityStatus::Failed => "FAILED",
            HostIntegrityStatus::Degraded => "DEGRADED",
        }
    }

    /// Case-insensitive parse. Unknown values map to `Unspecified`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "PASSED_ALL_CHECKS" => HostIntegrityStatus::PassedAllChecks,
            "FAILED" => HostIntegrityStatus::Failed,
            "DEGRADED" => HostIntegrityStatus::Degraded,
            _ => HostIntegrityStatus::Unspecified,
        }
    }
}

impl fmt::Display for HostIntegrityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for HostIntegrityStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for HostIntegrityStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(HostIntegrityStatus::parse(&raw))
    }
}

/// Accelerator (GPU) health sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceleratorHealth {
    pub status: String,
    pub utilization_pct: f64,
    pub memory_mb: i64,
}

/// Verified facts about the attesting host.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AttestedClaims {
    /// e.g. "Spain: Madrid"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geolocation: Option<String>,
    #[serde(default)]
    pub host_integrity_status: HostIntegrityStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerator_health: Option<AcceleratorHealth>,
}

/// Which claim fields carry a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PopulatedClaims {
    pub geolocation: bool,
    pub host_integrity: bool,
    pub accelerator_health: bool,
}

impl AttestedClaims {
    pub fn populated(&self) -> PopulatedClaims {
        PopulatedClaims {
            geolocation: self.geolocation.as_deref().is_some_and(|g| !g.is_empty()),
            host_integrity: self.host_integrity_status != HostIntegrityStatus::Unspecified,
            accelerator_health: self.accelerator_health.is_some(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.populated() == PopulatedClaims::default()
    }

    /// JSON payload embedded in the certificate extension.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_status_parse_is_case_insensitive() {
        assert_eq!(
            HostIntegrityStatus::parse("passed_all_checks"),
            HostIntegrityStatus::PassedAllChecks
        );
        assert_eq!(HostIntegrityStatus::parse("Degraded"), HostIntegrityStatus::Degraded);
        assert_eq!(HostIntegrityStatus::parse("bogus"), HostIntegrityStatus::Unspecified);
    }

    #[test]
    fn test_json_omits_absent_fields() {
        let claims = AttestedClaims {
            geolocation: Some("Spain: Madrid".to_string()),
            ..Default::default()
        };
        let json = String::from_utf8(claims.to_json().unwrap()).unwrap();
        assert!(json.contains("\"geolocation\":\"Spain: Madrid\""));
        assert!(json.contains("\"host_integrity_status\":\"UNSPECIFIED\""));
        assert!(!json.contains("accelerator_health"));
    }

    #[test]
    fn test_json_roundtrip_with_accelerator() {
        let claims = AttestedClaims {
            geolocation: Some("Spain: Madrid".to_string()),
            host_integrity_status: HostIntegrityStatus::PassedAllChecks,
            accelerator_health: Some(AcceleratorHealth {
                status: "healthy".to_string(),
                utilization_pct: 15.5,
                memory_mb: 10240,
            }),
        };
        let decoded = AttestedClaims::from_json(&claims.to_json().unwrap()).unwrap();
        assert_eq!(decoded, claims);
    }

    #[test]
    fn test_populated_fields() {
        let mut claims = AttestedClaims::default();
        assert!(claims.is_empty());

        claims.host_integrity_status = HostIntegrityStatus::Failed;
        let populated = claims.populated();
        assert!(populated.host_integrity);
        assert!(!populated.geolocation);
        assert!(!populated.accelerator_health);

        claims.geolocation = Some(String::new());
        assert!(!claims.populated().geolocation);
    }
}
