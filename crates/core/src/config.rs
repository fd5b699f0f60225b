//! Configuration management for the sovereign attestation node.
//!
//! Everything here is read once at process start. The feature gate and the
//! policy are not hot-reloadable; changing them requires a restart.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::CoreError;

/// Default TPM plugin socket.
pub const DEFAULT_TPM_ENDPOINT: &str = "unix:///tmp/spire-data/tpm-plugin/tpm-plugin.sock";

/// Default PCR selection for quotes.
pub const DEFAULT_PCR_SELECTOR: &str = "sha256:0,1,2,3,4,5,6,7";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub features: FeatureConfig,
    pub policy: PolicyConfig,
    pub verifier: VerifierConfig,
    pub bootstrap: BootstrapConfig,
    pub ca: CaConfig,
    pub entries: Vec<EntryConfig>,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub trust_domain: String,
    pub default_ttl_secs: u64,
    pub agent_ttl_secs: u64,
    /// `plain` or `json`
    pub log_format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8081".to_string(),
            trust_domain: "example.org".to_string(),
            default_ttl_secs: 3600,
            agent_ttl_secs: 3600,
            log_format: "plain".to_string(),
        }
    }
}

/// Process-wide switches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Gate for attested issuance. Off means evidence is ignored.
    pub unified_identity: bool,
}

/// Rules evaluated against attested claims.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Exact values or `Prefix:*` patterns. Empty disables the check.
    pub allowed_geolocations: Vec<String>,
    pub require_integrity: bool,
    pub require_healthy_accelerator: bool,
    pub min_accelerator_utilization_pct: Option<f64>,
    pub max_accelerator_utilization_pct: Option<f64>,
    pub min_accelerator_memory_mb: Option<i64>,
}

/// Which verifier backs attestation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifierMode {
    /// External verifier over HTTPS.
    #[default]
    Remote,
    /// In-process check of software TPM quotes. Development only.
    Software,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    pub mode: VerifierMode,
    pub base_url: String,
    pub timeout_secs: u64,
    /// PEM bundle used to authenticate the verifier.
    pub ca_cert_path: Option<PathBuf>,
    /// PEM file holding the client certificate followed by its private key.
    pub client_identity_path: Option<PathBuf>,
    /// Geolocation reported by the software verifier.
    pub software_geolocation: Option<String>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            mode: VerifierMode::Remote,
            base_url: "http://127.0.0.1:8881".to_string(),
            timeout_secs: 60,
            ca_cert_path: None,
            client_identity_path: None,
            software_geolocation: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub nonce_ttl_secs: u64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self { nonce_ttl_secs: 30 }
    }
}

/// Issuing CA material. Without both paths an ephemeral CA is generated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaConfig {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub common_name: String,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            cert_path: None,
            key_path: None,
            common_name: "Sovereign Issuing CA".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryConfig {
    pub id: String,
    pub spiffe_id: String,
    pub parent_id: String,
    #[serde(default)]
    pub selectors: Vec<String>,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent_id: String,
    pub server_addr: String,
    pub tpm_endpoint: String,
    pub pcr_selector: String,
    pub work_dir: String,
    /// Endpoint handed to the TPM plugin for delegated certification.
    pub certification_endpoint: String,
    pub workload_code_hash: String,
    pub request_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: "agent-001".to_string(),
            server_addr: "http://127.0.0.1:8081".to_string(),
            tpm_endpoint: DEFAULT_TPM_ENDPOINT.to_string(),
            pcr_selector: DEFAULT_PCR_SELECTOR.to_string(),
            work_dir: "/tmp/spire-data/tpm-plugin".to_string(),
            certification_endpoint: "http://127.0.0.1:9002".to_string(),
            workload_code_hash: String::new(),
            request_timeout_secs: 30,
        }
    }
}

impl Config {
    #[cfg(feature = "toml")]
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!(
            "Config :: loaded {} ({} registration entries)",
            path.display(),
            config.entries.len()
        );
        Ok(config)
    }

    #[cfg(feature = "toml")]
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work at runtime.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.server.trust_domain.trim().is_empty() {
            return Err(CoreError::Config("server.trust_domain must not be empty".into()));
        }
        if !self.agent.tpm_endpoint.starts_with("unix://") {
            return Err(CoreError::Config(format!(
                "agent.tpm_endpoint must be a unix:// socket, got {}",
                self.agent.tpm_endpoint
            )));
        }
        if self.bootstrap.nonce_ttl_secs == 0 {
            return Err(CoreError::Config("bootstrap.nonce_ttl_secs must be positive".into()));
        }
        if self.verifier.timeout_secs == 0 {
            return Err(CoreError::Config("verifier.timeout_secs must be positive".into()));
        }
        if self.agent.request_timeout_secs == 0 {
            return Err(CoreError::Config("agent.request_timeout_secs must be positive".into()));
        }
        if self.verifier.mode == VerifierMode::Software {
            tracing::warn!("Config :: verifier.mode = software, evidence is checked locally only");
        }
        for entry in &self.entries {
            if entry.id.is_empty() || entry.spiffe_id.is_empty() {
                return Err(CoreError::Config(format!(
                    "registration entry '{}' needs both id and spiffe_id",
                    entry.id
                )));
            }
        }
        Ok(())
    }
}
