//! Core functionality shared by the sovereign attestation workspace.
//!
//! This crate provides configuration loading, structured logging setup,
//! the core error type and time helpers used by the identity crate and
//! the node service.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::{
    AgentConfig, BootstrapConfig, CaConfig, Config, EntryConfig, FeatureConfig, PolicyConfig,
    ServerConfig, VerifierConfig, VerifierMode,
};
pub use error::{CoreError, Result};
pub use types::{current_timestamp_ms, current_timestamp_secs};
