//! Trusted Platform Module (TPM) bridge.
//!
//! The TPM is an opaque oracle owned by a separate plugin process. This module
//! fronts it with a [`TpmDevice`] trait and a [`TpmBridge`] that serializes
//! every hardware operation behind one async mutex, so overlapping callers
//! never interleave hardware sessions.
//!
//! Three operations are exposed:
//!
//! - `generate_app_key(force)`: create or reuse the application signing key
//! - `generate_quote(nonce, pcr_selector)`: hardware-signed quote over the nonce
//! - `request_certificate(...)`: delegated certification of the app key

pub mod software;
pub mod uds;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub use software::{CertificationMode, SoftwareQuote, SoftwareTpmDevice};
pub use uds::UdsTpmDevice;

/// Default timeout for a single TPM plugin call.
pub const DEFAULT_TPM_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum TpmError {
    /// The local channel to the TPM owner is down. Fatal, never retried.
    #[error("attestation hardware unavailable: {0}")]
    Unavailable(String),

    #[error("no app key handle: GenerateAppKey must be called first")]
    MissingAppKey,

    #[error("app key certification denied: {0}")]
    CertificationDenied(String),

    #[error("TPM plugin protocol error: {0}")]
    Protocol(String),

    #[error("invalid TPM endpoint '{0}': only unix:// sockets are accepted")]
    InvalidEndpoint(String),
}

/// Application key whose private half stays in the TPM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppKey {
    pub public_key_pem: String,
    /// Opaque handle (context path or persistent handle) understood by the device.
    pub key_handle: String,
}

/// Quote plus the delegated certificate when the device bundled one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteOutput {
    pub quote: Vec<u8>,
    pub certificate: Option<Vec<u8>>,
}

/// A TPM owner reachable from this process.
#[async_trait]
pub trait TpmDevice: Send {
    async fn generate_app_key(&mut self, force: bool) -> Result<AppKey, TpmError>;

    async fn generate_quote(
        &mut self,
        nonce: &str,
        pcr_selector: &str,
    ) -> Result<QuoteOutput, TpmError>;

    async fn request_certificate(
        &mut self,
        app_key_public: &str,
        key_handle: &str,
        endpoint: &str,
    ) -> Result<Vec<u8>, TpmError>;
}

struct BridgeState {
    device: Box<dyn TpmDevice>,
    app_key: Option<AppKey>,
}

/// Serialized access to a single TPM device.
pub struct TpmBridge {
    state: Mutex<BridgeState>,
}

impl TpmBridge {
    pub fn new<D: TpmDevice + 'static>(device: D) -> Self {
        Self {
            state: Mutex::new(BridgeState {
                device: Box::new(device),
                app_key: None,
            }),
        }
    }

    /// Bridge to the TPM plugin listening on `endpoint` (`unix://` only).
    pub fn connect_uds(endpoint: &str, work_dir: &str, timeout: Duration) -> Result<Self, TpmError> {
        let device = UdsTpmDevice::new(endpoint, work_dir, timeout)?;
        info!("STATUS: TpmBridge :: plugin endpoint {} :: CONFIGURED", endpoint);
        Ok(Self::new(device))
    }

    /// Create the app key, or return the cached one unless `force` is set.
    pub async fn generate_app_key(&self, force: bool) -> Result<AppKey, TpmError> {
        let mut state = self.state.lock().await;
        if !force {
            if let Some(key) = &state.app_key {
                debug!("TpmBridge :: reusing cached app key {}", key.key_handle);
                return Ok(key.clone());
            }
        }

        let key = state.device.generate_app_key(force).await?;
        if key.key_handle.is_empty() {
            return Err(TpmError::Protocol("device returned an empty key handle".into()));
        }
        info!("STATUS: TpmBridge :: App Key :: READY ({})", key.key_handle);
        state.app_key = Some(key.clone());
        Ok(key)
    }

    pub async fn generate_quote(
        &self,
        nonce: &str,
        pcr_selector: &str,
    ) -> Result<QuoteOutput, TpmError> {
        let mut state = self.state.lock().await;
        if state.app_key.is_none() {
            return Err(TpmError::MissingAppKey);
        }
        let output = state.device.generate_quote(nonce, pcr_selector).await?;
        if output.quote.is_empty() {
            return Err(TpmError::Protocol("device returned an empty quote".into()));
        }
        debug!(
            "TpmBridge :: quote generated ({} bytes, certificate bundled: {})",
            output.quote.len(),
            output.certificate.is_some()
        );
        Ok(output)
    }

    pub async fn request_certificate(
        &self,
        app_key_public: &str,
        key_handle: &str,
        endpoint: &str,
    ) -> Result<Vec<u8>, TpmError> {
        if key_handle.is_empty() {
            return Err(TpmError::MissingAppKey);
        }
        let mut state = self.state.lock().await;
        let certificate = state
            .device
            .request_certificate(app_key_public, key_handle, endpoint)
            .await?;
        if certificate.is_empty() {
            warn!("TpmBridge :: certification returned no certificate");
            return Err(TpmError::CertificationDenied("empty certificate".into()));
        }
        Ok(certificate)
    }

    /// Cached app key, if `generate_app_key` has succeeded.
    pub async fn app_key(&self) -> Option<AppKey> {
        self.state.lock().await.app_key.clone()
    }
}
