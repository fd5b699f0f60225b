//! TPM plugin client over a Unix domain socket.
//!
//! The plugin speaks HTTP/1.1 with JSON bodies. Attestation material never
//! crosses a loopback TCP port: endpoints must use the `unix://` scheme.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Body, Method, Request};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UnixStream;
use tracing::{debug, error, instrument};

use super::{AppKey, QuoteOutput, TpmDevice, TpmError};

const STATUS_SUCCESS: &str = "success";

#[derive(Debug, Serialize)]
struct GenerateAppKeyRequest<'a> {
    work_dir: &'a str,
    force: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateAppKeyResponse {
    status: String,
    #[serde(default)]
    app_key_public: String,
    #[serde(default)]
    app_key_context: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct GenerateQuoteRequest<'a> {
    nonce: &'a str,
    pcr_list: &'a str,
    work_dir: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateQuoteResponse {
    status: String,
    #[serde(default)]
    quote: String,
    #[serde(default)]
    app_key_certificate: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct RequestCertificateRequest<'a> {
    app_key_public: &'a str,
    app_key_context_path: &'a str,
    endpoint: &'a str,
}

#[derive(Debug, Deserialize)]
struct RequestCertificateResponse {
    status: String,
    #[serde(default)]
    app_key_certificate: String,
    #[serde(default)]
    message: Option<String>,
}

fn check_status(path: &str, status: &str, message: Option<&str>) -> Result<(), TpmError> {
    if status == STATUS_SUCCESS {
        Ok(())
    } else {
        Err(TpmError::Protocol(format!(
            "{} returned status '{}': {}",
            path,
            status,
            message.unwrap_or("no message")
        )))
    }
}

/// Client for the TPM plugin process.
#[derive(Debug, Clone)]
pub struct UdsTpmDevice {
    socket_path: PathBuf,
    work_dir: String,
    timeout: Duration,
}

impl UdsTpmDevice {
    pub fn new(endpoint: &str, work_dir: &str, timeout: Duration) -> Result<Self, TpmError> {
        let path = endpoint
            .strip_prefix("unix://")
            .filter(|p| !p.is_empty())
            .ok_or_else(|| TpmError::InvalidEndpoint(endpoint.to_string()))?;
        Ok(Self {
            socket_path: PathBuf::from(path),
            work_dir: work_dir.to_string(),
            timeout,
        })
    }

    pub fn socket_path(&self) -> &std::path::Path {
        &self.socket_path
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, TpmError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        match tokio::time::timeout(self.timeout, self.exchange(path, body)).await {
            Ok(result) => result,
            Err(_) => {
                error!("TpmBridge :: {} timed out after {:?}", path, self.timeout);
                Err(TpmError::Unavailable(format!(
                    "{} timed out after {:?}",
                    path, self.timeout
                )))
            }
        }
    }

    async fn exchange<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, TpmError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            TpmError::Unavailable(format!("{}: {}", self.socket_path.display(), e))
        })?;
        let (mut sender, connection) = hyper::client::conn::handshake(stream)
            .await
            .map_err(|e| TpmError::Unavailable(format!("handshake failed: {}", e)))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("TpmBridge :: plugin connection closed: {}", e);
            }
        });

        let payload = serde_json::to_vec(body)
            .map_err(|e| TpmError::Protocol(format!("request encoding failed: {}", e)))?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(HOST, "tpm-plugin")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(payload))
            .map_err(|e| TpmError::Protocol(e.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| TpmError::Unavailable(format!("{} failed: {}", path, e)))?;
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| TpmError::Unavailable(format!("{} body read failed: {}", path, e)))?;

        if !status.is_success() {
            return Err(TpmError::Protocol(format!(
                "{} returned HTTP {}: {}",
                path,
                status,
                String::from_utf8_lossy(&bytes)
            )));
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| TpmError::Protocol(format!("{} response decoding failed: {}", path, e)))
    }
}

#[async_trait]
impl TpmDevice for UdsTpmDevice {
    #[instrument(skip(self))]
    async fn generate_app_key(&mut self, force: bool) -> Result<AppKey, TpmError> {
        let path = "/generate-app-key";
        let response: GenerateAppKeyResponse = self
            .post(path, &GenerateAppKeyRequest { work_dir: &self.work_dir, force })
            .await?;
        check_status(path, &response.status, response.message.as_deref())?;
        if response.app_key_public.is_empty() {
            return Err(TpmError::Protocol(format!("{} returned no public key", path)));
        }
        Ok(AppKey {
            public_key_pem: response.app_key_public,
            key_handle: response.app_key_context,
        })
    }

    #[instrument(skip(self, nonce))]
    async fn generate_quote(
        &mut self,
        nonce: &str,
        pcr_selector: &str,
    ) -> Result<QuoteOutput, TpmError> {
        let path = "/generate-quote";
        let response: GenerateQuoteResponse = self
            .post(
                path,
                &GenerateQuoteRequest {
                    nonce,
                    pcr_list: pcr_selector,
                    work_dir: &self.work_dir,
                },
            )
            .await?;
        check_status(path, &response.status, response.message.as_deref())?;

        let quote = BASE64
            .decode(response.quote.as_bytes())
            .map_err(|e| TpmError::Protocol(format!("quote is not base64: {}", e)))?;
        let certificate = match response.app_key_certificate.as_deref() {
            None | Some("") => None,
            Some(encoded) => match BASE64.decode(encoded.as_bytes()) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    debug!("TpmBridge :: dropping undecodable bundled certificate: {}", e);
                    None
                }
            },
        };
        Ok(QuoteOutput { quote, certificate })
    }

    #[instrument(skip(self, app_key_public))]
    async fn request_certificate(
        &mut self,
        app_key_public: &str,
        key_handle: &str,
        endpoint: &str,
    ) -> Result<Vec<u8>, TpmError> {
        let path = "/request-certificate";
        let response: RequestCertificateResponse = match self
            .post(
                path,
                &RequestCertificateRequest {
                    app_key_public,
                    app_key_context_path: key_handle,
                    endpoint,
                },
            )
            .await
        {
            Ok(response) => response,
            Err(TpmError::Protocol(reason)) => return Err(TpmError::CertificationDenied(reason)),
            Err(e) => return Err(e),
        };
        if response.status != STATUS_SUCCESS {
            return Err(TpmError::CertificationDenied(
                response
                    .message
                    .unwrap_or_else(|| format!("status '{}'", response.status)),
            ));
        }
        BASE64
            .decode(response.app_key_certificate.as_bytes())
            .map_err(|e| TpmError::CertificationDenied(format!("certificate is not base64: {}", e)))
    }
}
