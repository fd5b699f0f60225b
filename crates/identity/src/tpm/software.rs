//! Software TPM device.
//!
//! Emulates the TPM plugin with an in-memory P-256 app key and synthetic PCR
//! banks. Used for development nodes and tests; it provides no hardware root
//! of trust.

use async_trait::async_trait;
use p256::ecdsa::{signature::Signer, signature::Verifier, Signature, SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use super::{AppKey, QuoteOutput, TpmDevice, TpmError};

const QUOTE_MAGIC: &[u8] = b"SOVEREIGN_SW_QUOTE_";
const MAX_PCR_INDEX: u8 = 23;

/// How the device handles delegated certification of its app key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificationMode {
    /// Certificate returned inline with every quote.
    Bundled,
    /// Only available through `request_certificate`.
    OnRequest,
    /// Certification always refused.
    Denied,
}

/// Quote format produced by [`SoftwareTpmDevice`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SoftwareQuote {
    pub pcr_bank: String,
    pub pcrs: Vec<PcrValue>,
    pub nonce: String,
    pub timestamp: u64,
    /// Signed payload: magic, nonce and PCR digest.
    pub attestation_data: Vec<u8>,
    /// DER ECDSA signature over `attestation_data`.
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PcrValue {
    pub index: u8,
    pub value: Vec<u8>,
}

impl SoftwareQuote {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TpmError> {
        serde_json::from_slice(bytes).map_err(|e| TpmError::Protocol(format!("bad quote: {}", e)))
    }

    /// Check the signature against `public_key_pem` and the binding to `expected_nonce`.
    pub fn verify(&self, public_key_pem: &str, expected_nonce: &str) -> bool {
        match self.check(public_key_pem, expected_nonce) {
            Ok(()) => {
                info!("TrustGate :: Software Quote Verified");
                true
            }
            Err(reason) => {
                error!("TrustGate :: Software Quote REJECTED :: {}", reason);
                false
            }
        }
    }

    fn check(&self, public_key_pem: &str, expected_nonce: &str) -> Result<(), String> {
        let public_key = p256::PublicKey::from_public_key_pem(public_key_pem)
            .map_err(|e| format!("invalid public key: {}", e))?;
        let verifying_key = VerifyingKey::from(public_key);
        let signature =
            Signature::from_der(&self.signature).map_err(|_| "invalid DER signature".to_string())?;
        verifying_key
            .verify(&self.attestation_data, &signature)
            .map_err(|_| "signature mismatch".to_string())?;

        if self.nonce != expected_nonce {
            return Err("nonce mismatch".into());
        }
        if self.attestation_data != signed_payload(&self.nonce, &self.pcrs) {
            return Err("signed payload does not match quote contents".into());
        }
        Ok(())
    }
}

/// In-memory TPM emulation.
pub struct SoftwareTpmDevice {
    secret_key: Option<p256::SecretKey>,
    generation: u64,
    certification: CertificationMode,
    measurement_seed: [u8; 32],
}

impl Default for SoftwareTpmDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareTpmDevice {
    pub fn new() -> Self {
        Self::with_certification(CertificationMode::Bundled)
    }

    pub fn with_certification(certification: CertificationMode) -> Self {
        warn!("STATUS: SoftwareTpmDevice :: Hardware Root of Trust :: STUBBED");
        Self {
            secret_key: None,
            generation: 0,
            certification,
            measurement_seed: *blake3::hash(b"sovereign-software-tpm").as_bytes(),
        }
    }

    fn secret_key(&self) -> Result<&p256::SecretKey, TpmError> {
        self.secret_key.as_ref().ok_or(TpmError::MissingAppKey)
    }

    fn public_key_pem(&self) -> Result<String, TpmError> {
        self.secret_key()?
            .public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| TpmError::Protocol(format!("public key encoding failed: {}", e)))
    }

    fn key_handle(&self) -> String {
        format!("software-ak-{}", self.generation)
    }

    /// Self-certify the app key; stands in for the delegated certifier.
    fn certify(&self) -> Result<Vec<u8>, TpmError> {
        let pkcs8 = self
            .secret_key()?
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| TpmError::CertificationDenied(e.to_string()))?;
        let key_pair = rcgen::KeyPair::from_pem(&pkcs8)
            .map_err(|e| TpmError::CertificationDenied(e.to_string()))?;
        let mut params = rcgen::CertificateParams::default();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, self.key_handle());
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| TpmError::CertificationDenied(e.to_string()))?;
        Ok(cert.der().to_vec())
    }

    /// Certificate carried inside a quote. A certification failure only drops
    /// the certificate; the assembler then falls back to `request_certificate`.
    fn bundled_certificate(&self) -> Option<Vec<u8>> {
        match self.certify() {
            Ok(cert) => Some(cert),
            Err(e) => {
                warn!(
                    "SoftwareTpmDevice :: bundled certification failed, quoting without certificate: {}",
                    e
                );
                None
            }
        }
    }

    fn pcr_values(&self, indices: &[u8]) -> Vec<PcrValue> {
        indices
            .iter()
            .map(|&index| {
                let mut hasher = Sha256::new();
                hasher.update(self.measurement_seed);
                hasher.update([index]);
                PcrValue {
                    index,
                    value: hasher.finalize().to_vec(),
                }
            })
            .collect()
    }
}

#[async_trait]
impl TpmDevice for SoftwareTpmDevice {
    async fn generate_app_key(&mut self, force: bool) -> Result<AppKey, TpmError> {
        if self.secret_key.is_none() || force {
            self.secret_key = Some(p256::SecretKey::random(&mut rand::thread_rng()));
            self.generation += 1;
        }
        Ok(AppKey {
            public_key_pem: self.public_key_pem()?,
            key_handle: self.key_handle(),
        })
    }

    async fn generate_quote(
        &mut self,
        nonce: &str,
        pcr_selector: &str,
    ) -> Result<QuoteOutput, TpmError> {
        let (pcr_bank, indices) = parse_pcr_selector(pcr_selector)?;
        let signing_key = SigningKey::from(self.secret_key()?.clone());

        let pcrs = self.pcr_values(&indices);
        let attestation_data = signed_payload(nonce, &pcrs);
        let signature: Signature = signing_key.sign(&attestation_data);

        let quote = SoftwareQuote {
            pcr_bank,
            pcrs,
            nonce: nonce.to_string(),
            timestamp: sovereign_core::current_timestamp_secs(),
            attestation_data,
            signature: signature.to_der().as_bytes().to_vec(),
        };
        let quote = serde_json::to_vec(&quote)
            .map_err(|e| TpmError::Protocol(format!("quote encoding failed: {}", e)))?;

        let certificate = match self.certification {
            CertificationMode::Bundled => self.bundled_certificate(),
            CertificationMode::OnRequest | CertificationMode::Denied => None,
        };
        Ok(QuoteOutput { quote, certificate })
    }

    async fn request_certificate(
        &mut self,
        _app_key_public: &str,
        key_handle: &str,
        _endpoint: &str,
    ) -> Result<Vec<u8>, TpmError> {
        if key_handle != self.key_handle() {
            return Err(TpmError::MissingAppKey);
        }
        match self.certification {
            CertificationMode::Denied => Err(TpmError::CertificationDenied(
                "software certifier configured to deny".into(),
            )),
            CertificationMode::Bundled | CertificationMode::OnRequest => self.certify(),
        }
    }
}

fn signed_payload(nonce: &str, pcrs: &[PcrValue]) -> Vec<u8> {
    let mut digest = Sha256::new();
    for pcr in pcrs {
        digest.update([pcr.index]);
        digest.update(&pcr.value);
    }
    let mut data = QUOTE_MAGIC.to_vec();
    data.extend_from_slice(nonce.as_bytes());
    data.extend_from_slice(&digest.finalize());
    data
}

/// Parse `"sha256:0,1,2"` into the bank name and register indices.
pub fn parse_pcr_selector(selector: &str) -> Result<(String, Vec<u8>), TpmError> {
    let (bank, list) = selector
        .split_once(':')
        .ok_or_else(|| TpmError::Protocol(format!("PCR selector '{}' lacks a bank", selector)))?;
    let mut indices = Vec::new();
    for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let index: u8 = item
            .parse()
            .map_err(|_| TpmError::Protocol(format!("invalid PCR index '{}'", item)))?;
        if index > MAX_PCR_INDEX {
            return Err(TpmError::Protocol(format!("PCR index {} out of range", index)));
        }
        indices.push(index);
    }
    if indices.is_empty() {
        return Err(TpmError::Protocol("empty PCR selection".into()));
    }
    Ok((bank.to_string(), indices))
}
