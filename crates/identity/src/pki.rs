//! Credential minting for workload and agent identities.
//!
//! The certificate authority signs CSRs into short-lived X.509 leaves whose
//! only subject alternative name is the identity URI. Attested claims, when
//! present, travel in a private non-critical extension as JSON.

use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, CustomExtension,
    DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
    SerialNumber,
};
use sovereign_core::CaConfig;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};
use x509_parser::extensions::GeneralName;

use crate::claims::{AttestedClaims, ATTESTED_CLAIMS_OID, ATTESTED_CLAIMS_OID_STR};

/// Validity backdating to absorb clock skew between nodes.
const BACKDATE_SECS: i64 = 60;

/// Lifetime of a generated CA certificate.
const CA_VALIDITY_DAYS: i64 = 365;

#[derive(Debug, Error)]
pub enum CaError {
    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    #[error("invalid identity URI '{0}'")]
    InvalidIdentity(String),

    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("claims encoding failed: {0}")]
    ClaimsEncoding(#[from] serde_json::Error),

    #[error("certificate parsing failed: {0}")]
    Parse(String),

    #[error("CA material unreadable: {0}")]
    Io(#[from] std::io::Error),
}

/// A CSR that parsed and whose self-signature verified.
#[derive(Debug, Clone)]
pub struct ParsedCsr {
    params: CertificateSigningRequestParams,
}

impl ParsedCsr {
    pub fn from_der(der: &[u8]) -> Result<Self, CaError> {
        if der.is_empty() {
            return Err(CaError::InvalidCsr("empty CSR".into()));
        }
        let params = CertificateSigningRequestParams::from_der(&der.into())
            .map_err(|e| CaError::InvalidCsr(e.to_string()))?;
        Ok(Self { params })
    }
}

/// Issued certificate chain, leaf first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub cert_chain: Vec<Vec<u8>>,
    /// Unix seconds.
    pub expires_at: u64,
    pub serial: String,
}

impl Credential {
    pub fn leaf(&self) -> &[u8] {
        self.cert_chain.first().map(Vec::as_slice).unwrap_or_default()
    }
}

/// Signing authority for identity credentials.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_der: Vec<u8>,
    cert_pem: String,
}

impl CertificateAuthority {
    /// Ephemeral self-signed CA for `trust_domain`.
    pub fn generate(common_name: &str, trust_domain: &str) -> Result<Self, CaError> {
        let key = KeyPair::generate()?;
        let now = OffsetDateTime::now_utc();

        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.distinguished_name.push(DnType::OrganizationName, trust_domain);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let trust_domain_uri = format!("spiffe://{}", trust_domain);
        params.subject_alt_names = vec![SanType::URI(
            trust_domain_uri
                .as_str()
                .try_into()
                .map_err(|_| CaError::InvalidIdentity(trust_domain_uri.clone()))?,
        )];
        params.not_before = now - time::Duration::seconds(BACKDATE_SECS);
        params.not_after = now + time::Duration::days(CA_VALIDITY_DAYS);

        let cert = params.self_signed(&key)?;
        warn!("STATUS: CertificateAuthority :: {} :: EPHEMERAL", common_name);
        Ok(Self {
            cert_der: cert.der().to_vec(),
            cert_pem: cert.pem(),
            issuer: Issuer::new(params, key),
        })
    }

    /// Load an existing CA certificate and its private key.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CaError> {
        let key = KeyPair::from_pem(key_pem)?;
        let issuer = Issuer::from_ca_cert_pem(cert_pem, key)?;
        let (_, parsed) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
            .map_err(|e| CaError::Parse(e.to_string()))?;
        Ok(Self {
            issuer,
            cert_der: parsed.contents,
            cert_pem: cert_pem.to_string(),
        })
    }

    /// CA from configured files, or an ephemeral one when none are configured.
    pub fn from_config(config: &CaConfig, trust_domain: &str) -> Result<Self, CaError> {
        match (&config.cert_path, &config.key_path) {
            (Some(cert_path), Some(key_path)) => {
                let cert_pem = std::fs::read_to_string(cert_path)?;
                let key_pem = std::fs::read_to_string(key_path)?;
                let ca = Self::from_pem(&cert_pem, &key_pem)?;
                info!("STATUS: CertificateAuthority :: loaded {}", cert_path.display());
                Ok(ca)
            }
            _ => Self::generate(&config.common_name, trust_domain),
        }
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.cert_der
    }

    pub fn certificate_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Sign `csr` for `identity_uri`, embedding `claims` when given.
    ///
    /// Requested subject alternative names and extensions are discarded; the
    /// leaf carries only what the registration entry authorizes.
    pub fn mint(
        &self,
        identity_uri: &str,
        csr: ParsedCsr,
        ttl: Duration,
        claims: Option<&AttestedClaims>,
    ) -> Result<Credential, CaError> {
        let mut csr = csr.params;
        let now = OffsetDateTime::now_utc();
        let not_after = now + ttl;

        let mut serial = [0u8; 16];
        OsRng.fill_bytes(&mut serial);
        serial[0] &= 0x7f;
        let serial = SerialNumber::from_slice(&serial);

        let params = &mut csr.params;
        params.subject_alt_names = vec![SanType::URI(
            identity_uri
                .try_into()
                .map_err(|_| CaError::InvalidIdentity(identity_uri.to_string()))?,
        )];
        params.not_before = now - time::Duration::seconds(BACKDATE_SECS);
        params.not_after = not_after;
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyAgreement,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.serial_number = Some(serial.clone());
        params.use_authority_key_identifier_extension = true;
        params.custom_extensions.clear();

        if let Some(claims) = claims {
            let mut extension = CustomExtension::from_oid_content(ATTESTED_CLAIMS_OID, claims.to_json()?);
            extension.set_criticality(false);
            params.custom_extensions.push(extension);
        }

        let cert = csr.signed_by(&self.issuer)?;
        Ok(Credential {
            cert_chain: vec![cert.der().to_vec(), self.cert_der.clone()],
            expires_at: not_after.unix_timestamp().max(0) as u64,
            serial: serial.to_string(),
        })
    }

    /// Check that `leaf_der` was signed by this CA.
    pub fn verify_issued(&self, leaf_der: &[u8]) -> Result<(), CaError> {
        let (_, ca) = x509_parser::parse_x509_certificate(&self.cert_der)
            .map_err(|e| CaError::Parse(e.to_string()))?;
        let (_, leaf) = x509_parser::parse_x509_certificate(leaf_der)
            .map_err(|e| CaError::Parse(e.to_string()))?;
        leaf.verify_signature(Some(ca.public_key()))
            .map_err(|e| CaError::Parse(format!("signature check failed: {}", e)))
    }
}

/// Attested claims embedded in a certificate.
///
/// `Ok(None)` means the certificate carries no claims; that is not an error.
pub fn extract_attested_claims(cert_der: &[u8]) -> Result<Option<AttestedClaims>, CaError> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| CaError::Parse(e.to_string()))?;
    for extension in cert.extensions() {
        if extension.oid.to_id_string() == ATTESTED_CLAIMS_OID_STR {
            return Ok(Some(AttestedClaims::from_json(extension.value)?));
        }
    }
    Ok(None)
}

/// Serial number of a certificate as colon-separated hex.
pub fn serial_number(cert_der: &[u8]) -> Result<String, CaError> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| CaError::Parse(e.to_string()))?;
    Ok(cert.raw_serial_as_string())
}

/// First URI subject alternative name of a certificate.
pub fn identity_uri(cert_der: &[u8]) -> Result<Option<String>, CaError> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| CaError::Parse(e.to_string()))?;
    let san = cert
        .subject_alternative_name()
        .map_err(|e| CaError::Parse(e.to_string()))?;
    Ok(san.and_then(|san| {
        san.value.general_names.iter().find_map(|name| match name {
            GeneralName::URI(uri) => Some(uri.to_string()),
            _ => None,
        })
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::HostIntegrityStatus;

    fn csr_der() -> Vec<u8> {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, "workload");
        params.serialize_request(&key).unwrap().der().to_vec()
    }

    fn ca() -> CertificateAuthority {
        CertificateAuthority::generate("Test CA", "sovereign.example").unwrap()
    }

    #[test]
    fn test_mint_without_claims() {
        let ca = ca();
        let csr = ParsedCsr::from_der(&csr_der()).unwrap();
        let credential = ca
            .mint("spiffe://sovereign.example/workload/007", csr, Duration::from_secs(600), None)
            .unwrap();

        assert_eq!(credential.cert_chain.len(), 2);
        assert_eq!(extract_attested_claims(credential.leaf()).unwrap(), None);
        assert_eq!(
            identity_uri(credential.leaf()).unwrap().as_deref(),
            Some("spiffe://sovereign.example/workload/007")
        );
        ca.verify_issued(credential.leaf()).unwrap();
    }

    #[test]
    fn test_claims_extension_roundtrip() {
        let ca = ca();
        let claims = AttestedClaims {
            geolocation: Some("Spain: Madrid".to_string()),
            host_integrity_status: HostIntegrityStatus::PassedAllChecks,
            accelerator_health: None,
        };
        let csr = ParsedCsr::from_der(&csr_der()).unwrap();
        let credential = ca
            .mint("spiffe://sovereign.example/w", csr, Duration::from_secs(600), Some(&claims))
            .unwrap();

        assert_eq!(extract_attested_claims(credential.leaf()).unwrap(), Some(claims));

        let (_, cert) = x509_parser::parse_x509_certificate(credential.leaf()).unwrap();
        let extension = cert
            .extensions()
            .iter()
            .find(|e| e.oid.to_id_string() == ATTESTED_CLAIMS_OID_STR)
            .unwrap();
        assert!(!extension.critical);
    }

    #[test]
    fn test_expiry_follows_ttl() {
        let ca = ca();
        let before = sovereign_core::current_timestamp_secs();
        let credential = ca
            .mint(
                "spiffe://sovereign.example/w",
                ParsedCsr::from_der(&csr_der()).unwrap(),
                Duration::from_secs(300),
                None,
            )
            .unwrap();
        assert!(credential.expires_at >= before + 299);
        assert!(credential.expires_at <= before + 302);
    }

    #[test]
    fn test_rejects_garbage_csr() {
        assert!(matches!(ParsedCsr::from_der(b"not a csr"), Err(CaError::InvalidCsr(_))));
        assert!(matches!(ParsedCsr::from_der(&[]), Err(CaError::InvalidCsr(_))));
    }

    #[test]
    fn test_foreign_leaf_fails_verification() {
        let ca_a = ca();
        let ca_b = ca();
        let credential = ca_a
            .mint(
                "spiffe://sovereign.example/w",
                ParsedCsr::from_der(&csr_der()).unwrap(),
                Duration::from_secs(60),
                None,
            )
            .unwrap();
        assert!(ca_b.verify_issued(credential.leaf()).is_err());
    }

    #[test]
    fn test_reload_from_pem() {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, "Loaded CA");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::DigitalSignature];
        let cert = params.self_signed(&key).unwrap();

        let ca = CertificateAuthority::from_pem(&cert.pem(), &key.serialize_pem()).unwrap();
        assert_eq!(ca.certificate_der(), cert.der().as_ref());
        let credential = ca
            .mint(
                "spiffe://sovereign.example/w",
                ParsedCsr::from_der(&csr_der()).unwrap(),
                Duration::from_secs(60),
                None,
            )
            .unwrap();
        ca.verify_issued(credential.leaf()).unwrap();
    }
}
