//! Certificate authority capability for serving-cert rotation.
//!
//! A [`CertificateAuthority`] is derived from the TLS fields of a router
//! certificate secret and used to issue serving certificates for the oauth
//! server. Material is ephemeral: it is recomputed every time the rotation
//! reconciler decides a change is needed and never cached.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Duration;

use rcgen::{
    string::Ia5String, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;
use x509_parser::prelude::*;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// PEM or certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// A requested hostname cannot be expressed as a SAN
    #[error("invalid hostname: {0}")]
    InvalidHostname(String),
}

impl From<PkiError> for crate::error::Error {
    fn from(err: PkiError) -> Self {
        crate::error::Error::Certificate(err.to_string())
    }
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// A certificate authority loaded from PEM material
pub struct CertificateAuthority {
    /// CA key pair as PEM (deserialized on use since KeyPair isn't Clone)
    ca_key_pem: String,
    /// PEM-encoded CA certificate
    ca_cert_pem: String,
}

impl CertificateAuthority {
    /// Derive a CA from the certificate and key bytes of a TLS secret
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        // Validate both halves parse before accepting them
        let _ = KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;
        let _ = parse_pem(cert_pem)?;

        Ok(Self {
            ca_key_pem: key_pem.to_string(),
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    /// Create a new self-signed CA (test fixtures and bootstrap tooling)
    pub fn self_signed(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = rcgen::date_time_ymd(2024, 1, 1);
        params.not_after = rcgen::date_time_ymd(2034, 1, 1);

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;
        let ca_key_pem = key_pair.serialize_pem();

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem,
            ca_cert_pem: cert.pem(),
        })
    }

    /// CA certificate in PEM format
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// CA private key in PEM format
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    /// Issue a serving certificate for the given host set.
    ///
    /// A `validity_days` of `0` selects this CA's default validity window;
    /// callers that only need "some certificate signed by the current CA"
    /// pass `0` and let the CA's own expiry policy govern.
    pub fn issue_server_cert(
        &self,
        hostnames: &BTreeSet<String>,
        validity_days: u32,
    ) -> Result<ServerCertificate> {
        if hostnames.is_empty() {
            return Err(PkiError::InvalidHostname(
                "at least one hostname is required".to_string(),
            ));
        }

        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        if let Some(first) = hostnames.iter().next() {
            dn.push(DnType::CommonName, DnValue::Utf8String(first.clone()));
        }
        params.distinguished_name = dn;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        params.subject_alt_names = hostnames
            .iter()
            .map(|host| match host.parse::<IpAddr>() {
                Ok(ip) => Ok(SanType::IpAddress(ip)),
                Err(_) => Ia5String::try_from(host.clone())
                    .map(SanType::DnsName)
                    .map_err(|e| PkiError::InvalidHostname(format!("{}: {}", host, e))),
            })
            .collect::<Result<Vec<_>>>()?;

        params.not_before = rcgen::date_time_ymd(2024, 1, 1);
        params.not_after = if validity_days == 0 {
            rcgen::date_time_ymd(2034, 1, 1)
        } else {
            params.not_before + Duration::from_secs(u64::from(validity_days) * 86_400)
        };

        let server_key = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate server key: {}", e))
        })?;

        let ca_key = KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let cert = params.signed_by(&server_key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign server cert: {}", e))
        })?;

        Ok(ServerCertificate {
            cert_pem: cert.pem(),
            key_pem: server_key.serialize_pem(),
        })
    }
}

/// A freshly issued serving certificate and its private key
pub struct ServerCertificate {
    cert_pem: String,
    key_pem: String,
}

impl ServerCertificate {
    /// PEM-encoded certificate and private key, in that order
    pub fn encode(&self) -> (&str, &str) {
        (&self.cert_pem, &self.key_pem)
    }
}

/// Verification outcome for an issued serving certificate
#[derive(Debug, Clone)]
pub struct VerificationResult {
    /// Whether the certificate chains to the CA and is within its window
    pub valid: bool,
    /// DNS names present in the certificate's SAN extension
    pub dns_names: Vec<String>,
    /// Reason if invalid
    pub reason: Option<String>,
}

/// Verify that a serving certificate was signed by the given CA
pub fn verify_server_cert(cert_der: &[u8], ca_cert_pem: &str) -> Result<VerificationResult> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse server cert: {}", e)))?;

    let ca_cert_der = parse_pem(ca_cert_pem)?;
    let (_, ca_cert) = X509Certificate::from_der(&ca_cert_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse CA cert: {}", e)))?;

    let mut dns_names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                dns_names.push(dns.to_string());
            }
        }
    }

    if cert.verify_signature(Some(ca_cert.public_key())).is_err() {
        return Ok(VerificationResult {
            valid: false,
            dns_names,
            reason: Some("signature verification failed".to_string()),
        });
    }

    Ok(VerificationResult {
        valid: true,
        dns_names,
        reason: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_set(hosts: &[&str]) -> BTreeSet<String> {
        hosts.iter().map(|h| h.to_string()).collect()
    }

    #[test]
    fn self_signed_ca_produces_pem_material() {
        let ca = CertificateAuthority::self_signed("router-ca").unwrap();
        assert!(ca.ca_cert_pem().contains("BEGIN CERTIFICATE"));
        assert!(ca.ca_key_pem().contains("PRIVATE KEY"));
    }

    #[test]
    fn ca_round_trips_through_pem() {
        let ca = CertificateAuthority::self_signed("router-ca").unwrap();
        let reloaded =
            CertificateAuthority::from_pem(ca.ca_cert_pem(), ca.ca_key_pem()).unwrap();

        let cert = reloaded
            .issue_server_cert(&host_set(&["oauth.example.com"]), 0)
            .unwrap();
        let (cert_pem, key_pem) = cert.encode();
        assert!(cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn issued_cert_verifies_against_its_ca() {
        let ca = CertificateAuthority::self_signed("router-ca").unwrap();
        let cert = ca
            .issue_server_cert(&host_set(&["oauth.apps.example.com"]), 0)
            .unwrap();

        let der = parse_pem(cert.encode().0).unwrap();
        let result = verify_server_cert(&der, ca.ca_cert_pem()).unwrap();
        assert!(result.valid);
        assert!(result
            .dns_names
            .contains(&"oauth.apps.example.com".to_string()));
    }

    #[test]
    fn cert_from_another_ca_is_rejected() {
        let ca = CertificateAuthority::self_signed("router-ca").unwrap();
        let other = CertificateAuthority::self_signed("impostor-ca").unwrap();
        let cert = other
            .issue_server_cert(&host_set(&["oauth.example.com"]), 0)
            .unwrap();

        let der = parse_pem(cert.encode().0).unwrap();
        let result = verify_server_cert(&der, ca.ca_cert_pem()).unwrap();
        assert!(!result.valid);
        assert!(result.reason.unwrap().contains("signature"));
    }

    #[test]
    fn ip_addresses_become_ip_sans() {
        let ca = CertificateAuthority::self_signed("router-ca").unwrap();
        // Must not be rejected as an invalid DNS name
        let cert = ca.issue_server_cert(&host_set(&["203.0.113.10"]), 0);
        assert!(cert.is_ok());
    }

    #[test]
    fn empty_host_set_is_rejected() {
        let ca = CertificateAuthority::self_signed("router-ca").unwrap();
        let result = ca.issue_server_cert(&BTreeSet::new(), 0);
        assert!(matches!(result, Err(PkiError::InvalidHostname(_))));
    }

    #[test]
    fn corrupted_ca_material_is_rejected() {
        let ca = CertificateAuthority::self_signed("router-ca").unwrap();

        let result = CertificateAuthority::from_pem(ca.ca_cert_pem(), "not a key");
        assert!(matches!(result, Err(PkiError::ParseError(_))));

        let result = CertificateAuthority::from_pem("not a cert", ca.ca_key_pem());
        assert!(matches!(result, Err(PkiError::ParseError(_))));
    }

    #[test]
    fn pki_errors_convert_to_reconcile_errors() {
        let err: crate::error::Error = PkiError::ParseError("bad pem".to_string()).into();
        assert!(err.to_string().contains("bad pem"));
        assert!(!err.is_not_found());
    }
}
