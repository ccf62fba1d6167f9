//! X.509 helpers: mesh fingerprint and certificate info.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;
use x509_parser::prelude::*;

/// Certificate handling errors
#[derive(Error, Debug)]
pub enum CertError {
    /// PEM input could not be read
    #[error("failed to read PEM: {0}")]
    Pem(#[from] std::io::Error),

    /// PEM input holds no certificate
    #[error("no certificate found")]
    Missing,

    /// DER bytes are not a valid X.509 certificate
    #[error("failed to parse X.509 certificate: {0}")]
    Parse(String),
}

/// DER of the first certificate in a PEM buffer
pub fn first_der(pem: &[u8]) -> Result<CertificateDer<'static>, CertError> {
    rustls_pemfile::certs(&mut &pem[..])
        .next()
        .ok_or(CertError::Missing)?
        .map_err(CertError::Pem)
}

/// Lowercase hex SHA-256 of a DER certificate
pub fn der_fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Mesh fingerprint: SHA-256 over the DER of the CA certificate.
///
/// Every member of one mesh shares the CA, so the fingerprint names the mesh
/// and is handed to discovery plugins.
pub fn fingerprint(ca_pem: &[u8]) -> Result<String, CertError> {
    Ok(der_fingerprint(first_der(ca_pem)?.as_ref()))
}

/// Wrap DER bytes into a PEM certificate block
pub fn der_to_pem(der: &[u8]) -> String {
    let encoded = STANDARD.encode(der);
    let mut pem = String::with_capacity(encoded.len() + encoded.len() / 64 + 64);
    pem.push_str("-----BEGIN CERTIFICATE-----\n");
    let mut rest = encoded.as_str();
    while !rest.is_empty() {
        let (line, tail) = rest.split_at(rest.len().min(64));
        pem.push_str(line);
        pem.push('\n');
        rest = tail;
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

/// Decoded view of an X.509 certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    /// Subject common name
    pub common_name: Option<String>,
    /// Subject organisation
    pub organization: Option<String>,
    /// Issuer common name
    pub issuer_common_name: Option<String>,
    /// Full subject distinguished name
    pub subject: String,
    /// Full issuer distinguished name
    pub issuer: String,
    /// Serial number, hex
    pub serial: String,
    /// Start of validity, unix seconds
    pub not_before: i64,
    /// End of validity, unix seconds
    pub not_after: i64,
    /// SHA-256 of the DER encoding, hex
    pub fingerprint: String,
}

fn first_attr<'a, 'b: 'a>(
    mut attrs: impl Iterator<Item = &'a AttributeTypeAndValue<'b>>,
) -> Option<String> {
    attrs
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned)
}

impl CertInfo {
    /// Decode a DER certificate
    pub fn from_der(der: &[u8]) -> Result<Self, CertError> {
        let (_remaining, cert) =
            parse_x509_certificate(der).map_err(|e| CertError::Parse(e.to_string()))?;

        Ok(Self {
            common_name: first_attr(cert.subject().iter_common_name()),
            organization: first_attr(cert.subject().iter_organization()),
            issuer_common_name: first_attr(cert.issuer().iter_common_name()),
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            serial: hex::encode(cert.raw_serial()),
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            fingerprint: der_fingerprint(der),
        })
    }

    /// Decode the first certificate of a PEM buffer
    pub fn from_pem(pem: &[u8]) -> Result<Self, CertError> {
        Self::from_der(first_der(pem)?.as_ref())
    }
}

impl fmt::Display for CertInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.common_name {
            Some(cn) => write!(f, "{}", cn),
            None => write!(f, "{}", self.subject),
        }
    }
}
