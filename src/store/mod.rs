//! Password-protected credential storage.
//!
//! One store file maps aliases to credentials (private key + certificate
//! chain). The file body is encrypted with the store password; each private
//! key is additionally encrypted with a per-key password, so the two may
//! rotate independently.

mod file;

pub use file::CredentialStore;

use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;
use zeroize::Zeroizing;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("credential store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential store is corrupt: {0}")]
    Corrupt(String),
    #[error("credential store password is incorrect")]
    BadPassword,
    #[error("credential store unavailable: {0}")]
    Unavailable(String),
}

/// One decrypted credential: a private key and its certificate chain.
#[derive(Clone)]
pub struct CertificateEntry {
    pub alias: String,
    /// PEM-encoded private key, zeroed on drop.
    pub key_pem: Zeroizing<String>,
    /// PEM-encoded chain, leaf first.
    pub chain_pem: Vec<String>,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// DNS names the leaf certificate covers.
    pub sans: Vec<String>,
}

impl CertificateEntry {
    pub fn leaf_pem(&self) -> Option<&str> {
        self.chain_pem.first().map(String::as_str)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.not_after <= now
    }
}

/// Non-secret view of a stored credential, readable without the key password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMetadata {
    pub alias: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub sans: Vec<String>,
}

pub(crate) struct LeafInfo {
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub sans: Vec<String>,
}

/// Extracts issuer, validity and SAN list from a PEM leaf certificate.
pub(crate) fn parse_leaf(leaf_pem: &str) -> Result<LeafInfo, StoreError> {
    let (_, pem_block) = parse_x509_pem(leaf_pem.as_bytes())
        .map_err(|err| StoreError::Corrupt(format!("invalid certificate PEM: {err}")))?;
    let cert = pem_block
        .parse_x509()
        .map_err(|err| StoreError::Corrupt(format!("invalid X.509 certificate: {err}")))?;

    let not_before = Utc
        .timestamp_opt(cert.validity().not_before.timestamp(), 0)
        .single()
        .ok_or_else(|| StoreError::Corrupt("certificate notBefore out of range".into()))?;
    let not_after = Utc
        .timestamp_opt(cert.validity().not_after.timestamp(), 0)
        .single()
        .ok_or_else(|| StoreError::Corrupt("certificate notAfter out of range".into()))?;

    let mut sans = Vec::new();
    if let Ok(Some(extension)) = cert.subject_alternative_name() {
        for name in &extension.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                sans.push((*dns).to_string());
            }
        }
    }

    Ok(LeafInfo {
        issuer: cert.issuer().to_string(),
        not_before,
        not_after,
        sans,
    })
}
