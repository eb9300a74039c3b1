//! Self-signed fallback credentials for when no ACME certificate is
//! available.

use log::debug;
use rcgen::{
    date_time_ymd, BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
};
use zeroize::Zeroizing;

use crate::acme::IssuedCertificate;
use crate::domain::DomainSet;

/// Issuer common name of the local fallback root. `needs_refresh` keys off
/// this string to always prefer a real ACME certificate over a fallback one.
pub const FALLBACK_ISSUER_CN: &str = "acme-connector self-signed fallback";

/// Returns whether an issuer string belongs to the local fallback root.
pub fn is_fallback_issuer(issuer: &str) -> bool {
    issuer.contains(FALLBACK_ISSUER_CN)
}

/// Issues locally signed certificates so the TLS listener is never left with
/// zero usable credentials while ACME issuance is unavailable.
///
/// The root is created once, at scheduler construction, with a fixed validity
/// window far in the past and future so clock skew never invalidates it.
pub struct SelfSignedFallbackGenerator {
    root_cert: rcgen::Certificate,
    root_key: KeyPair,
}

impl SelfSignedFallbackGenerator {
    pub fn new() -> Result<Self, rcgen::Error> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, FALLBACK_ISSUER_CN);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.not_before = date_time_ymd(1975, 1, 1);
        params.not_after = date_time_ymd(4096, 1, 1);

        let root_key = KeyPair::generate()?;
        let root_cert = params.self_signed(&root_key)?;
        debug!("[fallback] local fallback root initialized");
        Ok(Self {
            root_cert,
            root_key,
        })
    }

    /// Issues a leaf for the domain set, returning the leaf key and a
    /// two-certificate chain (leaf + local root).
    pub fn generate(&self, domains: &DomainSet) -> Result<IssuedCertificate, rcgen::Error> {
        let mut params = CertificateParams::new(domains.domains().to_vec())?;
        params.not_before = date_time_ymd(1975, 1, 1);
        params.not_after = date_time_ymd(4096, 1, 1);

        let leaf_key = KeyPair::generate()?;
        let leaf = params.signed_by(&leaf_key, &self.root_cert, &self.root_key)?;
        debug!("[fallback] issued self-signed certificate for {domains}");
        Ok(IssuedCertificate {
            key_pem: Zeroizing::new(leaf_key.serialize_pem()),
            chain_pem: vec![leaf.pem(), self.root_cert.pem()],
        })
    }
}
