use std::fmt;

use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainSetError {
    #[error("at least one domain is required")]
    Empty,
    #[error("invalid domain name {0:?}: {1}")]
    Invalid(String, String),
}

/// The set of DNS names covered by one certificate.
///
/// Domains are normalized on construction (trimmed, trailing dot stripped,
/// IDNA-encoded, lowercased) and kept sorted and deduplicated, so two sets
/// with the same members resolve to the same storage alias regardless of the
/// order the caller listed them in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSet {
    domains: Vec<String>,
}

impl DomainSet {
    pub fn new<I, S>(domains: I) -> Result<Self, DomainSetError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized = Vec::new();
        for raw in domains {
            normalized.push(normalize_domain(raw.as_ref())?);
        }
        normalized.sort();
        normalized.dedup();
        if normalized.is_empty() {
            return Err(DomainSetError::Empty);
        }
        Ok(Self {
            domains: normalized,
        })
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    /// First domain of the set, used as the order's primary identifier.
    pub fn primary(&self) -> &str {
        &self.domains[0]
    }

    /// Remaining domains, submitted as alt names on the order.
    pub fn alt_names(&self) -> Vec<&str> {
        self.domains.iter().skip(1).map(String::as_str).collect()
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.domains.iter().any(|d| d == domain)
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Stable storage alias for this set: a truncated hex SHA-256 over the
    /// normalized members. Deterministic and order-independent.
    pub fn alias(&self) -> String {
        let mut hasher = Sha256::new();
        for domain in &self.domains {
            hasher.update(domain.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hex::encode(hasher.finalize());
        format!("cert-{}", &digest[..32])
    }
}

impl fmt::Display for DomainSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.domains.join(", "))
    }
}

fn normalize_domain(input: &str) -> Result<String, DomainSetError> {
    let trimmed = input.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(DomainSetError::Invalid(
            input.to_string(),
            "empty domain name".to_string(),
        ));
    }
    let ascii = idna::domain_to_ascii(trimmed)
        .map_err(|err| DomainSetError::Invalid(input.to_string(), err.to_string()))?;
    Ok(ascii.to_lowercase())
}
