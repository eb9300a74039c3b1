use thiserror::Error;

use crate::store::StoreError;

/// Errors produced on the certificate renewal path.
///
/// Everything here is recoverable from the scheduler's point of view: errors
/// are logged and turned into a retry delay, they never escape the renewal
/// worker.
#[derive(Debug, Error)]
pub enum RenewalError {
    /// ACME account registration or lookup failed (network or protocol).
    #[error("account error: {0}")]
    Account(String),

    /// The CA did not offer a tls-alpn-01 challenge for this authorization.
    #[error("no tls-alpn-01 challenge offered for {domain}")]
    ChallengeUnavailable { domain: String },

    /// The CA validated the challenge and rejected it.
    #[error("challenge for {domain} was rejected: {detail}")]
    ChallengeRejected { domain: String, detail: String },

    /// The order reached a terminal status other than ready/valid.
    #[error("order rejected ({error_type}): {detail}")]
    OrderRejected { error_type: String, detail: String },

    /// The order is valid but the CA returned no certificate chain.
    #[error("order is valid but no certificate was returned")]
    CertificateUnavailable,

    /// Transport-level ACME failure outside of account handling.
    #[error("acme protocol error: {0}")]
    Protocol(String),

    #[error("credential store error: {0}")]
    Store(#[from] StoreError),

    /// Local key or certificate generation failed.
    #[error("pki error: {0}")]
    Pki(String),

    #[error("invalid connector configuration: {0}")]
    Config(String),
}

impl RenewalError {
    /// Maps an acme-lib failure on the order path, preserving the CA problem
    /// document's type and detail verbatim when one is present.
    pub(crate) fn from_order(err: acme_lib::Error) -> Self {
        match err {
            acme_lib::Error::ApiProblem(problem) => RenewalError::OrderRejected {
                error_type: problem._type.clone(),
                detail: problem.detail.clone().unwrap_or_default(),
            },
            other => RenewalError::Protocol(other.to_string()),
        }
    }

    /// Maps an acme-lib failure while validating a single authorization.
    pub(crate) fn from_challenge(domain: &str, err: acme_lib::Error) -> Self {
        match err {
            acme_lib::Error::ApiProblem(problem) => RenewalError::ChallengeRejected {
                domain: domain.to_string(),
                detail: match &problem.detail {
                    Some(detail) => format!("{}: {}", problem._type, detail),
                    None => problem._type.clone(),
                },
            },
            other => RenewalError::Protocol(other.to_string()),
        }
    }

    pub(crate) fn from_account(err: acme_lib::Error) -> Self {
        RenewalError::Account(err.to_string())
    }
}
