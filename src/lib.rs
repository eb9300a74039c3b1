//! Automatic TLS certificates over ACME with TLS-ALPN-01 validation.
//!
//! An [`AcmeConnector`] keeps one certificate current for a set of domains:
//! a background worker orders and renews it through an ACME CA, stores the
//! credential in an encrypted file store, and notifies registered listeners
//! whenever the credential changes so live TLS contexts can be rebuilt.
//! While the CA is unreachable, a self-signed fallback certificate keeps the
//! listener serving.
//!
//! ```no_run
//! use acme_connector::{acme_connector, directories, ConnectorConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let connector = acme_connector(ConnectorConfig {
//!     domains: vec!["example.com".into(), "www.example.com".into()],
//!     directory_url: directories::LETS_ENCRYPT_STAGING.into(),
//!     contact: "ops@example.com".into(),
//!     agree_tos: true,
//!     store_path: "credentials.store".into(),
//!     store_password: "store-pw".into(),
//!     key_password: "key-pw".into(),
//!     account_key_path: "account.pem".into(),
//!     port: 443,
//! })?;
//! connector.on_reload(|| {
//!     // Rebuild the TLS context from connector.credentials().
//! });
//! let handle = connector.start()?;
//! # drop(handle);
//! # Ok(())
//! # }
//! ```

mod acme;
mod connector;
mod domain;
mod error;
mod fallback;
mod reload;
mod scheduler;
mod store;

pub use acme::{
    challenge_alias, AccountClient, ChallengeExecutor, IssuedCertificate, MemoryPersist,
    OrderProcessor,
};
pub use connector::{acme_connector, directories, AcmeConnector, ConnectorConfig};
pub use domain::{DomainSet, DomainSetError};
pub use error::RenewalError;
pub use fallback::{is_fallback_issuer, SelfSignedFallbackGenerator, FALLBACK_ISSUER_CN};
pub use reload::ReloadNotifier;
pub use scheduler::{
    ConnectorState, CycleOutcome, RenewalHandle, RenewalScheduler, DEFAULT_RENEW_PERIOD,
    DEFAULT_RETRY_DELAY, RENEW_THRESHOLD_DAYS,
};
pub use store::{CertificateEntry, CredentialStore, EntryMetadata, StoreError};
