//! Top-level connector facade wiring the store, the ACME driver, and the
//! renewal scheduler together.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use log::info;
use zeroize::Zeroizing;

use crate::acme::{AccountClient, ChallengeExecutor, OrderProcessor};
use crate::domain::DomainSet;
use crate::error::RenewalError;
use crate::reload::ReloadNotifier;
use crate::scheduler::{ConnectorState, CycleOutcome, RenewalHandle, RenewalScheduler};
use crate::store::{CertificateEntry, CredentialStore, EntryMetadata, StoreError};

/// Well-known ACME directory endpoints.
pub mod directories {
    /// Local Pebble test CA, as started by its default config.
    pub const PEBBLE: &str = "https://localhost:14000/dir";
    pub const LETS_ENCRYPT_STAGING: &str =
        "https://acme-staging-v02.api.letsencrypt.org/directory";
    pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
}

/// Everything needed to run one connector: which domains to cover, which CA
/// to talk to, and where credentials live.
#[derive(Clone)]
pub struct ConnectorConfig {
    /// DNS names the certificate must cover. Normalized on construction of
    /// the connector; order and case do not matter.
    pub domains: Vec<String>,
    /// ACME directory URL, e.g. [`directories::LETS_ENCRYPT_STAGING`].
    pub directory_url: String,
    /// Contact e-mail (bare or as a `mailto:` URI) for the ACME account.
    pub contact: String,
    /// The CA's terms of service must be accepted explicitly.
    pub agree_tos: bool,
    /// Path of the encrypted credential store file.
    pub store_path: PathBuf,
    /// Password protecting the store file as a whole.
    pub store_password: String,
    /// Password protecting individual private keys inside the store.
    pub key_password: String,
    /// Path of the ACME account key PEM file.
    pub account_key_path: PathBuf,
    /// TLS port the host engine listens on. Carried for the engine; the
    /// renewal machinery itself opens no sockets.
    pub port: u16,
}

/// One ACME-managed certificate, kept current in the background.
///
/// Construction loads the store and wires the components; [`start`] spawns
/// the renewal worker. The server engine reads credentials through
/// [`credentials`] and re-reads them whenever an [`on_reload`] callback
/// fires.
///
/// [`start`]: AcmeConnector::start
/// [`credentials`]: AcmeConnector::credentials
/// [`on_reload`]: AcmeConnector::on_reload
pub struct AcmeConnector {
    domains: DomainSet,
    store: Arc<Mutex<CredentialStore>>,
    notifier: Arc<ReloadNotifier>,
    scheduler: Arc<RenewalScheduler>,
    key_password: Zeroizing<String>,
    port: u16,
}

impl AcmeConnector {
    pub fn new(config: ConnectorConfig) -> Result<Self, RenewalError> {
        let domains = DomainSet::new(&config.domains)
            .map_err(|err| RenewalError::Config(err.to_string()))?;

        let store = CredentialStore::load(&config.store_path, &config.store_password)?;
        let store = Arc::new(Mutex::new(store));
        let notifier = Arc::new(ReloadNotifier::new());

        let accounts = AccountClient::new(
            &config.directory_url,
            &config.contact,
            config.agree_tos,
            &config.account_key_path,
        );
        let challenges =
            ChallengeExecutor::new(store.clone(), notifier.clone(), &config.key_password);
        let orders = OrderProcessor::new(store.clone(), challenges, &config.key_password);
        let scheduler = RenewalScheduler::new(
            domains.clone(),
            store.clone(),
            notifier.clone(),
            accounts,
            orders,
            &config.key_password,
        )?;

        info!(
            "[connector] connector for {domains} on port {} ready (directory {})",
            config.port, config.directory_url
        );
        Ok(Self {
            domains,
            store,
            notifier,
            scheduler: Arc::new(scheduler),
            key_password: Zeroizing::new(config.key_password),
            port: config.port,
        })
    }

    /// Spawns the background renewal worker. The first evaluation runs
    /// immediately; drop (or `stop`) the handle to cancel the worker.
    pub fn start(&self) -> Result<RenewalHandle, RenewalError> {
        self.scheduler.clone().spawn()
    }

    /// Runs one renewal evaluation synchronously on the caller's thread.
    pub fn run_cycle(&self) -> CycleOutcome {
        self.scheduler.run_cycle()
    }

    pub fn state(&self) -> ConnectorState {
        self.scheduler.state()
    }

    pub fn domains(&self) -> &DomainSet {
        &self.domains
    }

    /// TLS port the host engine should bind for this connector.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Storage alias of this connector's live certificate.
    pub fn alias(&self) -> String {
        self.domains.alias()
    }

    /// Decrypted credential currently installed for this connector, if any.
    ///
    /// Returns `None` until the first renewal cycle completes; the host
    /// engine must not accept TLS connections while no credential exists.
    pub fn credentials(&self) -> Result<Option<CertificateEntry>, StoreError> {
        let store = self.lock_store()?;
        store.get(&self.domains.alias(), &self.key_password)
    }

    /// Non-secret metadata of the installed certificate, if any.
    pub fn certificate_metadata(&self) -> Result<Option<EntryMetadata>, StoreError> {
        let store = self.lock_store()?;
        Ok(store.entry_metadata(&self.domains.alias()))
    }

    /// Registers a callback invoked after every credential change, both for
    /// the live certificate and for in-flight challenge certificates. The
    /// returned id can be passed to [`ReloadNotifier::unregister`] via
    /// [`notifier`](AcmeConnector::notifier).
    pub fn on_reload(&self, callback: impl Fn() + Send + Sync + 'static) -> u64 {
        self.notifier.register(callback)
    }

    pub fn notifier(&self) -> &Arc<ReloadNotifier> {
        &self.notifier
    }

    /// Shared handle to the credential store, for server engines that serve
    /// challenge certificates directly from it.
    ///
    /// The renewal worker is the sole writer to this connector's aliases.
    /// Pointing two connectors at the same store file is not serialized here
    /// and needs external locking.
    pub fn store(&self) -> &Arc<Mutex<CredentialStore>> {
        &self.store
    }

    fn lock_store(&self) -> Result<MutexGuard<'_, CredentialStore>, StoreError> {
        self.store
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))
    }
}

/// Convenience constructor mirroring [`AcmeConnector::new`].
pub fn acme_connector(config: ConnectorConfig) -> Result<AcmeConnector, RenewalError> {
    AcmeConnector::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> ConnectorConfig {
        ConnectorConfig {
            domains: vec!["localhost".to_string(), "alt.localhost".to_string()],
            // Connection refused immediately; no CA is reachable in tests.
            directory_url: "https://127.0.0.1:1/dir".to_string(),
            contact: "ops@example.com".to_string(),
            agree_tos: true,
            store_path: dir.path().join("credentials.store"),
            store_password: "store-pw".to_string(),
            key_password: "key-pw".to_string(),
            account_key_path: dir.path().join("account.pem"),
            port: 8443,
        }
    }

    #[test]
    fn rejects_empty_domain_list() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.domains.clear();
        assert!(matches!(
            AcmeConnector::new(cfg),
            Err(RenewalError::Config(_))
        ));
    }

    #[test]
    fn starts_without_credentials() {
        let dir = TempDir::new().unwrap();
        let connector = AcmeConnector::new(config(&dir)).unwrap();
        assert!(connector.credentials().unwrap().is_none());
        assert!(connector.certificate_metadata().unwrap().is_none());
    }

    #[test]
    fn failed_cycle_installs_fallback_and_notifies() {
        let dir = TempDir::new().unwrap();
        let connector = AcmeConnector::new(config(&dir)).unwrap();

        let reloads = Arc::new(AtomicUsize::new(0));
        let counter = reloads.clone();
        connector.on_reload(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(connector.run_cycle(), CycleOutcome::FallbackInstalled);
        assert_eq!(connector.state(), ConnectorState::FallbackActive);
        assert!(reloads.load(Ordering::SeqCst) >= 1);

        let entry = connector.credentials().unwrap().expect("fallback entry");
        assert_eq!(entry.alias, connector.alias());
        assert!(crate::fallback::is_fallback_issuer(&entry.issuer));
    }

    #[test]
    fn fallback_survives_a_restart() {
        let dir = TempDir::new().unwrap();
        {
            let connector = AcmeConnector::new(config(&dir)).unwrap();
            connector.run_cycle();
        }
        // A fresh connector over the same store sees the installed fallback.
        let connector = AcmeConnector::new(config(&dir)).unwrap();
        let meta = connector.certificate_metadata().unwrap().expect("entry");
        assert!(crate::fallback::is_fallback_issuer(&meta.issuer));
    }
}
