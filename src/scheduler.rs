//! The renewal control loop.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::acme::{AccountClient, OrderProcessor};
use crate::domain::DomainSet;
use crate::error::RenewalError;
use crate::fallback::{is_fallback_issuer, SelfSignedFallbackGenerator};
use crate::reload::ReloadNotifier;
use crate::store::{CredentialStore, EntryMetadata, StoreError};

/// How often the certificate is re-evaluated while healthy.
pub const DEFAULT_RENEW_PERIOD: Duration = Duration::from_secs(60 * 60);
/// Delay before retrying after a failed renewal attempt.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(60);
/// Remaining validity below which a certificate is renewed.
pub const RENEW_THRESHOLD_DAYS: i64 = 7;

/// Observable state of one connector's certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    HasValidCert,
    NeedsRenewal,
    Renewing,
    FallbackActive,
}

/// Result of one scheduler evaluation, used to pick the next delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The current certificate needs no refresh; nothing was done.
    CertificateStillValid,
    /// A new ACME certificate was issued and installed.
    Renewed,
    /// Renewal failed and a self-signed fallback now covers the listener.
    FallbackInstalled,
    /// Renewal failed; an earlier credential (real or fallback) remains
    /// installed, or even the fallback could not be produced.
    Failed,
}

impl CycleOutcome {
    /// Delay until the next evaluation: the regular period while healthy,
    /// the short retry delay after any failure.
    pub fn next_delay(self, period: Duration, retry: Duration) -> Duration {
        match self {
            CycleOutcome::CertificateStillValid | CycleOutcome::Renewed => period,
            CycleOutcome::FallbackInstalled | CycleOutcome::Failed => retry,
        }
    }
}

/// Periodically decides whether the connector's certificate needs renewal
/// and drives the ACME order or the self-signed fallback accordingly.
///
/// One dedicated background worker runs the whole state machine; it is the
/// sole writer to this connector's store region, and every store mutation is
/// followed by a reload broadcast on the same worker. A single cancellable
/// timer drives re-evaluation, so renewal attempts never overlap.
pub struct RenewalScheduler {
    domains: DomainSet,
    store: Arc<Mutex<CredentialStore>>,
    notifier: Arc<ReloadNotifier>,
    accounts: AccountClient,
    orders: OrderProcessor,
    fallback: SelfSignedFallbackGenerator,
    key_password: Zeroizing<String>,
    renew_period: Duration,
    retry_delay: Duration,
    state: Mutex<ConnectorState>,
}

impl RenewalScheduler {
    pub fn new(
        domains: DomainSet,
        store: Arc<Mutex<CredentialStore>>,
        notifier: Arc<ReloadNotifier>,
        accounts: AccountClient,
        orders: OrderProcessor,
        key_password: &str,
    ) -> Result<Self, RenewalError> {
        // The fallback root is built once, up front, rather than lazily on
        // first use.
        let fallback = SelfSignedFallbackGenerator::new()
            .map_err(|err| RenewalError::Pki(err.to_string()))?;
        Ok(Self {
            domains,
            store,
            notifier,
            accounts,
            orders,
            fallback,
            key_password: Zeroizing::new(key_password.to_string()),
            renew_period: DEFAULT_RENEW_PERIOD,
            retry_delay: DEFAULT_RETRY_DELAY,
            state: Mutex::new(ConnectorState::NeedsRenewal),
        })
    }

    pub fn state(&self) -> ConnectorState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(ConnectorState::NeedsRenewal)
    }

    pub fn domains(&self) -> &DomainSet {
        &self.domains
    }

    pub fn renew_period(&self) -> Duration {
        self.renew_period
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// A certificate needs refresh when none exists, when it is the
    /// self-signed fallback (a real one is always preferred), or when its
    /// remaining validity is strictly below the 7-day threshold. Exactly
    /// seven days remaining does not yet trigger a refresh.
    pub fn needs_refresh(metadata: Option<&EntryMetadata>, now: DateTime<Utc>) -> bool {
        match metadata {
            None => true,
            Some(meta) => {
                is_fallback_issuer(&meta.issuer)
                    || meta.not_after < now + chrono::Duration::days(RENEW_THRESHOLD_DAYS)
            }
        }
    }

    /// Runs one evaluation of the renewal state machine. Never panics and
    /// never returns an error: failures are logged and folded into the
    /// outcome so the worker can reschedule.
    pub fn run_cycle(&self) -> CycleOutcome {
        let alias = self.domains.alias();
        let current = match self.lock_store() {
            Ok(store) => store.entry_metadata(&alias),
            Err(err) => {
                error!("[renewal] cannot inspect store: {err}");
                return CycleOutcome::Failed;
            }
        };

        if !Self::needs_refresh(current.as_ref(), Utc::now()) {
            debug!("[renewal] certificate for {} is current, nothing to do", self.domains);
            self.set_state(ConnectorState::HasValidCert);
            return CycleOutcome::CertificateStillValid;
        }

        self.set_state(ConnectorState::Renewing);
        info!("[renewal] renewing certificate for {}", self.domains);
        match self.attempt_renewal(&alias) {
            Ok(()) => {
                info!("[renewal] certificate for {} renewed", self.domains);
                self.set_state(ConnectorState::HasValidCert);
                CycleOutcome::Renewed
            }
            Err(err) => {
                error!("[renewal] renewal for {} failed: {err}", self.domains);
                match self.ensure_fallback(&alias) {
                    Ok(true) => {
                        self.set_state(ConnectorState::FallbackActive);
                        CycleOutcome::FallbackInstalled
                    }
                    Ok(false) => {
                        // An earlier credential is still installed; keep it.
                        let state = match &current {
                            Some(meta) if is_fallback_issuer(&meta.issuer) => {
                                ConnectorState::FallbackActive
                            }
                            _ => ConnectorState::NeedsRenewal,
                        };
                        self.set_state(state);
                        CycleOutcome::Failed
                    }
                    Err(fallback_err) => {
                        // Fallback failure must never block future retries.
                        error!("[renewal] fallback generation failed: {fallback_err}");
                        self.set_state(ConnectorState::NeedsRenewal);
                        CycleOutcome::Failed
                    }
                }
            }
        }
    }

    fn attempt_renewal(&self, alias: &str) -> Result<(), RenewalError> {
        let account = self.accounts.get_or_create_account()?;
        let issued = self.orders.run(&account, &self.domains)?;
        {
            let mut store = self.lock_store()?;
            store.put(alias, &issued.key_pem, &issued.chain_pem, &self.key_password)?;
            store.persist()?;
        }
        self.notifier.broadcast();
        Ok(())
    }

    /// Installs a self-signed fallback when no credential at all is present
    /// for the alias, so the listener never ends up with zero usable
    /// certificates. Returns whether a fallback was installed.
    fn ensure_fallback(&self, alias: &str) -> Result<bool, RenewalError> {
        {
            let store = self.lock_store()?;
            if store.contains(alias) {
                return Ok(false);
            }
        }
        let issued = self
            .fallback
            .generate(&self.domains)
            .map_err(|err| RenewalError::Pki(err.to_string()))?;
        {
            let mut store = self.lock_store()?;
            store.put(alias, &issued.key_pem, &issued.chain_pem, &self.key_password)?;
            store.persist()?;
        }
        self.notifier.broadcast();
        warn!(
            "[renewal] self-signed fallback installed for {} until ACME issuance succeeds",
            self.domains
        );
        Ok(true)
    }

    /// Spawns the dedicated renewal worker: first evaluation immediately,
    /// then one cancellable timer whose delay follows the last outcome.
    pub fn spawn(self: Arc<Self>) -> Result<RenewalHandle, RenewalError> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let name = format!("acme-renewal-{}", self.domains.primary());
        let scheduler = self;
        let thread = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                let mut delay = Duration::ZERO;
                loop {
                    match stop_rx.recv_timeout(delay) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    let outcome = scheduler.run_cycle();
                    delay = outcome.next_delay(scheduler.renew_period, scheduler.retry_delay);
                    debug!(
                        "[renewal] next evaluation for {} in {}s",
                        scheduler.domains,
                        delay.as_secs()
                    );
                }
                debug!("[renewal] worker for {} stopped", scheduler.domains);
            })
            .map_err(|err| RenewalError::Config(format!("cannot spawn renewal worker: {err}")))?;
        Ok(RenewalHandle {
            stop_tx,
            thread: Some(thread),
        })
    }

    fn lock_store(&self) -> Result<MutexGuard<'_, CredentialStore>, StoreError> {
        self.store
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))
    }

    fn set_state(&self, state: ConnectorState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }
}

/// Stops the renewal worker when dropped; `stop` additionally joins it.
pub struct RenewalHandle {
    stop_tx: mpsc::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl RenewalHandle {
    /// Signals the worker to stop and waits for it to finish. An in-flight
    /// renewal attempt completes first; there is no mid-order cancellation.
    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for RenewalHandle {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::ChallengeExecutor;
    use crate::fallback::FALLBACK_ISSUER_CN;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn metadata(issuer: &str, not_after: DateTime<Utc>) -> EntryMetadata {
        EntryMetadata {
            alias: "cert-test".to_string(),
            issuer: issuer.to_string(),
            not_before: not_after - chrono::Duration::days(90),
            not_after,
            sans: vec!["example.com".to_string()],
        }
    }

    #[test]
    fn missing_certificate_needs_refresh() {
        assert!(RenewalScheduler::needs_refresh(None, Utc::now()));
    }

    #[test]
    fn fallback_certificate_always_needs_refresh() {
        let now = Utc::now();
        let meta = metadata(
            &format!("CN={FALLBACK_ISSUER_CN}"),
            now + chrono::Duration::days(365),
        );
        assert!(RenewalScheduler::needs_refresh(Some(&meta), now));
    }

    #[test]
    fn expiring_certificate_needs_refresh() {
        let now = Utc::now();
        let meta = metadata("CN=Pebble Intermediate CA", now + chrono::Duration::days(3));
        assert!(RenewalScheduler::needs_refresh(Some(&meta), now));
    }

    #[test]
    fn threshold_boundary_is_strict() {
        let now = Utc::now();
        let exactly = metadata("CN=Pebble Intermediate CA", now + chrono::Duration::days(7));
        assert!(!RenewalScheduler::needs_refresh(Some(&exactly), now));

        let just_below = metadata(
            "CN=Pebble Intermediate CA",
            now + chrono::Duration::days(7) - chrono::Duration::seconds(1),
        );
        assert!(RenewalScheduler::needs_refresh(Some(&just_below), now));
    }

    #[test]
    fn fresh_certificate_does_not_need_refresh() {
        let now = Utc::now();
        let meta = metadata("CN=Pebble Intermediate CA", now + chrono::Duration::days(60));
        assert!(!RenewalScheduler::needs_refresh(Some(&meta), now));
    }

    #[test]
    fn failure_outcomes_pick_the_retry_delay() {
        let period = Duration::from_secs(3600);
        let retry = Duration::from_secs(60);
        assert_eq!(
            CycleOutcome::CertificateStillValid.next_delay(period, retry),
            period
        );
        assert_eq!(CycleOutcome::Renewed.next_delay(period, retry), period);
        assert_eq!(
            CycleOutcome::FallbackInstalled.next_delay(period, retry),
            retry
        );
        assert_eq!(CycleOutcome::Failed.next_delay(period, retry), retry);
    }

    struct Fixture {
        scheduler: RenewalScheduler,
        store: Arc<Mutex<CredentialStore>>,
        store_path: PathBuf,
        _dir: TempDir,
    }

    /// Scheduler wired against an unreachable CA endpoint.
    fn unreachable_ca_fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store_path = dir.path().join("credentials.store");
        let store = CredentialStore::load(&store_path, "store-pw").unwrap();
        let store = Arc::new(Mutex::new(store));
        let notifier = Arc::new(ReloadNotifier::new());
        let domains = DomainSet::new(["localhost", "alt.localhost"]).unwrap();

        let accounts = AccountClient::new(
            // Nothing listens on port 1; connection is refused immediately.
            "https://127.0.0.1:1/dir",
            "ops@example.com",
            true,
            dir.path().join("account.pem"),
        );
        let challenges = ChallengeExecutor::new(store.clone(), notifier.clone(), "key-pw");
        let orders = OrderProcessor::new(store.clone(), challenges, "key-pw");
        let scheduler = RenewalScheduler::new(
            domains,
            store.clone(),
            notifier,
            accounts,
            orders,
            "key-pw",
        )
        .unwrap();
        Fixture {
            scheduler,
            store,
            store_path,
            _dir: dir,
        }
    }

    #[test]
    fn unreachable_ca_installs_fallback() {
        let fixture = unreachable_ca_fixture();
        let outcome = fixture.scheduler.run_cycle();
        assert_eq!(outcome, CycleOutcome::FallbackInstalled);
        assert_eq!(fixture.scheduler.state(), ConnectorState::FallbackActive);

        let alias = fixture.scheduler.domains().alias();
        let store = fixture.store.lock().unwrap();
        let meta = store.entry_metadata(&alias).expect("fallback entry");
        assert!(is_fallback_issuer(&meta.issuer));
        let mut sans = meta.sans.clone();
        sans.sort();
        assert_eq!(sans, ["alt.localhost", "localhost"]);

        // The retry delay applies while the fallback is active.
        assert_eq!(
            outcome.next_delay(
                fixture.scheduler.renew_period(),
                fixture.scheduler.retry_delay()
            ),
            fixture.scheduler.retry_delay()
        );
    }

    #[test]
    fn repeated_failures_keep_the_existing_fallback() {
        let fixture = unreachable_ca_fixture();
        assert_eq!(fixture.scheduler.run_cycle(), CycleOutcome::FallbackInstalled);
        // Second cycle: renewal still fails, the installed fallback stays.
        assert_eq!(fixture.scheduler.run_cycle(), CycleOutcome::Failed);
        assert_eq!(fixture.scheduler.state(), ConnectorState::FallbackActive);
    }

    #[test]
    fn valid_certificate_skips_the_cycle_without_writes() {
        let fixture = unreachable_ca_fixture();
        let alias = fixture.scheduler.domains().alias();

        // Install a certificate that looks ACME-issued and far from expiry.
        let params = rcgen::CertificateParams::new(vec![
            "localhost".to_string(),
            "alt.localhost".to_string(),
        ])
        .unwrap();
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        {
            let mut store = fixture.store.lock().unwrap();
            store
                .put(&alias, &key.serialize_pem(), &[cert.pem()], "key-pw")
                .unwrap();
            store.persist().unwrap();
        }
        let modified_before = std::fs::metadata(&fixture.store_path)
            .unwrap()
            .modified()
            .unwrap();

        assert_eq!(
            fixture.scheduler.run_cycle(),
            CycleOutcome::CertificateStillValid
        );
        assert_eq!(
            fixture.scheduler.run_cycle(),
            CycleOutcome::CertificateStillValid
        );
        assert_eq!(fixture.scheduler.state(), ConnectorState::HasValidCert);

        // No store write happened on either cycle.
        let modified_after = std::fs::metadata(&fixture.store_path)
            .unwrap()
            .modified()
            .unwrap();
        assert_eq!(modified_before, modified_after);
    }

    #[test]
    fn worker_stops_on_handle_drop() {
        let fixture = unreachable_ca_fixture();
        let scheduler = Arc::new(fixture.scheduler);
        let handle = scheduler.spawn().unwrap();
        // Give the worker time for its immediate first evaluation.
        std::thread::sleep(Duration::from_millis(50));
        handle.stop();
    }
}
