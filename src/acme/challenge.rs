use std::sync::{Arc, Mutex, MutexGuard};

use acme_lib::order::Auth;
use log::{error, info, warn};
use rcgen::{CertificateParams, CustomExtension, ExtendedKeyUsagePurpose, KeyPair};
use zeroize::Zeroizing;

use super::MemoryPersist;
use crate::error::RenewalError;
use crate::reload::ReloadNotifier;
use crate::store::{CredentialStore, StoreError};

/// Store alias under which the validation certificate for `domain` is
/// served while its challenge is in flight.
pub fn challenge_alias(domain: &str) -> String {
    format!("{domain}-challenge")
}

/// Fulfils one TLS-ALPN-01 authorization.
///
/// The validation certificate is installed under the challenge alias so an
/// inbound handshake negotiating `acme-tls/1` for the domain is answered with
/// it, and is removed again on every exit path — success, CA rejection, or
/// error. It must never remain reachable after the challenge concludes.
pub struct ChallengeExecutor {
    store: Arc<Mutex<CredentialStore>>,
    notifier: Arc<ReloadNotifier>,
    key_password: Zeroizing<String>,
    poll_millis: u64,
}

impl ChallengeExecutor {
    pub fn new(
        store: Arc<Mutex<CredentialStore>>,
        notifier: Arc<ReloadNotifier>,
        key_password: &str,
    ) -> Self {
        Self {
            store,
            notifier,
            key_password: Zeroizing::new(key_password.to_string()),
            poll_millis: 1_000,
        }
    }

    pub fn execute(&self, auth: &Auth<MemoryPersist>) -> Result<(), RenewalError> {
        let domain = auth.domain_name().to_string();
        if auth.api_auth().tls_alpn_challenge().is_none() {
            return Err(RenewalError::ChallengeUnavailable { domain });
        }

        let challenge = auth.tls_alpn_challenge();
        let proof = challenge.tls_alpn_proof();
        let (key_pem, cert_pem) = build_challenge_certificate(&domain, &proof)
            .map_err(|err| RenewalError::Pki(err.to_string()))?;

        let alias = challenge_alias(&domain);
        self.install(&alias, &key_pem, cert_pem)?;
        info!("[challenge] validation certificate for {domain} installed under {alias}");

        // Trigger validation and poll at 1s until the authorization leaves
        // pending; acme-lib surfaces an invalid outcome as an error.
        let outcome = challenge
            .validate(self.poll_millis)
            .map_err(|err| RenewalError::from_challenge(&domain, err));

        self.remove(&alias);
        match &outcome {
            Ok(()) => info!("[challenge] {domain} validated"),
            Err(err) => warn!("[challenge] {domain} failed: {err}"),
        }
        outcome
    }

    fn install(&self, alias: &str, key_pem: &str, cert_pem: String) -> Result<(), RenewalError> {
        {
            let mut store = self.lock_store()?;
            store.put(alias, key_pem, &[cert_pem], &self.key_password)?;
            // Roll the entry back when it cannot be persisted; a validation
            // certificate must never linger in the serving path.
            if let Err(err) = store.persist() {
                store.delete(alias);
                return Err(RenewalError::Store(err));
            }
        }
        self.notifier.broadcast();
        Ok(())
    }

    /// Best-effort removal: a failure to persist the deletion is logged but
    /// must not mask the challenge outcome.
    fn remove(&self, alias: &str) {
        match self.lock_store() {
            Ok(mut store) => {
                store.delete(alias);
                if let Err(err) = store.persist() {
                    error!("[challenge] failed to persist removal of {alias}: {err}");
                }
            }
            Err(err) => error!("[challenge] cannot remove {alias}: {err}"),
        }
        self.notifier.broadcast();
    }

    fn lock_store(&self) -> Result<MutexGuard<'_, CredentialStore>, StoreError> {
        self.store
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))
    }
}

/// Builds the self-signed validation certificate for a TLS-ALPN-01 challenge:
/// SAN = domain, plus the critical acmeIdentifier extension (OID
/// 1.3.6.1.5.5.7.1.31) carrying the SHA-256 key-authorization digest.
pub(crate) fn build_challenge_certificate(
    domain: &str,
    acme_digest: &[u8],
) -> Result<(Zeroizing<String>, String), rcgen::Error> {
    let mut params = CertificateParams::new(vec![domain.to_string()])?;
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.custom_extensions = vec![CustomExtension::new_acme_identifier(acme_digest)];

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;
    Ok((Zeroizing::new(key_pair.serialize_pem()), cert.pem()))
}
