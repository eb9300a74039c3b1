use std::sync::{Arc, Mutex, MutexGuard};

use acme_lib::api::ApiOrder;
use acme_lib::Account;
use chrono::Utc;
use log::{debug, info};
use zeroize::Zeroizing;

use super::{ChallengeExecutor, MemoryPersist};
use crate::domain::DomainSet;
use crate::error::RenewalError;
use crate::store::{CredentialStore, StoreError};

/// A freshly issued credential: private key plus chain, leaf first.
pub struct IssuedCertificate {
    pub key_pem: Zeroizing<String>,
    pub chain_pem: Vec<String>,
}

/// Drives one certificate order end to end: order creation, authorization
/// challenges, readiness check, finalization, and chain download.
pub struct OrderProcessor {
    store: Arc<Mutex<CredentialStore>>,
    challenges: ChallengeExecutor,
    key_password: Zeroizing<String>,
    poll_millis: u64,
}

impl OrderProcessor {
    pub fn new(
        store: Arc<Mutex<CredentialStore>>,
        challenges: ChallengeExecutor,
        key_password: &str,
    ) -> Self {
        Self {
            store,
            challenges,
            key_password: Zeroizing::new(key_password.to_string()),
            poll_millis: 1_000,
        }
    }

    pub fn run(
        &self,
        account: &Account<MemoryPersist>,
        domains: &DomainSet,
    ) -> Result<IssuedCertificate, RenewalError> {
        info!("[order] creating order for {domains}");
        let mut order = account
            .new_order(domains.primary(), &domains.alt_names())
            .map_err(RenewalError::from_order)?;

        // One in-flight challenge at a time keeps the shared store's alias
        // space simple; authorizations are resolved sequentially.
        for auth in order.authorizations().map_err(RenewalError::from_order)? {
            if auth.api_auth().is_status_pending() {
                self.challenges.execute(&auth)?;
            } else {
                debug!(
                    "[order] authorization for {} already settled",
                    auth.domain_name()
                );
            }
        }

        order.refresh().map_err(RenewalError::from_order)?;
        let Some(csr_order) = order.confirm_validations() else {
            return Err(order_not_ready(order.api_order()));
        };

        let key_pem = self.select_key_pair(domains)?;

        // Submitting the CSR moves the order to processing; poll at 1s until
        // it settles.
        let cert_order = csr_order
            .finalize(&key_pem, self.poll_millis)
            .map_err(RenewalError::from_order)?;
        let certificate = cert_order
            .download_and_save_cert()
            .map_err(RenewalError::from_order)?;

        let chain_pem = split_chain(certificate.certificate())?;
        if chain_pem.is_empty() {
            return Err(RenewalError::CertificateUnavailable);
        }
        info!(
            "[order] certificate issued for {domains} ({} certificates in chain)",
            chain_pem.len()
        );
        Ok(IssuedCertificate { key_pem, chain_pem })
    }

    /// Reuses the key already on file for this alias while its certificate
    /// is unexpired; otherwise generates a fresh one. Key continuity avoids
    /// rotation noise without hanging on to keys of expired certificates.
    fn select_key_pair(&self, domains: &DomainSet) -> Result<Zeroizing<String>, RenewalError> {
        let alias = domains.alias();
        {
            let store = self.lock_store()?;
            if let Some(entry) = store.get(&alias, &self.key_password)? {
                if !entry.is_expired(Utc::now()) {
                    debug!("[order] reusing existing private key for {alias}");
                    return Ok(entry.key_pem);
                }
            }
        }
        debug!("[order] generating fresh private key for {alias}");
        let key = acme_lib::create_p256_key();
        let pem = key
            .private_key_to_pem_pkcs8()
            .map_err(|err| RenewalError::Pki(format!("serialize private key: {err}")))?;
        let pem = String::from_utf8(pem)
            .map_err(|_| RenewalError::Pki("private key PEM is not valid UTF-8".into()))?;
        Ok(Zeroizing::new(pem))
    }

    fn lock_store(&self) -> Result<MutexGuard<'_, CredentialStore>, StoreError> {
        self.store
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))
    }
}

/// The order did not reach ready after its authorizations settled; surface
/// the CA's error detail rather than a bare status.
fn order_not_ready(api_order: &ApiOrder) -> RenewalError {
    match &api_order.error {
        Some(problem) => RenewalError::OrderRejected {
            error_type: problem._type.clone(),
            detail: problem.detail.clone().unwrap_or_default(),
        },
        None => RenewalError::OrderRejected {
            error_type: "order-not-ready".to_string(),
            detail: format!(
                "order status is {}",
                api_order.status.as_deref().unwrap_or("unknown")
            ),
        },
    }
}

/// Splits a PEM bundle (leaf first, as returned by the CA) into individual
/// certificates.
fn split_chain(pem_bundle: &str) -> Result<Vec<String>, RenewalError> {
    let blocks = pem::parse_many(pem_bundle)
        .map_err(|err| RenewalError::Pki(format!("invalid certificate bundle: {err}")))?;
    Ok(blocks.iter().map(pem::encode).collect())
}
