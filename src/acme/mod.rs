//! ACME protocol plumbing: account resolution, TLS-ALPN-01 challenges, and
//! order processing on top of acme-lib.

mod account;
mod challenge;
mod order;

pub use account::AccountClient;
pub use challenge::{challenge_alias, ChallengeExecutor};
pub use order::{IssuedCertificate, OrderProcessor};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use acme_lib::persist::{Persist, PersistKey, PersistKind};

/// In-memory persistence for acme-lib.
///
/// The account key file is the only durable ACME state; everything acme-lib
/// wants to persist beyond that (certificates, intermediate state) lives in
/// the credential store instead, so this adapter keeps acme-lib's writes off
/// the disk and lets us seed the account key explicitly.
#[derive(Clone, Default)]
pub struct MemoryPersist {
    inner: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryPersist {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn seed_account_key(&self, realm: &str, pem: &[u8]) -> acme_lib::Result<()> {
        let key = PersistKey::new(realm, PersistKind::AccountPrivateKey, "acme_account");
        self.put(&key, pem)
    }
}

impl Persist for MemoryPersist {
    fn put(&self, key: &PersistKey<'_>, value: &[u8]) -> acme_lib::Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|err| acme_lib::Error::Other(err.to_string()))?;
        inner.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &PersistKey<'_>) -> acme_lib::Result<Option<Vec<u8>>> {
        let inner = self
            .inner
            .lock()
            .map_err(|err| acme_lib::Error::Other(err.to_string()))?;
        Ok(inner.get(&key.to_string()).cloned())
    }
}
