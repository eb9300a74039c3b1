use std::fs;
use std::path::PathBuf;

use acme_lib::{Account, Directory, DirectoryUrl};
use log::{debug, info};

use super::MemoryPersist;
use crate::error::RenewalError;

/// Owns the ACME account for one CA directory.
///
/// The account key pair, persisted as a PEM file, is the durable identity:
/// registering with a key the CA already knows returns the existing account,
/// so recovery after a restart needs no stored account URL.
pub struct AccountClient {
    directory_url: String,
    contact: String,
    agree_tos: bool,
    account_key_path: PathBuf,
}

impl AccountClient {
    pub fn new(
        directory_url: impl Into<String>,
        contact: impl Into<String>,
        agree_tos: bool,
        account_key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            directory_url: directory_url.into(),
            contact: contact.into(),
            agree_tos,
            account_key_path: account_key_path.into(),
        }
    }

    /// Resolves the account for the persisted key pair, registering a new
    /// account (and minting a key) on first run.
    ///
    /// Fails with [`RenewalError::Account`] on network or protocol failure;
    /// "no account yet" is the expected first-run path, not an error.
    pub fn get_or_create_account(&self) -> Result<Account<MemoryPersist>, RenewalError> {
        if !self.agree_tos {
            return Err(RenewalError::Account(
                "terms of service must be accepted before an ACME account can be registered"
                    .to_string(),
            ));
        }

        let realm = self.realm();
        let persist = MemoryPersist::new();

        if self.account_key_path.exists() {
            let pem = fs::read(&self.account_key_path).map_err(|err| {
                RenewalError::Account(format!(
                    "cannot read account key {}: {err}",
                    self.account_key_path.display()
                ))
            })?;
            persist
                .seed_account_key(realm, &pem)
                .map_err(RenewalError::from_account)?;
            debug!(
                "[account] using persisted account key {}",
                self.account_key_path.display()
            );
        } else {
            // First run: the key minted here becomes the durable identity.
            let pem = generate_account_key_pem().map_err(|err| RenewalError::Pki(err.to_string()))?;
            if let Some(parent) = self.account_key_path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent).map_err(|err| {
                        RenewalError::Account(format!("cannot create account key dir: {err}"))
                    })?;
                }
            }
            fs::write(&self.account_key_path, pem.as_bytes()).map_err(|err| {
                RenewalError::Account(format!(
                    "cannot write account key {}: {err}",
                    self.account_key_path.display()
                ))
            })?;
            persist
                .seed_account_key(realm, pem.as_bytes())
                .map_err(RenewalError::from_account)?;
            info!(
                "[account] generated new account key at {}",
                self.account_key_path.display()
            );
        }

        let directory = Directory::from_url(persist, DirectoryUrl::Other(&self.directory_url))
            .map_err(RenewalError::from_account)?;
        let account = directory
            .account_with_realm(realm, Some(vec![self.contact_uri()]))
            .map_err(RenewalError::from_account)?;
        debug!("[account] account resolved for {realm}");
        Ok(account)
    }

    /// Contact without any URI scheme, used as the persistence realm.
    fn realm(&self) -> &str {
        self.contact
            .strip_prefix("mailto:")
            .unwrap_or(&self.contact)
    }

    /// Contact as a full URI; bare e-mail addresses get a `mailto:` scheme.
    fn contact_uri(&self) -> String {
        if self.contact.contains(':') {
            self.contact.clone()
        } else {
            format!("mailto:{}", self.contact)
        }
    }
}

pub(crate) fn generate_account_key_pem() -> Result<String, rcgen::Error> {
    let key = rcgen::KeyPair::generate()?;
    Ok(key.serialize_pem())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn contact_uri_adds_mailto_for_bare_email() {
        let client = AccountClient::new("https://ca.invalid/dir", "ops@example.com", true, "k.pem");
        assert_eq!(client.contact_uri(), "mailto:ops@example.com");
        assert_eq!(client.realm(), "ops@example.com");
    }

    #[test]
    fn contact_uri_keeps_full_uri() {
        let client =
            AccountClient::new("https://ca.invalid/dir", "mailto:ops@example.com", true, "k.pem");
        assert_eq!(client.contact_uri(), "mailto:ops@example.com");
        assert_eq!(client.realm(), "ops@example.com");
    }

    #[test]
    fn refuses_to_register_without_tos_acceptance() {
        let dir = TempDir::new().unwrap();
        let client = AccountClient::new(
            "https://ca.invalid/dir",
            "ops@example.com",
            false,
            dir.path().join("account.pem"),
        );
        let result = client.get_or_create_account();
        assert!(matches!(result, Err(RenewalError::Account(_))));
        // No key material may be minted before the ToS gate passes.
        assert!(!dir.path().join("account.pem").exists());
    }

    #[test]
    fn account_key_pem_is_generated() {
        let pem = generate_account_key_pem().unwrap();
        assert!(pem.contains("BEGIN PRIVATE KEY"));
    }
}
