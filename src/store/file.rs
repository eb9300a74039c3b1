use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use log::debug;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::{parse_leaf, CertificateEntry, EntryMetadata, StoreError};

// Version 1 stretched the password with an iterated-SHA-256 loop; version 2
// switched to Argon2id and is not backward compatible.
const STORE_VERSION: u32 = 2;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// On-disk envelope: everything below `ciphertext` is encrypted with the
/// store password.
#[derive(Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    salt: String,
    nonce: String,
    ciphertext: String,
}

#[derive(Serialize, Deserialize, Clone)]
struct EntryRecord {
    key_salt: String,
    key_nonce: String,
    key_ciphertext: String,
    chain_pem: Vec<String>,
    issuer: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    sans: Vec<String>,
}

/// File-backed, password-protected alias -> credential map.
///
/// `persist` is atomic: the document is written to a sibling temp file and
/// renamed over the previous version, so a failed write never leaves a torn
/// store behind and the in-memory map stays authoritative.
pub struct CredentialStore {
    path: PathBuf,
    password: Zeroizing<String>,
    entries: BTreeMap<String, EntryRecord>,
}

impl CredentialStore {
    /// Opens the store at `path`, creating an empty one when the file does
    /// not exist yet. A present but undecodable file is `Corrupt`; a present
    /// file that does not decrypt is `BadPassword`.
    pub fn load(path: impl Into<PathBuf>, password: &str) -> Result<Self, StoreError> {
        let path = path.into();
        let mut store = Self {
            path,
            password: Zeroizing::new(password.to_string()),
            entries: BTreeMap::new(),
        };

        if !store.path.exists() {
            debug!(
                "[store] no store file at {}, starting empty",
                store.path.display()
            );
            return Ok(store);
        }

        let raw = fs::read(&store.path)?;
        let document: StoreDocument = serde_json::from_slice(&raw)
            .map_err(|err| StoreError::Corrupt(format!("unreadable store document: {err}")))?;
        if document.version != STORE_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported store version {}",
                document.version
            )));
        }

        let salt = decode_field(&document.salt, "salt")?;
        let nonce = decode_field(&document.nonce, "nonce")?;
        let ciphertext = decode_field(&document.ciphertext, "ciphertext")?;
        if nonce.len() != NONCE_LEN {
            return Err(StoreError::Corrupt("bad nonce length".into()));
        }

        let plaintext = decrypt(password, &salt, &nonce, &ciphertext)?;
        store.entries = serde_json::from_slice(&plaintext)
            .map_err(|err| StoreError::Corrupt(format!("unreadable entry table: {err}")))?;
        debug!(
            "[store] loaded {} entries from {}",
            store.entries.len(),
            store.path.display()
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.entries.contains_key(alias)
    }

    pub fn aliases(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Non-secret metadata for one alias; no key password required.
    pub fn entry_metadata(&self, alias: &str) -> Option<EntryMetadata> {
        self.entries.get(alias).map(|record| EntryMetadata {
            alias: alias.to_string(),
            issuer: record.issuer.clone(),
            not_before: record.not_before,
            not_after: record.not_after,
            sans: record.sans.clone(),
        })
    }

    /// Decrypts and returns the credential stored under `alias`.
    pub fn get(
        &self,
        alias: &str,
        key_password: &str,
    ) -> Result<Option<CertificateEntry>, StoreError> {
        let Some(record) = self.entries.get(alias) else {
            return Ok(None);
        };
        let key_salt = decode_field(&record.key_salt, "key salt")?;
        let key_nonce = decode_field(&record.key_nonce, "key nonce")?;
        let key_ciphertext = decode_field(&record.key_ciphertext, "key ciphertext")?;
        let key_bytes = decrypt(key_password, &key_salt, &key_nonce, &key_ciphertext)?;
        let key_pem = String::from_utf8(key_bytes)
            .map_err(|_| StoreError::Corrupt("stored private key is not valid UTF-8".into()))?;

        Ok(Some(CertificateEntry {
            alias: alias.to_string(),
            key_pem: Zeroizing::new(key_pem),
            chain_pem: record.chain_pem.clone(),
            issuer: record.issuer.clone(),
            not_before: record.not_before,
            not_after: record.not_after,
            sans: record.sans.clone(),
        }))
    }

    /// Stores a credential under `alias`, replacing any previous entry.
    /// Certificate metadata is captured from the chain's leaf at this point.
    pub fn put(
        &mut self,
        alias: &str,
        key_pem: &str,
        chain_pem: &[String],
        key_password: &str,
    ) -> Result<(), StoreError> {
        let leaf = chain_pem
            .first()
            .ok_or_else(|| StoreError::Corrupt("empty certificate chain".into()))?;
        let info = parse_leaf(leaf)?;

        let (key_salt, key_nonce, key_ciphertext) = encrypt(key_password, key_pem.as_bytes())?;
        let record = EntryRecord {
            key_salt,
            key_nonce,
            key_ciphertext,
            chain_pem: chain_pem.to_vec(),
            issuer: info.issuer,
            not_before: info.not_before,
            not_after: info.not_after,
            sans: info.sans,
        };
        self.entries.insert(alias.to_string(), record);
        Ok(())
    }

    /// Removes `alias` from the in-memory store. Returns whether an entry
    /// was present.
    pub fn delete(&mut self, alias: &str) -> bool {
        self.entries.remove(alias).is_some()
    }

    /// Writes the store to disk. Either the file is fully replaced or the
    /// previous version stays intact.
    pub fn persist(&self) -> Result<(), StoreError> {
        let plaintext = serde_json::to_vec(&self.entries)
            .map_err(|err| StoreError::Unavailable(format!("serialize entries: {err}")))?;
        let (salt, nonce, ciphertext) = encrypt(&self.password, &plaintext)?;
        let document = StoreDocument {
            version: STORE_VERSION,
            salt,
            nonce,
            ciphertext,
        };
        let body = serde_json::to_vec_pretty(&document)
            .map_err(|err| StoreError::Unavailable(format!("serialize document: {err}")))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &body)?;
        fs::rename(&tmp, &self.path)?;
        debug!(
            "[store] persisted {} entries to {}",
            self.entries.len(),
            self.path.display()
        );
        Ok(())
    }
}

fn decode_field(value: &str, what: &str) -> Result<Vec<u8>, StoreError> {
    BASE64
        .decode(value)
        .map_err(|err| StoreError::Corrupt(format!("undecodable {what}: {err}")))
}

fn derive_key(password: &str, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>, StoreError> {
    let mut key = Zeroizing::new([0u8; 32]);
    Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut *key)
        .map_err(|err| StoreError::Unavailable(format!("key derivation: {err}")))?;
    Ok(key)
}

fn encrypt(password: &str, plaintext: &[u8]) -> Result<(String, String, String), StoreError> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut nonce);

    let key = derive_key(password, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(key.as_ref())
        .map_err(|err| StoreError::Unavailable(format!("cipher init: {err}")))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| StoreError::Unavailable("encryption failed".into()))?;

    Ok((
        BASE64.encode(salt),
        BASE64.encode(nonce),
        BASE64.encode(ciphertext),
    ))
}

fn decrypt(
    password: &str,
    salt: &[u8],
    nonce: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, StoreError> {
    let key = derive_key(password, salt)?;
    let cipher = Aes256Gcm::new_from_slice(key.as_ref())
        .map_err(|err| StoreError::Unavailable(format!("cipher init: {err}")))?;
    // An authentication failure here means the password does not match.
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| StoreError::BadPassword)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_credential(domain: &str) -> (String, String) {
        let params = rcgen::CertificateParams::new(vec![domain.to_string()]).unwrap();
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        (key.serialize_pem(), cert.pem())
    }

    fn store_path(dir: &TempDir) -> PathBuf {
        dir.path().join("credentials.store")
    }

    #[test]
    fn missing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::load(store_path(&dir), "secret").unwrap();
        assert!(store.aliases().is_empty());
    }

    #[test]
    fn put_persist_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let (key_pem, cert_pem) = sample_credential("example.com");

        let mut store = CredentialStore::load(store_path(&dir), "store-pw").unwrap();
        store
            .put("example", &key_pem, &[cert_pem.clone()], "key-pw")
            .unwrap();
        store.persist().unwrap();

        let reloaded = CredentialStore::load(store_path(&dir), "store-pw").unwrap();
        let entry = reloaded.get("example", "key-pw").unwrap().unwrap();
        assert_eq!(*entry.key_pem, key_pem);
        assert_eq!(entry.chain_pem, vec![cert_pem]);
        assert_eq!(entry.sans, vec!["example.com"]);
    }

    #[test]
    fn wrong_store_password_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (key_pem, cert_pem) = sample_credential("example.com");
        let mut store = CredentialStore::load(store_path(&dir), "right").unwrap();
        store.put("example", &key_pem, &[cert_pem], "kp").unwrap();
        store.persist().unwrap();

        let result = CredentialStore::load(store_path(&dir), "wrong");
        assert!(matches!(result, Err(StoreError::BadPassword)));
    }

    #[test]
    fn wrong_key_password_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (key_pem, cert_pem) = sample_credential("example.com");
        let mut store = CredentialStore::load(store_path(&dir), "store-pw").unwrap();
        store.put("example", &key_pem, &[cert_pem], "right").unwrap();

        let result = store.get("example", "wrong");
        assert!(matches!(result, Err(StoreError::BadPassword)));
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        fs::write(&path, b"not a store document").unwrap();
        let result = CredentialStore::load(&path, "pw");
        assert!(matches!(result, Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn put_replaces_previous_entry_for_alias() {
        let dir = TempDir::new().unwrap();
        let (key_one, cert_one) = sample_credential("one.example.com");
        let (key_two, cert_two) = sample_credential("two.example.com");

        let mut store = CredentialStore::load(store_path(&dir), "pw").unwrap();
        store.put("live", &key_one, &[cert_one], "kp").unwrap();
        store.put("live", &key_two, &[cert_two], "kp").unwrap();

        assert_eq!(store.aliases(), vec!["live".to_string()]);
        let entry = store.get("live", "kp").unwrap().unwrap();
        assert_eq!(entry.sans, vec!["two.example.com"]);
    }

    #[test]
    fn delete_removes_entry() {
        let dir = TempDir::new().unwrap();
        let (key_pem, cert_pem) = sample_credential("example.com");
        let mut store = CredentialStore::load(store_path(&dir), "pw").unwrap();
        store.put("example", &key_pem, &[cert_pem], "kp").unwrap();

        assert!(store.delete("example"));
        assert!(!store.delete("example"));
        assert!(store.get("example", "kp").unwrap().is_none());
    }

    #[test]
    fn metadata_does_not_need_key_password() {
        let dir = TempDir::new().unwrap();
        let (key_pem, cert_pem) = sample_credential("example.com");
        let mut store = CredentialStore::load(store_path(&dir), "pw").unwrap();
        store.put("example", &key_pem, &[cert_pem], "kp").unwrap();

        let meta = store.entry_metadata("example").unwrap();
        assert_eq!(meta.sans, vec!["example.com"]);
        assert!(meta.not_after > meta.not_before);
    }

    #[test]
    fn unsupported_store_version_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        let document = serde_json::json!({
            "version": 1,
            "salt": "",
            "nonce": "",
            "ciphertext": "",
        });
        fs::write(&path, serde_json::to_vec(&document).unwrap()).unwrap();
        let result = CredentialStore::load(&path, "pw");
        assert!(matches!(result, Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn empty_chain_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (key_pem, _) = sample_credential("example.com");
        let mut store = CredentialStore::load(store_path(&dir), "pw").unwrap();
        let result = store.put("example", &key_pem, &[], "kp");
        assert!(matches!(result, Err(StoreError::Corrupt(_))));
    }
}
