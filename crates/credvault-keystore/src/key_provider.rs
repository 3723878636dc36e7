use std::{
    collections::HashMap,
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use aes_gcm::{aead::KeyInit, Aes256Gcm};
use base64::{engine::general_purpose, Engine as _};
use credvault_core::CredentialError;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::creation_lock::CreationLock;

/// Alias of the app-scoped device key. Device-bound, not user-bound.
pub const DEFAULT_KEY_ALIAS: &str = "credvault.device-key";

const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("keystore unavailable: {0}")]
    Unavailable(String),
    #[error("stored key could not be decoded: {0}")]
    Decode(String),
    #[error("key generation failed: {0}")]
    Generation(String),
}

impl From<KeyError> for CredentialError {
    fn from(err: KeyError) -> Self {
        CredentialError::KeystoreUnavailable {
            reason: err.to_string(),
        }
    }
}

/// Opaque handle to a 256-bit device key.
///
/// Holds an initialised AES-256-GCM instance, never the key bytes, so the
/// only thing a holder can do is seal or open through [`crate::aead::AeadCipher`].
#[derive(Clone)]
pub struct CredentialKey {
    alias: Arc<str>,
    id: Arc<str>,
    cipher: Arc<Aes256Gcm>,
}

impl CredentialKey {
    fn from_bytes(alias: &str, id: &str, bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != KEY_LEN {
            return Err(KeyError::Decode(format!(
                "expected {KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let cipher =
            Aes256Gcm::new_from_slice(bytes).map_err(|e| KeyError::Decode(e.to_string()))?;
        Ok(Self {
            alias: Arc::from(alias),
            id: Arc::from(id),
            cipher: Arc::new(cipher),
        })
    }

    /// Stable alias the key is stored under.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Random identifier assigned when the key was generated (safe to log).
    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn cipher(&self) -> &Aes256Gcm {
        &self.cipher
    }
}

impl fmt::Debug for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialKey")
            .field("alias", &self.alias)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Source of the non-extractable device key.
///
/// Implementations must be idempotent under concurrent first use: two callers
/// racing on an absent alias end up holding the same key.
pub trait HardwareKeyProvider: Send + Sync {
    /// Return the key stored under `alias`, generating it on first use.
    fn get_or_create_key(&self, alias: &str) -> Result<CredentialKey, KeyError>;

    fn key_exists(&self, alias: &str) -> Result<bool, KeyError>;

    /// Destroy the key under `alias` (idempotent). Everything sealed with it
    /// becomes unreadable.
    fn delete_key(&self, alias: &str) -> Result<(), KeyError>;
}

/// OS keyring-backed provider (Keychain, Credential Manager, Secret Service).
/// Key bytes only exist in process memory inside zeroizing buffers while the
/// cipher is being initialised.
pub struct KeyringKeyProvider {
    service: String,
    creation: Mutex<()>,
    lock: Option<CreationLock>,
}

impl KeyringKeyProvider {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            creation: Mutex::new(()),
            lock: None,
        }
    }

    /// Serialize first-time key creation across processes through a lock
    /// file at `path`. Without one, creation is only serialized in-process.
    pub fn with_creation_lock(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock = Some(CreationLock::new(path));
        self
    }

    fn entry(&self, alias: &str) -> Result<keyring::Entry, KeyError> {
        keyring::Entry::new(&self.service, alias).map_err(|e| KeyError::Unavailable(e.to_string()))
    }
}

/// Storage cell holding one alias's serialized key.
trait SecretSlot {
    fn read_secret(&self) -> Result<Option<Zeroizing<String>>, KeyError>;
    fn write_secret(&self, secret: &str) -> Result<(), KeyError>;
}

impl SecretSlot for keyring::Entry {
    fn read_secret(&self) -> Result<Option<Zeroizing<String>>, KeyError> {
        match self.get_password() {
            Ok(secret) => Ok(Some(Zeroizing::new(secret))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(KeyError::Unavailable(e.to_string())),
        }
    }

    fn write_secret(&self, secret: &str) -> Result<(), KeyError> {
        self.set_password(secret)
            .map_err(|e| KeyError::Unavailable(e.to_string()))
    }
}

fn read_key(slot: &impl SecretSlot, alias: &str) -> Result<Option<CredentialKey>, KeyError> {
    slot.read_secret()?
        .map(|secret| decode_key(alias, &secret))
        .transpose()
}

/// Load the key in `slot`, creating it under `creation` (in-process) and
/// `lock` (cross-process) when absent.
fn get_or_create_in(
    slot: &impl SecretSlot,
    alias: &str,
    creation: &Mutex<()>,
    lock: Option<&CreationLock>,
) -> Result<CredentialKey, KeyError> {
    if let Some(key) = read_key(slot, alias)? {
        debug!(alias, key_id = key.id(), "loaded device key");
        return Ok(key);
    }

    let _guard = creation
        .lock()
        .map_err(|err| KeyError::Generation(format!("lock poisoned: {err}")))?;
    let _file_guard = lock.map(CreationLock::acquire).transpose()?;

    // Another thread or process may have created it while we waited.
    if let Some(key) = read_key(slot, alias)? {
        return Ok(key);
    }

    let (id, bytes) = generate_key_bytes();
    slot.write_secret(&encode_key(&id, &bytes)?)?;

    // Hand out what the slot holds, not the local copy of the bytes.
    let key = read_key(slot, alias)?.ok_or_else(|| {
        KeyError::Unavailable("key vanished from keyring right after creation".to_string())
    })?;
    info!(alias, key_id = key.id(), "generated new device key");
    Ok(key)
}

impl HardwareKeyProvider for KeyringKeyProvider {
    fn get_or_create_key(&self, alias: &str) -> Result<CredentialKey, KeyError> {
        get_or_create_in(
            &self.entry(alias)?,
            alias,
            &self.creation,
            self.lock.as_ref(),
        )
    }

    fn key_exists(&self, alias: &str) -> Result<bool, KeyError> {
        let entry = self.entry(alias)?;
        match entry.get_password() {
            Ok(_) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(KeyError::Unavailable(e.to_string())),
        }
    }

    fn delete_key(&self, alias: &str) -> Result<(), KeyError> {
        let entry = self.entry(alias)?;
        match entry.delete_credential() {
            Ok(()) => {
                warn!(alias, "device key deleted from keyring");
                Ok(())
            }
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(KeyError::Unavailable(e.to_string())),
        }
    }
}

/// In-memory key provider for tests and ephemeral sessions. Holds handles
/// only; generated bytes are dropped (and zeroized) once the cipher exists.
#[derive(Debug, Default, Clone)]
pub struct InMemoryKeyProvider {
    keys: Arc<Mutex<HashMap<String, CredentialKey>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryKeyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a degraded device where the isolated environment cannot be reached.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn keys(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, CredentialKey>>, KeyError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(KeyError::Unavailable(
                "isolated environment unreachable".to_string(),
            ));
        }
        self.keys
            .lock()
            .map_err(|err| KeyError::Generation(format!("lock poisoned: {err}")))
    }
}

impl HardwareKeyProvider for InMemoryKeyProvider {
    fn get_or_create_key(&self, alias: &str) -> Result<CredentialKey, KeyError> {
        let mut keys = self.keys()?;
        if let Some(existing) = keys.get(alias) {
            return Ok(existing.clone());
        }

        let (id, bytes) = generate_key_bytes();
        let key = CredentialKey::from_bytes(alias, &id, bytes.as_slice())?;
        keys.insert(alias.to_string(), key.clone());
        Ok(key)
    }

    fn key_exists(&self, alias: &str) -> Result<bool, KeyError> {
        Ok(self.keys()?.contains_key(alias))
    }

    fn delete_key(&self, alias: &str) -> Result<(), KeyError> {
        self.keys()?.remove(alias);
        Ok(())
    }
}

/// Keyring payload. The key travels as base64 inside a zeroizing string.
#[derive(Serialize, Deserialize)]
struct StoredKey {
    id: String,
    key: String,
}

fn generate_key_bytes() -> (String, Zeroizing<[u8; KEY_LEN]>) {
    let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
    OsRng.fill_bytes(bytes.as_mut_slice());
    let id = format!("{:016x}", OsRng.next_u64());
    (id, bytes)
}

fn encode_key(id: &str, bytes: &[u8; KEY_LEN]) -> Result<Zeroizing<String>, KeyError> {
    let stored = StoredKey {
        id: id.to_string(),
        key: general_purpose::STANDARD.encode(bytes),
    };
    let json = serde_json::to_string(&stored).map_err(|e| KeyError::Generation(e.to_string()));
    drop(Zeroizing::new(stored.key));
    json.map(Zeroizing::new)
}

fn decode_key(alias: &str, secret: &str) -> Result<CredentialKey, KeyError> {
    let stored: StoredKey =
        serde_json::from_str(secret).map_err(|e| KeyError::Decode(e.to_string()))?;
    let bytes = Zeroizing::new(
        general_purpose::STANDARD
            .decode(&stored.key)
            .map_err(|e| KeyError::Decode(e.to_string()))?,
    );
    drop(Zeroizing::new(stored.key));
    CredentialKey::from_bytes(alias, &stored.id, &bytes)
}

#[cfg(test)]
mod tests {
    use std::{sync::Barrier, thread, time::Duration};

    use super::*;

    /// Last-writer-wins cell shared between simulated processes; writes are
    /// slow to widen any read/write race.
    #[derive(Clone, Default)]
    struct SharedSlot(Arc<Mutex<Option<String>>>);

    impl SecretSlot for SharedSlot {
        fn read_secret(&self) -> Result<Option<Zeroizing<String>>, KeyError> {
            Ok(self.0.lock().unwrap().clone().map(Zeroizing::new))
        }

        fn write_secret(&self, secret: &str) -> Result<(), KeyError> {
            thread::sleep(Duration::from_millis(20));
            *self.0.lock().unwrap() = Some(secret.to_string());
            Ok(())
        }
    }

    #[test]
    fn creation_lock_yields_one_key_across_processes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock_path = dir.path().join(".device-key.lock");
        let slot = SharedSlot::default();
        let start = Arc::new(Barrier::new(4));

        // Each thread has its own in-process mutex and lock handle, as a
        // separate process would.
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let slot = slot.clone();
                let lock = CreationLock::new(&lock_path);
                let start = Arc::clone(&start);
                thread::spawn(move || {
                    let creation = Mutex::new(());
                    start.wait();
                    get_or_create_in(&slot, DEFAULT_KEY_ALIAS, &creation, Some(&lock))
                        .unwrap()
                        .id()
                        .to_string()
                })
            })
            .collect();
        let ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(ids.iter().all(|id| id == &ids[0]), "ids diverged: {ids:?}");
        let stored = slot.read_secret().unwrap().expect("stored");
        assert_eq!(decode_key(DEFAULT_KEY_ALIAS, &stored).unwrap().id(), ids[0]);
    }

    #[test]
    fn existing_key_is_loaded_without_the_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = CreationLock::new(dir.path().join(".device-key.lock"));
        let slot = SharedSlot::default();
        let first =
            get_or_create_in(&slot, "alias", &Mutex::new(()), Some(&lock)).unwrap();

        let _held = lock.acquire().unwrap();
        let again = get_or_create_in(&slot, "alias", &Mutex::new(()), Some(&lock)).unwrap();
        assert_eq!(first.id(), again.id());
    }

    #[test]
    fn memory_provider_returns_same_key() {
        let provider = InMemoryKeyProvider::new();
        let first = provider.get_or_create_key(DEFAULT_KEY_ALIAS).unwrap();
        let second = provider.get_or_create_key(DEFAULT_KEY_ALIAS).unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(first.alias(), DEFAULT_KEY_ALIAS);
    }

    #[test]
    fn distinct_aliases_get_distinct_keys() {
        let provider = InMemoryKeyProvider::new();
        let a = provider.get_or_create_key("a").unwrap();
        let b = provider.get_or_create_key("b").unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn key_exists_and_delete() {
        let provider = InMemoryKeyProvider::new();
        assert!(!provider.key_exists("k").unwrap());

        let created = provider.get_or_create_key("k").unwrap();
        assert!(provider.key_exists("k").unwrap());

        provider.delete_key("k").unwrap();
        provider.delete_key("k").expect("delete is idempotent");
        assert!(!provider.key_exists("k").unwrap());

        let recreated = provider.get_or_create_key("k").unwrap();
        assert_ne!(created.id(), recreated.id());
    }

    #[test]
    fn unavailable_environment_fails_fast() {
        let provider = InMemoryKeyProvider::new();
        provider.set_unavailable(true);

        let err = provider
            .get_or_create_key(DEFAULT_KEY_ALIAS)
            .expect_err("should be unavailable");
        assert!(matches!(err, KeyError::Unavailable(_)));
        assert!(matches!(
            CredentialError::from(err),
            CredentialError::KeystoreUnavailable { .. }
        ));
    }

    #[test]
    fn concurrent_first_use_yields_one_key() {
        let provider = InMemoryKeyProvider::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let provider = provider.clone();
                thread::spawn(move || {
                    provider
                        .get_or_create_key(DEFAULT_KEY_ALIAS)
                        .map(|k| k.id().to_string())
                })
            })
            .collect();

        let ids: Vec<String> = handles
            .into_iter()
            .map(|h| h.join().expect("thread").expect("key"))
            .collect();
        assert!(ids.iter().all(|id| id == &ids[0]));
    }

    #[test]
    fn debug_output_redacts_key_material() {
        let provider = InMemoryKeyProvider::new();
        let key = provider.get_or_create_key("debug").unwrap();
        let rendered = format!("{key:?}");
        assert!(rendered.starts_with("CredentialKey"));
        assert!(rendered.contains("debug"));
        assert!(!rendered.contains("cipher"));
    }

    #[test]
    fn keyring_payload_round_trips() {
        let (id, bytes) = generate_key_bytes();
        let encoded = encode_key(&id, &bytes).expect("encode");
        assert!(!encoded.is_empty());
        let key = decode_key("alias", &encoded).expect("decode");
        assert_eq!(key.id(), id);
        assert_eq!(key.alias(), "alias");
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let payload = r#"{"id":"abc","key":"abcd"}"#;
        let err = decode_key("alias", payload).expect_err("should reject wrong length");
        assert!(matches!(err, KeyError::Decode(_)));
    }

    #[test]
    fn decode_rejects_non_json_payload() {
        let err = decode_key("alias", "not-json").expect_err("should reject");
        assert!(matches!(err, KeyError::Decode(_)));
    }
}
