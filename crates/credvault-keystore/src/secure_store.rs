use std::sync::RwLock;

use credvault_core::{CipherEnvelope, CredentialError, EnvelopeVersion};
use tracing::{debug, info, instrument};
use zeroize::Zeroizing;

use crate::{
    aead::AeadCipher,
    key_provider::{CredentialKey, HardwareKeyProvider, DEFAULT_KEY_ALIAS},
};

/// Domain prefix folded into v2 associated data.
const V2_CONTEXT: &[u8] = b"credvault/oauth-token\0";

/// Protects credential material under the app-scoped device key.
///
/// One key serves every user; each envelope is bound to its user through
/// associated data, so an envelope sealed for one user never opens for another.
/// The only state is the lazily fetched key handle, which is replaced solely by
/// [`SecureCredentialStore::rotate_key`].
pub struct SecureCredentialStore<P: HardwareKeyProvider> {
    provider: P,
    alias: String,
    cipher: AeadCipher,
    key: RwLock<Option<CredentialKey>>,
}

impl<P: HardwareKeyProvider> SecureCredentialStore<P> {
    pub fn new(provider: P) -> Self {
        Self::with_alias(provider, DEFAULT_KEY_ALIAS)
    }

    pub fn with_alias(provider: P, alias: impl Into<String>) -> Self {
        Self {
            provider,
            alias: alias.into(),
            cipher: AeadCipher::new(),
            key: RwLock::new(None),
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn key_exists(&self) -> Result<bool, CredentialError> {
        Ok(self.provider.key_exists(&self.alias)?)
    }

    /// Identifier of the current device key, creating the key if needed.
    pub fn key_id(&self) -> Result<String, CredentialError> {
        Ok(self.device_key()?.id().to_string())
    }

    /// Seal `plaintext` for `user_id` at the current envelope version.
    #[instrument(skip_all, fields(user_id = %user_id))]
    pub fn protect(
        &self,
        user_id: &str,
        plaintext: &[u8],
    ) -> Result<CipherEnvelope, CredentialError> {
        let key = self.device_key()?;
        self.seal_with(&key, EnvelopeVersion::CURRENT, user_id, plaintext)
    }

    /// Open an envelope sealed for `user_id`, whatever supported version wrote it.
    #[instrument(skip_all, fields(user_id = %user_id, version = envelope.version()))]
    pub fn unprotect(
        &self,
        user_id: &str,
        envelope: &CipherEnvelope,
    ) -> Result<Vec<u8>, CredentialError> {
        let key = self.device_key()?;
        self.open_with(&key, user_id, envelope)
    }

    /// Decode wire bytes, then [`Self::unprotect`].
    pub fn unprotect_encoded(
        &self,
        user_id: &str,
        encoded: &[u8],
    ) -> Result<Vec<u8>, CredentialError> {
        let envelope = CipherEnvelope::decode(encoded)?;
        self.unprotect(user_id, &envelope)
    }

    /// Seal at an explicit supported version. Lets tests fabricate envelopes
    /// written by older builds.
    #[cfg(any(test, feature = "test-util"))]
    pub fn protect_with_version(
        &self,
        version: EnvelopeVersion,
        user_id: &str,
        plaintext: &[u8],
    ) -> Result<CipherEnvelope, CredentialError> {
        let key = self.device_key()?;
        self.seal_with(&key, version, user_id, plaintext)
    }

    /// True when the envelope was written by an older supported version.
    pub fn needs_upgrade(&self, envelope: &CipherEnvelope) -> bool {
        EnvelopeVersion::try_from(envelope.version())
            .map(|version| !version.is_current())
            .unwrap_or(false)
    }

    /// Re-seal an envelope at the current version.
    pub fn reseal(
        &self,
        user_id: &str,
        envelope: &CipherEnvelope,
    ) -> Result<CipherEnvelope, CredentialError> {
        let plaintext = Zeroizing::new(self.unprotect(user_id, envelope)?);
        self.protect(user_id, &plaintext)
    }

    /// Replace the device key and re-seal every supplied envelope under it.
    ///
    /// All envelopes are opened before the old key is destroyed; if any of
    /// them fails, nothing changes. Returns the new envelopes in input order.
    #[instrument(skip_all, fields(alias = %self.alias, count = entries.len()))]
    pub fn rotate_key(
        &self,
        entries: &[(String, CipherEnvelope)],
    ) -> Result<Vec<CipherEnvelope>, CredentialError> {
        let mut slot = self.key.write().map_err(poisoned)?;
        let old = match slot.as_ref() {
            Some(key) => key.clone(),
            None => self.provider.get_or_create_key(&self.alias)?,
        };

        let plaintexts = entries
            .iter()
            .map(|(user_id, envelope)| {
                self.open_with(&old, user_id, envelope).map(Zeroizing::new)
            })
            .collect::<Result<Vec<_>, _>>()?;

        *slot = None;
        self.provider.delete_key(&self.alias)?;
        let fresh = self.provider.get_or_create_key(&self.alias)?;
        *slot = Some(fresh.clone());
        info!(old_key = old.id(), new_key = fresh.id(), "device key rotated");

        entries
            .iter()
            .zip(plaintexts.iter())
            .map(|((user_id, _), plaintext)| {
                self.seal_with(&fresh, EnvelopeVersion::CURRENT, user_id, plaintext)
            })
            .collect()
    }

    fn device_key(&self) -> Result<CredentialKey, CredentialError> {
        if let Some(key) = self.key.read().map_err(poisoned)?.as_ref() {
            return Ok(key.clone());
        }

        let mut slot = self.key.write().map_err(poisoned)?;
        if let Some(key) = slot.as_ref() {
            return Ok(key.clone());
        }
        let key = self.provider.get_or_create_key(&self.alias)?;
        debug!(alias = %self.alias, key_id = key.id(), "device key ready");
        *slot = Some(key.clone());
        Ok(key)
    }

    fn seal_with(
        &self,
        key: &CredentialKey,
        version: EnvelopeVersion,
        user_id: &str,
        plaintext: &[u8],
    ) -> Result<CipherEnvelope, CredentialError> {
        let aad = associated_data(version, user_id);
        self.cipher.seal(key, version, plaintext, &aad)
    }

    fn open_with(
        &self,
        key: &CredentialKey,
        user_id: &str,
        envelope: &CipherEnvelope,
    ) -> Result<Vec<u8>, CredentialError> {
        let version = EnvelopeVersion::try_from(envelope.version())?;
        let aad = associated_data(version, user_id);
        self.cipher.open(key, envelope, &aad)
    }
}

/// Per-version associated data for a user. Never stored; rebuilt on every open.
fn associated_data(version: EnvelopeVersion, user_id: &str) -> Vec<u8> {
    match version {
        EnvelopeVersion::V1 => user_id.as_bytes().to_vec(),
        EnvelopeVersion::V2 => {
            let mut aad = Vec::with_capacity(V2_CONTEXT.len() + user_id.len());
            aad.extend_from_slice(V2_CONTEXT);
            aad.extend_from_slice(user_id.as_bytes());
            aad
        }
    }
}

fn poisoned<E: std::fmt::Display>(err: E) -> CredentialError {
    CredentialError::KeystoreUnavailable {
        reason: format!("key cache lock poisoned: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc, thread};

    use credvault_core::envelope::MIN_ENCODED_LEN;

    use super::*;
    use crate::key_provider::InMemoryKeyProvider;

    fn store() -> SecureCredentialStore<InMemoryKeyProvider> {
        SecureCredentialStore::new(InMemoryKeyProvider::new())
    }

    #[test]
    fn round_trip_returns_plaintext() {
        let store = store();
        for token in [&b""[..], &b"ya29.a0AfH6SM"[..], &[0xFFu8; 4096][..]] {
            let envelope = store.protect("alice@example.com", token).expect("protect");
            let opened = store.unprotect("alice@example.com", &envelope).expect("unprotect");
            assert_eq!(opened, token);
        }
    }

    #[test]
    fn encoded_round_trip() {
        let store = store();
        let envelope = store.protect("alice", b"token").expect("protect");
        let opened = store
            .unprotect_encoded("alice", &envelope.encode())
            .expect("unprotect");
        assert_eq!(opened, b"token");

        let err = store
            .unprotect_encoded("alice", &[2u8; MIN_ENCODED_LEN - 1])
            .expect_err("truncated");
        assert!(matches!(err, CredentialError::MalformedEnvelope { .. }));
    }

    #[test]
    fn any_single_bit_flip_is_detected() {
        let store = store();
        let envelope = store.protect("alice", b"refresh-token").expect("protect");
        let encoded = envelope.encode();

        // Every bit of ciphertext and tag; the version byte and nonce follow other paths.
        for byte in 1 + 12..encoded.len() {
            for bit in 0..8 {
                let mut tampered = encoded.clone();
                tampered[byte] ^= 1 << bit;
                let err = store
                    .unprotect_encoded("alice", &tampered)
                    .expect_err("tampered envelope must not open");
                assert_eq!(err, CredentialError::AuthenticationFailed);
            }
        }
    }

    #[test]
    fn nonce_tamper_is_detected() {
        let store = store();
        let mut encoded = store.protect("alice", b"t").expect("protect").encode();
        encoded[1] ^= 0x80;
        assert_eq!(
            store.unprotect_encoded("alice", &encoded),
            Err(CredentialError::AuthenticationFailed)
        );
    }

    #[test]
    fn envelopes_do_not_cross_users() {
        let store = store();
        let envelope = store.protect("alice", b"token").expect("protect");
        assert_eq!(
            store.unprotect("bob", &envelope),
            Err(CredentialError::AuthenticationFailed)
        );
    }

    #[test]
    fn nonces_are_unique() {
        let store = store();
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let envelope = store.protect("alice", b"token").expect("protect");
            assert!(seen.insert(*envelope.nonce()), "nonce reused");
        }
    }

    #[test]
    fn unrecognized_version_is_rejected() {
        let store = store();
        let mut encoded = store.protect("alice", b"token").expect("protect").encode();
        encoded[0] = 0x7F;
        assert_eq!(
            store.unprotect_encoded("alice", &encoded),
            Err(CredentialError::UnsupportedEnvelopeVersion { version: 0x7F })
        );
    }

    #[test]
    fn legacy_envelopes_still_open_and_can_be_upgraded() {
        let store = store();
        let legacy = store
            .protect_with_version(EnvelopeVersion::V1, "alice", b"old-token")
            .expect("seal v1");

        assert!(store.needs_upgrade(&legacy));
        assert_eq!(store.unprotect("alice", &legacy).expect("open v1"), b"old-token");
        assert_eq!(
            store.unprotect("bob", &legacy),
            Err(CredentialError::AuthenticationFailed)
        );

        let upgraded = store.reseal("alice", &legacy).expect("reseal");
        assert_eq!(upgraded.version(), EnvelopeVersion::CURRENT.as_byte());
        assert!(!store.needs_upgrade(&upgraded));
        assert_eq!(store.unprotect("alice", &upgraded).expect("open"), b"old-token");
    }

    #[test]
    fn versions_use_distinct_associated_data() {
        assert_ne!(
            associated_data(EnvelopeVersion::V1, "alice"),
            associated_data(EnvelopeVersion::V2, "alice")
        );
        assert!(associated_data(EnvelopeVersion::V2, "alice").starts_with(V2_CONTEXT));
    }

    #[test]
    fn keystore_unavailable_is_surfaced() {
        let provider = InMemoryKeyProvider::new();
        provider.set_unavailable(true);
        let store = SecureCredentialStore::new(provider);

        let err = store.protect("alice", b"token").expect_err("should fail");
        assert!(matches!(err, CredentialError::KeystoreUnavailable { .. }));
        assert!(!err.requires_reauthentication());
    }

    #[test]
    fn concurrent_first_use_shares_one_key() {
        let provider = InMemoryKeyProvider::new();
        let stores: Vec<_> = (0..2)
            .map(|_| Arc::new(SecureCredentialStore::new(provider.clone())))
            .collect();

        let handles: Vec<_> = stores
            .iter()
            .enumerate()
            .map(|(i, store)| {
                let store = Arc::clone(store);
                thread::spawn(move || {
                    let user = format!("user-{i}");
                    let envelope = store.protect(&user, user.as_bytes()).expect("protect");
                    (user, envelope)
                })
            })
            .collect();
        let sealed: Vec<_> = handles.into_iter().map(|h| h.join().expect("thread")).collect();

        // Each store opens what the other one sealed.
        for (user, envelope) in &sealed {
            for store in &stores {
                assert_eq!(store.unprotect(user, envelope).expect("unprotect"), user.as_bytes());
            }
        }
    }

    #[test]
    fn parallel_protect_and_unprotect_share_a_store() {
        let store = Arc::new(store());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let user = format!("user-{i}");
                    for n in 0..50 {
                        let token = format!("token-{i}-{n}");
                        let envelope = store.protect(&user, token.as_bytes()).expect("protect");
                        let opened = store.unprotect(&user, &envelope).expect("unprotect");
                        assert_eq!(opened, token.as_bytes());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread");
        }
    }

    #[test]
    fn rotation_reseals_and_retires_old_key() {
        let store = store();
        let before = store.key_id().expect("key id");
        let entries = vec![
            ("alice".to_string(), store.protect("alice", b"a-token").expect("protect")),
            ("bob".to_string(), store.protect("bob", b"b-token").expect("protect")),
        ];

        let rotated = store.rotate_key(&entries).expect("rotate");
        assert_ne!(store.key_id().expect("key id"), before);
        assert_eq!(rotated.len(), 2);
        assert_eq!(store.unprotect("alice", &rotated[0]).expect("open"), b"a-token");
        assert_eq!(store.unprotect("bob", &rotated[1]).expect("open"), b"b-token");
        assert_eq!(
            store.unprotect("alice", &entries[0].1),
            Err(CredentialError::AuthenticationFailed)
        );
    }

    #[test]
    fn rotation_aborts_without_touching_key_when_an_envelope_fails() {
        let store = store();
        let before = store.key_id().expect("key id");
        let good = store.protect("alice", b"a-token").expect("protect");
        let entries = vec![
            ("alice".to_string(), good.clone()),
            ("mallory".to_string(), good.clone()),
        ];

        assert_eq!(
            store.rotate_key(&entries),
            Err(CredentialError::AuthenticationFailed)
        );
        assert_eq!(store.key_id().expect("key id"), before);
        assert_eq!(store.unprotect("alice", &good).expect("open"), b"a-token");
    }

    #[test]
    fn alias_scopes_the_key() {
        let provider = InMemoryKeyProvider::new();
        let primary = SecureCredentialStore::new(provider.clone());
        let other = SecureCredentialStore::with_alias(provider, "other-app");
        assert_eq!(other.alias(), "other-app");

        let envelope = primary.protect("alice", b"token").expect("protect");
        assert_eq!(
            other.unprotect("alice", &envelope),
            Err(CredentialError::AuthenticationFailed)
        );
        assert!(primary.key_exists().expect("exists"));
    }
}
