//! Credential vault: seals tokens through [`SecureCredentialStore`] and keeps the
//! resulting records in a local cache mirrored to a remote document store.

use std::collections::BTreeMap;

use credvault_core::{
    CipherEnvelope, CredentialError, RecordStore, RecordStoreError, StoredRecord,
};
use credvault_keystore::{key_provider::HardwareKeyProvider, secure_store::SecureCredentialStore};
use thiserror::Error;
use tracing::{info, instrument, warn};
use zeroize::Zeroizing;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("local store ({store}) failed: {source}")]
    Local {
        store: &'static str,
        #[source]
        source: RecordStoreError,
    },
    #[error("remote store ({store}) failed: {source}")]
    Remote {
        store: &'static str,
        #[source]
        source: RecordStoreError,
    },
    #[error("no stored credential for user: {user_id}")]
    NotFound { user_id: String },
    #[error("device key rotated but {} record write(s) failed", .failures.len())]
    RotationIncomplete { failures: Vec<VaultError> },
}

impl VaultError {
    /// True when the caller should drop the credential and sign the user in again.
    pub fn requires_reauthentication(&self) -> bool {
        match self {
            VaultError::Credential(err) => err.requires_reauthentication(),
            VaultError::NotFound { .. } => true,
            VaultError::Local { .. }
            | VaultError::Remote { .. }
            | VaultError::RotationIncomplete { .. } => false,
        }
    }
}

/// Ties the credential store to its local and remote persistence.
pub struct CredentialVault<P: HardwareKeyProvider, L: RecordStore, R: RecordStore> {
    store: SecureCredentialStore<P>,
    local: L,
    remote: R,
}

impl<P: HardwareKeyProvider, L: RecordStore, R: RecordStore> CredentialVault<P, L, R> {
    pub fn new(store: SecureCredentialStore<P>, local: L, remote: R) -> Self {
        Self {
            store,
            local,
            remote,
        }
    }

    pub fn store(&self) -> &SecureCredentialStore<P> {
        &self.store
    }

    pub fn local(&self) -> &L {
        &self.local
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// Seal a token and persist it locally, then mirror it remotely.
    #[instrument(skip(self, token))]
    pub async fn save(&self, user_id: &str, token: &[u8]) -> Result<StoredRecord, VaultError> {
        let envelope = self.store.protect(user_id, token)?;
        let record = StoredRecord::new(user_id, envelope);
        self.write_both(&record).await?;
        Ok(record)
    }

    /// Recover a token, restoring the record from the remote when the local
    /// cache has none. Records sealed by an older envelope version are
    /// re-sealed at the current version and written back.
    #[instrument(skip(self))]
    pub async fn load(&self, user_id: &str) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        let record = match self.local.get(user_id).await {
            Ok(record) => record,
            Err(RecordStoreError::NotFound { .. }) => self.restore_from_remote(user_id).await?,
            Err(err) => return Err(self.local_err(err)),
        };

        let token = Zeroizing::new(self.store.unprotect(user_id, &record.envelope)?);
        if self.store.needs_upgrade(&record.envelope) {
            if let Err(err) = self.upgrade(user_id, &token).await {
                warn!(version = record.envelope.version(), "envelope upgrade failed: {err}");
            }
        }
        Ok(token)
    }

    /// Pull the remote copy into the local cache.
    #[instrument(skip(self))]
    pub async fn restore_from_remote(&self, user_id: &str) -> Result<StoredRecord, VaultError> {
        let record = match self.remote.get(user_id).await {
            Ok(record) => record,
            Err(RecordStoreError::NotFound { .. }) => {
                return Err(VaultError::NotFound {
                    user_id: user_id.to_string(),
                })
            }
            Err(err) => return Err(self.remote_err(err)),
        };
        self.local
            .put(&record)
            .await
            .map_err(|err| self.local_err(err))?;
        info!(remote = self.remote.name(), "restored record from remote");
        Ok(record)
    }

    /// Drop a user's record everywhere (idempotent).
    #[instrument(skip(self))]
    pub async fn forget(&self, user_id: &str) -> Result<(), VaultError> {
        self.local
            .delete(user_id)
            .await
            .map_err(|err| self.local_err(err))?;
        self.remote
            .delete(user_id)
            .await
            .map_err(|err| self.remote_err(err))
    }

    /// Rotate the device key and rewrite every known record under it.
    ///
    /// The rotation set is the union of the local cache and the remote
    /// mirror, the local copy winning per user. Any listing failure or any
    /// record that does not open aborts before the old key is touched. Once
    /// the key is replaced, every record is written locally first and only
    /// then mirrored; write failures are collected and reported together.
    /// Returns how many records were re-sealed.
    #[instrument(skip(self))]
    pub async fn rotate_key(&self) -> Result<usize, VaultError> {
        let entries = self.rotation_set().await?;
        let resealed = self.store.rotate_key(&entries)?;
        let records: Vec<StoredRecord> = entries
            .into_iter()
            .zip(resealed)
            .map(|((user_id, _), envelope)| StoredRecord::new(user_id, envelope))
            .collect();

        let mut failures = Vec::new();
        for record in &records {
            if let Err(err) = self.local.put(record).await {
                warn!(user_id = %record.user_id, "re-sealed record not cached locally: {err}");
                failures.push(self.local_err(err));
            }
        }
        for record in &records {
            if let Err(err) = self.remote.put(record).await {
                warn!(user_id = %record.user_id, remote = self.remote.name(), "re-sealed record not mirrored: {err}");
                failures.push(self.remote_err(err));
            }
        }

        info!(count = records.len(), failed = failures.len(), "re-sealed records under rotated key");
        if failures.is_empty() {
            Ok(records.len())
        } else {
            Err(VaultError::RotationIncomplete { failures })
        }
    }

    async fn rotation_set(&self) -> Result<Vec<(String, CipherEnvelope)>, VaultError> {
        let remote = self
            .remote
            .list()
            .await
            .map_err(|err| self.remote_err(err))?;
        let local = self
            .local
            .list()
            .await
            .map_err(|err| self.local_err(err))?;

        let mut merged = BTreeMap::new();
        for record in remote.into_iter().chain(local) {
            merged.insert(record.user_id, record.envelope);
        }
        Ok(merged.into_iter().collect())
    }

    async fn upgrade(&self, user_id: &str, token: &[u8]) -> Result<(), VaultError> {
        let envelope = self.store.protect(user_id, token)?;
        self.write_both(&StoredRecord::new(user_id, envelope)).await?;
        info!("upgraded record to current envelope version");
        Ok(())
    }

    async fn write_both(&self, record: &StoredRecord) -> Result<(), VaultError> {
        self.local
            .put(record)
            .await
            .map_err(|err| self.local_err(err))?;
        self.remote.put(record).await.map_err(|err| {
            warn!(remote = self.remote.name(), "local write committed, remote mirror failed");
            self.remote_err(err)
        })
    }

    fn local_err(&self, source: RecordStoreError) -> VaultError {
        VaultError::Local {
            store: self.local.name(),
            source,
        }
    }

    fn remote_err(&self, source: RecordStoreError) -> VaultError {
        VaultError::Remote {
            store: self.remote.name(),
            source,
        }
    }
}
