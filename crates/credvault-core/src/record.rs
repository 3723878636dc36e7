use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::envelope::CipherEnvelope;

/// Persisted unit, identical in the local cache and the remote per-user document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    pub user_id: String,
    pub envelope: CipherEnvelope,
    pub updated_at: DateTime<Utc>,
}

impl StoredRecord {
    pub fn new(user_id: impl Into<String>, envelope: CipherEnvelope) -> Self {
        Self {
            user_id: user_id.into(),
            envelope,
            updated_at: Utc::now(),
        }
    }
}

/// Errors produced by record store implementations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecordStoreError {
    /// No record exists for the user.
    #[error("no record for user: {user_id}")]
    NotFound { user_id: String },
    /// Underlying storage or transport failure.
    #[error("storage failure: {reason}")]
    Storage { reason: String },
}

/// Opaque key-value persistence of sealed records, keyed by user id.
/// Implementations only ever see ciphertext.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Short name used for logging.
    fn name(&self) -> &'static str;

    /// Persist a record, overwriting any existing one for the same user.
    async fn put(&self, record: &StoredRecord) -> Result<(), RecordStoreError>;

    /// Fetch the record for a user.
    async fn get(&self, user_id: &str) -> Result<StoredRecord, RecordStoreError>;

    /// Remove the record for a user (idempotent).
    async fn delete(&self, user_id: &str) -> Result<(), RecordStoreError>;

    /// Every record currently held.
    async fn list(&self) -> Result<Vec<StoredRecord>, RecordStoreError>;
}

#[async_trait]
impl<T: RecordStore + ?Sized> RecordStore for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn put(&self, record: &StoredRecord) -> Result<(), RecordStoreError> {
        (**self).put(record).await
    }

    async fn get(&self, user_id: &str) -> Result<StoredRecord, RecordStoreError> {
        (**self).get(user_id).await
    }

    async fn delete(&self, user_id: &str) -> Result<(), RecordStoreError> {
        (**self).delete(user_id).await
    }

    async fn list(&self) -> Result<Vec<StoredRecord>, RecordStoreError> {
        (**self).list().await
    }
}

/// Map-backed store for tests and ephemeral sessions.
#[derive(Debug, Default, Clone)]
pub struct InMemoryRecordStore {
    inner: Arc<Mutex<HashMap<String, StoredRecord>>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, StoredRecord>>, RecordStoreError> {
        self.inner.lock().map_err(|err| RecordStoreError::Storage {
            reason: format!("lock poisoned: {err}"),
        })
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, record: &StoredRecord) -> Result<(), RecordStoreError> {
        self.lock()?.insert(record.user_id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, user_id: &str) -> Result<StoredRecord, RecordStoreError> {
        self.lock()?
            .get(user_id)
            .cloned()
            .ok_or_else(|| RecordStoreError::NotFound {
                user_id: user_id.to_string(),
            })
    }

    async fn delete(&self, user_id: &str) -> Result<(), RecordStoreError> {
        self.lock()?.remove(user_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<StoredRecord>, RecordStoreError> {
        let mut records: Vec<StoredRecord> = self.lock()?.values().cloned().collect();
        records.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(records)
    }
}
