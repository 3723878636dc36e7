//! Remote mirror of sealed credential records.
//!
//! The remote document store only ever receives `StoredRecord`s, which carry
//! ciphertext; no key material or plaintext crosses this boundary and the
//! remote side takes no part in any cryptographic operation.

use async_trait::async_trait;
use credvault_core::{RecordStore, RecordStoreError, StoredRecord};
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT},
    StatusCode, Url,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// Collection used when the config does not name one.
pub const DEFAULT_COLLECTION: &str = "credentials";

/// Remote document store configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RemoteConfig {
    pub base_url: String,
    pub token: String,
    #[serde(default)]
    pub collection: Option<String>,
}

/// Stand-in used when no remote is configured: writes are dropped, reads miss.
pub struct NoopRecordStore;

#[async_trait]
impl RecordStore for NoopRecordStore {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn put(&self, _record: &StoredRecord) -> Result<(), RecordStoreError> {
        Ok(())
    }

    async fn get(&self, user_id: &str) -> Result<StoredRecord, RecordStoreError> {
        Err(RecordStoreError::NotFound {
            user_id: user_id.to_string(),
        })
    }

    async fn delete(&self, _user_id: &str) -> Result<(), RecordStoreError> {
        Ok(())
    }

    async fn list(&self) -> Result<Vec<StoredRecord>, RecordStoreError> {
        Ok(Vec::new())
    }
}

/// Per-user documents over HTTP:
/// `PUT|GET|DELETE {base_url}/{collection}/{user_id}` and `GET {base_url}/{collection}`.
pub struct HttpRecordStore {
    cfg: RemoteConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct DocumentList {
    documents: Vec<StoredRecord>,
}

impl HttpRecordStore {
    pub fn new(cfg: RemoteConfig) -> Self {
        Self {
            cfg,
            client: reqwest::Client::new(),
        }
    }

    fn collection(&self) -> &str {
        self.cfg.collection.as_deref().unwrap_or(DEFAULT_COLLECTION)
    }

    fn collection_url(&self) -> Result<Url, RecordStoreError> {
        self.url_with(&[])
    }

    fn document_url(&self, user_id: &str) -> Result<Url, RecordStoreError> {
        self.url_with(&[user_id])
    }

    fn url_with(&self, extra: &[&str]) -> Result<Url, RecordStoreError> {
        let mut url = Url::parse(&self.cfg.base_url).map_err(remote_err)?;
        {
            let mut segments = url.path_segments_mut().map_err(|_| RecordStoreError::Storage {
                reason: format!("base url cannot carry a path: {}", self.cfg.base_url),
            })?;
            segments.pop_if_empty().push(self.collection());
            for segment in extra {
                segments.push(segment);
            }
        }
        Ok(url)
    }

    fn headers(&self) -> Result<HeaderMap, RecordStoreError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("credvault"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.cfg.token)).map_err(remote_err)?,
        );
        Ok(headers)
    }
}

#[async_trait]
impl RecordStore for HttpRecordStore {
    fn name(&self) -> &'static str {
        "remote"
    }

    #[instrument(skip_all, fields(user_id = %record.user_id, base = %self.cfg.base_url))]
    async fn put(&self, record: &StoredRecord) -> Result<(), RecordStoreError> {
        self.client
            .put(self.document_url(&record.user_id)?)
            .headers(self.headers()?)
            .json(record)
            .send()
            .await
            .map_err(remote_err)?
            .error_for_status()
            .map_err(remote_err)?;
        debug!("mirrored record to remote");
        Ok(())
    }

    #[instrument(skip_all, fields(user_id = %user_id, base = %self.cfg.base_url))]
    async fn get(&self, user_id: &str) -> Result<StoredRecord, RecordStoreError> {
        let resp = self
            .client
            .get(self.document_url(user_id)?)
            .headers(self.headers()?)
            .send()
            .await
            .map_err(remote_err)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(RecordStoreError::NotFound {
                user_id: user_id.to_string(),
            });
        }

        let record: StoredRecord = resp
            .error_for_status()
            .map_err(remote_err)?
            .json()
            .await
            .map_err(remote_err)?;
        if record.user_id != user_id {
            return Err(RecordStoreError::Storage {
                reason: format!("remote returned the record of another user for {user_id}"),
            });
        }
        Ok(record)
    }

    #[instrument(skip_all, fields(user_id = %user_id, base = %self.cfg.base_url))]
    async fn delete(&self, user_id: &str) -> Result<(), RecordStoreError> {
        let resp = self
            .client
            .delete(self.document_url(user_id)?)
            .headers(self.headers()?)
            .send()
            .await
            .map_err(remote_err)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        resp.error_for_status().map_err(remote_err)?;
        Ok(())
    }

    #[instrument(skip_all, fields(base = %self.cfg.base_url))]
    async fn list(&self) -> Result<Vec<StoredRecord>, RecordStoreError> {
        let list: DocumentList = self
            .client
            .get(self.collection_url()?)
            .headers(self.headers()?)
            .send()
            .await
            .map_err(remote_err)?
            .error_for_status()
            .map_err(remote_err)?
            .json()
            .await
            .map_err(remote_err)?;
        Ok(list.documents)
    }
}

fn remote_err<E: ToString>(err: E) -> RecordStoreError {
    RecordStoreError::Storage {
        reason: format!("remote: {}", err.to_string()),
    }
}
