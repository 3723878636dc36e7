use std::{
    fs::{self, File},
    io::{ErrorKind, Read, Write},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use credvault_core::{RecordStore, RecordStoreError, StoredRecord};
use tempfile::NamedTempFile;
use tracing::{instrument, warn};

const RECORD_PREFIX: &str = "user-";
const RECORD_EXTENSION: &str = "json";

/// Local record cache: one JSON document per user under `root`.
/// Records already hold ciphertext only, so files are written as-is.
pub struct FileRecordStore {
    root: PathBuf,
}

impl FileRecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, user_id: &str) -> PathBuf {
        self.root
            .join(format!("{RECORD_PREFIX}{}.{RECORD_EXTENSION}", sanitize_user_id(user_id)))
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    fn name(&self) -> &'static str {
        "local"
    }

    #[instrument(skip_all, fields(user_id = %record.user_id))]
    async fn put(&self, record: &StoredRecord) -> Result<(), RecordStoreError> {
        fs::create_dir_all(&self.root).map_err(storage_err)?;
        write_record(&self.path_for(&record.user_id), record)
    }

    #[instrument(skip_all, fields(user_id = %user_id))]
    async fn get(&self, user_id: &str) -> Result<StoredRecord, RecordStoreError> {
        read_record(&self.path_for(user_id)).map_err(|err| match err {
            RecordStoreError::NotFound { .. } => RecordStoreError::NotFound {
                user_id: user_id.to_string(),
            },
            other => other,
        })
    }

    #[instrument(skip_all, fields(user_id = %user_id))]
    async fn delete(&self, user_id: &str) -> Result<(), RecordStoreError> {
        match fs::remove_file(self.path_for(user_id)) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(storage_err(err)),
        }
    }

    #[instrument(skip_all)]
    async fn list(&self) -> Result<Vec<StoredRecord>, RecordStoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(storage_err(err)),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry.map_err(storage_err)?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            // Every record or none: key rotation re-seals exactly this set.
            let record = read_record(&path).map_err(|err| {
                warn!(?path, "unreadable record: {err}");
                RecordStoreError::Storage {
                    reason: format!("unreadable record {}: {err}", path.display()),
                }
            })?;
            records.push(record);
        }
        records.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(records)
    }
}

fn write_record(path: &Path, record: &StoredRecord) -> Result<(), RecordStoreError> {
    let parent = path.parent().ok_or_else(|| RecordStoreError::Storage {
        reason: "invalid storage path".to_string(),
    })?;
    fs::create_dir_all(parent).map_err(storage_err)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(storage_err)?;
    let json = serde_json::to_vec_pretty(record).map_err(storage_err)?;
    tmp.write_all(&json).map_err(storage_err)?;
    tmp.flush().map_err(storage_err)?;
    tmp.persist(path).map_err(|e| storage_err(e.error))?;
    Ok(())
}

fn read_record(path: &Path) -> Result<StoredRecord, RecordStoreError> {
    let mut file = File::open(path).map_err(|err| {
        if err.kind() == ErrorKind::NotFound {
            RecordStoreError::NotFound {
                user_id: path.to_string_lossy().to_string(),
            }
        } else {
            storage_err(err)
        }
    })?;

    let mut buf = Vec::new();
    file.read_to_end(&mut buf).map_err(storage_err)?;
    serde_json::from_slice(&buf).map_err(storage_err)
}

fn sanitize_user_id(user_id: &str) -> String {
    URL_SAFE_NO_PAD.encode(user_id)
}

fn storage_err<E: ToString>(err: E) -> RecordStoreError {
    RecordStoreError::Storage {
        reason: err.to_string(),
    }
}
