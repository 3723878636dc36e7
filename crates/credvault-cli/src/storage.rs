use std::path::PathBuf;

use crate::config::Config;
use color_eyre::Result;
use credvault_core::RecordStore;
#[cfg(test)]
use credvault_keystore::key_provider::InMemoryKeyProvider;
use credvault_keystore::{
    file_record_store::FileRecordStore,
    key_provider::{KeyringKeyProvider, DEFAULT_KEY_ALIAS},
    secure_store::SecureCredentialStore,
};
use credvault_remote::{HttpRecordStore, NoopRecordStore};
use credvault_vault::CredentialVault;
use dirs::data_dir;
use tracing::debug;

/// Keyring service used when the config does not override it.
pub const DEFAULT_KEYRING_SERVICE: &str = "credvault";

/// Lock file, inside the records directory, guarding device key creation.
pub const KEY_LOCK_FILE: &str = ".device-key.lock";

/// Vault as wired by the CLI: file-backed local cache, optional remote mirror.
pub type Vault<P> = CredentialVault<P, FileRecordStore, Box<dyn RecordStore>>;

/// Resolve the default data directory for credvault.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| color_eyre::eyre::eyre!("no data dir available"))?;
    Ok(base.join("credvault"))
}

/// Local record directory, honoring the config override.
pub fn records_dir(config: &Config) -> Result<PathBuf> {
    match &config.data_dir {
        Some(root) => Ok(root.clone()),
        None => default_data_dir(),
    }
}

/// Credential store over the OS keyring; key creation is serialized across
/// credvault processes sharing the records directory.
pub fn store_from_config(config: &Config) -> Result<SecureCredentialStore<KeyringKeyProvider>> {
    let service = config
        .keyring_service
        .as_deref()
        .unwrap_or(DEFAULT_KEYRING_SERVICE);
    let alias = config.key_alias.as_deref().unwrap_or(DEFAULT_KEY_ALIAS);
    let provider =
        KeyringKeyProvider::new(service).with_creation_lock(records_dir(config)?.join(KEY_LOCK_FILE));
    Ok(SecureCredentialStore::with_alias(provider, alias))
}

/// Remote mirror if configured, otherwise a no-op stand-in.
pub fn remote_from_config(config: &Config) -> Box<dyn RecordStore> {
    match &config.remote {
        Some(remote) => {
            debug!(base_url = %remote.base_url, "remote mirror enabled");
            Box::new(HttpRecordStore::new(remote.clone()))
        }
        None => Box::new(NoopRecordStore),
    }
}

/// Build the production vault from config.
pub fn vault_from_config(config: &Config) -> Result<Vault<KeyringKeyProvider>> {
    let root = records_dir(config)?;
    debug!(?root, "initializing credential vault");
    Ok(CredentialVault::new(
        store_from_config(config)?,
        FileRecordStore::new(root),
        remote_from_config(config),
    ))
}

/// Helper for tests: temp-dir records, in-memory key, no remote.
#[cfg(test)]
pub fn test_vault(root: impl Into<PathBuf>) -> Vault<InMemoryKeyProvider> {
    CredentialVault::new(
        SecureCredentialStore::new(InMemoryKeyProvider::new()),
        FileRecordStore::new(root),
        Box::new(NoopRecordStore),
    )
}
