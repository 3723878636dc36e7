//! Credential protection backed by a non-extractable device key.
//! AES-256-GCM through opaque key handles sourced from the OS keyring
//! (or test doubles), plus the file-backed local record cache.

pub mod aead;
pub mod creation_lock;
pub mod file_record_store;
pub mod key_provider;
pub mod secure_store;
