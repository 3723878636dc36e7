//! Core contracts for credvault: the error taxonomy, the sealed envelope format,
//! and the record store interface shared by local and remote persistence.
//! Holds no key material and performs no cryptography.

pub mod envelope;
pub mod error;
pub mod record;

pub use envelope::{CipherEnvelope, EnvelopeVersion};
pub use error::CredentialError;
pub use record::{InMemoryRecordStore, RecordStore, RecordStoreError, StoredRecord};
