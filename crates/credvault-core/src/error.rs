use thiserror::Error;

/// Errors surfaced by credential protection and recovery.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CredentialError {
    /// The isolated keystore could not be reached or returned unusable key material.
    #[error("keystore unavailable: {reason}")]
    KeystoreUnavailable { reason: String },
    /// Tag verification failed: tampered data, a different key, or a different user context.
    #[error("authentication failed: envelope does not verify under this key and context")]
    AuthenticationFailed,
    /// Envelope carries a version this build cannot open.
    #[error("unsupported envelope version: {version}")]
    UnsupportedEnvelopeVersion { version: u8 },
    /// Envelope bytes do not match the fixed nonce/tag layout.
    #[error("malformed envelope: {reason}")]
    MalformedEnvelope { reason: String },
    /// The AEAD primitive refused to encrypt (e.g. input too large).
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },
}

impl CredentialError {
    /// True when the stored credential should be discarded and re-obtained
    /// from the identity provider; false when the operation should be aborted.
    pub fn requires_reauthentication(&self) -> bool {
        matches!(
            self,
            CredentialError::AuthenticationFailed
                | CredentialError::UnsupportedEnvelopeVersion { .. }
                | CredentialError::MalformedEnvelope { .. }
        )
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        CredentialError::MalformedEnvelope {
            reason: reason.into(),
        }
    }
}
