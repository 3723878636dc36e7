//! Versioned AEAD envelope and its wire encoding.
//!
//! ```text
//! version:u8 | nonce:12 bytes | ciphertext:variable | tag:16 bytes
//! ```
//!
//! Associated data is never part of the envelope; callers rebuild it from
//! context (the user id) on both seal and open.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CredentialError;

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;
/// AES-GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;
/// Smallest valid encoding: version byte, nonce, empty ciphertext, tag.
pub const MIN_ENCODED_LEN: usize = 1 + NONCE_LEN + TAG_LEN;

/// Envelope format versions this build understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum EnvelopeVersion {
    /// Legacy layout: associated data is the bare user id.
    V1 = 1,
    /// Current layout: associated data is domain-separated.
    V2 = 2,
}

impl EnvelopeVersion {
    /// Version written by every new seal.
    pub const CURRENT: EnvelopeVersion = EnvelopeVersion::V2;

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn is_current(self) -> bool {
        self == Self::CURRENT
    }
}

impl TryFrom<u8> for EnvelopeVersion {
    type Error = CredentialError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(EnvelopeVersion::V1),
            2 => Ok(EnvelopeVersion::V2),
            other => Err(CredentialError::UnsupportedEnvelopeVersion { version: other }),
        }
    }
}

impl fmt::Display for EnvelopeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.as_byte())
    }
}

/// Sealed credential: the unit that is persisted locally and mirrored remotely.
///
/// The version is kept as a raw byte so that envelopes written by a newer
/// build still decode and are rejected at open time, not at parse time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherEnvelope {
    version: u8,
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
    tag: [u8; TAG_LEN],
}

impl CipherEnvelope {
    pub fn new(
        version: u8,
        nonce: [u8; NONCE_LEN],
        ciphertext: Vec<u8>,
        tag: [u8; TAG_LEN],
    ) -> Self {
        Self {
            version,
            nonce,
            ciphertext,
            tag,
        }
    }

    /// Build an envelope from loosely typed parts, enforcing the fixed
    /// nonce and tag lengths.
    pub fn from_parts(
        version: u8,
        nonce: &[u8],
        ciphertext: Vec<u8>,
        tag: &[u8],
    ) -> Result<Self, CredentialError> {
        let nonce: [u8; NONCE_LEN] = nonce.try_into().map_err(|_| {
            CredentialError::malformed(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                nonce.len()
            ))
        })?;
        let tag: [u8; TAG_LEN] = tag.try_into().map_err(|_| {
            CredentialError::malformed(format!("tag must be {TAG_LEN} bytes, got {}", tag.len()))
        })?;
        Ok(Self::new(version, nonce, ciphertext, tag))
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn tag(&self) -> &[u8; TAG_LEN] {
        &self.tag
    }

    /// Serialize to the fixed-width wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MIN_ENCODED_LEN + self.ciphertext.len());
        out.push(self.version);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }

    /// Parse the wire layout. Only lengths are checked here; version support
    /// and authenticity are decided when the envelope is opened.
    pub fn decode(bytes: &[u8]) -> Result<Self, CredentialError> {
        if bytes.len() < MIN_ENCODED_LEN {
            return Err(CredentialError::malformed(format!(
                "expected at least {MIN_ENCODED_LEN} bytes, got {}",
                bytes.len()
            )));
        }

        let (version, rest) = (bytes[0], &bytes[1..]);
        let (nonce, rest) = rest.split_at(NONCE_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);
        Self::from_parts(version, nonce, ciphertext.to_vec(), tag)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.encode())
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CredentialError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CredentialError::malformed(format!("base64 decode failed: {e}")))?;
        Self::decode(&bytes)
    }
}

impl Serialize for CipherEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for CipherEnvelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        CipherEnvelope::from_base64(&encoded).map_err(de::Error::custom)
    }
}
