use aes_gcm::{
    aead::{generic_array::GenericArray, AeadCore, AeadInPlace, OsRng},
    Aes256Gcm, Nonce,
};
use credvault_core::{
    envelope::{NONCE_LEN, TAG_LEN},
    CipherEnvelope, CredentialError, EnvelopeVersion,
};
use zeroize::Zeroizing;

use crate::key_provider::CredentialKey;

/// AES-256-GCM over [`CredentialKey`] handles.
///
/// Stateless: every call is a pure function of its inputs plus a fresh OS
/// CSPRNG nonce, so parallel seals and opens never interfere. The envelope
/// version byte is always prepended to the caller's associated data, which
/// binds the format version into the tag and blocks downgrade by relabeling.
#[derive(Debug, Clone, Copy, Default)]
pub struct AeadCipher;

impl AeadCipher {
    pub fn new() -> Self {
        Self
    }

    pub fn seal(
        &self,
        key: &CredentialKey,
        version: EnvelopeVersion,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<CipherEnvelope, CredentialError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let aad = bind_version(version.as_byte(), associated_data);

        let mut buffer = plaintext.to_vec();
        let tag = key
            .cipher()
            .encrypt_in_place_detached(&nonce, &aad, &mut buffer)
            .map_err(|e| CredentialError::Encryption {
                reason: e.to_string(),
            })?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(nonce.as_slice());
        let mut tag_bytes = [0u8; TAG_LEN];
        tag_bytes.copy_from_slice(tag.as_slice());

        Ok(CipherEnvelope::new(
            version.as_byte(),
            nonce_bytes,
            buffer,
            tag_bytes,
        ))
    }

    /// Verify and decrypt. Nothing but an error comes back when the tag fails.
    pub fn open(
        &self,
        key: &CredentialKey,
        envelope: &CipherEnvelope,
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CredentialError> {
        let version = EnvelopeVersion::try_from(envelope.version())?;
        let aad = bind_version(version.as_byte(), associated_data);

        let nonce = Nonce::from_slice(envelope.nonce());
        let tag = GenericArray::from_slice(envelope.tag());
        let mut buffer = Zeroizing::new(envelope.ciphertext().to_vec());
        key.cipher()
            .decrypt_in_place_detached(nonce, &aad, &mut buffer, tag)
            .map_err(|_| CredentialError::AuthenticationFailed)?;

        Ok(std::mem::take(&mut *buffer))
    }
}

fn bind_version(version: u8, associated_data: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(1 + associated_data.len());
    aad.push(version);
    aad.extend_from_slice(associated_data);
    aad
}
