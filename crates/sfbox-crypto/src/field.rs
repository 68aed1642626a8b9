//! Per-field AES-256-GCM encryption for record metadata
//!
//! Text format: `"v1:" + base64url_nopad(nonce (12 bytes) || ciphertext || tag)`.
//! Every call draws a fresh random nonce, so equal plaintexts never produce
//! equal ciphertexts. No associated data is bound.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;

use sfbox_core::{EncryptedFields, FileFields, SfboxError, SfboxResult};

use crate::kdf::SubKey;
use crate::{NONCE_SIZE, TAG_SIZE};

/// Version tag prefixed to every encrypted field
pub const FIELD_VERSION_TAG: &str = "v1:";

#[derive(Clone)]
pub struct FieldCipher {
    aead: Aes256Gcm,
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCipher").finish_non_exhaustive()
    }
}

impl FieldCipher {
    pub fn new(key: &SubKey) -> Self {
        Self {
            aead: Aes256Gcm::new(key.as_bytes().into()),
        }
    }

    /// Encrypt one field. The empty string is encrypted like any other value.
    pub fn encrypt_field(&self, plain: &str) -> SfboxResult<String> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), plain.as_bytes())
            .map_err(|e| anyhow::anyhow!("metadata encryption failed: {e}"))?;

        let mut payload = Vec::with_capacity(NONCE_SIZE + sealed.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&sealed);

        Ok(format!("{FIELD_VERSION_TAG}{}", URL_SAFE_NO_PAD.encode(payload)))
    }

    /// Decrypt one field. An empty input means "not set" and yields an empty
    /// string without touching the cipher.
    pub fn decrypt_field(&self, text: &str) -> SfboxResult<String> {
        if text.is_empty() {
            return Ok(String::new());
        }

        let encoded = text
            .strip_prefix(FIELD_VERSION_TAG)
            .ok_or_else(|| SfboxError::Format("invalid encrypted metadata format".into()))?;

        let blob = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| SfboxError::Format(format!("invalid encrypted metadata encoding: {e}")))?;

        if blob.len() < NONCE_SIZE {
            return Err(SfboxError::Format(format!(
                "invalid encrypted metadata payload: {} bytes",
                blob.len()
            )));
        }

        let (nonce, sealed) = blob.split_at(NONCE_SIZE);
        let plain = self
            .aead
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| SfboxError::Integrity("metadata integrity check failed".into()))?;

        String::from_utf8(plain)
            .map_err(|e| SfboxError::Format(format!("decrypted metadata is not UTF-8: {e}")))
    }

    /// Encrypt all five descriptive fields, each with its own nonce.
    pub fn seal_fields(&self, fields: &FileFields) -> SfboxResult<EncryptedFields> {
        Ok(EncryptedFields {
            filename: self.encrypt_field(&fields.filename)?,
            storage_path: self.encrypt_field(&fields.storage_path)?,
            size: self.encrypt_field(&fields.size.to_string())?,
            description: self.encrypt_field(&fields.description)?,
            uploader_id: self.encrypt_field(&fields.uploader_id)?,
        })
    }

    /// Decrypt all five fields. Size text must be decimal; empty means 0.
    pub fn open_fields(&self, enc: &EncryptedFields) -> SfboxResult<FileFields> {
        let size_text = self.decrypt_field(&enc.size)?;
        let size = if size_text.is_empty() {
            0
        } else {
            size_text
                .parse::<u64>()
                .map_err(|e| SfboxError::Format(format!("invalid size field: {e}")))?
        };

        Ok(FileFields {
            filename: self.decrypt_field(&enc.filename)?,
            storage_path: self.decrypt_field(&enc.storage_path)?,
            size,
            description: self.decrypt_field(&enc.description)?,
            uploader_id: self.decrypt_field(&enc.uploader_id)?,
        })
    }
}
