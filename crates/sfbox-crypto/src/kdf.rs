//! Key derivation: master secret → purpose-bound subkeys via HMAC-SHA256
//!
//! Each subkey is `HMAC-SHA256(key = master, msg = label)`. The labels are
//! fixed; changing them orphans every blob and field already written.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use sfbox_core::{SfboxError, SfboxResult};

use crate::KEY_SIZE;

/// Domain-separation label for the file-content key
pub const CONTENT_KEY_LABEL: &[u8] = b"file-gcm-aes256";

/// Domain-separation label for the metadata key
pub const METADATA_KEY_LABEL: &[u8] = b"db-meta-gcm-aes256";

/// Minimum decoded master secret length
pub const MIN_MASTER_SECRET_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// A 256-bit derived key. Zeroized on drop.
#[derive(Clone)]
pub struct SubKey {
    bytes: [u8; KEY_SIZE],
}

impl SubKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for SubKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SubKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// The two subkeys the engine runs on.
#[derive(Debug, Clone)]
pub struct Keyring {
    content: SubKey,
    metadata: SubKey,
}

impl Keyring {
    pub fn content(&self) -> &SubKey {
        &self.content
    }

    pub fn metadata(&self) -> &SubKey {
        &self.metadata
    }
}

/// Decode the master secret and derive the content and metadata subkeys.
///
/// Fails with [`SfboxError::Config`] if the text is not URL-safe unpadded
/// base64 or decodes to fewer than [`MIN_MASTER_SECRET_LEN`] bytes.
pub fn derive_keyring(master: &SecretString) -> SfboxResult<Keyring> {
    let raw = decode_master_secret(master.expose_secret())?;

    Ok(Keyring {
        content: derive_subkey(&raw, CONTENT_KEY_LABEL)?,
        metadata: derive_subkey(&raw, METADATA_KEY_LABEL)?,
    })
}

/// Generate a fresh master secret: 32 random bytes, base64url without padding.
pub fn generate_master_secret() -> String {
    let mut raw = Zeroizing::new([0u8; MIN_MASTER_SECRET_LEN]);
    rand::thread_rng().fill_bytes(&mut raw[..]);
    URL_SAFE_NO_PAD.encode(&raw[..])
}

fn decode_master_secret(text: &str) -> SfboxResult<Zeroizing<Vec<u8>>> {
    let raw = URL_SAFE_NO_PAD
        .decode(text.trim())
        .map(Zeroizing::new)
        .map_err(|_| SfboxError::Config("master key is not valid URL-safe base64".into()))?;

    if raw.len() < MIN_MASTER_SECRET_LEN {
        return Err(SfboxError::Config(format!(
            "master key decodes to {} bytes, need at least {MIN_MASTER_SECRET_LEN}",
            raw.len()
        )));
    }
    Ok(raw)
}

fn derive_subkey(master: &[u8], label: &[u8]) -> SfboxResult<SubKey> {
    let mut mac = HmacSha256::new_from_slice(master)
        .map_err(|e| SfboxError::Config(format!("HMAC key setup failed: {e}")))?;
    mac.update(label);
    let tag = mac.finalize().into_bytes();

    let mut bytes = [0u8; KEY_SIZE];
    bytes.copy_from_slice(tag.as_slice());
    Ok(SubKey::from_bytes(bytes))
}
