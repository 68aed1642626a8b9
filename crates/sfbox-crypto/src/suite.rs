//! The engine's cipher pair, or the absence of one
//!
//! A suite built without usable key material stays constructible so a caller
//! can boot, but every encrypt/decrypt fails fast with a configuration error
//! before any file is opened.

use secrecy::SecretString;
use tracing::warn;

use sfbox_core::{SfboxError, SfboxResult};

use crate::field::FieldCipher;
use crate::kdf::{derive_keyring, Keyring};
use crate::stream::ContentCipher;

#[derive(Debug, Clone)]
pub struct CipherSuite {
    ciphers: Option<Ciphers>,
}

#[derive(Debug, Clone)]
struct Ciphers {
    content: ContentCipher,
    fields: FieldCipher,
}

impl CipherSuite {
    pub fn new(keys: &Keyring) -> Self {
        Self {
            ciphers: Some(Ciphers {
                content: ContentCipher::new(keys.content()),
                fields: FieldCipher::new(keys.metadata()),
            }),
        }
    }

    /// Derive both subkeys from the master secret. Any key problem is fatal.
    pub fn from_master_secret(master: &SecretString) -> SfboxResult<Self> {
        let keys = derive_keyring(master)?;
        Ok(Self::new(&keys))
    }

    /// Like [`CipherSuite::from_master_secret`], but a missing or bad key
    /// yields an unavailable suite instead of an error.
    pub fn from_master_secret_lenient(master: Option<&SecretString>) -> Self {
        let Some(master) = master else {
            warn!("no master key configured: file crypto unavailable");
            return Self::unavailable();
        };
        match derive_keyring(master) {
            Ok(keys) => Self::new(&keys),
            Err(e) => {
                warn!("master key unusable, file crypto unavailable: {e}");
                Self::unavailable()
            }
        }
    }

    pub fn unavailable() -> Self {
        Self { ciphers: None }
    }

    pub fn is_available(&self) -> bool {
        self.ciphers.is_some()
    }

    pub fn content(&self) -> SfboxResult<&ContentCipher> {
        self.ciphers
            .as_ref()
            .map(|c| &c.content)
            .ok_or_else(not_configured)
    }

    pub fn fields(&self) -> SfboxResult<&FieldCipher> {
        self.ciphers
            .as_ref()
            .map(|c| &c.fields)
            .ok_or_else(not_configured)
    }
}

fn not_configured() -> SfboxError {
    SfboxError::Config("file crypto key not configured".into())
}
