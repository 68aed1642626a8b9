//! sfbox-crypto: at-rest encryption for SecureFileBox
//!
//! Key hierarchy:
//! ```text
//! Master Secret (>= 256-bit, base64url from config)
//!   ├── Content Key  = HMAC-SHA256(master, "file-gcm-aes256")
//!   │   └── Blob chunks: AES-256-GCM (nonce = prefix8 || be32(idx), AAD = be32(idx))
//!   └── Metadata Key = HMAC-SHA256(master, "db-meta-gcm-aes256")
//!       └── Fields: AES-256-GCM (random 96-bit nonce), "v1:" + base64url(nonce || sealed)
//! ```
//!
//! Blob layout and field text format are documented in [`stream`] and [`field`].

pub mod field;
pub mod kdf;
pub mod names;
pub mod stream;
pub mod suite;

pub use field::FieldCipher;
pub use kdf::{derive_keyring, generate_master_secret, Keyring, SubKey};
pub use names::{random_storage_name, random_token, AVATAR_PREFIX};
pub use stream::ContentCipher;
pub use suite::CipherSuite;

/// Size of a derived subkey in bytes (AES-256)
pub const KEY_SIZE: usize = 32;

/// Size of an AES-GCM nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of a GCM authentication tag
pub const TAG_SIZE: usize = 16;
