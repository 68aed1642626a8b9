//! Random blob names
//!
//! Blob names never derive from the caller's filename: 16 random bytes,
//! base64url without padding, with a fixed extension.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;

/// Extension of every stored blob
pub const STORAGE_NAME_EXT: &str = ".bin";

/// Prefix distinguishing avatar blobs from file blobs
pub const AVATAR_PREFIX: &str = "avatar_";

const STORAGE_NAME_BYTES: usize = 16;

/// `len` random bytes, base64url without padding.
pub fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// A fresh blob name such as `avatar_3q2-7wAAAAAAAAAAAAAAAA.bin`.
pub fn random_storage_name(prefix: &str) -> String {
    format!(
        "{prefix}{}{STORAGE_NAME_EXT}",
        random_token(STORAGE_NAME_BYTES)
    )
}
