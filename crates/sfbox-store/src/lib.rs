//! sfbox-store: storage lifecycle for encrypted files and avatars
//!
//! Upload path:  source → ContentCipher (blob on disk) → FieldCipher (sealed
//! columns) → FileRepository.
//! Read path:    FileRepository → FieldCipher (or legacy passthrough) →
//! ContentCipher → caller's sink.
//!
//! Lifecycle rules:
//!   - a blob is written before its record; if the record write fails the blob
//!     is removed
//!   - replacement content goes to a temp file beside the old blob and is
//!     renamed over it, so readers see the old or the new blob, never a mix
//!   - deletion removes the blob first (already-absent counts as removed),
//!     then the record

pub mod avatar;
pub mod blob;
pub mod engine;
pub mod json;
pub mod repo;

pub use blob::BlobDir;
pub use engine::{FileEntry, FilePage, FileStore, Limits, Replacement, StoredFile};
pub use json::JsonRepository;
pub use repo::{FileRepository, UserRepository};

use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
