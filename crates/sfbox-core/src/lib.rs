pub mod config;
pub mod error;
pub mod types;

pub use error::{SfboxError, SfboxResult};
pub use types::{AvatarRef, EncryptedFields, FileFields, FileMetadata, FileRecord, UserProfile};
