//! Persistence seams: the engine only sees these traits.
//!
//! Repositories store opaque column values. They never see plaintext
//! metadata for rows written by the engine.

use std::sync::Arc;

use sfbox_core::{AvatarRef, EncryptedFields, FileRecord, SfboxResult, UserProfile};

/// Record storage for file entries.
pub trait FileRepository {
    /// Insert a new row from sealed columns and return its id.
    fn create(&self, fields: EncryptedFields) -> SfboxResult<u64>;

    fn find(&self, id: u64) -> SfboxResult<Option<FileRecord>>;

    /// Overwrite the sealed columns of an existing row and clear any legacy
    /// plaintext columns. Missing rows are `NotFound`.
    fn update(&self, id: u64, fields: EncryptedFields) -> SfboxResult<()>;

    /// Missing rows are `NotFound`.
    fn delete(&self, id: u64) -> SfboxResult<()>;

    /// Newest first. Returns the total row count alongside the page.
    fn list(&self, offset: usize, limit: usize) -> SfboxResult<(u64, Vec<FileRecord>)>;
}

/// Profile storage for avatar references.
pub trait UserRepository {
    fn find_user(&self, id: u64) -> SfboxResult<Option<UserProfile>>;

    /// Replace the user's avatar reference. Missing users are `NotFound`.
    fn set_avatar(&self, id: u64, avatar: Option<AvatarRef>) -> SfboxResult<()>;
}

impl<T: FileRepository + ?Sized> FileRepository for Arc<T> {
    fn create(&self, fields: EncryptedFields) -> SfboxResult<u64> {
        (**self).create(fields)
    }

    fn find(&self, id: u64) -> SfboxResult<Option<FileRecord>> {
        (**self).find(id)
    }

    fn update(&self, id: u64, fields: EncryptedFields) -> SfboxResult<()> {
        (**self).update(id, fields)
    }

    fn delete(&self, id: u64) -> SfboxResult<()> {
        (**self).delete(id)
    }

    fn list(&self, offset: usize, limit: usize) -> SfboxResult<(u64, Vec<FileRecord>)> {
        (**self).list(offset, limit)
    }
}

impl<T: UserRepository + ?Sized> UserRepository for Arc<T> {
    fn find_user(&self, id: u64) -> SfboxResult<Option<UserProfile>> {
        (**self).find_user(id)
    }

    fn set_avatar(&self, id: u64, avatar: Option<AvatarRef>) -> SfboxResult<()> {
        (**self).set_avatar(id, avatar)
    }
}
