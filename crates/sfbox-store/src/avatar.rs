//! Per-user avatar images, encrypted like any other blob
//!
//! Attach order: write the new blob, point the profile at it, then remove
//! the old blob. A failure at any step puts the profile back and removes
//! whatever was newly written.

use std::io::{Read, Write};
use tracing::{error, info};

use sfbox_core::{AvatarRef, SfboxError, SfboxResult, UserProfile};
use sfbox_crypto::AVATAR_PREFIX;

use crate::blob::{path_to_string, BlobDir};
use crate::engine::FileStore;
use crate::repo::UserRepository;
use crate::unix_now;

/// Declared content types must start with this prefix
pub const IMAGE_CONTENT_PREFIX: &str = "image/";

impl<R: UserRepository> FileStore<R> {
    /// Encrypt an image and make it the user's avatar, replacing any
    /// previous one.
    pub fn attach_avatar<S: Read>(
        &self,
        owner_id: u64,
        src: S,
        content_type: &str,
    ) -> SfboxResult<AvatarRef> {
        let content = self.crypto.content()?;
        validate_content_type(content_type)?;
        let previous = self.find_profile(owner_id)?.avatar;

        let path = self.blobs.new_blob_path(AVATAR_PREFIX);
        let stored = path_to_string(&path)?;
        let size = content.encrypt_to_path(src, &path, Some(self.limits.max_avatar_size))?;

        let avatar = AvatarRef {
            path: stored,
            content_type: content_type.to_string(),
            updated_at: unix_now(),
        };

        if let Err(e) = self.repo.set_avatar(owner_id, Some(avatar.clone())) {
            self.discard_blob(&path);
            return Err(e);
        }

        if let Some(old) = &previous {
            if let Err(e) = BlobDir::remove(&self.blobs.resolve(&old.path)) {
                match self.repo.set_avatar(owner_id, previous.clone()) {
                    Ok(()) => self.discard_blob(&path),
                    // Profile still points at the new blob, so keep it
                    Err(re) => error!(owner_id, "avatar rollback failed: {re}"),
                }
                return Err(e);
            }
        }

        info!(owner_id, size, replaced = previous.is_some(), "avatar attached");
        Ok(avatar)
    }

    /// Stream the user's decrypted avatar into `sink` and return its
    /// reference (for the content type).
    pub fn fetch_avatar<W: Write>(&self, owner_id: u64, sink: W) -> SfboxResult<AvatarRef> {
        let content = self.crypto.content()?;
        let avatar = self
            .find_profile(owner_id)?
            .avatar
            .ok_or_else(|| SfboxError::NotFound(format!("avatar for user {owner_id}")))?;

        content.decrypt_from_path(&self.blobs.resolve(&avatar.path), sink)?;
        Ok(avatar)
    }

    /// Detach and delete the user's avatar. Returns false if there was none.
    pub fn remove_avatar(&self, owner_id: u64) -> SfboxResult<bool> {
        let Some(avatar) = self.find_profile(owner_id)?.avatar else {
            return Ok(false);
        };

        self.repo.set_avatar(owner_id, None)?;
        self.discard_blob(&self.blobs.resolve(&avatar.path));
        info!(owner_id, "avatar removed");
        Ok(true)
    }

    fn find_profile(&self, owner_id: u64) -> SfboxResult<UserProfile> {
        self.repo
            .find_user(owner_id)?
            .ok_or_else(|| SfboxError::NotFound(format!("user {owner_id}")))
    }
}

fn validate_content_type(content_type: &str) -> SfboxResult<()> {
    if content_type
        .to_ascii_lowercase()
        .starts_with(IMAGE_CONTENT_PREFIX)
    {
        Ok(())
    } else {
        Err(SfboxError::InvalidInput(format!(
            "avatar must be an image, got {content_type:?}"
        )))
    }
}
