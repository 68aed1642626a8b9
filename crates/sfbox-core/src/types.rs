use serde::{Deserialize, Serialize};

/// Descriptive fields of a stored file, in the clear.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFields {
    pub filename: String,
    /// Path of the ciphertext blob
    pub storage_path: String,
    /// Plaintext length in bytes
    pub size: u64,
    pub description: String,
    pub uploader_id: String,
}

/// The same five fields, each an independent `v1:` ciphertext string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedFields {
    pub filename: String,
    pub storage_path: String,
    pub size: String,
    pub description: String,
    pub uploader_id: String,
}

impl EncryptedFields {
    /// True when no encrypted column carries a value.
    pub fn is_empty(&self) -> bool {
        self.filename.is_empty()
            && self.storage_path.is_empty()
            && self.size.is_empty()
            && self.description.is_empty()
            && self.uploader_id.is_empty()
    }
}

/// How a record's metadata is represented at rest.
///
/// Rows written before encryption was introduced only carry plaintext
/// columns. The write path always produces `Encrypted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileMetadata {
    Encrypted(EncryptedFields),
    LegacyPlaintext(FileFields),
}

impl FileMetadata {
    /// Resolve a persisted row into its variant.
    ///
    /// A row is legacy only if every encrypted column is empty; otherwise the
    /// encrypted columns win and the legacy columns are ignored.
    pub fn from_columns(encrypted: EncryptedFields, legacy: FileFields) -> Self {
        if encrypted.is_empty() {
            FileMetadata::LegacyPlaintext(legacy)
        } else {
            FileMetadata::Encrypted(encrypted)
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, FileMetadata::LegacyPlaintext(_))
    }
}

/// A logical file entry as handed back by the persistence layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: u64,
    pub metadata: FileMetadata,
    /// Unix timestamp (seconds)
    pub created_at: u64,
    /// Unix timestamp (seconds)
    pub updated_at: u64,
}

/// Avatar attached to a user profile: a blob path plus its declared type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvatarRef {
    pub path: String,
    pub content_type: String,
    /// Unix timestamp (seconds)
    pub updated_at: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: u64,
    pub avatar: Option<AvatarRef>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_empty_encrypted_columns_resolve_to_legacy() {
        let legacy = FileFields {
            filename: "old.txt".into(),
            storage_path: "/srv/uploads/old.txt".into(),
            size: 12,
            description: "before encryption".into(),
            uploader_id: "3".into(),
        };
        let meta = FileMetadata::from_columns(EncryptedFields::default(), legacy.clone());
        assert_eq!(meta, FileMetadata::LegacyPlaintext(legacy));
        assert!(meta.is_legacy());
    }

    #[test]
    fn test_any_encrypted_column_wins() {
        let enc = EncryptedFields {
            filename: "v1:abc".into(),
            ..Default::default()
        };
        let legacy = FileFields {
            filename: "stale".into(),
            ..Default::default()
        };
        let meta = FileMetadata::from_columns(enc.clone(), legacy);
        assert_eq!(meta, FileMetadata::Encrypted(enc));
    }
}
