//! JSON-file record store.
//!
//! The whole table set lives in memory and is written back after every
//! mutation with an atomic temp+rename. A mutation is applied to a copy
//! first; if the write fails the in-memory state is left untouched, so
//! memory and disk never disagree.
//!
//! File rows keep two column groups: the sealed `enc_*` columns written by
//! the engine and the plaintext columns of rows that predate encryption.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use sfbox_core::{
    AvatarRef, EncryptedFields, FileFields, FileMetadata, FileRecord, SfboxError, SfboxResult,
    UserProfile,
};

use crate::repo::{FileRepository, UserRepository};
use crate::unix_now;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct FileRow {
    enc_filename: String,
    enc_storage_path: String,
    enc_size: String,
    enc_description: String,
    enc_uploader_id: String,

    // Pre-encryption columns, cleared on every update
    filename: String,
    storage_path: String,
    size: u64,
    description: String,
    uploader_id: String,

    created_at: u64,
    updated_at: u64,
}

impl FileRow {
    fn set_sealed(&mut self, enc: EncryptedFields) {
        self.enc_filename = enc.filename;
        self.enc_storage_path = enc.storage_path;
        self.enc_size = enc.size;
        self.enc_description = enc.description;
        self.enc_uploader_id = enc.uploader_id;
    }

    fn clear_legacy(&mut self) {
        self.filename.clear();
        self.storage_path.clear();
        self.size = 0;
        self.description.clear();
        self.uploader_id.clear();
    }

    fn to_record(&self, id: u64) -> FileRecord {
        let encrypted = EncryptedFields {
            filename: self.enc_filename.clone(),
            storage_path: self.enc_storage_path.clone(),
            size: self.enc_size.clone(),
            description: self.enc_description.clone(),
            uploader_id: self.enc_uploader_id.clone(),
        };
        let legacy = FileFields {
            filename: self.filename.clone(),
            storage_path: self.storage_path.clone(),
            size: self.size,
            description: self.description.clone(),
            uploader_id: self.uploader_id.clone(),
        };
        FileRecord {
            id,
            metadata: FileMetadata::from_columns(encrypted, legacy),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct Tables {
    next_file_id: u64,
    files: BTreeMap<u64, FileRow>,
    users: BTreeMap<u64, UserProfile>,
}

impl Tables {
    fn allocate_file_id(&mut self) -> u64 {
        let floor = self.files.keys().next_back().copied().unwrap_or(0);
        self.next_file_id = self.next_file_id.max(floor) + 1;
        self.next_file_id
    }
}

pub struct JsonRepository {
    path: PathBuf,
    tables: Mutex<Tables>,
}

impl std::fmt::Debug for JsonRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonRepository")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl JsonRepository {
    /// Load or create a record store at the given path.
    /// If the file doesn't exist, starts empty; nothing is written until the
    /// first mutation.
    pub fn open(path: &Path) -> SfboxResult<Self> {
        let tables = if path.exists() {
            let content = fs::read_to_string(path).map_err(|e| {
                SfboxError::Persistence(format!("reading record store {}: {e}", path.display()))
            })?;
            serde_json::from_str(&content).map_err(|e| {
                SfboxError::Persistence(format!("parsing record store {}: {e}", path.display()))
            })?
        } else {
            Tables::default()
        };

        Ok(Self {
            path: path.to_path_buf(),
            tables: Mutex::new(tables),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the user profile if it does not exist yet.
    pub fn ensure_user(&self, id: u64) -> SfboxResult<UserProfile> {
        if let Some(existing) = self.lock()?.users.get(&id) {
            return Ok(existing.clone());
        }
        self.mutate(|t| {
            Ok(t.users
                .entry(id)
                .or_insert_with(|| UserProfile { id, avatar: None })
                .clone())
        })
    }

    /// Insert a row carrying only plaintext columns, as written before
    /// metadata encryption existed. Used when importing old data.
    pub fn insert_legacy(&self, fields: FileFields) -> SfboxResult<u64> {
        self.mutate(|t| {
            let id = t.allocate_file_id();
            let now = unix_now();
            t.files.insert(
                id,
                FileRow {
                    filename: fields.filename,
                    storage_path: fields.storage_path,
                    size: fields.size,
                    description: fields.description,
                    uploader_id: fields.uploader_id,
                    created_at: now,
                    updated_at: now,
                    ..Default::default()
                },
            );
            Ok(id)
        })
    }

    fn lock(&self) -> SfboxResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| SfboxError::Persistence("record store lock poisoned".into()))
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut Tables) -> SfboxResult<T>) -> SfboxResult<T> {
        let mut guard = self.lock()?;
        let mut next = guard.clone();
        let out = f(&mut next)?;
        self.flush(&next)?;
        *guard = next;
        Ok(out)
    }

    /// Atomic write: write to a temp file, then rename over the store.
    fn flush(&self, tables: &Tables) -> SfboxResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    SfboxError::Persistence(format!(
                        "creating record store dir {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let json = serde_json::to_string_pretty(tables)
            .map_err(|e| SfboxError::Persistence(format!("serializing record store: {e}")))?;

        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, json).map_err(|e| {
            SfboxError::Persistence(format!(
                "writing record store temp {}: {e}",
                tmp_path.display()
            ))
        })?;
        fs::rename(&tmp_path, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            SfboxError::Persistence(format!(
                "renaming record store {}: {e}",
                self.path.display()
            ))
        })?;

        debug!(path = %self.path.display(), files = tables.files.len(), "record store flushed");
        Ok(())
    }
}

impl FileRepository for JsonRepository {
    fn create(&self, fields: EncryptedFields) -> SfboxResult<u64> {
        self.mutate(|t| {
            let id = t.allocate_file_id();
            let now = unix_now();
            let mut row = FileRow {
                created_at: now,
                updated_at: now,
                ..Default::default()
            };
            row.set_sealed(fields);
            t.files.insert(id, row);
            Ok(id)
        })
    }

    fn find(&self, id: u64) -> SfboxResult<Option<FileRecord>> {
        Ok(self.lock()?.files.get(&id).map(|row| row.to_record(id)))
    }

    fn update(&self, id: u64, fields: EncryptedFields) -> SfboxResult<()> {
        self.mutate(|t| {
            let row = t
                .files
                .get_mut(&id)
                .ok_or_else(|| SfboxError::NotFound(format!("file {id}")))?;
            row.set_sealed(fields);
            row.clear_legacy();
            row.updated_at = unix_now();
            Ok(())
        })
    }

    fn delete(&self, id: u64) -> SfboxResult<()> {
        self.mutate(|t| {
            t.files
                .remove(&id)
                .map(|_| ())
                .ok_or_else(|| SfboxError::NotFound(format!("file {id}")))
        })
    }

    fn list(&self, offset: usize, limit: usize) -> SfboxResult<(u64, Vec<FileRecord>)> {
        let tables = self.lock()?;
        let mut rows: Vec<(u64, &FileRow)> = tables.files.iter().map(|(id, r)| (*id, r)).collect();
        rows.sort_by(|a, b| b.1.created_at.cmp(&a.1.created_at).then(b.0.cmp(&a.0)));

        let total = rows.len() as u64;
        let page = rows
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(id, row)| row.to_record(id))
            .collect();
        Ok((total, page))
    }
}

impl UserRepository for JsonRepository {
    fn find_user(&self, id: u64) -> SfboxResult<Option<UserProfile>> {
        Ok(self.lock()?.users.get(&id).cloned())
    }

    fn set_avatar(&self, id: u64, avatar: Option<AvatarRef>) -> SfboxResult<()> {
        self.mutate(|t| {
            let user = t
                .users
                .get_mut(&id)
                .ok_or_else(|| SfboxError::NotFound(format!("user {id}")))?;
            user.avatar = avatar;
            Ok(())
        })
    }
}
