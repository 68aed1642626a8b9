//! FileStore: the upload / read / replace / delete lifecycle
//!
//! Every operation checks that crypto is configured before it touches the
//! blob directory or the repository.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use secrecy::SecretString;
use sfbox_core::config::DEFAULT_MAX_AVATAR_SIZE;
use sfbox_core::{FileFields, FileMetadata, FileRecord, SfboxError, SfboxResult};
use sfbox_crypto::{CipherSuite, ContentCipher};

use crate::blob::{path_to_string, BlobDir};
use crate::repo::FileRepository;

/// Default page size when the caller's is out of range
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Largest page size honoured as given
pub const MAX_PAGE_SIZE: usize = 100;

/// Plaintext size caps enforced while streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Uploaded and replacement files (None = unbounded)
    pub max_file_size: Option<u64>,
    pub max_avatar_size: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_file_size: None,
            max_avatar_size: DEFAULT_MAX_AVATAR_SIZE,
        }
    }
}

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub id: u64,
    /// Plaintext bytes consumed from the source
    pub size: u64,
}

/// A file entry with its metadata in the clear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub id: u64,
    pub fields: FileFields,
    pub created_at: u64,
    pub updated_at: u64,
    /// Read from plaintext columns written before metadata encryption
    pub legacy: bool,
}

#[derive(Debug, Clone)]
pub struct FilePage {
    pub total: u64,
    pub page: usize,
    pub size: usize,
    pub items: Vec<FileEntry>,
}

/// What to change on an existing entry. Unset parts are kept.
#[derive(Default)]
pub struct Replacement<'a> {
    content: Option<Box<dyn Read + 'a>>,
    filename: Option<String>,
    description: Option<String>,
}

impl<'a> Replacement<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(mut self, src: impl Read + 'a) -> Self {
        self.content = Some(Box::new(src));
        self
    }

    /// An empty name is ignored.
    pub fn filename(mut self, name: impl Into<String>) -> Self {
        self.filename = Some(name.into());
        self
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }
}

impl std::fmt::Debug for Replacement<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replacement")
            .field("content", &self.content.is_some())
            .field("filename", &self.filename)
            .field("description", &self.description)
            .finish()
    }
}

pub struct FileStore<R> {
    pub(crate) repo: R,
    pub(crate) blobs: BlobDir,
    pub(crate) crypto: CipherSuite,
    pub(crate) limits: Limits,
}

impl<R> std::fmt::Debug for FileStore<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("blob_dir", &self.blobs.root())
            .field("crypto_available", &self.crypto.is_available())
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl<R> FileStore<R> {
    /// Build a store over an existing cipher suite. An unavailable suite is
    /// accepted; operations then fail with a configuration error.
    pub fn new(repo: R, blob_dir: impl Into<PathBuf>, crypto: CipherSuite) -> SfboxResult<Self> {
        Ok(Self {
            repo,
            blobs: BlobDir::open(blob_dir)?,
            crypto,
            limits: Limits::default(),
        })
    }

    /// Build a store from the master secret. Key problems are fatal here.
    pub fn open(
        repo: R,
        blob_dir: impl Into<PathBuf>,
        master: &SecretString,
    ) -> SfboxResult<Self> {
        Self::new(repo, blob_dir, CipherSuite::from_master_secret(master)?)
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    pub fn blob_dir(&self) -> &BlobDir {
        &self.blobs
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn crypto_available(&self) -> bool {
        self.crypto.is_available()
    }

    /// Best-effort removal of a blob nobody will reference.
    pub(crate) fn discard_blob(&self, path: &Path) {
        if let Err(e) = BlobDir::remove(path) {
            warn!(path = %path.display(), "failed to remove orphaned blob: {e}");
        }
    }
}

impl<R: FileRepository> FileStore<R> {
    /// Encrypt `src` into a new blob, then persist its sealed metadata.
    ///
    /// If sealing or the repository write fails, the blob is removed before
    /// the error is returned.
    pub fn store_new<S: Read>(
        &self,
        src: S,
        filename: &str,
        owner_id: u64,
        description: &str,
    ) -> SfboxResult<StoredFile> {
        let content = self.crypto.content()?;
        let fields_cipher = self.crypto.fields()?;

        let path = self.blobs.new_blob_path("");
        let storage_path = path_to_string(&path)?;
        let size = content.encrypt_to_path(src, &path, self.limits.max_file_size)?;

        let fields = FileFields {
            filename: filename.to_string(),
            storage_path,
            size,
            description: description.to_string(),
            uploader_id: owner_id.to_string(),
        };

        let id = match fields_cipher
            .seal_fields(&fields)
            .and_then(|sealed| self.repo.create(sealed))
        {
            Ok(id) => id,
            Err(e) => {
                self.discard_blob(&path);
                return Err(e);
            }
        };

        info!(id, size, owner_id, "file stored");
        Ok(StoredFile { id, size })
    }

    /// Metadata of one entry, decrypted or read from legacy columns.
    pub fn fetch_metadata(&self, id: u64) -> SfboxResult<FileEntry> {
        let record = self.find_record(id)?;
        self.entry(&record)
    }

    /// Stream the decrypted content of one entry into `sink`.
    ///
    /// Bytes may already have reached the sink when an integrity error is
    /// returned; callers that need all-or-nothing output buffer or write to
    /// a temp file.
    pub fn fetch_content<W: Write>(&self, id: u64, sink: W) -> SfboxResult<u64> {
        let content = self.crypto.content()?;
        let entry = self.fetch_metadata(id)?;
        let path = self.blobs.resolve(&entry.fields.storage_path);
        content.decrypt_from_path(&path, sink)
    }

    /// Change the content and/or descriptive fields of an entry.
    ///
    /// New content is encrypted to a sibling temp file and renamed over the
    /// old blob, so the blob path never changes and a failure before the
    /// rename leaves the old content readable. The record is always
    /// rewritten with sealed columns, which also migrates legacy rows.
    pub fn replace(&self, id: u64, change: Replacement<'_>) -> SfboxResult<FileEntry> {
        let content = self.crypto.content()?;
        let fields_cipher = self.crypto.fields()?;

        let record = self.find_record(id)?;
        let mut fields = self.resolve_fields(&record.metadata)?;
        let Replacement {
            content: new_content,
            filename,
            description,
        } = change;

        if let Some(src) = new_content {
            if fields.storage_path.is_empty() {
                return Err(SfboxError::InvalidInput(format!(
                    "file {id} has no blob path to replace"
                )));
            }
            let target = self.blobs.resolve(&fields.storage_path);
            fields.size = self.swap_blob(content, src, &target)?;
        }
        if let Some(name) = filename.filter(|n| !n.is_empty()) {
            fields.filename = name;
        }
        if let Some(text) = description {
            fields.description = text;
        }

        let sealed = fields_cipher.seal_fields(&fields)?;
        if let Err(e) = self.repo.update(id, sealed) {
            error!(id, "blob replaced but record update failed: {e}");
            return Err(e);
        }

        info!(id, size = fields.size, migrated = record.metadata.is_legacy(), "file replaced");
        self.fetch_metadata(id)
    }

    /// Remove the blob, then the record. A blob that is already gone is
    /// not an error.
    pub fn delete(&self, id: u64) -> SfboxResult<()> {
        let record = self.find_record(id)?;
        let fields = self.resolve_fields(&record.metadata)?;

        if !fields.storage_path.is_empty() {
            let path = self.blobs.resolve(&fields.storage_path);
            if !BlobDir::remove(&path)? {
                warn!(id, path = %path.display(), "blob already absent");
            }
        }

        self.repo.delete(id)?;
        info!(id, "file deleted");
        Ok(())
    }

    /// One page of entries, newest first.
    ///
    /// `page` < 1 is treated as 1; `size` outside 1..=100 becomes 20.
    pub fn list(&self, page: usize, size: usize) -> SfboxResult<FilePage> {
        let (page, size) = normalize_page(page, size);
        // Pages past the end come back empty
        let offset = (page - 1).saturating_mul(size);
        let (total, records) = self.repo.list(offset, size)?;
        let items = records
            .iter()
            .map(|r| self.entry(r))
            .collect::<SfboxResult<Vec<_>>>()?;

        Ok(FilePage {
            total,
            page,
            size,
            items,
        })
    }

    fn find_record(&self, id: u64) -> SfboxResult<FileRecord> {
        self.repo
            .find(id)?
            .ok_or_else(|| SfboxError::NotFound(format!("file {id}")))
    }

    fn entry(&self, record: &FileRecord) -> SfboxResult<FileEntry> {
        Ok(FileEntry {
            id: record.id,
            fields: self.resolve_fields(&record.metadata)?,
            created_at: record.created_at,
            updated_at: record.updated_at,
            legacy: record.metadata.is_legacy(),
        })
    }

    /// Legacy rows pass through without touching the field cipher.
    fn resolve_fields(&self, metadata: &FileMetadata) -> SfboxResult<FileFields> {
        match metadata {
            FileMetadata::Encrypted(sealed) => self.crypto.fields()?.open_fields(sealed),
            FileMetadata::LegacyPlaintext(fields) => Ok(fields.clone()),
        }
    }

    fn swap_blob<S: Read>(
        &self,
        content: &ContentCipher,
        src: S,
        target: &Path,
    ) -> SfboxResult<u64> {
        let tmp = BlobDir::temp_path_beside(target);
        let size = content.encrypt_to_path(src, &tmp, self.limits.max_file_size)?;
        BlobDir::commit(&tmp, target)?;
        Ok(size)
    }
}

fn normalize_page(page: usize, size: usize) -> (usize, usize) {
    let page = page.max(1);
    let size = if (1..=MAX_PAGE_SIZE).contains(&size) {
        size
    } else {
        DEFAULT_PAGE_SIZE
    };
    (page, size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json::JsonRepository;
    use sfbox_crypto::{derive_keyring, generate_master_secret};
    use std::fs;
    use tempfile::{tempdir, TempDir};

    fn test_store() -> (TempDir, FileStore<JsonRepository>) {
        let dir = tempdir().unwrap();
        let repo = JsonRepository::open(&dir.path().join("records.json")).unwrap();
        let master = SecretString::from(generate_master_secret());
        let keys = derive_keyring(&master).unwrap();
        let store = FileStore::new(repo, dir.path().join("blobs"), CipherSuite::new(&keys)).unwrap();
        (dir, store)
    }

    fn blob_count(store: &FileStore<JsonRepository>) -> usize {
        fs::read_dir(store.blob_dir().root()).unwrap().count()
    }

    #[test]
    fn test_normalize_page() {
        assert_eq!(normalize_page(0, 10), (1, 10));
        assert_eq!(normalize_page(3, 0), (3, 20));
        assert_eq!(normalize_page(1, 101), (1, 20));
        assert_eq!(normalize_page(2, 100), (2, 100));
    }

    #[test]
    fn test_store_fetch_roundtrip() {
        let (_dir, store) = test_store();
        let data = b"hello sfbox".repeat(1000);

        let stored = store.store_new(&data[..], "hello.txt", 7, "greeting").unwrap();
        assert_eq!(stored.size, data.len() as u64);

        let entry = store.fetch_metadata(stored.id).unwrap();
        assert_eq!(entry.fields.filename, "hello.txt");
        assert_eq!(entry.fields.uploader_id, "7");
        assert_eq!(entry.fields.size, data.len() as u64);
        assert!(!entry.legacy);

        let mut out = Vec::new();
        let n = store.fetch_content(stored.id, &mut out).unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(out, data);
    }

    #[test]
    fn test_blob_on_disk_is_not_plaintext() {
        let (_dir, store) = test_store();
        let data = b"very recognizable plaintext ".repeat(50);
        let stored = store.store_new(&data[..], "p.txt", 1, "").unwrap();

        let entry = store.fetch_metadata(stored.id).unwrap();
        let blob = fs::read(&entry.fields.storage_path).unwrap();
        assert_eq!(&blob[..4], b"SFB2");
        assert!(!blob
            .windows(b"recognizable".len())
            .any(|w| w == b"recognizable"));
    }

    #[test]
    fn test_max_file_size_enforced_and_cleaned_up() {
        let (_dir, store) = test_store();
        let store = store.with_limits(Limits {
            max_file_size: Some(1024),
            ..Limits::default()
        });

        let err = store
            .store_new(&[0u8; 1025][..], "big.bin", 1, "")
            .unwrap_err();
        assert!(matches!(err, SfboxError::LimitExceeded { limit: 1024 }));
        assert_eq!(blob_count(&store), 0);
        assert_eq!(store.list(1, 20).unwrap().total, 0);

        assert!(store.store_new(&[0u8; 1024][..], "ok.bin", 1, "").is_ok());
    }

    #[test]
    fn test_replace_metadata_only_keeps_blob() {
        let (_dir, store) = test_store();
        let stored = store.store_new(&b"abc"[..], "a.txt", 1, "first").unwrap();
        let before = store.fetch_metadata(stored.id).unwrap();
        let blob_before = fs::read(&before.fields.storage_path).unwrap();

        let after = store
            .replace(
                stored.id,
                Replacement::new().filename("").description("second"),
            )
            .unwrap();

        assert_eq!(after.fields.filename, "a.txt", "empty filename is ignored");
        assert_eq!(after.fields.description, "second");
        assert_eq!(after.fields.storage_path, before.fields.storage_path);
        assert_eq!(fs::read(&after.fields.storage_path).unwrap(), blob_before);
    }

    #[test]
    fn test_replace_content_same_path_new_size() {
        let (_dir, store) = test_store();
        let stored = store.store_new(&b"short"[..], "a.txt", 1, "").unwrap();
        let path = store.fetch_metadata(stored.id).unwrap().fields.storage_path;

        let new_data = vec![9u8; 70_000];
        let entry = store
            .replace(
                stored.id,
                Replacement::new().content(&new_data[..]).filename("b.txt"),
            )
            .unwrap();

        assert_eq!(entry.fields.storage_path, path);
        assert_eq!(entry.fields.size, 70_000);
        assert_eq!(entry.fields.filename, "b.txt");
        assert_eq!(blob_count(&store), 1, "no temp files left behind");

        let mut out = Vec::new();
        store.fetch_content(stored.id, &mut out).unwrap();
        assert_eq!(out, new_data);
    }

    #[test]
    fn test_delete_then_not_found() {
        let (_dir, store) = test_store();
        let stored = store.store_new(&b"bye"[..], "bye.txt", 1, "").unwrap();

        store.delete(stored.id).unwrap();
        assert_eq!(blob_count(&store), 0);
        assert!(store.fetch_metadata(stored.id).unwrap_err().is_not_found());
        assert!(store.delete(stored.id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_delete_with_blob_already_gone() {
        let (_dir, store) = test_store();
        let stored = store.store_new(&b"x"[..], "x.txt", 1, "").unwrap();
        let path = store.fetch_metadata(stored.id).unwrap().fields.storage_path;
        fs::remove_file(&path).unwrap();

        store.delete(stored.id).unwrap();
        assert!(store.fetch_metadata(stored.id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_missing_blob_read_is_not_found() {
        let (_dir, store) = test_store();
        let stored = store.store_new(&b"x"[..], "x.txt", 1, "").unwrap();
        let path = store.fetch_metadata(stored.id).unwrap().fields.storage_path;
        fs::remove_file(&path).unwrap();

        let err = store.fetch_content(stored.id, Vec::new()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_unknown_id_is_not_found() {
        let (_dir, store) = test_store();
        assert!(store.fetch_metadata(99).unwrap_err().is_not_found());
        assert!(store.fetch_content(99, Vec::new()).unwrap_err().is_not_found());
        assert!(store
            .replace(99, Replacement::new().description("x"))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_list_pages() {
        let (_dir, store) = test_store();
        for i in 0..25 {
            store
                .store_new(&b"data"[..], &format!("f{i}.txt"), 1, "")
                .unwrap();
        }

        let first = store.list(0, 0).unwrap();
        assert_eq!((first.page, first.size, first.total), (1, 20, 25));
        assert_eq!(first.items.len(), 20);
        assert_eq!(first.items[0].fields.filename, "f24.txt");

        let second = store.list(2, 20).unwrap();
        assert_eq!(second.items.len(), 5);
        assert_eq!(second.items[4].fields.filename, "f0.txt");
    }

    #[test]
    fn test_list_huge_page_is_empty() {
        let (_dir, store) = test_store();
        store.store_new(&b"data"[..], "only.txt", 1, "").unwrap();

        let page = store.list(usize::MAX, 20).unwrap();
        assert_eq!(page.page, usize::MAX);
        assert_eq!(page.total, 1);
        assert!(page.items.is_empty());

        let page = store.list(usize::MAX / 2, 100).unwrap();
        assert!(page.items.is_empty());
    }

    #[test]
    fn test_replace_content_without_blob_path_is_invalid() {
        let (_dir, store) = test_store();
        let id = store
            .repository()
            .insert_legacy(FileFields {
                filename: "pathless.txt".into(),
                storage_path: String::new(),
                size: 0,
                description: String::new(),
                uploader_id: "1".into(),
            })
            .unwrap();

        let err = store
            .replace(id, Replacement::new().content(&b"new"[..]))
            .unwrap_err();
        assert!(matches!(err, SfboxError::InvalidInput(_)));
        assert_eq!(blob_count(&store), 0);
        assert!(store.fetch_metadata(id).unwrap().legacy, "record untouched");

        // Metadata-only changes still work
        let entry = store
            .replace(id, Replacement::new().description("noted"))
            .unwrap();
        assert_eq!(entry.fields.description, "noted");
    }
}
