//! Chunked AES-256-GCM blob encryption
//!
//! Blob format (all integers big-endian):
//! ```text
//! offset 0:  4 bytes  magic "SFB2"
//! offset 4:  8 bytes  random nonce prefix
//! offset 12: repeated { 4-byte sealed length N, N bytes sealed chunk }
//! ```
//!
//! Chunk `i` is sealed with nonce `prefix || be32(i)` and AAD `be32(i)`, so a
//! chunk moved to another position or spliced in from another blob fails
//! authentication. Dropping trailing chunks is not detectable from the format.
//!
//! The chunk index is 32 bits, which caps a blob at 2^32 chunks of 32 KiB
//! (about 128 TiB of plaintext).

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::{debug, warn};

use sfbox_core::{SfboxError, SfboxResult};

use crate::kdf::SubKey;
use crate::{NONCE_SIZE, TAG_SIZE};

/// Format tag at the start of every blob
pub const MAGIC: &[u8; 4] = b"SFB2";

/// Random per-blob nonce prefix length
pub const NONCE_PREFIX_SIZE: usize = 8;

/// Magic + nonce prefix
pub const HEADER_SIZE: usize = MAGIC.len() + NONCE_PREFIX_SIZE;

/// Plaintext bytes per chunk
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Largest sealed chunk a well-formed blob can contain
pub const MAX_SEALED_CHUNK: usize = CHUNK_SIZE + TAG_SIZE;

/// Chunk index is a u32
pub const MAX_CHUNKS: u64 = 1 << 32;

/// Streaming cipher for file and avatar content.
#[derive(Clone)]
pub struct ContentCipher {
    aead: Aes256Gcm,
}

impl std::fmt::Debug for ContentCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentCipher").finish_non_exhaustive()
    }
}

impl ContentCipher {
    pub fn new(key: &SubKey) -> Self {
        Self {
            aead: Aes256Gcm::new(key.as_bytes().into()),
        }
    }

    /// Encrypt `src` into `dst` and return the plaintext byte count.
    ///
    /// `limit` caps the plaintext size; going over it aborts with
    /// [`SfboxError::LimitExceeded`]. Whatever was already written to `dst`
    /// is the caller's to discard.
    pub fn encrypt_stream<R: Read, W: Write>(
        &self,
        mut src: R,
        mut dst: W,
        limit: Option<u64>,
    ) -> SfboxResult<u64> {
        let mut prefix = [0u8; NONCE_PREFIX_SIZE];
        rand::thread_rng().fill_bytes(&mut prefix);

        dst.write_all(MAGIC)?;
        dst.write_all(&prefix)?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut total: u64 = 0;
        let mut counter: u64 = 0;

        loop {
            let n = read_full(&mut src, &mut buf)?;
            if n == 0 {
                break;
            }
            if counter >= MAX_CHUNKS {
                return Err(SfboxError::LimitExceeded {
                    limit: MAX_CHUNKS * CHUNK_SIZE as u64,
                });
            }

            total += n as u64;
            if let Some(limit) = limit {
                if total > limit {
                    return Err(SfboxError::LimitExceeded { limit });
                }
            }

            let index = counter as u32;
            let nonce = chunk_nonce(&prefix, index);
            let sealed = self
                .aead
                .encrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: &buf[..n],
                        aad: &index.to_be_bytes(),
                    },
                )
                .map_err(|e| anyhow::anyhow!("chunk {index} encryption failed: {e}"))?;

            dst.write_all(&(sealed.len() as u32).to_be_bytes())?;
            dst.write_all(&sealed)?;
            counter += 1;

            // A short read means the source is exhausted
            if n < CHUNK_SIZE {
                break;
            }
        }

        dst.flush()?;
        Ok(total)
    }

    /// Decrypt a blob from `src` into `sink` and return the plaintext byte count.
    ///
    /// Plaintext is written chunk by chunk as each one authenticates. On error
    /// the sink may hold a prefix of the plaintext and must be discarded.
    pub fn decrypt_stream<R: Read, W: Write>(&self, mut src: R, mut sink: W) -> SfboxResult<u64> {
        let mut header = [0u8; HEADER_SIZE];
        let got = read_full(&mut src, &mut header)?;
        if got < HEADER_SIZE {
            return Err(SfboxError::Format(format!(
                "truncated header: {got} of {HEADER_SIZE} bytes"
            )));
        }
        if &header[..MAGIC.len()] != MAGIC {
            return Err(SfboxError::Format("invalid file magic".into()));
        }
        let mut prefix = [0u8; NONCE_PREFIX_SIZE];
        prefix.copy_from_slice(&header[MAGIC.len()..]);

        let mut sealed = Vec::with_capacity(MAX_SEALED_CHUNK);
        let mut total: u64 = 0;
        let mut counter: u64 = 0;

        loop {
            let mut len_buf = [0u8; 4];
            match read_full(&mut src, &mut len_buf)? {
                0 => break,
                4 => {}
                n => {
                    return Err(SfboxError::Format(format!(
                        "truncated length prefix at chunk {counter}: {n} of 4 bytes"
                    )))
                }
            }

            let len = u32::from_be_bytes(len_buf) as usize;
            if len <= TAG_SIZE || len > MAX_SEALED_CHUNK {
                return Err(SfboxError::Format(format!(
                    "invalid encrypted chunk length {len} at chunk {counter}"
                )));
            }
            if counter >= MAX_CHUNKS {
                return Err(SfboxError::LimitExceeded {
                    limit: MAX_CHUNKS * CHUNK_SIZE as u64,
                });
            }

            sealed.resize(len, 0);
            let got = read_full(&mut src, &mut sealed)?;
            if got < len {
                return Err(SfboxError::Format(format!(
                    "truncated chunk {counter}: {got} of {len} bytes"
                )));
            }

            let index = counter as u32;
            let nonce = chunk_nonce(&prefix, index);
            let plain = self
                .aead
                .decrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: &sealed,
                        aad: &index.to_be_bytes(),
                    },
                )
                .map_err(|_| {
                    SfboxError::Integrity(format!("file integrity check failed at chunk {index}"))
                })?;

            sink.write_all(&plain)?;
            total += plain.len() as u64;
            counter += 1;
        }

        sink.flush()?;
        Ok(total)
    }

    /// Encrypt `src` into a new file at `path`.
    ///
    /// The file is created exclusively and synced before returning. On any
    /// failure the partial file is removed.
    pub fn encrypt_to_path<R: Read>(
        &self,
        src: R,
        path: &Path,
        limit: Option<u64>,
    ) -> SfboxResult<u64> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;

        match self.write_blob(src, file, limit) {
            Ok(total) => {
                debug!(path = %path.display(), bytes = total, "blob written");
                Ok(total)
            }
            Err(e) => {
                if let Err(rm) = fs::remove_file(path) {
                    warn!(path = %path.display(), "failed to remove partial blob: {rm}");
                }
                Err(e)
            }
        }
    }

    /// Decrypt the blob at `path` into `sink`.
    pub fn decrypt_from_path<W: Write>(&self, path: &Path, sink: W) -> SfboxResult<u64> {
        let file = File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                SfboxError::NotFound(format!("blob {}", path.display()))
            }
            _ => SfboxError::Io(e),
        })?;

        let total = self.decrypt_stream(BufReader::with_capacity(CHUNK_SIZE * 2, file), sink)?;
        debug!(path = %path.display(), bytes = total, "blob read");
        Ok(total)
    }

    fn write_blob<R: Read>(&self, src: R, file: File, limit: Option<u64>) -> SfboxResult<u64> {
        let mut writer = BufWriter::with_capacity(CHUNK_SIZE * 2, file);
        let total = self.encrypt_stream(src, &mut writer, limit)?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(total)
    }
}

/// nonce = prefix (8 bytes) || be32(index)
fn chunk_nonce(prefix: &[u8; NONCE_PREFIX_SIZE], index: u32) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..NONCE_PREFIX_SIZE].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_SIZE..].copy_from_slice(&index.to_be_bytes());
    nonce
}

/// Read until `buf` is full or the source hits EOF.
fn read_full<R: Read>(src: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_cipher() -> ContentCipher {
        ContentCipher::new(&SubKey::from_bytes([0x42u8; 32]))
    }

    fn make_data(size: usize) -> Vec<u8> {
        (0..size)
            .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
            .collect()
    }

    fn encrypt(cipher: &ContentCipher, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let n = cipher.encrypt_stream(data, &mut out, None).unwrap();
        assert_eq!(n, data.len() as u64);
        out
    }

    fn decrypt(cipher: &ContentCipher, blob: &[u8]) -> SfboxResult<Vec<u8>> {
        let mut out = Vec::new();
        cipher.decrypt_stream(blob, &mut out)?;
        Ok(out)
    }

    /// Byte offset of each chunk's length prefix
    fn chunk_offsets(blob: &[u8]) -> Vec<usize> {
        let mut offsets = Vec::new();
        let mut pos = HEADER_SIZE;
        while pos < blob.len() {
            offsets.push(pos);
            let len = u32::from_be_bytes(blob[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4 + len;
        }
        offsets
    }

    /// Reader that errors once `remaining` bytes have been handed out
    struct FailingReader {
        remaining: usize,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.remaining == 0 {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "source went away"));
            }
            let n = buf.len().min(self.remaining);
            buf[..n].fill(0xEE);
            self.remaining -= n;
            Ok(n)
        }
    }

    /// Reader that hands out one byte per call
    struct TrickleReader<'a> {
        data: &'a [u8],
    }

    impl Read for TrickleReader<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.data.is_empty() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.data[0];
            self.data = &self.data[1..];
            Ok(1)
        }
    }

    #[test]
    fn test_roundtrip_boundary_sizes() {
        let cipher = test_cipher();
        for size in [
            0,
            1,
            CHUNK_SIZE - 1,
            CHUNK_SIZE,
            CHUNK_SIZE + 1,
            3 * CHUNK_SIZE + 17,
        ] {
            let data = make_data(size);
            let blob = encrypt(&cipher, &data);
            assert_eq!(decrypt(&cipher, &blob).unwrap(), data, "size {size}");
        }
    }

    #[test]
    fn test_empty_stream_is_header_only() {
        let blob = encrypt(&test_cipher(), b"");
        assert_eq!(blob.len(), HEADER_SIZE);
        assert_eq!(&blob[..4], MAGIC);
    }

    #[test]
    fn test_blob_layout() {
        let data = make_data(CHUNK_SIZE + 100);
        let blob = encrypt(&test_cipher(), &data);

        assert_eq!(&blob[..4], b"SFB2");
        let offsets = chunk_offsets(&blob);
        assert_eq!(offsets.len(), 2);

        let first = u32::from_be_bytes(blob[12..16].try_into().unwrap()) as usize;
        assert_eq!(first, CHUNK_SIZE + TAG_SIZE);
        let second =
            u32::from_be_bytes(blob[offsets[1]..offsets[1] + 4].try_into().unwrap()) as usize;
        assert_eq!(second, 100 + TAG_SIZE);
        assert_eq!(blob.len(), HEADER_SIZE + 2 * 4 + first + second);
    }

    #[test]
    fn test_short_reads_still_fill_chunks() {
        let data = make_data(CHUNK_SIZE + 5);
        let cipher = test_cipher();
        let mut blob = Vec::new();
        cipher
            .encrypt_stream(TrickleReader { data: &data }, &mut blob, None)
            .unwrap();

        assert_eq!(chunk_offsets(&blob).len(), 2);
        assert_eq!(decrypt(&cipher, &blob).unwrap(), data);
    }

    #[test]
    fn test_nonce_prefix_unique_per_blob() {
        let cipher = test_cipher();
        let data = make_data(1000);
        let a = encrypt(&cipher, &data);
        let b = encrypt(&cipher, &data);

        assert_ne!(&a[4..12], &b[4..12], "nonce prefixes must differ");
        assert_ne!(a[12..], b[12..], "ciphertexts must differ");
    }

    #[test]
    fn test_every_sealed_byte_is_authenticated() {
        let cipher = test_cipher();
        let data = make_data(300);
        let blob = encrypt(&cipher, &data);

        // skip the header and the single length prefix
        for pos in HEADER_SIZE + 4..blob.len() {
            let mut tampered = blob.clone();
            tampered[pos] ^= 0x01;
            let err = decrypt(&cipher, &tampered).unwrap_err();
            assert!(err.is_integrity(), "byte {pos}: {err}");
        }
    }

    #[test]
    fn test_length_prefix_tamper_never_yields_output() {
        let cipher = test_cipher();
        let data = make_data(2 * CHUNK_SIZE + 9);
        let blob = encrypt(&cipher, &data);

        for offset in chunk_offsets(&blob) {
            for bit in 0..32 {
                let mut tampered = blob.clone();
                let byte = offset + bit / 8;
                tampered[byte] ^= 1 << (bit % 8);
                let err = decrypt(&cipher, &tampered).unwrap_err();
                assert!(
                    err.is_integrity() || err.is_format(),
                    "offset {offset} bit {bit}: {err}"
                );
            }
        }
    }

    #[test]
    fn test_swapped_chunks_fail_at_first_swap() {
        let cipher = test_cipher();
        let data = make_data(3 * CHUNK_SIZE);
        let blob = encrypt(&cipher, &data);
        let offsets = chunk_offsets(&blob);
        assert_eq!(offsets.len(), 3);

        let chunk_len = offsets[1] - offsets[0];
        let mut swapped = blob.clone();
        swapped[offsets[0]..offsets[1]].copy_from_slice(&blob[offsets[1]..offsets[2]]);
        swapped[offsets[1]..offsets[1] + chunk_len].copy_from_slice(&blob[offsets[0]..offsets[1]]);

        let mut sink = Vec::new();
        let err = cipher.decrypt_stream(&swapped[..], &mut sink).unwrap_err();
        assert!(err.is_integrity());
        assert!(err.to_string().contains("chunk 0"));
        assert!(sink.is_empty(), "nothing may be emitted before the failing chunk");
    }

    #[test]
    fn test_chunk_spliced_from_other_blob_fails() {
        let cipher = test_cipher();
        let data = make_data(CHUNK_SIZE);
        let a = encrypt(&cipher, &data);
        let b = encrypt(&cipher, &data);

        let mut spliced = a[..HEADER_SIZE].to_vec();
        spliced.extend_from_slice(&b[HEADER_SIZE..]);
        assert!(decrypt(&cipher, &spliced).unwrap_err().is_integrity());
    }

    #[test]
    fn test_wrong_key_is_integrity_error() {
        let blob = encrypt(&test_cipher(), b"secret data");
        let other = ContentCipher::new(&SubKey::from_bytes([0x43u8; 32]));
        assert!(decrypt(&other, &blob).unwrap_err().is_integrity());
    }

    #[test]
    fn test_bad_magic_is_format_error() {
        let mut blob = encrypt(&test_cipher(), b"secret data");
        blob[0] = b'X';
        let err = decrypt(&test_cipher(), &blob).unwrap_err();
        assert!(err.is_format());
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_plaintext_file_is_format_error() {
        let err = decrypt(&test_cipher(), b"just some plaintext that was never encrypted").unwrap_err();
        assert!(err.is_format());
    }

    #[test]
    fn test_truncated_header_is_format_error() {
        let blob = encrypt(&test_cipher(), b"x");
        let err = decrypt(&test_cipher(), &blob[..7]).unwrap_err();
        assert!(err.is_format());
    }

    #[test]
    fn test_truncated_chunk_is_format_error() {
        let blob = encrypt(&test_cipher(), &make_data(500));
        let err = decrypt(&test_cipher(), &blob[..blob.len() - 3]).unwrap_err();
        assert!(err.is_format());
    }

    #[test]
    fn test_dropping_whole_trailing_chunk_is_undetected() {
        // Documented limitation of the framing
        let cipher = test_cipher();
        let data = make_data(2 * CHUNK_SIZE);
        let blob = encrypt(&cipher, &data);
        let offsets = chunk_offsets(&blob);

        let out = decrypt(&cipher, &blob[..offsets[1]]).unwrap();
        assert_eq!(out, data[..CHUNK_SIZE]);
    }

    #[test]
    fn test_limit_enforced_while_streaming() {
        let cipher = test_cipher();
        let data = make_data(CHUNK_SIZE + 1);
        let err = cipher
            .encrypt_stream(&data[..], Vec::new(), Some(CHUNK_SIZE as u64))
            .unwrap_err();
        assert!(matches!(err, SfboxError::LimitExceeded { limit } if limit == CHUNK_SIZE as u64));

        // exactly at the limit is fine
        let mut out = Vec::new();
        cipher
            .encrypt_stream(&data[..CHUNK_SIZE], &mut out, Some(CHUNK_SIZE as u64))
            .unwrap();
    }

    #[test]
    fn test_path_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        let cipher = test_cipher();
        let data = make_data(70_000);

        let n = cipher.encrypt_to_path(&data[..], &path, None).unwrap();
        assert_eq!(n, data.len() as u64);

        let mut out = Vec::new();
        let m = cipher.decrypt_from_path(&path, &mut out).unwrap();
        assert_eq!(m, n);
        assert_eq!(out, data);
    }

    #[test]
    fn test_failed_encrypt_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");

        let err = test_cipher()
            .encrypt_to_path(FailingReader { remaining: 50_000 }, &path, None)
            .unwrap_err();
        assert!(matches!(err, SfboxError::Io(_)));
        assert!(!path.exists());
    }

    #[test]
    fn test_encrypt_to_path_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taken.bin");
        fs::write(&path, b"keep me").unwrap();

        assert!(test_cipher().encrypt_to_path(&b"new"[..], &path, None).is_err());
        assert_eq!(fs::read(&path).unwrap(), b"keep me");
    }

    #[test]
    fn test_missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = test_cipher()
            .decrypt_from_path(&dir.path().join("nope.bin"), Vec::new())
            .unwrap_err();
        assert!(err.is_not_found());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn roundtrip_arbitrary(data in proptest::collection::vec(any::<u8>(), 0..3 * CHUNK_SIZE)) {
            let cipher = test_cipher();
            let blob = encrypt(&cipher, &data);
            prop_assert_eq!(decrypt(&cipher, &blob).unwrap(), data);
        }
    }
}
