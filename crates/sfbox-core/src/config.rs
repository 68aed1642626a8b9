use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{SfboxError, SfboxResult};

/// Default avatar cap: 5 MiB
pub const DEFAULT_MAX_AVATAR_SIZE: u64 = 5 * 1024 * 1024;

/// Top-level configuration (loaded from sfbox.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SfboxConfig {
    pub storage: StorageConfig,
    pub crypto: CryptoConfig,
    pub log: LogConfig,
    /// Warn if the config file is group/world-readable (default: true)
    #[serde(default = "default_true")]
    pub config_file_mode_check: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding ciphertext blobs (created if absent)
    pub blob_dir: PathBuf,
    /// JSON record store path
    pub records_path: PathBuf,
    /// Maximum plaintext size of an uploaded file in bytes (unset = unbounded)
    pub max_file_size: Option<u64>,
    /// Maximum plaintext size of an avatar in bytes
    pub max_avatar_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// URL-safe unpadded base64 master key (>= 32 bytes decoded)
    pub master_key: Option<String>,
    /// Environment variable consulted before `master_key`
    pub master_key_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            blob_dir: PathBuf::from("~/.local/share/sfbox/blobs"),
            records_path: PathBuf::from("~/.local/share/sfbox/records.json"),
            max_file_size: None,
            max_avatar_size: DEFAULT_MAX_AVATAR_SIZE,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            master_key: None,
            master_key_env: "SFBOX_MASTER_KEY".into(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl CryptoConfig {
    /// Resolve the master key: environment variable first, then the file value.
    ///
    /// Empty values count as unset.
    pub fn resolve_master_key(&self) -> Option<SecretString> {
        let from_env = if self.master_key_env.is_empty() {
            None
        } else {
            std::env::var(&self.master_key_env).ok()
        };

        from_env
            .filter(|v| !v.is_empty())
            .or_else(|| self.master_key.clone().filter(|v| !v.is_empty()))
            .map(SecretString::from)
    }
}

impl SfboxConfig {
    /// Parse a TOML document; missing sections and keys take their defaults.
    pub fn from_toml_str(text: &str) -> SfboxResult<Self> {
        toml::from_str(text).map_err(|e| SfboxError::Config(format!("invalid config: {e}")))
    }

    /// Copy of the config with the master key replaced, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.crypto.master_key.is_some() {
            copy.crypto.master_key = Some("[REDACTED]".into());
        }
        copy
    }
}

/// Expand `~` in path to the user's home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_default();
        PathBuf::from(home).join(rest)
    } else {
        path.to_path_buf()
    }
}

/// True if the file is readable by group or others.
#[cfg(unix)]
pub fn is_loosely_readable(path: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(path)?.permissions().mode();
    Ok(mode & 0o044 != 0)
}

#[cfg(not(unix))]
pub fn is_loosely_readable(_path: &Path) -> std::io::Result<bool> {
    Ok(false)
}
