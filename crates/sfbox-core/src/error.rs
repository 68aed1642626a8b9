use thiserror::Error;

pub type SfboxResult<T> = Result<T, SfboxError>;

#[derive(Debug, Error)]
pub enum SfboxError {
    /// Master secret missing, undecodable, or too short. Nothing proceeds.
    #[error("config error: {0}")]
    Config(String),

    /// Input is not in a recognised format (bad magic, bad version prefix,
    /// malformed framing). Usually the wrong file or the wrong key version.
    #[error("format error: {0}")]
    Format(String),

    /// AEAD authentication failed: tampered or corrupted data.
    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("size limit exceeded: plaintext larger than {limit} bytes")]
    LimitExceeded { limit: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SfboxError {
    pub fn is_integrity(&self) -> bool {
        matches!(self, SfboxError::Integrity(_))
    }

    pub fn is_format(&self) -> bool {
        matches!(self, SfboxError::Format(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SfboxError::NotFound(_))
    }
}
