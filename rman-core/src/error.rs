use thiserror::Error;

pub type Result<T, E = RmanError> = std::result::Result<T, E>;

/// Errors raised by manifest decoding, verification and patching.
#[derive(Debug, Error)]
pub enum RmanError {
    /// Malformed container or table schema violation.
    #[error("malformed manifest: {0}")]
    Format(String),

    /// Decompressed manifest body does not match the declared length.
    #[error("manifest body size mismatch: header declares {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Chunk bytes did not hash to the chunk id (or failed to decompress).
    #[error("chunk {chunk_id:016X} from bundle {bundle_id:016X} failed verification")]
    ChunkIntegrity { chunk_id: u64, bundle_id: u64 },

    #[error("request to {url} failed: {message}")]
    Network { url: String, message: String, retryable: bool },

    #[error("unsupported hash algorithm tag {0}")]
    UnsupportedAlgorithm(u8),

    /// Name filter that does not compile.
    #[error("invalid selection: {0}")]
    Selection(String),

    #[error("unsafe path in manifest: {0}")]
    UnsafePath(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,
}

impl RmanError {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        RmanError::Format(msg.into())
    }

    /// True for failures worth another attempt of the same range request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RmanError::Network { retryable: true, .. })
    }
}
