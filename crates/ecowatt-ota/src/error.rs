use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OtaError {
    #[error("manifest fetch failed")]
    ManifestFetch,
    #[error("chunk fetch failed")]
    ChunkFetch,
    #[error("chunk {0} failed HMAC verification")]
    ChunkHmacFail(u32),
    #[error("chunk {0} failed to decrypt")]
    DecryptFail(u32),
    #[error("assembled image hash does not match manifest")]
    HashMismatch,
    #[error("signature verification failed")]
    SignatureFail,
    #[error("firmware magic byte mismatch")]
    MagicMismatch,
    #[error("partition write failed")]
    PartitionWrite,
    #[error("no chunk activity for longer than the stall timeout")]
    Stalled,
    #[error("update was cancelled")]
    Cancelled,
}
