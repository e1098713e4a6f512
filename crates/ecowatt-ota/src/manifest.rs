use rsa::RsaPublicKey;

/// Everything the backend's `update_info` carries for one firmware
/// release: chunk geometry, the expected plaintext hash/signature, and the
/// chained-CBC IV used to decrypt chunks in order.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Manifest {
    pub version: String,
    pub total_chunks: u32,
    pub chunk_size: u32,
    pub expected_sha256: [u8; 32],
    pub signature: Vec<u8>,
    pub iv: [u8; 16],
    /// Per-chunk HMAC tags, verified before decryption when present.
    pub chunk_hmacs: Option<Vec<[u8; 32]>>,
}

/// Download/apply progress, persisted under `ota.progress` after every
/// chunk so a crash mid-download can resume instead of restarting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Progress {
    pub chunks_received: u32,
    pub bytes_written: u64,
    pub last_activity_ms: u64,
    /// Chained-CBC IV the next chunk must be decrypted with — the last
    /// ciphertext block of the most recently accepted chunk.
    pub next_iv: [u8; 16],
}

/// Key material the OTA manager needs but never persists: the shared
/// per-chunk HMAC key and the backend's RSA-2048 public key used to verify
/// the manifest signature.
#[derive(Clone)]
pub struct OtaKeys {
    pub chunk_hmac_key: [u8; 32],
    pub aes_key: [u8; 16],
    pub signing_public_key: RsaPublicKey,
}

/// Test-only fault injection: forces the named verification step to fail
/// so the rollback path can be exercised without a real corrupt server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFault {
    CorruptChunk,
    BadHash,
    BadSignature,
    BadHmac,
    Timeout,
    Incomplete,
}
