use std::time::Duration;

use aes::cipher::block_padding::{NoPadding, Pkcs7};
use aes::cipher::{BlockDecryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rsa::Pkcs1v15Sign;
use sha2::{Digest, Sha256};

use ecowatt_diagnostics::{Diagnostics, KvStore, PartitionWriter, TransportError};

use crate::error::OtaError;
use crate::manifest::{InjectedFault, Manifest, OtaKeys, Progress};

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// Byte every genuine EcoWatt firmware image starts with; anything else
/// indicates a corrupt or foreign image.
pub const FIRMWARE_MAGIC: u8 = 0xEC;

const STALL_TIMEOUT: Duration = Duration::from_secs(30);
const PROGRESS_KEY: &str = "ota.progress";
const MANIFEST_VERSION_KEY: &str = "ota.manifest_version";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaState {
    Idle,
    Checking,
    Downloading,
    Verifying,
    Applying,
    Completed,
    Rollback,
    Error,
}

pub struct OtaManager {
    state: OtaState,
    manifest: Option<Manifest>,
    progress: Progress,
    keys: OtaKeys,
    fault: Option<InjectedFault>,
}

impl OtaManager {
    pub fn new(keys: OtaKeys) -> Self {
        Self {
            state: OtaState::Idle,
            manifest: None,
            progress: Progress::default(),
            keys,
            fault: None,
        }
    }

    pub fn state(&self) -> OtaState {
        self.state
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    /// Next chunk index the manager expects; what the agent should request.
    pub fn next_chunk_index(&self) -> u32 {
        self.progress.chunks_received
    }

    /// Forces the named verification step to fail, so the rollback path can
    /// be exercised deterministically in tests.
    pub fn inject_fault(&mut self, fault: InjectedFault) {
        self.fault = Some(fault);
    }

    /// `Idle -> Checking` on a scheduler OTA tick.
    pub fn begin_check(&mut self) {
        if self.state == OtaState::Idle {
            self.state = OtaState::Checking;
        }
    }

    /// Resolves a `Checking` state given the backend's update info.
    /// `Checking -> Downloading` if a newer version is on offer;
    /// `Checking -> Idle` otherwise.
    pub fn evaluate_check(&mut self, available: Option<Manifest>, current_version: &str) {
        debug_assert_eq!(self.state, OtaState::Checking);
        match available {
            Some(manifest) if manifest.version != current_version => {
                self.progress = Progress {
                    next_iv: manifest.iv,
                    ..Progress::default()
                };
                self.manifest = Some(manifest);
                self.state = OtaState::Downloading;
            }
            _ => self.state = OtaState::Idle,
        }
    }

    /// Rebuilds manager state after a reboot. If persisted progress names
    /// the same manifest version, resumes from `chunks_received`; otherwise
    /// starts the download over from chunk 0.
    pub fn resume_or_restart(keys: OtaKeys, store: &dyn KvStore, manifest: Manifest) -> Self {
        let mut mgr = Self::new(keys);
        mgr.progress.next_iv = manifest.iv;

        let resumable = store
            .get(MANIFEST_VERSION_KEY)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .is_some_and(|v| v == manifest.version);

        if resumable
            && let Some(bytes) = store.get(PROGRESS_KEY)
            && let Ok(progress) = serde_json::from_slice::<Progress>(&bytes)
        {
            mgr.progress = progress;
        }

        mgr.manifest = Some(manifest);
        mgr.state = OtaState::Downloading;
        mgr
    }

    fn persist_progress(&self, store: &mut dyn KvStore) -> Result<(), OtaError> {
        let manifest = self.manifest.as_ref().expect("manifest present while downloading");
        let bytes = serde_json::to_vec(&self.progress).map_err(|_| OtaError::PartitionWrite)?;
        store.put(PROGRESS_KEY, &bytes).map_err(|_| OtaError::PartitionWrite)?;
        store
            .put(MANIFEST_VERSION_KEY, manifest.version.as_bytes())
            .map_err(|_| OtaError::PartitionWrite)?;
        Ok(())
    }

    /// Stall detection: no chunk activity for longer than the 30s budget
    /// transitions straight to `Error`.
    pub fn check_stall(&mut self, now_ms: u64) -> Result<(), OtaError> {
        if matches!(self.state, OtaState::Downloading | OtaState::Verifying | OtaState::Applying)
            && now_ms.saturating_sub(self.progress.last_activity_ms) > STALL_TIMEOUT.as_millis() as u64
        {
            self.state = OtaState::Error;
            return Err(OtaError::Stalled);
        }
        Ok(())
    }

    /// Accepts one downloaded chunk: verifies its HMAC (if the manifest
    /// carries one), decrypts it with the chained CBC IV, writes it to the
    /// partition, and persists progress.
    pub fn accept_chunk(
        &mut self,
        index: u32,
        raw_chunk: &[u8],
        now_ms: u64,
        partition: &mut dyn PartitionWriter,
        store: &mut dyn KvStore,
    ) -> Result<(), OtaError> {
        debug_assert_eq!(self.state, OtaState::Downloading);

        if self.fault == Some(InjectedFault::Timeout) {
            self.state = OtaState::Error;
            return Err(OtaError::Stalled);
        }
        if index != self.progress.chunks_received {
            return Err(OtaError::ChunkFetch);
        }

        let manifest = self.manifest.as_ref().expect("manifest present while downloading");

        if let Some(hmacs) = &manifest.chunk_hmacs {
            let expected = hmacs.get(index as usize).ok_or(OtaError::ChunkFetch)?;
            let mut mac = HmacSha256::new_from_slice(&self.keys.chunk_hmac_key).expect("any key length");
            mac.update(raw_chunk);
            let computed: [u8; 32] = mac.finalize().into_bytes().into();
            let tampered = self.fault == Some(InjectedFault::BadHmac);
            if tampered || computed != *expected {
                return Err(OtaError::ChunkHmacFail(index));
            }
        }

        let is_last_chunk = index + 1 == manifest.total_chunks;
        let chunk_iv = self.progress.next_iv;
        let mut buf = raw_chunk.to_vec();
        let decrypted: &[u8] = if is_last_chunk {
            Aes128CbcDec::new(&self.keys.aes_key.into(), &chunk_iv.into())
                .decrypt_padded_mut::<Pkcs7>(&mut buf)
                .map_err(|_| OtaError::DecryptFail(index))?
        } else {
            Aes128CbcDec::new(&self.keys.aes_key.into(), &chunk_iv.into())
                .decrypt_padded_mut::<NoPadding>(&mut buf)
                .map_err(|_| OtaError::DecryptFail(index))?
        };

        let mut decrypted = decrypted.to_vec();
        if self.fault == Some(InjectedFault::CorruptChunk)
            && let Some(byte) = decrypted.first_mut()
        {
            *byte ^= 0xFF;
        }

        partition
            .write_chunk(self.progress.bytes_written as u32, &decrypted)
            .map_err(|e| match e {
                TransportError::Timeout => OtaError::Stalled,
                _ => OtaError::PartitionWrite,
            })?;

        if raw_chunk.len() >= 16 {
            self.progress.next_iv.copy_from_slice(&raw_chunk[raw_chunk.len() - 16..]);
        }
        self.progress.bytes_written += decrypted.len() as u64;
        self.progress.chunks_received = index + 1;
        self.progress.last_activity_ms = now_ms;
        self.persist_progress(store)?;

        if is_last_chunk && self.fault != Some(InjectedFault::Incomplete) {
            self.state = OtaState::Verifying;
        }
        Ok(())
    }

    /// Verifies the assembled image's hash and signature, then applies it.
    /// Any verification failure transitions to `Rollback`, discards the new
    /// partition's contents via `PartitionWriter::rollback`, and leaves it
    /// unmarked so the bootloader stays on the old image.
    pub fn finalize(
        &mut self,
        diagnostics: &mut Diagnostics,
        partition: &mut dyn PartitionWriter,
    ) -> Result<(), OtaError> {
        debug_assert_eq!(self.state, OtaState::Verifying);
        let manifest = self.manifest.as_ref().expect("manifest present while verifying");

        let assembled = partition.read_back();
        let digest: [u8; 32] = Sha256::digest(&assembled).into();
        let hash_bad = self.fault == Some(InjectedFault::BadHash) || digest != manifest.expected_sha256;
        if hash_bad {
            self.state = OtaState::Rollback;
            partition.rollback().map_err(|_| OtaError::PartitionWrite)?;
            diagnostics.record_ota_rollback();
            diagnostics.record_ota_failure();
            return Err(OtaError::HashMismatch);
        }

        if assembled.first().copied() != Some(FIRMWARE_MAGIC) {
            self.state = OtaState::Rollback;
            partition.rollback().map_err(|_| OtaError::PartitionWrite)?;
            diagnostics.record_ota_rollback();
            diagnostics.record_ota_failure();
            return Err(OtaError::MagicMismatch);
        }

        self.state = OtaState::Applying;

        let sig_bad = self.fault == Some(InjectedFault::BadSignature)
            || self
                .keys
                .signing_public_key
                .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &manifest.signature)
                .is_err();
        if sig_bad {
            self.state = OtaState::Rollback;
            partition.rollback().map_err(|_| OtaError::PartitionWrite)?;
            diagnostics.record_ota_rollback();
            diagnostics.record_ota_failure();
            return Err(OtaError::SignatureFail);
        }

        partition.mark_boot_target().map_err(|_| OtaError::PartitionWrite)?;
        self.state = OtaState::Completed;
        diagnostics.record_ota_success();
        Ok(())
    }

    /// Called after a successful self-validation on the next boot
    /// (`PendingVerify`): cancels rollback and marks the new partition valid.
    pub fn confirm_boot(&mut self, partition: &mut dyn PartitionWriter) -> Result<(), OtaError> {
        partition.mark_valid().map_err(|_| OtaError::PartitionWrite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockEncryptMut;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rsa::RsaPrivateKey;
    use std::collections::HashMap;

    type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

    struct MemStore(HashMap<String, Vec<u8>>);

    impl KvStore for MemStore {
        fn get(&self, key: &str) -> Option<Vec<u8>> {
            self.0.get(key).cloned()
        }
        fn put(&mut self, key: &str, value: &[u8]) -> Result<(), ecowatt_diagnostics::StoreError> {
            self.0.insert(key.to_string(), value.to_vec());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakePartition {
        written: Vec<(u32, Vec<u8>)>,
        boot_target_marked: bool,
        valid_marked: bool,
        rolled_back: bool,
    }

    impl PartitionWriter for FakePartition {
        fn write_chunk(&mut self, offset: u32, bytes: &[u8]) -> Result<(), TransportError> {
            self.written.push((offset, bytes.to_vec()));
            Ok(())
        }
        fn read_back(&self) -> Vec<u8> {
            let mut ordered = self.written.clone();
            ordered.sort_by_key(|(offset, _)| *offset);
            ordered.into_iter().flat_map(|(_, bytes)| bytes).collect()
        }
        fn mark_boot_target(&mut self) -> Result<(), TransportError> {
            self.boot_target_marked = true;
            Ok(())
        }
        fn mark_valid(&mut self) -> Result<(), TransportError> {
            self.valid_marked = true;
            Ok(())
        }
        fn rollback(&mut self) -> Result<(), TransportError> {
            self.rolled_back = true;
            Ok(())
        }
    }

    fn test_rsa_key() -> RsaPrivateKey {
        let mut rng = StdRng::seed_from_u64(42);
        RsaPrivateKey::new(&mut rng, 2048).expect("key generation")
    }

    /// Builds an encrypted, chunked, HMAC-tagged firmware image and its
    /// manifest. `chunk_size` must divide the ciphertext length evenly.
    fn build_update(
        plaintext: &[u8],
        chunk_size: usize,
        hmac_key: [u8; 32],
        aes_key: [u8; 16],
        iv: [u8; 16],
        signing_key: &RsaPrivateKey,
        version: &str,
    ) -> (Manifest, Vec<Vec<u8>>) {
        let digest: [u8; 32] = Sha256::digest(plaintext).into();
        let signature = signing_key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .expect("signing");

        let mut buf = plaintext.to_vec();
        buf.resize(plaintext.len() + 16, 0);
        let ciphertext = Aes128CbcEnc::new(&aes_key.into(), &iv.into())
            .encrypt_padded_mut::<Pkcs7>(&mut buf, plaintext.len())
            .expect("encrypt")
            .to_vec();
        assert_eq!(ciphertext.len() % chunk_size, 0);

        let chunks: Vec<Vec<u8>> = ciphertext.chunks(chunk_size).map(|c| c.to_vec()).collect();
        let chunk_hmacs: Vec<[u8; 32]> = chunks
            .iter()
            .map(|c| {
                let mut mac = HmacSha256::new_from_slice(&hmac_key).unwrap();
                mac.update(c);
                mac.finalize().into_bytes().into()
            })
            .collect();

        let manifest = Manifest {
            version: version.to_string(),
            total_chunks: chunks.len() as u32,
            chunk_size: chunk_size as u32,
            expected_sha256: digest,
            signature,
            iv,
            chunk_hmacs: Some(chunk_hmacs),
        };
        (manifest, chunks)
    }

    fn download_all(mgr: &mut OtaManager, chunks: &[Vec<u8>], partition: &mut FakePartition, store: &mut MemStore) {
        while mgr.state() == OtaState::Downloading {
            let next = mgr.next_chunk_index() as usize;
            mgr.accept_chunk(next as u32, &chunks[next], next as u64, partition, store)
                .unwrap();
        }
    }

    #[test]
    fn rollback_on_bad_signature() {
        let signing_key = test_rsa_key();
        let wrong_key = {
            let mut rng = StdRng::seed_from_u64(99);
            RsaPrivateKey::new(&mut rng, 2048).unwrap()
        };

        let hmac_key = [3u8; 32];
        let aes_key = [5u8; 16];
        let iv = [7u8; 16];

        let mut plaintext = vec![FIRMWARE_MAGIC];
        plaintext.extend(std::iter::repeat_n(0xAB, 47));
        let (manifest, chunks) = build_update(&plaintext, 16, hmac_key, aes_key, iv, &signing_key, "v2");

        let keys = OtaKeys {
            chunk_hmac_key: hmac_key,
            aes_key,
            signing_public_key: wrong_key.to_public_key(),
        };
        let mut mgr = OtaManager::new(keys);
        mgr.begin_check();
        mgr.evaluate_check(Some(manifest), "v1");
        assert_eq!(mgr.state(), OtaState::Downloading);

        let mut partition = FakePartition::default();
        let mut store = MemStore(HashMap::new());
        download_all(&mut mgr, &chunks, &mut partition, &mut store);
        assert_eq!(mgr.state(), OtaState::Verifying);

        let mut diagnostics = Diagnostics::new();
        let err = mgr.finalize(&mut diagnostics, &mut partition).unwrap_err();
        assert_eq!(err, OtaError::SignatureFail);
        assert_eq!(mgr.state(), OtaState::Rollback);
        assert_eq!(diagnostics.ota_counters.rollbacks, 1);
        assert!(!partition.boot_target_marked);
        assert!(!partition.valid_marked);
    }

    #[test]
    fn resume_after_simulated_crash_matches_uninterrupted_run() {
        let signing_key = test_rsa_key();
        let hmac_key = [11u8; 32];
        let aes_key = [13u8; 16];
        let iv = [17u8; 16];

        // 996 full blocks plus a 10-byte remainder -> exactly 997 16-byte
        // chunks once PKCS7 padding is applied to the final block.
        let mut plaintext = vec![FIRMWARE_MAGIC];
        plaintext.extend(std::iter::repeat_n(0x42, 996 * 16 + 9));
        assert_eq!(plaintext.len(), 996 * 16 + 10);

        let (manifest, chunks) = build_update(&plaintext, 16, hmac_key, aes_key, iv, &signing_key, "v3");
        assert_eq!(manifest.total_chunks, 997);

        let keys = OtaKeys {
            chunk_hmac_key: hmac_key,
            aes_key,
            signing_public_key: signing_key.to_public_key(),
        };

        // Uninterrupted run, for comparison.
        let mut uninterrupted = OtaManager::new(keys.clone());
        uninterrupted.begin_check();
        uninterrupted.evaluate_check(Some(manifest.clone()), "v1");
        let mut partition_a = FakePartition::default();
        let mut store_a = MemStore(HashMap::new());
        download_all(&mut uninterrupted, &chunks, &mut partition_a, &mut store_a);
        assert_eq!(partition_a.read_back(), plaintext);
        let mut diagnostics_a = Diagnostics::new();
        uninterrupted.finalize(&mut diagnostics_a, &mut partition_a).unwrap();

        // Interrupted run: crash after chunk 500.
        let mut mgr = OtaManager::new(keys.clone());
        mgr.begin_check();
        mgr.evaluate_check(Some(manifest.clone()), "v1");
        let mut partition_b = FakePartition::default();
        let mut store_b = MemStore(HashMap::new());
        for i in 0..=500u32 {
            mgr.accept_chunk(i, &chunks[i as usize], i as u64, &mut partition_b, &mut store_b)
                .unwrap();
        }
        assert_eq!(mgr.next_chunk_index(), 501);
        drop(mgr); // simulated crash: manager instance is dropped, only store/partition persist

        // Restart: manager reloads persisted progress against the same manifest.
        let mut resumed = OtaManager::resume_or_restart(keys, &store_b, manifest);
        assert_eq!(resumed.state(), OtaState::Downloading);
        assert_eq!(resumed.next_chunk_index(), 501);

        for i in 501..chunks.len() as u32 {
            resumed
                .accept_chunk(i, &chunks[i as usize], i as u64, &mut partition_b, &mut store_b)
                .unwrap();
        }
        assert_eq!(resumed.state(), OtaState::Verifying);

        let mut diagnostics_b = Diagnostics::new();
        resumed.finalize(&mut diagnostics_b, &mut partition_b).unwrap();
        assert_eq!(resumed.state(), OtaState::Completed);

        // Final firmware (what was written to the partition) is identical
        // whether or not the download was interrupted midway through.
        assert_eq!(partition_a.written, partition_b.written);
    }

    #[test]
    fn hmac_tamper_fails_before_decryption() {
        let signing_key = test_rsa_key();
        let hmac_key = [21u8; 32];
        let aes_key = [23u8; 16];
        let iv = [29u8; 16];

        let mut plaintext = vec![FIRMWARE_MAGIC];
        plaintext.extend(std::iter::repeat_n(0x10, 31));
        let (manifest, mut chunks) = build_update(&plaintext, 16, hmac_key, aes_key, iv, &signing_key, "v4");
        chunks[0][0] ^= 0x01;

        let keys = OtaKeys {
            chunk_hmac_key: hmac_key,
            aes_key,
            signing_public_key: signing_key.to_public_key(),
        };
        let mut mgr = OtaManager::new(keys);
        mgr.begin_check();
        mgr.evaluate_check(Some(manifest), "v1");

        let mut partition = FakePartition::default();
        let mut store = MemStore(HashMap::new());
        let err = mgr
            .accept_chunk(0, &chunks[0], 0, &mut partition, &mut store)
            .unwrap_err();
        assert_eq!(err, OtaError::ChunkHmacFail(0));
    }

    #[test]
    fn stall_timeout_transitions_to_error() {
        let signing_key = test_rsa_key();
        let keys = OtaKeys {
            chunk_hmac_key: [1u8; 32],
            aes_key: [2u8; 16],
            signing_public_key: signing_key.to_public_key(),
        };
        let manifest = Manifest {
            version: "v5".into(),
            total_chunks: 4,
            chunk_size: 16,
            expected_sha256: [0u8; 32],
            signature: vec![],
            iv: [0u8; 16],
            chunk_hmacs: None,
        };
        let mut mgr = OtaManager::new(keys);
        mgr.begin_check();
        mgr.evaluate_check(Some(manifest), "v1");
        mgr.progress.last_activity_ms = 1_000;

        assert!(mgr.check_stall(31_000).is_ok());
        let err = mgr.check_stall(32_001).unwrap_err();
        assert_eq!(err, OtaError::Stalled);
        assert_eq!(mgr.state(), OtaState::Error);
    }
}
