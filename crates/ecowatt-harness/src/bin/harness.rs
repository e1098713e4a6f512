//! Conformance harness: replays the six literal end-to-end scenarios
//! against in-memory fakes of the external collaborators, independent of
//! `cargo test`, and prints a human-readable pass/fail report.

use std::collections::HashMap;

use clap::Parser;

use aes::cipher::BlockEncryptMut;
use aes::cipher::KeyIvInit;
use aes::cipher::block_padding::Pkcs7;
use hmac::{Hmac, Mac};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha2::{Digest, Sha256};

use ecowatt_core::acquisition;
use ecowatt_core::catalog::RegId;
use ecowatt_core::compression;
use ecowatt_core::fault::NoSleep;
use ecowatt_core::proto::{self, FUNC_READ};
use ecowatt_diagnostics::{Diagnostics, KvStore, ModbusTransport, PartitionWriter, StoreError, TransportError};
use ecowatt_ota::{FIRMWARE_MAGIC, Manifest, OtaKeys, OtaManager, OtaState};
use ecowatt_security::{Keyring, secure, verify};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// Replays EcoWatt's conformance scenarios against in-memory fakes.
#[derive(Debug, Parser)]
#[command(name = "ecowatt-harness")]
#[command(about = "Replays end-to-end scenarios against in-memory fakes")]
struct Cli {
    /// Print the section each scenario exercises alongside its name.
    #[arg(long)]
    verbose: bool,
}

struct Scenario {
    name: &'static str,
    section: &'static str,
    run: fn() -> Result<(), String>,
}

const SCENARIOS: &[Scenario] = &[
    Scenario { name: "three-register poll happy path", section: "scenario 1", run: scenario_poll },
    Scenario {
        name: "stable readings compress and round-trip",
        section: "scenario 2",
        run: scenario_compression,
    },
    Scenario { name: "anti-replay nonce enforcement", section: "scenario 3", run: scenario_anti_replay },
    Scenario { name: "HMAC tamper is rejected", section: "scenario 4", run: scenario_hmac_tamper },
    Scenario { name: "OTA rollback on bad signature", section: "scenario 5", run: scenario_ota_rollback },
    Scenario { name: "OTA resume after simulated crash", section: "scenario 6", run: scenario_ota_resume },
];

fn main() {
    let cli = Cli::parse();
    let mut failures = 0;
    for scenario in SCENARIOS {
        match (scenario.run)() {
            Ok(()) => {
                if cli.verbose {
                    println!("PASS  [{}] {}", scenario.section, scenario.name);
                } else {
                    println!("PASS  {}", scenario.name);
                }
            }
            Err(reason) => {
                failures += 1;
                println!("FAIL  [{}] {}: {reason}", scenario.section, scenario.name);
            }
        }
    }
    println!("\n{}/{} scenarios passed", SCENARIOS.len() - failures, SCENARIOS.len());
    if failures > 0 {
        std::process::exit(1);
    }
}

// --- shared in-memory fakes --------------------------------------------

struct ScriptedGateway {
    responses: std::collections::VecDeque<Result<Vec<u8>, TransportError>>,
}

impl ModbusTransport for ScriptedGateway {
    fn send(&mut self, _frame: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.responses.pop_front().unwrap_or(Err(TransportError::Timeout))
    }
}

fn read_response(words: &[u16]) -> Vec<u8> {
    let mut resp = vec![0x11, FUNC_READ, (words.len() * 2) as u8];
    for w in words {
        resp.extend_from_slice(&w.to_be_bytes());
    }
    let crc = proto::crc16_modbus(&resp);
    resp.push((crc & 0xFF) as u8);
    resp.push((crc >> 8) as u8);
    resp
}

#[derive(Default)]
struct MemStore(HashMap<String, Vec<u8>>);

impl KvStore for MemStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.0.get(key).cloned()
    }
    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.0.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

#[derive(Default)]
struct FakePartition {
    written: Vec<(u32, Vec<u8>)>,
    boot_target_marked: bool,
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
        Ok(())
    }
    fn rollback(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

fn test_rsa_key(seed: u64) -> RsaPrivateKey {
    let mut rng = StdRng::seed_from_u64(seed);
    RsaPrivateKey::new(&mut rng, 2048).expect("key generation")
}

fn build_signed_update(
    plaintext: &[u8],
    chunk_size: usize,
    hmac_key: [u8; 32],
    aes_key: [u8; 16],
    iv: [u8; 16],
    signing_key: &RsaPrivateKey,
    version: &str,
) -> (Manifest, Vec<Vec<u8>>) {
    let digest: [u8; 32] = Sha256::digest(plaintext).into();
    let signature = signing_key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest).expect("signing");

    let mut buf = plaintext.to_vec();
    buf.resize(plaintext.len() + 16, 0);
    let ciphertext = Aes128CbcEnc::new(&aes_key.into(), &iv.into())
        .encrypt_padded_mut::<Pkcs7>(&mut buf, plaintext.len())
        .expect("encrypt")
        .to_vec();

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
        mgr.accept_chunk(next as u32, &chunks[next], next as u64, partition, store).expect("chunk accepted");
    }
}

// --- scenarios -----------------------------------------------------------

fn scenario_poll() -> Result<(), String> {
    let mut gateway = ScriptedGateway {
        responses: [Ok(read_response(&[2300, 150])), Ok(read_response(&[3450]))].into_iter().collect(),
    };
    let mut diag = Diagnostics::new();
    let selection = [RegId::Vac1, RegId::Iac1, RegId::Pac];
    let values = acquisition::poll(&mut gateway, &mut diag, &NoSleep, &selection).map_err(|e| e.to_string())?;
    if values != vec![2300, 150, 3450] {
        return Err(format!("unexpected values: {values:?}"));
    }
    Ok(())
}

fn scenario_compression() -> Result<(), String> {
    let sample = [2400u16, 180, 50, 4200, 70, 600, 70, 35, 100, 1500];
    let values: Vec<u16> = sample.iter().copied().cycle().take(70).collect();
    let frame = compression::compress(&values).map_err(|e| e.to_string())?;
    let raw_len = 1 + values.len() * 2;
    if frame.len() >= raw_len {
        return Err(format!("frame ({} bytes) did not beat raw encoding ({raw_len} bytes)", frame.len()));
    }
    let decoded = compression::decompress(&frame).map_err(|e| e.to_string())?;
    if decoded != values {
        return Err("round-trip mismatch".into());
    }
    Ok(())
}

fn scenario_anti_replay() -> Result<(), String> {
    let keyring = Keyring::new([7u8; 32]);
    let mut store = MemStore::default();
    let envelope = secure(b"payload-a", &keyring, &mut store).map_err(|e| e.to_string())?;
    let mut last_valid = 0u32;
    verify(&envelope, &keyring, &mut last_valid).map_err(|e| e.to_string())?;
    match verify(&envelope, &keyring, &mut last_valid) {
        Err(_) => {}
        Ok(_) => return Err("replay was accepted".into()),
    }

    // A verifier that persists `last_valid_nonce` (e.g. the backend,
    // restarting between requests) must resume above the highest nonce it
    // has already accepted, not just above what the device last issued.
    store.put("security.last_valid_nonce", &last_valid.to_le_bytes()).map_err(|e| e.to_string())?;
    let resume_from = ecowatt_security::restore_nonce(&store);
    if resume_from <= last_valid {
        return Err(format!("restore_nonce resumed at {resume_from}, not above last_valid {last_valid}"));
    }
    Ok(())
}

fn scenario_hmac_tamper() -> Result<(), String> {
    let keyring = Keyring::new([7u8; 32]);
    let mut store = MemStore::default();
    let mut envelope = secure(b"untampered", &keyring, &mut store).map_err(|e| e.to_string())?;
    envelope.mac = "00".repeat(32);
    let mut last_valid = 0u32;
    match verify(&envelope, &keyring, &mut last_valid) {
        Err(_) if last_valid == 0 => Ok(()),
        Err(_) => Err("rejected but last_valid_nonce advanced".into()),
        Ok(_) => Err("tampered MAC was accepted".into()),
    }
}

fn scenario_ota_rollback() -> Result<(), String> {
    let signing_key = test_rsa_key(1);
    let wrong_key = test_rsa_key(2);
    let (hmac_key, aes_key, iv) = ([3u8; 32], [5u8; 16], [7u8; 16]);

    let mut plaintext = vec![FIRMWARE_MAGIC];
    plaintext.extend(std::iter::repeat_n(0xAB, 47));
    let (manifest, chunks) = build_signed_update(&plaintext, 16, hmac_key, aes_key, iv, &signing_key, "v2");

    let keys = OtaKeys { chunk_hmac_key: hmac_key, aes_key, signing_public_key: wrong_key.to_public_key() };
    let mut mgr = OtaManager::new(keys);
    mgr.begin_check();
    mgr.evaluate_check(Some(manifest), "v1");

    let mut partition = FakePartition::default();
    let mut store = MemStore::default();
    download_all(&mut mgr, &chunks, &mut partition, &mut store);

    let mut diagnostics = Diagnostics::new();
    match mgr.finalize(&mut diagnostics, &mut partition) {
        Err(_) if mgr.state() == OtaState::Rollback && !partition.boot_target_marked => Ok(()),
        Err(err) => Err(format!("wrong failure mode: {err}")),
        Ok(()) => Err("bad signature was accepted".into()),
    }
}

fn scenario_ota_resume() -> Result<(), String> {
    let signing_key = test_rsa_key(3);
    let (hmac_key, aes_key, iv) = ([11u8; 32], [13u8; 16], [17u8; 16]);

    let mut plaintext = vec![FIRMWARE_MAGIC];
    plaintext.extend(std::iter::repeat_n(0x42, 996 * 16 + 9));
    let (manifest, chunks) = build_signed_update(&plaintext, 16, hmac_key, aes_key, iv, &signing_key, "v3");

    let keys = OtaKeys { chunk_hmac_key: hmac_key, aes_key, signing_public_key: signing_key.to_public_key() };

    let mut uninterrupted = OtaManager::new(keys.clone());
    uninterrupted.begin_check();
    uninterrupted.evaluate_check(Some(manifest.clone()), "v1");
    let mut partition_a = FakePartition::default();
    let mut store_a = MemStore::default();
    download_all(&mut uninterrupted, &chunks, &mut partition_a, &mut store_a);
    let mut diagnostics_a = Diagnostics::new();
    uninterrupted.finalize(&mut diagnostics_a, &mut partition_a).map_err(|e| e.to_string())?;

    let mut mgr = OtaManager::new(keys.clone());
    mgr.begin_check();
    mgr.evaluate_check(Some(manifest.clone()), "v1");
    let mut partition_b = FakePartition::default();
    let mut store_b = MemStore::default();
    for i in 0..=500u32 {
        mgr.accept_chunk(i, &chunks[i as usize], i as u64, &mut partition_b, &mut store_b)
            .map_err(|e| e.to_string())?;
    }
    if mgr.next_chunk_index() != 501 {
        return Err("manager did not stop at the expected chunk".into());
    }
    drop(mgr); // simulated crash: manager instance dropped, only store/partition persist

    let mut resumed = OtaManager::resume_or_restart(keys, &store_b, manifest);
    if resumed.next_chunk_index() != 501 {
        return Err(format!("resumed at wrong chunk: {}", resumed.next_chunk_index()));
    }
    for i in 501..chunks.len() as u32 {
        resumed
            .accept_chunk(i, &chunks[i as usize], i as u64, &mut partition_b, &mut store_b)
            .map_err(|e| e.to_string())?;
    }
    let mut diagnostics_b = Diagnostics::new();
    resumed.finalize(&mut diagnostics_b, &mut partition_b).map_err(|e| e.to_string())?;

    if partition_a.written != partition_b.written {
        return Err("resumed download diverged from an uninterrupted run".into());
    }
    Ok(())
}
