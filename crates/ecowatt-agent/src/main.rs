//! Device-side EcoWatt agent: wires C1–C9 into the cooperative main loop
//! (§5) using file-backed stand-ins for the NVS, dual flash partitions,
//! and HTTP transports the spec keeps out of scope.

mod config;
mod partition;
mod store;
mod transport;
mod wire;

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::Parser;
use rand::SeedableRng;
use rand::rngs::StdRng;

use ecowatt_core::acquisition;
use ecowatt_core::buffer::{Entry, RingBuffer};
use ecowatt_core::compression;
use ecowatt_core::fault::ThreadSleep;
use ecowatt_core::logger::{Level, Logger, StderrSink};
use ecowatt_diagnostics::{Clock, Diagnostics, HttpTransport, KvStore, Scheduler, SystemClock, Task};
use ecowatt_ota::{OtaKeys, OtaManager, OtaState};
use ecowatt_security::{Keyring, secure};

use config::{AgentConfig, ConfigCheckResponse};
use partition::FilePartitionWriter;
use store::FileKvStore;
use transport::{SimulatedBackend, SimulatedGateway};
use wire::{AggregatedItem, AggregatedPayload, OtaCheckResponse};

const AGENT_VERSION: &str = "1.0.0";

/// Device-side EcoWatt agent.
#[derive(Debug, Parser)]
#[command(name = "ecowatt-agent")]
#[command(about = "Polls, buffers, compresses, secures, and uploads inverter telemetry; applies signed OTA updates")]
struct Cli {
    /// Device configuration JSON (falls back to built-in defaults if absent).
    #[arg(long, default_value = "ecowatt.json")]
    config: PathBuf,
    /// Persisted key/value store file (nonce, OTA progress, counters).
    #[arg(long, default_value = "ecowatt-state.json")]
    state: PathBuf,
    /// Flash partition A image.
    #[arg(long, default_value = "ecowatt-partition-a.bin")]
    partition_a: PathBuf,
    /// Flash partition B image.
    #[arg(long, default_value = "ecowatt-partition-b.bin")]
    partition_b: PathBuf,
    /// Main loop tick resolution.
    #[arg(long, default_value_t = 50)]
    tick_ms: u64,
    /// Stop after this many ticks instead of running forever.
    #[arg(long)]
    max_ticks: Option<u64>,
}

fn main() {
    let cli = Cli::parse();
    let level = std::env::var("ECOWATT_LOG_LEVEL")
        .map(|v| Level::from_str_loose(&v))
        .unwrap_or(Level::Info);
    let mut logger = Logger::new(level, StderrSink);

    let config = match AgentConfig::load_or_default(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            ecowatt_core::log_at!(logger, Level::Error, "agent", "failed to load config: {err}");
            std::process::exit(1);
        }
    };

    let mut store = FileKvStore::open(&cli.state);
    let mut gateway = SimulatedGateway::default();
    let mut backend = SimulatedBackend;
    let mut partition_a = FilePartitionWriter::open(&cli.partition_a);
    let mut partition_b = FilePartitionWriter::open(&cli.partition_b);
    let mut diagnostics = Diagnostics::new();
    let mut buffer = RingBuffer::new(128);

    let keyring = Keyring::new(load_or_init_hmac_key(&mut store));
    let ota_keys = load_or_init_ota_keys(&mut store);
    let mut ota = OtaManager::new(ota_keys);
    let mut active_partition_is_a = store.get("ota.active_partition").as_deref() != Some(b"b");

    let mut active_registers = config.active_registers.clone();
    let now = SystemClock.now();
    let mut scheduler = Scheduler::new(
        now,
        config.poll_period(),
        config.upload_period(),
        config.config_period(),
        config.ota_period(),
    );

    ecowatt_core::log_at!(
        logger,
        Level::Info,
        "agent",
        "starting device {} with {} active registers",
        config.device_id,
        active_registers.len()
    );

    let mut ticks = 0u64;
    loop {
        scheduler.tick(SystemClock.now());
        while let Some(task) = scheduler.next_ready() {
            match task {
                Task::Poll => handle_poll(
                    &mut gateway,
                    &mut diagnostics,
                    &mut buffer,
                    &active_registers,
                    &mut logger,
                ),
                Task::Upload => handle_upload(
                    &mut backend,
                    &mut buffer,
                    &keyring,
                    &mut store,
                    &config.device_id,
                    &mut logger,
                ),
                Task::ConfigCheck => handle_config_check(
                    &mut backend,
                    &config.device_id,
                    &mut scheduler,
                    &mut active_registers,
                    &mut logger,
                ),
                Task::OtaCheck => handle_ota_check(
                    &mut backend,
                    &mut ota,
                    &mut scheduler,
                    &mut store,
                    &mut diagnostics,
                    &mut active_partition_is_a,
                    &mut partition_a,
                    &mut partition_b,
                    &config.device_id,
                    &mut logger,
                ),
            }
        }

        if let Some(err) = ota.check_stall(now_ms()).err() {
            ecowatt_core::log_at!(logger, Level::Warn, "ota", "stalled: {err}");
            scheduler.resume_all();
        }

        ticks += 1;
        if cli.max_ticks.is_some_and(|max| ticks >= max) {
            break;
        }
        thread::sleep(Duration::from_millis(cli.tick_ms));
    }

    ecowatt_core::log_at!(logger, Level::Info, "agent", "stopping after {ticks} ticks");
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn load_or_init_hmac_key(store: &mut dyn KvStore) -> [u8; 32] {
    if let Some(bytes) = store.get("security.psk_hmac")
        && let Ok(key) = bytes.try_into()
    {
        return key;
    }
    let mut rng = StdRng::seed_from_u64(now_ms());
    let key: [u8; 32] = std::array::from_fn(|_| rand::Rng::r#gen(&mut rng));
    let _ = store.put("security.psk_hmac", &key);
    key
}

fn load_or_init_ota_keys(store: &mut dyn KvStore) -> OtaKeys {
    use rsa::RsaPrivateKey;

    let aes_key = if let Some(bytes) = store.get("security.psk_aes") {
        bytes.try_into().unwrap_or([0u8; 16])
    } else {
        let mut rng = StdRng::seed_from_u64(now_ms().wrapping_add(1));
        let key: [u8; 16] = std::array::from_fn(|_| rand::Rng::r#gen(&mut rng));
        let _ = store.put("security.psk_aes", &key);
        key
    };
    let chunk_hmac_key = if let Some(bytes) = store.get("ota.chunk_hmac_key") {
        bytes.try_into().unwrap_or([0u8; 32])
    } else {
        let mut rng = StdRng::seed_from_u64(now_ms().wrapping_add(2));
        let key: [u8; 32] = std::array::from_fn(|_| rand::Rng::r#gen(&mut rng));
        let _ = store.put("ota.chunk_hmac_key", &key);
        key
    };

    // Provisioning of the backend's real RSA-2048 signing public key is
    // out of scope (it would be burned into the device at manufacture
    // time); a throwaway keypair is generated here so the verify path is
    // exercisable, at the cost of never accepting a real signed update.
    let mut rng = StdRng::seed_from_u64(now_ms().wrapping_add(3));
    let throwaway = RsaPrivateKey::new(&mut rng, 2048).expect("key generation");
    let signing_public_key = throwaway.to_public_key();

    OtaKeys { chunk_hmac_key, aes_key, signing_public_key }
}

#[allow(clippy::too_many_arguments)]
fn handle_poll(
    gateway: &mut SimulatedGateway,
    diagnostics: &mut Diagnostics,
    buffer: &mut RingBuffer,
    selection: &[ecowatt_core::catalog::RegId],
    logger: &mut Logger<StderrSink>,
) {
    match acquisition::poll(gateway, diagnostics, &ThreadSleep, selection) {
        Ok(values) => {
            let mut frame = Vec::with_capacity(values.len() * 2);
            for v in &values {
                frame.extend_from_slice(&v.to_be_bytes());
            }
            buffer.push(Entry { frame, sample_count: values.len(), enqueued_at_ms: now_ms() });
            ecowatt_core::log_at!(logger, Level::Debug, "acq", "polled {} registers", values.len());
        }
        Err(err) => ecowatt_core::log_at!(logger, Level::Warn, "acq", "poll failed: {err}"),
    }
}

fn handle_upload(
    backend: &mut SimulatedBackend,
    buffer: &mut RingBuffer,
    keyring: &Keyring,
    store: &mut FileKvStore,
    device_id: &str,
    logger: &mut Logger<StderrSink>,
) {
    if buffer.empty() {
        return;
    }
    let entries = buffer.drain_all();
    let mut aggregated_data = Vec::with_capacity(entries.len());
    for entry in entries {
        let values: Vec<u16> =
            entry.frame.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect();
        let compressed = match compression::compress(&values) {
            Ok(frame) => frame,
            Err(err) => {
                ecowatt_core::log_at!(logger, Level::Warn, "upload", "skipping batch: {err}");
                continue;
            }
        };
        aggregated_data.push(AggregatedItem {
            sample_count: entry.sample_count,
            enqueued_at_ms: entry.enqueued_at_ms,
            frame_b64: base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &compressed),
        });
    }

    let body = match serde_json::to_vec(&AggregatedPayload { aggregated_data }) {
        Ok(body) => body,
        Err(err) => {
            ecowatt_core::log_at!(logger, Level::Error, "upload", "serialization failed: {err}");
            return;
        }
    };
    let envelope = match secure(&body, keyring, store) {
        Ok(envelope) => envelope,
        Err(err) => {
            ecowatt_core::log_at!(logger, Level::Error, "upload", "envelope build failed: {err}");
            return;
        }
    };
    let envelope_bytes = serde_json::to_vec(&envelope).expect("envelope always serializes");
    match backend.post(&format!("/aggregated/{device_id}"), &envelope_bytes) {
        Ok(_) => ecowatt_core::log_at!(logger, Level::Success, "upload", "uploaded nonce={}", envelope.nonce),
        Err(err) => ecowatt_core::log_at!(logger, Level::Warn, "upload", "upload failed: {err}"),
    }
}

fn handle_config_check(
    backend: &mut SimulatedBackend,
    device_id: &str,
    scheduler: &mut Scheduler,
    active_registers: &mut Vec<ecowatt_core::catalog::RegId>,
    logger: &mut Logger<StderrSink>,
) {
    let Ok(body) = backend.get(&format!("/config/{device_id}/check")) else {
        ecowatt_core::log_at!(logger, Level::Warn, "config", "config check request failed");
        return;
    };
    let Ok(response) = serde_json::from_slice::<ConfigCheckResponse>(&body) else {
        ecowatt_core::log_at!(logger, Level::Warn, "config", "malformed config response");
        return;
    };
    if let Some(new_config) = response.new_config.filter(|_| response.config_changed) {
        scheduler.set_period(Task::Poll, Duration::from_micros(new_config.poll_period_us));
        scheduler.set_period(Task::Upload, Duration::from_micros(new_config.upload_period_us));
        *active_registers = new_config.active_registers;
        ecowatt_core::log_at!(logger, Level::Info, "config", "applied new configuration from backend");
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_ota_check(
    backend: &mut SimulatedBackend,
    ota: &mut OtaManager,
    scheduler: &mut Scheduler,
    store: &mut FileKvStore,
    diagnostics: &mut Diagnostics,
    active_partition_is_a: &mut bool,
    partition_a: &mut FilePartitionWriter,
    partition_b: &mut FilePartitionWriter,
    device_id: &str,
    logger: &mut Logger<StderrSink>,
) {
    ota.begin_check();
    let Ok(body) = backend.get(&format!("/ota/check/{device_id}?version={AGENT_VERSION}")) else {
        ecowatt_core::log_at!(logger, Level::Warn, "ota", "update check request failed");
        return;
    };
    let Ok(response) = serde_json::from_slice::<OtaCheckResponse>(&body) else {
        ecowatt_core::log_at!(logger, Level::Warn, "ota", "malformed update-check response");
        return;
    };
    ota.evaluate_check(response.update_available.then_some(response.update_info).flatten(), AGENT_VERSION);

    if ota.state() == OtaState::Downloading {
        scheduler.pause(Task::Poll);
        scheduler.pause(Task::Upload);
        *active_partition_is_a = !*active_partition_is_a;
        let target: &mut FilePartitionWriter = if *active_partition_is_a { partition_a } else { partition_b };

        let index = ota.next_chunk_index();
        let Ok(chunk) = backend.get(&format!("/ota/download/{device_id}/{index}")) else {
            ecowatt_core::log_at!(logger, Level::Warn, "ota", "chunk {index} fetch failed");
            return;
        };
        if let Err(err) = ota.accept_chunk(index, &chunk, now_ms(), target, store) {
            ecowatt_core::log_at!(logger, Level::Error, "ota", "chunk {index} rejected: {err}");
        }
    }

    if ota.state() == OtaState::Verifying {
        let target: &mut FilePartitionWriter = if *active_partition_is_a { partition_a } else { partition_b };
        match ota.finalize(diagnostics, target) {
            Ok(()) => {
                let _ = store.put("ota.active_partition", if *active_partition_is_a { b"a" } else { b"b" });
                ecowatt_core::log_at!(logger, Level::Success, "ota", "update applied, awaiting boot confirmation");
            }
            Err(err) => ecowatt_core::log_at!(logger, Level::Error, "ota", "update rejected: {err}"),
        }
        scheduler.resume_all();
    }
}
