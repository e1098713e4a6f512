use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use ecowatt_diagnostics::KvStore;

use crate::keyring::Keyring;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

const NONCE_KEY: &str = "security.nonce";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecError {
    #[error("nonce {got} is not greater than last valid nonce {last_valid}")]
    ReplayDetected { got: u32, last_valid: u32 },
    #[error("HMAC verification failed")]
    MacMismatch,
    #[error("envelope is malformed: {0}")]
    MalformedEnvelope(String),
    #[error("key material unavailable")]
    KeyUnavailable,
}

/// The secured envelope (§4.6's wire shape): a nonce, the encoded payload,
/// and the authenticating MAC.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Envelope {
    pub nonce: u32,
    pub payload: String,
    pub mac: String,
    pub encrypted: bool,
}

fn mac_over(hmac_key: &[u8; 32], nonce: u32, payload: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(hmac_key).expect("HMAC accepts any key length");
    mac.update(&nonce.to_be_bytes());
    mac.update(payload);
    mac.finalize().into_bytes().into()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn load_nonce(store: &dyn KvStore) -> u32 {
    store
        .get(NONCE_KEY)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u32::from_le_bytes)
        .unwrap_or(0)
}

/// Reads `security.nonce` and `security.last_valid_nonce`, returning the
/// value the nonce counter should resume from after a reboot.
pub fn restore_nonce(store: &dyn KvStore) -> u32 {
    let persisted = load_nonce(store);
    let last_valid = store
        .get("security.last_valid_nonce")
        .and_then(|bytes| bytes.try_into().ok())
        .map(u32::from_le_bytes)
        .unwrap_or(0);
    persisted.max(last_valid) + 1
}

/// Builds a secured envelope around `payload`. Increments and persists the
/// nonce counter before the envelope is assembled, so every call — even one
/// that later fails to be sent — consumes a distinct nonce.
pub fn secure(payload: &[u8], keyring: &Keyring, store: &mut dyn KvStore) -> Result<Envelope, SecError> {
    let current = load_nonce(store);
    let nonce = current + 1;
    store
        .put(NONCE_KEY, &nonce.to_le_bytes())
        .map_err(|_| SecError::MalformedEnvelope("nonce persistence failed".into()))?;

    let encoded_bytes = match keyring.aes_key() {
        Some(aes_key) => {
            let iv = keyring.iv().ok_or(SecError::KeyUnavailable)?;
            let mut buf = vec![0u8; payload.len() + 16];
            buf[..payload.len()].copy_from_slice(payload);
            let ct = Aes128CbcEnc::new(aes_key.into(), iv.into())
                .encrypt_padded_mut::<Pkcs7>(&mut buf, payload.len())
                .map_err(|e| SecError::MalformedEnvelope(e.to_string()))?;
            ct.to_vec()
        }
        None => payload.to_vec(),
    };
    let payload_b64 = BASE64.encode(&encoded_bytes);

    let mac = mac_over(keyring.hmac_key(), nonce, payload_b64.as_bytes());

    Ok(Envelope {
        nonce,
        payload: payload_b64,
        mac: hex::encode(mac),
        encrypted: keyring.encrypted(),
    })
}

/// Verifies and decodes a secured envelope. Rejects replays (nonce not
/// strictly greater than `last_valid_nonce`) and tampered payloads (MAC
/// mismatch) without mutating `last_valid_nonce` in either case.
pub fn verify(envelope: &Envelope, keyring: &Keyring, last_valid_nonce: &mut u32) -> Result<Vec<u8>, SecError> {
    if envelope.nonce <= *last_valid_nonce {
        return Err(SecError::ReplayDetected {
            got: envelope.nonce,
            last_valid: *last_valid_nonce,
        });
    }

    let expected = mac_over(keyring.hmac_key(), envelope.nonce, envelope.payload.as_bytes());
    let given = hex::decode(&envelope.mac).map_err(|e| SecError::MalformedEnvelope(e.to_string()))?;
    if !constant_time_eq(&expected, &given) {
        return Err(SecError::MacMismatch);
    }

    let encoded_bytes = BASE64
        .decode(&envelope.payload)
        .map_err(|e| SecError::MalformedEnvelope(e.to_string()))?;

    let plaintext = if envelope.encrypted {
        let aes_key = keyring.aes_key().ok_or(SecError::KeyUnavailable)?;
        let iv = keyring.iv().ok_or(SecError::KeyUnavailable)?;
        let mut buf = encoded_bytes;
        Aes128CbcDec::new(aes_key.into(), iv.into())
            .decrypt_padded_mut::<Pkcs7>(&mut buf)
            .map_err(|e| SecError::MalformedEnvelope(e.to_string()))?
            .to_vec()
    } else {
        encoded_bytes
    };

    *last_valid_nonce = envelope.nonce;
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

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

    fn test_keyring() -> Keyring {
        Keyring::new([7u8; 32])
    }

    #[test]
    fn secure_then_verify_round_trip() {
        let keyring = test_keyring();
        let mut store = MemStore(HashMap::new());
        let envelope = secure(b"hello device", &keyring, &mut store).unwrap();
        assert_eq!(envelope.nonce, 1);

        let mut last_valid = 0u32;
        let out = verify(&envelope, &keyring, &mut last_valid).unwrap();
        assert_eq!(out, b"hello device");
        assert_eq!(last_valid, 1);
    }

    #[test]
    fn anti_replay_scenario() {
        // Start with persisted nonce=100.
        let keyring = test_keyring();
        let mut store = MemStore(HashMap::new());
        store.put("security.nonce", &100u32.to_le_bytes()).unwrap();

        let envelope_a = secure(b"payload-a", &keyring, &mut store).unwrap();
        assert_eq!(envelope_a.nonce, 101);

        let mut last_valid = 0u32;
        verify(&envelope_a, &keyring, &mut last_valid).unwrap();
        assert_eq!(last_valid, 101);

        let replay = verify(&envelope_a, &keyring, &mut last_valid);
        assert_eq!(
            replay,
            Err(SecError::ReplayDetected {
                got: 101,
                last_valid: 101
            })
        );
        assert_eq!(last_valid, 101);

        let envelope_b = secure(b"payload-b", &keyring, &mut store).unwrap();
        assert_eq!(envelope_b.nonce, 102);
        verify(&envelope_b, &keyring, &mut last_valid).unwrap();
        assert_eq!(last_valid, 102);
    }

    #[test]
    fn hmac_tamper_is_rejected_without_advancing_last_valid() {
        let keyring = test_keyring();
        let mut store = MemStore(HashMap::new());
        let mut envelope = secure(b"untampered", &keyring, &mut store).unwrap();

        // flip one bit in the payload
        let mut raw = BASE64.decode(&envelope.payload).unwrap();
        raw[0] ^= 0x01;
        envelope.payload = BASE64.encode(&raw);

        let mut last_valid = 0u32;
        let result = verify(&envelope, &keyring, &mut last_valid);
        assert_eq!(result, Err(SecError::MacMismatch));
        assert_eq!(last_valid, 0);
    }

    #[test]
    fn encrypted_round_trip() {
        let keyring = Keyring::with_encryption([9u8; 32], [1u8; 16], [2u8; 16]);
        let mut store = MemStore(HashMap::new());
        let envelope = secure(b"solar-panel-telemetry", &keyring, &mut store).unwrap();
        assert!(envelope.encrypted);

        let mut last_valid = 0u32;
        let out = verify(&envelope, &keyring, &mut last_valid).unwrap();
        assert_eq!(out, b"solar-panel-telemetry");
    }

    #[test]
    fn nonce_restoration_takes_the_larger_persisted_value() {
        let mut store = MemStore(HashMap::new());
        store.put("security.nonce", &50u32.to_le_bytes()).unwrap();
        store
            .put("security.last_valid_nonce", &75u32.to_le_bytes())
            .unwrap();
        assert_eq!(restore_nonce(&store), 76);
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn nonces_are_strictly_monotonic(payloads in proptest::collection::vec(proptest::collection::vec(proptest::num::u8::ANY, 0..32), 1..20)) {
            let keyring = test_keyring();
            let mut store = MemStore(HashMap::new());
            let mut prev = 0u32;
            for payload in payloads {
                let envelope = secure(&payload, &keyring, &mut store).unwrap();
                prop_assert!(envelope.nonce > prev);
                prev = envelope.nonce;
            }
        }

        #[test]
        fn accepted_nonce_rejects_all_replays(payload in proptest::collection::vec(proptest::num::u8::ANY, 0..32)) {
            let keyring = test_keyring();
            let mut store = MemStore(HashMap::new());
            let envelope = secure(&payload, &keyring, &mut store).unwrap();
            let mut last_valid = 0u32;
            verify(&envelope, &keyring, &mut last_valid).unwrap();
            let replay = verify(&envelope, &keyring, &mut last_valid);
            prop_assert!(replay.is_err());
        }
    }
}
