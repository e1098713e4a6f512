//! Nonce-anchored HMAC-SHA256 envelope for outbound telemetry and inbound
//! commands.
//!
//! `secure` and `verify` are symmetric: the same envelope shape authenticates
//! uploads leaving the device and commands arriving from the backend. The
//! only persisted, ever-incrementing state is the nonce pair
//! (`nonce`, `last_valid_nonce`); everything else is recomputed per call.

#![deny(unsafe_code)]

mod envelope;
mod keyring;

pub use envelope::{Envelope, SecError, restore_nonce, secure, verify};
pub use keyring::Keyring;
