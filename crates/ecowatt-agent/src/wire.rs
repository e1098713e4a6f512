//! JSON bodies exchanged with the backend (§6.2). Kept separate from the
//! component crates since these shapes are the agent's own wiring, not
//! part of any one component's contract.

use ecowatt_ota::Manifest;

#[derive(Debug, serde::Serialize)]
pub struct AggregatedItem {
    pub sample_count: usize,
    pub enqueued_at_ms: u64,
    pub frame_b64: String,
}

#[derive(Debug, serde::Serialize)]
pub struct AggregatedPayload {
    pub aggregated_data: Vec<AggregatedItem>,
}

#[derive(Debug, serde::Deserialize)]
pub struct OtaCheckResponse {
    pub update_available: bool,
    pub update_info: Option<Manifest>,
}
