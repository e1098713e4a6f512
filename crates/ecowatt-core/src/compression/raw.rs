//! RAW encoder (§4.5, §6.4): tag + big-endian words. The correctness
//! fallback every other encoder must beat to be selected.

pub const TAG: u8 = 0;

pub fn name() -> &'static str {
    "RAW"
}

pub fn encode(values: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + values.len() * 2);
    out.push(TAG);
    out.extend_from_slice(&(values.len() as u16).to_be_bytes());
    for &v in values {
        out.extend_from_slice(&v.to_be_bytes());
    }
    out
}

pub fn decode(body: &[u8]) -> Option<Vec<u16>> {
    let len = u16::from_be_bytes(body.get(0..2)?.try_into().ok()?) as usize;
    let data = body.get(2..2 + len * 2)?;
    Some(data.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect())
}
