//! BITPACK encoder (§4.5, §6.4): every value packed to
//! `ceil(log2(max(X)+1))` bits. The floor encoder when deltas don't help
//! (e.g. random noise).

use super::bits::{BitReader, BitWriter};

pub const TAG: u8 = 4;

pub fn name() -> &'static str {
    "BITPACK"
}

fn width_for_max(max: u32) -> u8 {
    if max == 0 { 0 } else { 32 - max.leading_zeros() as u8 }
}

pub fn encode(values: &[u16]) -> Option<Vec<u8>> {
    if values.is_empty() {
        return None;
    }
    let max = values.iter().copied().map(u32::from).max().unwrap_or(0);
    let width = width_for_max(max);

    let mut out = Vec::new();
    out.push(TAG);
    out.extend_from_slice(&(values.len() as u16).to_be_bytes());
    out.push(width);

    let mut writer = BitWriter::new();
    for &v in values {
        writer.write_bits(u32::from(v), width);
    }
    out.extend_from_slice(&writer.into_bytes());
    Some(out)
}

pub fn decode(body: &[u8]) -> Option<Vec<u16>> {
    let len = u16::from_be_bytes(body.get(0..2)?.try_into().ok()?) as usize;
    let width = *body.get(2)?;
    let mut reader = BitReader::new(body.get(3..)?);
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        let raw = reader.read_bits(width)?;
        out.push(u16::try_from(raw).ok()?);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_noise() {
        let values = [5u16, 60000, 1, 32768, 999];
        let encoded = encode(&values).unwrap();
        assert_eq!(decode(&encoded[1..]).unwrap(), values);
    }

    #[test]
    fn all_zero_uses_zero_width() {
        let values = [0u16; 8];
        let encoded = encode(&values).unwrap();
        assert_eq!(encoded[3], 0); // width byte
        assert_eq!(decode(&encoded[1..]).unwrap(), values);
    }
}
