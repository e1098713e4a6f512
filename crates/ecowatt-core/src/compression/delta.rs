//! DELTA encoder (§4.5, §6.4): first value raw, then signed deltas packed
//! at the smallest width in `{4, 8, 12, 16}` bits that fits every delta.

use super::bits::{BitWriter, BitReader, min_signed_width, sign_extend};

pub const TAG: u8 = 1;

pub fn name() -> &'static str {
    "DELTA"
}

/// `None` when the batch is empty — DELTA needs a base value and is not
/// applicable; the selector falls through to another encoder.
pub fn encode(values: &[u16]) -> Option<Vec<u8>> {
    let (&base, rest) = values.split_first()?;
    let deltas: Vec<i32> = rest
        .iter()
        .zip(values.iter())
        .map(|(&cur, &prev)| i32::from(cur) - i32::from(prev))
        .collect();
    let width = min_signed_width(&deltas);

    let mut out = Vec::new();
    out.push(TAG);
    out.extend_from_slice(&(values.len() as u16).to_be_bytes());
    out.extend_from_slice(&base.to_be_bytes());
    out.push(width);

    let mut writer = BitWriter::new();
    for d in deltas {
        writer.write_bits((d as u32) & mask(width), width);
    }
    out.extend_from_slice(&writer.into_bytes());
    Some(out)
}

fn mask(width: u8) -> u32 {
    if width >= 32 { u32::MAX } else { (1u32 << width) - 1 }
}

pub fn decode(body: &[u8]) -> Option<Vec<u16>> {
    let len = u16::from_be_bytes(body.get(0..2)?.try_into().ok()?) as usize;
    let base = u16::from_be_bytes(body.get(2..4)?.try_into().ok()?);
    let width = *body.get(4)?;
    if len == 0 {
        return Some(Vec::new());
    }

    let mut out = Vec::with_capacity(len);
    out.push(base);
    let mut reader = BitReader::new(body.get(5..)?);
    let mut prev = i32::from(base);
    for _ in 1..len {
        let raw = reader.read_bits(width)?;
        let delta = sign_extend(raw, width);
        prev += delta;
        out.push(u16::try_from(prev).ok()?);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_small_deltas() {
        let values = [100u16, 102, 101, 105, 104];
        let encoded = encode(&values).unwrap();
        assert_eq!(decode(&encoded[1..]).unwrap(), values);
    }

    #[test]
    fn empty_input_is_not_applicable() {
        assert!(encode(&[]).is_none());
    }

    #[test]
    fn single_value_round_trips() {
        let encoded = encode(&[42]).unwrap();
        assert_eq!(decode(&encoded[1..]).unwrap(), vec![42]);
    }
}
