//! DICT encoder (§4.5, §6.4): a table of up to 16 distinct values plus a
//! 4-bit index per sample. Skipped when the batch has more than 16
//! distinct values.

use super::bits::{BitReader, BitWriter};

pub const TAG: u8 = 3;
const MAX_DICT_SIZE: usize = 16;

pub fn name() -> &'static str {
    "DICT"
}

pub fn encode(values: &[u16]) -> Option<Vec<u8>> {
    if values.is_empty() {
        return None;
    }

    let mut dict: Vec<u16> = Vec::new();
    for &v in values {
        if !dict.contains(&v) {
            if dict.len() == MAX_DICT_SIZE {
                return None;
            }
            dict.push(v);
        }
    }

    let mut out = Vec::new();
    out.push(TAG);
    out.extend_from_slice(&(values.len() as u16).to_be_bytes());
    out.push(dict.len() as u8);
    for &v in &dict {
        out.extend_from_slice(&v.to_be_bytes());
    }

    let mut writer = BitWriter::new();
    for &v in values {
        let index = dict.iter().position(|&d| d == v).expect("value registered above") as u32;
        writer.write_bits(index, 4);
    }
    out.extend_from_slice(&writer.into_bytes());
    Some(out)
}

pub fn decode(body: &[u8]) -> Option<Vec<u16>> {
    let len = u16::from_be_bytes(body.get(0..2)?.try_into().ok()?) as usize;
    let dict_size = *body.get(2)? as usize;
    if dict_size > MAX_DICT_SIZE {
        return None;
    }
    let table_end = 3 + dict_size * 2;
    let dict: Vec<u16> = body
        .get(3..table_end)?
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();

    let mut reader = BitReader::new(body.get(table_end..)?);
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        let index = reader.read_bits(4)? as usize;
        out.push(*dict.get(index)?);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_small_alphabet() {
        let values = [1u16, 2, 3, 1, 2, 1, 3, 3];
        let encoded = encode(&values).unwrap();
        assert_eq!(decode(&encoded[1..]).unwrap(), values);
    }

    #[test]
    fn skipped_beyond_sixteen_distinct_values() {
        let values: Vec<u16> = (0..17).collect();
        assert!(encode(&values).is_none());
    }
}
