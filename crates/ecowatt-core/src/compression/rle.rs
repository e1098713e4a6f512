//! RLE encoder (§4.5, §6.4): runs of equal values as `(value:u16,
//! count:u8|0xFF+u16)`.

pub const TAG: u8 = 2;
const ESCAPE: u8 = 0xFF;

pub fn name() -> &'static str {
    "RLE"
}

pub fn encode(values: &[u16]) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(TAG);
    out.extend_from_slice(&(values.len() as u16).to_be_bytes());

    let mut i = 0;
    while i < values.len() {
        let value = values[i];
        let mut count: u32 = 1;
        while i + (count as usize) < values.len() && values[i + count as usize] == value {
            count += 1;
        }
        out.extend_from_slice(&value.to_be_bytes());
        if count < ESCAPE as u32 {
            out.push(count as u8);
        } else {
            out.push(ESCAPE);
            out.extend_from_slice(&(count as u16).to_be_bytes());
        }
        i += count as usize;
    }
    out
}

pub fn decode(body: &[u8]) -> Option<Vec<u16>> {
    let len = u16::from_be_bytes(body.get(0..2)?.try_into().ok()?) as usize;
    let mut out = Vec::with_capacity(len);
    let mut pos = 2;
    while out.len() < len {
        let value = u16::from_be_bytes(body.get(pos..pos + 2)?.try_into().ok()?);
        pos += 2;
        let first_count_byte = *body.get(pos)?;
        pos += 1;
        let count = if first_count_byte == ESCAPE {
            let c = u16::from_be_bytes(body.get(pos..pos + 2)?.try_into().ok()?);
            pos += 2;
            c as usize
        } else {
            first_count_byte as usize
        };
        out.extend(std::iter::repeat_n(value, count));
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_runs_with_and_without_escape() {
        let mut values = vec![7u16; 300];
        values.extend(vec![9u16; 2]);
        let encoded = encode(&values);
        assert_eq!(decode(&encoded[1..]).unwrap(), values);
    }
}
