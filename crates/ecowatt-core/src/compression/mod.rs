//! Compression engine (C5, §4.5). Encodes a `u16` sequence into a
//! self-describing byte frame, picking whichever of four encoders (plus a
//! RAW fallback) produces the smallest output, with bit-accurate
//! round-trip guaranteed for every encoder.

mod bits;
mod bitpack;
mod delta;
mod dict;
mod raw;
mod rle;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompressionError {
    #[error("input has {0} samples, exceeding the 65535 frame limit")]
    InputTooLong(usize),
    #[error("frame is malformed or truncated")]
    MalformedFrame,
}

/// The encoding method a frame was tagged with (§6.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Raw,
    Delta,
    Rle,
    Dict,
    Bitpack,
}

impl Method {
    pub fn name(self) -> &'static str {
        match self {
            Method::Raw => raw::name(),
            Method::Delta => delta::name(),
            Method::Rle => rle::name(),
            Method::Dict => dict::name(),
            Method::Bitpack => bitpack::name(),
        }
    }
}

/// One candidate considered by the selector, kept around for
/// observability (§4.5's "benchmark obligations").
#[derive(Debug, Clone)]
pub struct Candidate {
    pub method: Method,
    pub bytes: usize,
}

/// The selector's full report: every applicable candidate plus the
/// winner. `ecowatt-bench` uses this to report per-encoder size.
#[derive(Debug, Clone)]
pub struct SelectionReport {
    pub candidates: Vec<Candidate>,
    pub chosen: Method,
}

/// Preference order for ties: earlier wins (§4.5).
const PREFERENCE: [Method; 5] = [Method::Delta, Method::Dict, Method::Rle, Method::Bitpack, Method::Raw];

fn encode_all(values: &[u16]) -> Vec<(Method, Vec<u8>)> {
    let mut out = Vec::new();
    if let Some(frame) = delta::encode(values) {
        out.push((Method::Delta, frame));
    }
    if let Some(frame) = dict::encode(values) {
        out.push((Method::Dict, frame));
    }
    out.push((Method::Rle, rle::encode(values)));
    if let Some(frame) = bitpack::encode(values) {
        out.push((Method::Bitpack, frame));
    }
    out.push((Method::Raw, raw::encode(values)));
    out
}

/// Run every applicable encoder and report the smallest, breaking ties by
/// [`PREFERENCE`] order. §8's boundary cases (`N == 0` / `N == 1` always
/// choose RAW) are handled before the general size comparison.
pub fn select(values: &[u16]) -> SelectionReport {
    if values.len() <= 1 {
        let frame = raw::encode(values);
        return SelectionReport {
            candidates: vec![Candidate { method: Method::Raw, bytes: frame.len() }],
            chosen: Method::Raw,
        };
    }

    let encoded = encode_all(values);
    let candidates: Vec<Candidate> =
        encoded.iter().map(|(m, f)| Candidate { method: *m, bytes: f.len() }).collect();

    let chosen = PREFERENCE
        .iter()
        .filter_map(|pref| encoded.iter().find(|(m, _)| m == pref))
        .min_by_key(|(m, f)| (f.len(), PREFERENCE.iter().position(|p| p == m).unwrap()))
        .map(|(m, _)| *m)
        .unwrap_or(Method::Raw);

    SelectionReport { candidates, chosen }
}

/// Compress `values` into a self-describing frame (§4.5, §6.4).
pub fn compress(values: &[u16]) -> Result<Vec<u8>, CompressionError> {
    if values.len() > u16::MAX as usize {
        return Err(CompressionError::InputTooLong(values.len()));
    }
    let report = select(values);
    let frame = match report.chosen {
        Method::Raw => raw::encode(values),
        Method::Delta => delta::encode(values).expect("selector only chose an applicable encoder"),
        Method::Rle => rle::encode(values),
        Method::Dict => dict::encode(values).expect("selector only chose an applicable encoder"),
        Method::Bitpack => bitpack::encode(values).expect("selector only chose an applicable encoder"),
    };
    Ok(frame)
}

/// Decompress a self-describing frame back to the exact original `u16`
/// sequence (§4.5's round-trip contract).
pub fn decompress(frame: &[u8]) -> Result<Vec<u16>, CompressionError> {
    let (&tag, body) = frame.split_first().ok_or(CompressionError::MalformedFrame)?;
    let decoded = match tag {
        t if t == raw::TAG => raw::decode(body),
        t if t == delta::TAG => delta::decode(body),
        t if t == rle::TAG => rle::decode(body),
        t if t == dict::TAG => dict::decode(body),
        t if t == bitpack::TAG => bitpack::decode(body),
        _ => None,
    };
    decoded.ok_or(CompressionError::MalformedFrame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_batch_round_trips() {
        let frame = compress(&[]).unwrap();
        assert_eq!(frame[0], raw::TAG);
        assert_eq!(decompress(&frame).unwrap(), Vec::<u16>::new());
    }

    #[test]
    fn singleton_batch_always_chooses_raw() {
        for v in [0u16, 1, 65535] {
            let report = select(&[v]);
            assert_eq!(report.chosen, Method::Raw);
            let frame = compress(&[v]).unwrap();
            assert_eq!(frame[0], raw::TAG);
            assert_eq!(decompress(&frame).unwrap(), vec![v]);
        }
    }

    #[test]
    fn all_equal_batch_chooses_rle() {
        let values = vec![42u16; 70];
        let report = select(&values);
        assert_eq!(report.chosen, Method::Rle);
    }

    #[test]
    fn selector_never_loses_to_raw() {
        let batches: [&[u16]; 4] = [
            &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10],
            &[100; 50],
            &[1, 1, 1, 2, 2, 2, 3, 3, 3],
            &[5, 60000, 1, 32768, 999, 1, 2, 3],
        ];
        for batch in batches {
            let report = select(batch);
            let raw_len = raw::encode(batch).len();
            let chosen_len = report.candidates.iter().find(|c| c.method == report.chosen).unwrap().bytes;
            assert!(chosen_len <= raw_len);
        }
    }

    #[test]
    fn stable_repeated_readings_compress_and_round_trip() {
        // 7 repeats of a 10-register sample: few distinct values, so DICT
        // wins handily over RAW even though the readings never repeat a
        // neighbor (which is what keeps RLE from helping here).
        let sample = [2400u16, 180, 50, 4200, 70, 600, 70, 35, 100, 1500];
        let values: Vec<u16> = sample.iter().copied().cycle().take(70).collect();
        let frame = compress(&values).unwrap();
        assert!(frame.len() < raw::encode(&values).len());
        assert_eq!(decompress(&frame).unwrap(), values);
    }

    proptest::proptest! {
        #[test]
        fn round_trip_holds_for_any_input(values in proptest::collection::vec(0u16..=u16::MAX, 0..300)) {
            let frame = compress(&values).unwrap();
            proptest::prop_assert_eq!(decompress(&frame).unwrap(), values);
        }

        #[test]
        fn selector_never_exceeds_raw_length(values in proptest::collection::vec(0u16..=u16::MAX, 0..300)) {
            let frame = compress(&values).unwrap();
            let raw_len = raw::encode(&values).len();
            proptest::prop_assert!(frame.len() <= raw_len);
        }
    }
}
