//! Unsigned-LEB128 ("varint") encode/decode, shared by the address model's
//! length-delimited components and multistream-select's length-prefixed
//! messages.
//!
//! Each byte carries 7 bits of payload plus a continuation bit in the high
//! bit. Encoding is always the shortest representation; decoding rejects an
//! overlong encoding the same way `unsigned-varint` does (a 10th byte would
//! already overflow `u64`, so the limit here is expressed as a byte count).

use thiserror::Error;

const CONTINUATION: u8 = 0x80;
const PAYLOAD_MASK: u8 = 0x7f;
/// A u64 never needs more than 10 continuation-coded bytes.
const MAX_BYTES: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("varint requires more bytes than are available")]
    Insufficient,
    #[error("varint encoding overflows a u64")]
    Overflow,
}

/// Encodes `value` as unsigned-LEB128, appending the bytes to `out`.
pub fn encode_u64(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & u64::from(PAYLOAD_MASK)) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        } else {
            out.push(byte | CONTINUATION);
        }
    }
}

/// Decodes an unsigned-LEB128 varint from the front of `input`, returning
/// the value and the remaining unconsumed bytes.
pub fn decode_u64(input: &[u8]) -> Result<(u64, &[u8]), DecodeError> {
    let mut value: u64 = 0;
    for (index, &byte) in input.iter().enumerate() {
        if index >= MAX_BYTES {
            return Err(DecodeError::Overflow);
        }
        let payload = u64::from(byte & PAYLOAD_MASK);
        let shift = index * 7;
        if shift >= 64 || (shift == 63 && payload > 1) {
            return Err(DecodeError::Overflow);
        }
        value |= payload
            .checked_shl(shift as u32)
            .ok_or(DecodeError::Overflow)?;
        if byte & CONTINUATION == 0 {
            return Ok((value, &input[index + 1..]));
        }
    }
    Err(DecodeError::Insufficient)
}

/// Convenience wrapper for lengths and other values that fit a `usize`.
pub fn encode_usize(value: usize, out: &mut Vec<u8>) {
    encode_u64(value as u64, out)
}

/// Convenience wrapper mirroring [`encode_usize`].
pub fn decode_usize(input: &[u8]) -> Result<(usize, &[u8]), DecodeError> {
    let (value, rest) = decode_u64(input)?;
    let value = usize::try_from(value).map_err(|_| DecodeError::Overflow)?;
    Ok((value, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_small_values() {
        for value in [0u64, 1, 127, 128, 300, 16384, u32::MAX as u64] {
            let mut buf = Vec::new();
            encode_u64(value, &mut buf);
            let (decoded, rest) = decode_u64(&buf).unwrap();
            assert_eq!(decoded, value);
            assert!(rest.is_empty());
        }
    }

    #[test]
    fn shortest_encoding() {
        let mut buf = Vec::new();
        encode_u64(300, &mut buf);
        // 300 = 0b1_0010_1100 -> low 7 bits 0b010_1100 with continuation, then 0b10
        assert_eq!(buf, vec![0xAC, 0x02]);
    }

    #[test]
    fn insufficient_data_is_reported() {
        assert_eq!(decode_u64(&[0x80, 0x80]), Err(DecodeError::Insufficient));
    }

    #[test]
    fn overlong_encoding_overflows() {
        let overlong = [0xFFu8; 11];
        assert_eq!(decode_u64(&overlong), Err(DecodeError::Overflow));
    }

    #[test]
    fn leaves_trailing_bytes_untouched() {
        let mut buf = Vec::new();
        encode_u64(42, &mut buf);
        buf.extend_from_slice(b"trailer");
        let (value, rest) = decode_u64(&buf).unwrap();
        assert_eq!(value, 42);
        assert_eq!(rest, b"trailer");
    }
}
