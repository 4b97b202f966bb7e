//! The TLV wire format exchanged on `/libp2p/autonat/2/dial-request` and
//! `/libp2p/autonat/2/dial-back`. Every message is wrapped in a
//! top-level record that tags which of the three payloads follows.

use meshnet_multiaddr::{AddressError, Multiaddr};
use thiserror::Error;

const TAG_RECORD_TYPE: u8 = 0x08;
const TAG_DIAL_REQUEST: u8 = 0x12;
const TAG_DIAL_RESPONSE: u8 = 0x1A;
const TAG_DIAL_BACK: u8 = 0x22;

const TAG_REQUEST_ADDRESS: u8 = 0x0A;
const TAG_REQUEST_NONCE: u8 = 0x11;
const TAG_RESPONSE_STATUS: u8 = 0x08;
const TAG_RESPONSE_ADDRESS: u8 = 0x12;
const TAG_DIALBACK_NONCE: u8 = 0x09;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("message truncated")]
    Truncated,
    #[error("unexpected tag byte {0:#04x}")]
    UnexpectedTag(u8),
    #[error("unknown record type {0}")]
    UnknownRecordType(u64),
    #[error("unknown status code {0}")]
    UnknownStatus(u64),
    #[error(transparent)]
    InvalidAddress(#[from] AddressError),
    #[error(transparent)]
    Varint(#[from] meshnet_varint::DecodeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 0,
    DialError = 100,
    DialBackError = 101,
    BadRequest = 200,
    InternalError = 300,
}

impl Status {
    fn from_u64(value: u64) -> Result<Self, WireError> {
        match value {
            0 => Ok(Status::Ok),
            100 => Ok(Status::DialError),
            101 => Ok(Status::DialBackError),
            200 => Ok(Status::BadRequest),
            300 => Ok(Status::InternalError),
            other => Err(WireError::UnknownStatus(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialRequest {
    pub address: Multiaddr,
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialResponse {
    pub status: Status,
    pub address: Option<Multiaddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialBack {
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    DialRequest(DialRequest),
    DialResponse(DialResponse),
    DialBack(DialBack),
}

fn take_byte(input: &[u8]) -> Result<(u8, &[u8]), WireError> {
    input.split_first().map(|(b, rest)| (*b, rest)).ok_or(WireError::Truncated)
}

fn take_fixed64(input: &[u8]) -> Result<(u64, &[u8]), WireError> {
    if input.len() < 8 {
        return Err(WireError::Truncated);
    }
    let (bytes, rest) = input.split_at(8);
    Ok((u64::from_le_bytes(bytes.try_into().unwrap()), rest))
}

fn take_len_delimited(input: &[u8]) -> Result<(&[u8], &[u8]), WireError> {
    let (len, rest) = meshnet_varint::decode_usize(input)?;
    if rest.len() < len {
        return Err(WireError::Truncated);
    }
    Ok(rest.split_at(len))
}

fn encode_dial_request(request: &DialRequest) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(TAG_REQUEST_ADDRESS);
    let address_bytes = request.address.to_bytes();
    meshnet_varint::encode_usize(address_bytes.len(), &mut out);
    out.extend_from_slice(&address_bytes);
    out.push(TAG_REQUEST_NONCE);
    out.extend_from_slice(&request.nonce.to_le_bytes());
    out
}

fn decode_dial_request(mut input: &[u8]) -> Result<DialRequest, WireError> {
    let (tag, rest) = take_byte(input)?;
    if tag != TAG_REQUEST_ADDRESS {
        return Err(WireError::UnexpectedTag(tag));
    }
    let (address_bytes, rest) = take_len_delimited(rest)?;
    let address = Multiaddr::from_bytes(address_bytes)?;
    input = rest;
    let (tag, rest) = take_byte(input)?;
    if tag != TAG_REQUEST_NONCE {
        return Err(WireError::UnexpectedTag(tag));
    }
    let (nonce, _rest) = take_fixed64(rest)?;
    Ok(DialRequest { address, nonce })
}

fn encode_dial_response(response: &DialResponse) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(TAG_RESPONSE_STATUS);
    meshnet_varint::encode_u64(response.status as u64, &mut out);
    if let Some(address) = &response.address {
        out.push(TAG_RESPONSE_ADDRESS);
        let address_bytes = address.to_bytes();
        meshnet_varint::encode_usize(address_bytes.len(), &mut out);
        out.extend_from_slice(&address_bytes);
    }
    out
}

fn decode_dial_response(input: &[u8]) -> Result<DialResponse, WireError> {
    let (tag, rest) = take_byte(input)?;
    if tag != TAG_RESPONSE_STATUS {
        return Err(WireError::UnexpectedTag(tag));
    }
    let (status_code, rest) = meshnet_varint::decode_u64(rest)?;
    let status = Status::from_u64(status_code)?;
    let address = if rest.is_empty() {
        None
    } else {
        let (tag, rest) = take_byte(rest)?;
        if tag != TAG_RESPONSE_ADDRESS {
            return Err(WireError::UnexpectedTag(tag));
        }
        let (address_bytes, _rest) = take_len_delimited(rest)?;
        Some(Multiaddr::from_bytes(address_bytes)?)
    };
    Ok(DialResponse { status, address })
}

fn encode_dial_back(dial_back: &DialBack) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(TAG_DIALBACK_NONCE);
    out.extend_from_slice(&dial_back.nonce.to_le_bytes());
    out
}

fn decode_dial_back(input: &[u8]) -> Result<DialBack, WireError> {
    let (tag, rest) = take_byte(input)?;
    if tag != TAG_DIALBACK_NONCE {
        return Err(WireError::UnexpectedTag(tag));
    }
    let (nonce, _rest) = take_fixed64(rest)?;
    Ok(DialBack { nonce })
}

pub fn encode_message(message: &Message) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(TAG_RECORD_TYPE);
    let (record_type, tag, payload) = match message {
        Message::DialRequest(request) => (0u64, TAG_DIAL_REQUEST, encode_dial_request(request)),
        Message::DialResponse(response) => (1u64, TAG_DIAL_RESPONSE, encode_dial_response(response)),
        Message::DialBack(dial_back) => (2u64, TAG_DIAL_BACK, encode_dial_back(dial_back)),
    };
    meshnet_varint::encode_u64(record_type, &mut out);
    out.push(tag);
    meshnet_varint::encode_usize(payload.len(), &mut out);
    out.extend_from_slice(&payload);
    out
}

pub fn decode_message(input: &[u8]) -> Result<Message, WireError> {
    let (tag, rest) = take_byte(input)?;
    if tag != TAG_RECORD_TYPE {
        return Err(WireError::UnexpectedTag(tag));
    }
    let (record_type, rest) = meshnet_varint::decode_u64(rest)?;
    let (payload_tag, rest) = take_byte(rest)?;
    let (payload, _rest) = take_len_delimited(rest)?;

    match record_type {
        0 => {
            if payload_tag != TAG_DIAL_REQUEST {
                return Err(WireError::UnexpectedTag(payload_tag));
            }
            Ok(Message::DialRequest(decode_dial_request(payload)?))
        }
        1 => {
            if payload_tag != TAG_DIAL_RESPONSE {
                return Err(WireError::UnexpectedTag(payload_tag));
            }
            Ok(Message::DialResponse(decode_dial_response(payload)?))
        }
        2 => {
            if payload_tag != TAG_DIAL_BACK {
                return Err(WireError::UnexpectedTag(payload_tag));
            }
            Ok(Message::DialBack(decode_dial_back(payload)?))
        }
        other => Err(WireError::UnknownRecordType(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dial_request_round_trips() {
        let message = Message::DialRequest(DialRequest {
            address: "/ip4/203.0.113.9/tcp/4001".parse().unwrap(),
            nonce: 0xdead_beef_cafe_1234,
        });
        let bytes = encode_message(&message);
        assert_eq!(decode_message(&bytes).unwrap(), message);
    }

    #[test]
    fn dial_response_with_address_round_trips() {
        let message = Message::DialResponse(DialResponse {
            status: Status::Ok,
            address: Some("/ip4/203.0.113.9/tcp/4001".parse().unwrap()),
        });
        let bytes = encode_message(&message);
        assert_eq!(decode_message(&bytes).unwrap(), message);
    }

    #[test]
    fn dial_response_without_address_round_trips() {
        let message = Message::DialResponse(DialResponse {
            status: Status::DialError,
            address: None,
        });
        let bytes = encode_message(&message);
        assert_eq!(decode_message(&bytes).unwrap(), message);
    }

    #[test]
    fn dial_back_round_trips() {
        let message = Message::DialBack(DialBack { nonce: 42 });
        let bytes = encode_message(&message);
        assert_eq!(decode_message(&bytes).unwrap(), message);
    }

    #[test]
    fn truncated_input_is_rejected_not_panicked_on() {
        let message = Message::DialBack(DialBack { nonce: 42 });
        let bytes = encode_message(&message);
        for cut in 0..bytes.len() {
            assert!(decode_message(&bytes[..cut]).is_err());
        }
    }
}
