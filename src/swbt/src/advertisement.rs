use serde::Serialize;
use thiserror::Error;

use crate::address::Address;
use crate::codec::{self, CodecError};
use crate::model::DeviceModel;
use crate::state::DeviceState;
use crate::transport::ScanEvent;

/// High bit of the model byte: the device is broadcasting in encrypted mode.
const ENCRYPTED_FLAG: u8 = 0b1000_0000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown model byte 0x{0:02x}")]
    UnknownModel(u8),
    #[error("malformed advertisement: {0}")]
    MalformedFrame(String),
}

impl From<CodecError> for ParseError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::MalformedFrame(msg) => ParseError::MalformedFrame(msg),
            other => ParseError::MalformedFrame(other.to_string()),
        }
    }
}

/// Decoded, immutable view of one broadcast.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Advertisement {
    pub address: Address,
    pub rssi: i16,
    pub model: DeviceModel,
    pub encrypted: bool,
    pub raw_payload: Vec<u8>,
    pub state: DeviceState,
}

impl Advertisement {
    pub fn from_event(event: &ScanEvent) -> Result<Self, ParseError> {
        parse(event.address, event.rssi, &event.manufacturer_data)
    }
}

/// Identifies the model from byte 0 and decodes the rest with that model's table.
pub fn parse(address: Address, rssi: i16, raw: &[u8]) -> Result<Advertisement, ParseError> {
    let (model, encrypted) = identify(raw)?;
    let state = codec::decode_advertisement(model, raw)?;
    Ok(Advertisement {
        address,
        rssi,
        model,
        encrypted,
        raw_payload: raw.to_vec(),
        state,
    })
}

/// Model lookup without decoding the fields.
pub fn identify(raw: &[u8]) -> Result<(DeviceModel, bool), ParseError> {
    let first = *raw
        .first()
        .ok_or_else(|| ParseError::MalformedFrame("empty manufacturer data".into()))?;
    let model = DeviceModel::from_byte(first).ok_or(ParseError::UnknownModel(first))?;
    Ok((model, first & ENCRYPTED_FLAG != 0))
}
