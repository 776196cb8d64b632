use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Opaque transport identifier for a peripheral.
///
/// Linux and Windows stacks expose the device MAC; CoreBluetooth hides it behind a
/// per-host UUID, so both forms are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Address {
    Mac([u8; 6]),
    Uuid(Uuid),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unrecognised device address: {0}")]
pub struct AddressError(pub String);

impl Address {
    pub fn mac(bytes: [u8; 6]) -> Self {
        Address::Mac(bytes)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    /// Accepts `AA:BB:CC:DD:EE:FF`, `aa-bb-cc-dd-ee-ff`, `aabb.ccdd.eeff`, bare hex, or a UUID.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let compact: String = match trimmed.len() {
            17 if trimmed.matches(':').count() == 5 => trimmed.replace(':', ""),
            17 if trimmed.matches('-').count() == 5 => trimmed.replace('-', ""),
            14 if trimmed.matches('.').count() == 2 => trimmed.replace('.', ""),
            12 => trimmed.to_string(),
            _ => {
                return Uuid::parse_str(trimmed)
                    .map(Address::Uuid)
                    .map_err(|_| AddressError(s.to_string()));
            }
        };
        let mut mac = [0u8; 6];
        hex::decode_to_slice(&compact, &mut mac).map_err(|_| AddressError(s.to_string()))?;
        Ok(Address::Mac(mac))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Mac(b) => write!(
                f,
                "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
                b[0], b[1], b[2], b[3], b[4], b[5]
            ),
            Address::Uuid(id) => write!(f, "{}", id.hyphenated()),
        }
    }
}
