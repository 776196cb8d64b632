//! Where lock keys come from.
//!
//! Keys are issued by the vendor cloud; fetching them is left to the host
//! application. The controller only needs something that can hand over
//! [`KeyMaterial`] for an address.
use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::address::Address;
use crate::crypto::{CryptoError, KeyMaterial};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("no key provisioned for {0}")]
    NotFound(Address),
    #[error("invalid key document: {0}")]
    Invalid(String),
}

impl From<CryptoError> for ProvisionError {
    fn from(err: CryptoError) -> Self {
        ProvisionError::Invalid(err.to_string())
    }
}

#[async_trait]
pub trait KeyProvisioner: Send + Sync {
    async fn key_material(&self, address: &Address) -> Result<KeyMaterial, ProvisionError>;
}

/// Fixed table of keys, typically loaded from a local file.
#[derive(Debug, Clone, Default)]
pub struct StaticKeyProvisioner {
    keys: HashMap<Address, KeyMaterial>,
}

#[derive(Deserialize)]
struct KeyEntry {
    key_id: String,
    encryption_key: String,
}

impl StaticKeyProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, address: Address, key: KeyMaterial) -> Self {
        self.keys.insert(address, key);
        self
    }

    /// Loads `{"AA:BB:CC:DD:EE:FF": {"key_id": "ff", "encryption_key": "<32 hex>"}}`.
    pub fn from_json_str(raw: &str) -> Result<Self, ProvisionError> {
        let entries: HashMap<String, KeyEntry> =
            serde_json::from_str(raw).map_err(|e| ProvisionError::Invalid(e.to_string()))?;
        let mut keys = HashMap::with_capacity(entries.len());
        for (address, entry) in entries {
            let address: Address = address
                .parse()
                .map_err(|e: crate::address::AddressError| ProvisionError::Invalid(e.to_string()))?;
            let key = KeyMaterial::from_hex(&entry.key_id, &entry.encryption_key)?;
            keys.insert(address, key);
        }
        Ok(Self { keys })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl KeyProvisioner for StaticKeyProvisioner {
    async fn key_material(&self, address: &Address) -> Result<KeyMaterial, ProvisionError> {
        self.keys
            .get(address)
            .cloned()
            .ok_or(ProvisionError::NotFound(*address))
    }
}
