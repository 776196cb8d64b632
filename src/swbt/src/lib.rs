//! Client-side protocol layer for SwitchBot Bluetooth LE devices.
//!
//! Decodes broadcast advertisements into typed device state, frames high-level
//! commands for the GATT command characteristic, runs the lock key exchange and
//! AES-CTR session, and drives each device through a retrying, single-flight
//! controller. Radio access is abstracted behind [`transport::BleTransport`] and
//! [`transport::Scanner`].

pub mod address;
pub mod advertisement;
pub mod codec;
pub mod crypto;
pub mod device;
pub mod discovery;
pub mod model;
pub mod provisioning;
pub mod simulator;
pub mod state;
pub mod transport;

pub use address::Address;
pub use advertisement::{Advertisement, ParseError};
pub use codec::{BotPassword, CodecError, Command, CommandFrame, CurtainSpeed};
pub use crypto::{CryptoError, CryptoSession, HandshakeState, KeyMaterial};
pub use device::{
    BusyPolicy, CommandFailure, ControllerConfig, Credentials, DeviceController, DeviceError,
    DeviceStatus, RetryPolicy,
};
pub use discovery::{AdvertisementWatch, DiscoveryError, DiscoveryRegistry, ScanConfig};
pub use model::{DeviceModel, ModelFamily};
pub use provisioning::{KeyProvisioner, ProvisionError, StaticKeyProvisioner};
pub use state::{
    BotState, CurtainState, DeviceState, Firmware, LockState, LockStatus, MeterState, PlugState,
};
pub use transport::{BleTransport, ScanEvent, Scanner, TransportError};
