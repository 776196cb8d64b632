//! Immutable per-family state snapshots.
//!
//! A snapshot is produced whole by a decoder and handed to the controller, which swaps
//! it in atomically; nothing in this module mutates a snapshot after construction
//! except the builders used by the decoders themselves.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::ModelFamily;

/// Firmware version as reported on the wire, in tenths (`0x0b` is `1.1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Firmware(pub u8);

impl fmt::Display for Firmware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.0 / 10, self.0 % 10)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceState {
    Bot(BotState),
    Curtain(CurtainState),
    Lock(LockState),
    Meter(MeterState),
    Plug(PlugState),
}

impl DeviceState {
    pub fn family(&self) -> ModelFamily {
        match self {
            DeviceState::Bot(_) => ModelFamily::Bot,
            DeviceState::Curtain(_) => ModelFamily::Curtain,
            DeviceState::Lock(_) => ModelFamily::Lock,
            DeviceState::Meter(_) => ModelFamily::Meter,
            DeviceState::Plug(_) => ModelFamily::Plug,
        }
    }

    /// Battery percentage, when the snapshot carries one.
    pub fn battery(&self) -> Option<u8> {
        match self {
            DeviceState::Bot(s) => s.battery,
            DeviceState::Curtain(s) => Some(s.battery),
            DeviceState::Lock(s) => s.battery,
            DeviceState::Meter(s) => Some(s.battery),
            DeviceState::Plug(_) => None,
        }
    }

    pub fn as_curtain(&self) -> Option<&CurtainState> {
        match self {
            DeviceState::Curtain(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_lock(&self) -> Option<&LockState> {
        match self {
            DeviceState::Lock(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bot(&self) -> Option<&BotState> {
        match self {
            DeviceState::Bot(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_plug(&self) -> Option<&PlugState> {
        match self {
            DeviceState::Plug(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_meter(&self) -> Option<&MeterState> {
        match self {
            DeviceState::Meter(s) => Some(s),
            _ => None,
        }
    }
}

/// Bot (button pusher). Advertisements report the switch state; the basic-info
/// response reports settings but not whether the switch is on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotState {
    pub battery: Option<u8>,
    /// `true` when the bot runs in on/off switch mode rather than press mode.
    pub switch_mode: bool,
    pub is_on: Option<bool>,
    pub inverse_direction: Option<bool>,
    pub hold_seconds: Option<u8>,
    pub firmware: Option<Firmware>,
}

/// Curtain motor. `position` is the raw device value: 0 is fully open, 100 fully closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurtainState {
    pub position: u8,
    pub battery: u8,
    pub light_level: Option<u8>,
    pub is_moving: bool,
    /// Set when the motor was calibrated to open right-to-left.
    pub is_reversed: bool,
    pub calibrated: bool,
    pub chain_length: Option<u8>,
    pub solar_panel: Option<bool>,
    pub fault: Option<bool>,
    pub firmware: Option<Firmware>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockStatus {
    Locked,
    Unlocked,
    Locking,
    Unlocking,
    LockingStop,
    UnlockingStop,
    /// Latch engaged but bolt not thrown (EU models).
    NotFullyLocked,
    Unknown(u8),
}

impl LockStatus {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => LockStatus::Locked,
            1 => LockStatus::Unlocked,
            2 => LockStatus::Locking,
            3 => LockStatus::Unlocking,
            4 => LockStatus::LockingStop,
            5 => LockStatus::UnlockingStop,
            6 => LockStatus::NotFullyLocked,
            other => LockStatus::Unknown(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            LockStatus::Locked => 0,
            LockStatus::Unlocked => 1,
            LockStatus::Locking => 2,
            LockStatus::Unlocking => 3,
            LockStatus::LockingStop => 4,
            LockStatus::UnlockingStop => 5,
            LockStatus::NotFullyLocked => 6,
            LockStatus::Unknown(other) => other,
        }
    }

    pub fn is_moving(self) -> bool {
        matches!(self, LockStatus::Locking | LockStatus::Unlocking)
    }

    pub fn is_blocked(self) -> bool {
        matches!(self, LockStatus::LockingStop | LockStatus::UnlockingStop)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockState {
    pub locked: bool,
    pub status: LockStatus,
    pub door_open: bool,
    pub calibrated: bool,
    pub battery: Option<u8>,
    pub unclosed_alarm: bool,
    pub unlocked_alarm: bool,
    pub auto_lock_paused: Option<bool>,
    pub night_latch: Option<bool>,
    pub firmware: Option<Firmware>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterState {
    pub temperature_c: f32,
    /// The display unit selected on the device, not the unit of `temperature_c`.
    pub fahrenheit_display: bool,
    pub humidity: u8,
    pub battery: u8,
}

impl MeterState {
    pub fn temperature_f(&self) -> f32 {
        self.temperature_c * 9.0 / 5.0 + 32.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlugState {
    pub is_on: bool,
    pub wifi_rssi: Option<i16>,
    pub power_w: Option<f32>,
}
