use serde::{Deserialize, Serialize};

/// Mask applied to the identifying byte; the high bit flags an encrypted advertisement.
const MODEL_BYTE_MASK: u8 = 0b0111_1111;

/// Every device variant this crate knows how to talk to.
///
/// The identifying byte is the ASCII character SwitchBot firmware places in the low
/// seven bits of the first advertisement byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceModel {
    Bot,
    Curtain,
    Curtain3,
    Lock,
    LockPro,
    Meter,
    MeterPlus,
    OutdoorMeter,
    PlugMini,
    PlugMiniJp,
}

/// Groups models sharing one codec and one state shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelFamily {
    Bot,
    Curtain,
    Lock,
    Meter,
    Plug,
}

impl DeviceModel {
    pub const ALL: [DeviceModel; 10] = [
        DeviceModel::Bot,
        DeviceModel::Curtain,
        DeviceModel::Curtain3,
        DeviceModel::Lock,
        DeviceModel::LockPro,
        DeviceModel::Meter,
        DeviceModel::MeterPlus,
        DeviceModel::OutdoorMeter,
        DeviceModel::PlugMini,
        DeviceModel::PlugMiniJp,
    ];

    /// Looks up the model for an advertisement's first byte, ignoring the encryption flag.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte & MODEL_BYTE_MASK {
            b'H' => Some(DeviceModel::Bot),
            b'c' => Some(DeviceModel::Curtain),
            b'{' => Some(DeviceModel::Curtain3),
            b'o' => Some(DeviceModel::Lock),
            b'$' => Some(DeviceModel::LockPro),
            b'T' => Some(DeviceModel::Meter),
            b'i' => Some(DeviceModel::MeterPlus),
            b'w' => Some(DeviceModel::OutdoorMeter),
            b'g' => Some(DeviceModel::PlugMini),
            b'j' => Some(DeviceModel::PlugMiniJp),
            _ => None,
        }
    }

    pub fn model_byte(self) -> u8 {
        match self {
            DeviceModel::Bot => b'H',
            DeviceModel::Curtain => b'c',
            DeviceModel::Curtain3 => b'{',
            DeviceModel::Lock => b'o',
            DeviceModel::LockPro => b'$',
            DeviceModel::Meter => b'T',
            DeviceModel::MeterPlus => b'i',
            DeviceModel::OutdoorMeter => b'w',
            DeviceModel::PlugMini => b'g',
            DeviceModel::PlugMiniJp => b'j',
        }
    }

    pub fn family(self) -> ModelFamily {
        match self {
            DeviceModel::Bot => ModelFamily::Bot,
            DeviceModel::Curtain | DeviceModel::Curtain3 => ModelFamily::Curtain,
            DeviceModel::Lock | DeviceModel::LockPro => ModelFamily::Lock,
            DeviceModel::Meter | DeviceModel::MeterPlus | DeviceModel::OutdoorMeter => {
                ModelFamily::Meter
            }
            DeviceModel::PlugMini | DeviceModel::PlugMiniJp => ModelFamily::Plug,
        }
    }

    /// Whether command payloads must go through an encrypted session.
    pub fn requires_encryption(self) -> bool {
        self.family() == ModelFamily::Lock
    }

    /// Whether the model accepts GATT commands at all.
    pub fn is_connectable(self) -> bool {
        self.family() != ModelFamily::Meter
    }

    pub fn friendly_name(self) -> &'static str {
        match self {
            DeviceModel::Bot => "Bot",
            DeviceModel::Curtain => "Curtain",
            DeviceModel::Curtain3 => "Curtain 3",
            DeviceModel::Lock => "Lock",
            DeviceModel::LockPro => "Lock Pro",
            DeviceModel::Meter => "Meter",
            DeviceModel::MeterPlus => "Meter Plus",
            DeviceModel::OutdoorMeter => "Indoor/Outdoor Meter",
            DeviceModel::PlugMini => "Plug Mini",
            DeviceModel::PlugMiniJp => "Plug Mini (JP)",
        }
    }
}

impl std::fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.friendly_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_byte_lookup_is_inverse_of_model_byte() {
        for model in DeviceModel::ALL {
            assert_eq!(DeviceModel::from_byte(model.model_byte()), Some(model));
        }
    }

    #[test]
    fn encryption_flag_is_ignored_for_routing() {
        assert_eq!(DeviceModel::from_byte(b'o' | 0x80), Some(DeviceModel::Lock));
        assert_eq!(DeviceModel::from_byte(0x63), Some(DeviceModel::Curtain));
    }

    #[test]
    fn unknown_bytes_have_no_model() {
        assert_eq!(DeviceModel::from_byte(b'Z'), None);
        assert_eq!(DeviceModel::from_byte(0x00), None);
    }

    #[test]
    fn only_locks_require_encryption() {
        let encrypted: Vec<_> = DeviceModel::ALL
            .into_iter()
            .filter(|m| m.requires_encryption())
            .collect();
        assert_eq!(encrypted, vec![DeviceModel::Lock, DeviceModel::LockPro]);
    }
}
