use serde::{Deserialize, Serialize};

use super::{basic_info_frame, check_len, percent, CodecError, Command, CommandFrame};
use crate::model::DeviceModel;
use crate::state::{CurtainState, Firmware};

const COVER_OPCODE: [u8; 3] = [0x0f, 0x45, 0x01];
const MOVE: u8 = 0x05;
const STOP: [u8; 2] = [0x00, 0xff];
const MAX_POSITION: u8 = 100;
const BASIC_INFO_LEN: usize = 8;
const ADVERTISEMENT_LEN: usize = 5;

/// Motor speed for movement commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CurtainSpeed {
    #[default]
    Normal,
    Slow,
}

impl CurtainSpeed {
    pub fn byte(self) -> u8 {
        match self {
            CurtainSpeed::Normal => 0xff,
            CurtainSpeed::Slow => 0x01,
        }
    }

    /// Firmware treats anything but `0x01` as normal speed.
    pub fn from_byte(byte: u8) -> Self {
        if byte == 0x01 {
            CurtainSpeed::Slow
        } else {
            CurtainSpeed::Normal
        }
    }
}

pub(super) fn encode(command: &Command) -> Result<CommandFrame, CodecError> {
    let (position, speed) = match *command {
        Command::Open { speed } => (0, speed),
        Command::Close { speed } => (MAX_POSITION, speed),
        Command::SetPosition { position, speed } => (position, speed),
        Command::Stop => return Ok(CommandFrame::new(&COVER_OPCODE, &STOP, false)),
        Command::Status | Command::BasicInfo => return Ok(basic_info_frame(false)),
        ref other => return Err(super::unsupported(DeviceModel::Curtain, other)),
    };
    if position > MAX_POSITION {
        return Err(CodecError::InvalidArgument(format!(
            "curtain position {position} outside 0..=100"
        )));
    }
    Ok(CommandFrame::new(
        &COVER_OPCODE,
        &[MOVE, speed.byte(), position],
        false,
    ))
}

pub(super) fn decode_command(body: &[u8]) -> Result<Command, CodecError> {
    if body == [0x02] {
        return Ok(Command::Status);
    }
    let args = body
        .strip_prefix(&COVER_OPCODE[..])
        .ok_or_else(|| CodecError::malformed(format!("unknown curtain request {}", hex::encode(body))))?;
    match args {
        [MOVE, speed, position] if *position <= MAX_POSITION => Ok(Command::SetPosition {
            position: *position,
            speed: CurtainSpeed::from_byte(*speed),
        }),
        [MOVE, _, position] => Err(CodecError::malformed(format!(
            "curtain position {position} outside 0..=100"
        ))),
        a if a == STOP => Ok(Command::Stop),
        _ => Err(CodecError::malformed(format!(
            "unknown curtain arguments {}",
            hex::encode(args)
        ))),
    }
}

pub(super) fn decode_basic_info(bytes: &[u8]) -> Result<CurtainState, CodecError> {
    check_len(bytes, BASIC_INFO_LEN, "curtain basic info")?;
    Ok(CurtainState {
        // Whole byte, clamped; unlike the advertisement it carries no flags.
        position: bytes[6].min(100),
        battery: percent(bytes[1]),
        light_level: None,
        is_moving: bytes[5] & 0b0100_0011 != 0,
        is_reversed: bytes[4] & 0b1000_0000 != 0,
        calibrated: bytes[5] & 0b0000_0100 != 0,
        chain_length: Some(bytes[3]),
        solar_panel: Some(bytes[5] & 0b0000_1000 != 0),
        fault: Some(bytes[4] & 0b0000_1000 != 0),
        firmware: Some(Firmware(bytes[2])),
    })
}

pub(super) fn decode_advertisement(bytes: &[u8]) -> Result<CurtainState, CodecError> {
    check_len(bytes, ADVERTISEMENT_LEN, "curtain advertisement")?;
    Ok(CurtainState {
        position: percent(bytes[2]),
        battery: percent(bytes[3]),
        light_level: Some(bytes[4] >> 4),
        is_moving: bytes[2] & 0b1000_0000 != 0,
        is_reversed: bytes[1] & 0b0001_0000 != 0,
        calibrated: bytes[1] & 0b0100_0000 != 0,
        chain_length: Some(bytes[4] & 0b0000_0111),
        solar_panel: None,
        fault: None,
        firmware: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_command as decode_request, encode as encode_request};

    #[test]
    fn movement_frames_match_vendor_bytes() {
        let cases = [
            (Command::Open { speed: CurtainSpeed::Normal }, "570f450105ff00"),
            (Command::Close { speed: CurtainSpeed::Normal }, "570f450105ff64"),
            (Command::Stop, "570f450100ff"),
            (
                Command::SetPosition {
                    position: 30,
                    speed: CurtainSpeed::Slow,
                },
                "570f450105011e",
            ),
        ];
        for (command, expected) in cases {
            let frame = encode_request(DeviceModel::Curtain, &command).unwrap();
            assert_eq!(hex::encode(frame.to_bytes()), expected);
        }
    }

    #[test]
    fn out_of_range_position_is_rejected_before_encoding() {
        let err = encode(&Command::SetPosition {
            position: 101,
            speed: CurtainSpeed::Normal,
        })
        .unwrap_err();
        assert!(matches!(err, CodecError::InvalidArgument(_)));
    }

    #[test]
    fn open_decodes_as_position_zero() {
        let frame = encode(&Command::Open {
            speed: CurtainSpeed::Normal,
        })
        .unwrap();
        assert_eq!(
            decode_request(DeviceModel::Curtain3, &frame.to_bytes()).unwrap(),
            Command::SetPosition {
                position: 0,
                speed: CurtainSpeed::Normal
            }
        );
    }

    #[test]
    fn basic_info_fields() {
        let bytes = [0x01, 0x57, 0x0b, 0x02, 0x88, 0x4c, 0x2a, 0x00];
        let state = decode_basic_info(&bytes).unwrap();
        assert_eq!(state.battery, 87);
        assert_eq!(state.firmware, Some(Firmware(11)));
        assert_eq!(state.chain_length, Some(2));
        assert!(state.is_reversed);
        assert_eq!(state.fault, Some(true));
        assert_eq!(state.solar_panel, Some(true));
        assert!(state.calibrated);
        assert!(state.is_moving);
        assert_eq!(state.position, 42);
    }

    #[test]
    fn basic_info_position_clamps_instead_of_masking() {
        let bytes = [0x01, 0x57, 0x0b, 0x01, 0x00, 0x04, 0x96, 0x00];
        assert_eq!(decode_basic_info(&bytes).unwrap().position, 100);
        let bytes = [0x01, 0x57, 0x0b, 0x01, 0x00, 0x04, 0x64, 0x00];
        assert_eq!(decode_basic_info(&bytes).unwrap().position, 100);
    }

    #[test]
    fn advertisement_reserved_bits_are_ignored() {
        let plain = decode_advertisement(&[0x63, 0x40, 0x32, 0x50, 0x51]).unwrap();
        let noisy = decode_advertisement(&[0x63, 0x4f, 0x32, 0xd0, 0x59]).unwrap();
        assert_eq!(plain.position, 50);
        assert_eq!(plain.battery, 80);
        assert_eq!(plain.light_level, Some(5));
        assert_eq!(plain.chain_length, Some(1));
        assert_eq!(plain, noisy);
    }
}
