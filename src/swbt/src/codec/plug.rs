use super::{check_len, CodecError, Command, CommandFrame};
use crate::model::DeviceModel;
use crate::state::PlugState;

const SWITCH_OPCODE: [u8; 3] = [0x0f, 0x50, 0x01];
const READ_OPCODE: [u8; 3] = [0x0f, 0x50, 0x81];
const ON: u8 = 0x80;
const STATUS_LEN: usize = 2;
const ADVERTISEMENT_LEN: usize = 6;

pub(super) fn encode(command: &Command) -> Result<CommandFrame, CodecError> {
    let payload: [u8; 2] = match command {
        Command::TurnOn => [0x01, ON],
        Command::TurnOff => [0x01, 0x00],
        Command::Toggle => [0x02, ON],
        Command::Status => return Ok(CommandFrame::new(&READ_OPCODE, &[], false)),
        other => return Err(super::unsupported(DeviceModel::PlugMini, other)),
    };
    Ok(CommandFrame::new(&SWITCH_OPCODE, &payload, false))
}

pub(super) fn decode_command(body: &[u8]) -> Result<Command, CodecError> {
    if body == READ_OPCODE {
        return Ok(Command::Status);
    }
    match body.strip_prefix(&SWITCH_OPCODE[..]) {
        Some([0x01, ON]) => Ok(Command::TurnOn),
        Some([0x01, 0x00]) => Ok(Command::TurnOff),
        Some([0x02, ON]) => Ok(Command::Toggle),
        _ => Err(CodecError::malformed(format!(
            "unknown plug request {}",
            hex::encode(body)
        ))),
    }
}

/// Switch and read requests both answer `<status> <state>`.
pub(super) fn decode_status(bytes: &[u8]) -> Result<PlugState, CodecError> {
    check_len(bytes, STATUS_LEN, "plug status")?;
    Ok(PlugState {
        is_on: bytes[1] == ON,
        wifi_rssi: None,
        power_w: None,
    })
}

pub(super) fn decode_advertisement(bytes: &[u8]) -> Result<PlugState, CodecError> {
    check_len(bytes, ADVERTISEMENT_LEN, "plug advertisement")?;
    let raw_power = u16::from_be_bytes([bytes[4], bytes[5]]) & 0x7fff;
    Ok(PlugState {
        is_on: bytes[1] == ON,
        wifi_rssi: Some(-i16::from(bytes[3])),
        power_w: Some(f32::from(raw_power) / 10.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_frames_match_vendor_bytes() {
        let cases = [
            (Command::TurnOn, "570f50010180"),
            (Command::TurnOff, "570f50010100"),
            (Command::Toggle, "570f50010280"),
            (Command::Status, "570f5081"),
        ];
        for (command, expected) in cases {
            let frame = encode(&command).unwrap();
            assert_eq!(hex::encode(frame.to_bytes()), expected);
            assert_eq!(decode_command(&frame.body()).unwrap(), command);
        }
    }

    #[test]
    fn advertisement_power_ignores_high_bit() {
        let state = decode_advertisement(&[b'g', 0x80, 0x00, 0x3c, 0x80, 0x7b]).unwrap();
        assert!(state.is_on);
        assert_eq!(state.wifi_rssi, Some(-60));
        assert!((state.power_w.unwrap() - 12.3).abs() < 1e-4);
    }

    #[test]
    fn status_reports_off() {
        assert!(!decode_status(&[0x01, 0x00]).unwrap().is_on);
    }
}
