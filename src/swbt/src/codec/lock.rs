//! Lock and Lock Pro frames. Every request to these models travels encrypted
//! except the key request that opens a crypto session.
use super::{basic_info_frame, check_len, percent, CodecError, Command, CommandFrame};
use crate::model::DeviceModel;
use crate::state::{LockState, LockStatus};

const ACTION_OPCODE: [u8; 3] = [0x0f, 0x4e, 0x01];
const INFO_OPCODE: [u8; 3] = [0x0f, 0x4f, 0x81];
const KEY_REQUEST_OPCODE: [u8; 3] = [0x0f, 0x21, 0x03];

const ARG_LOCK: u8 = 0x00;
const ARG_UNLOCK: u8 = 0x80;
const ARG_UNLOCK_NO_UNLATCH: u8 = 0xa0;

/// Bytes that precede the action argument; the two models disagree on the prefix.
fn action_prefix(model: DeviceModel) -> &'static [u8] {
    match model {
        DeviceModel::LockPro => &[0x01, 0x00, 0x00],
        _ => &[0x01, 0x10],
    }
}

fn info_selector(model: DeviceModel) -> u8 {
    match model {
        DeviceModel::LockPro => 0x02,
        _ => 0x01,
    }
}

/// Minimum lock-info response length, status byte included.
fn info_len(model: DeviceModel) -> usize {
    match model {
        DeviceModel::LockPro => 7,
        _ => 3,
    }
}

fn advertisement_len(model: DeviceModel) -> usize {
    match model {
        DeviceModel::LockPro => 6,
        _ => 5,
    }
}

pub(super) fn encode(model: DeviceModel, command: &Command) -> Result<CommandFrame, CodecError> {
    let arg = match command {
        Command::Lock => ARG_LOCK,
        Command::Unlock => ARG_UNLOCK,
        Command::UnlockWithoutUnlatch => ARG_UNLOCK_NO_UNLATCH,
        Command::Status => {
            return Ok(CommandFrame::new(
                &INFO_OPCODE,
                &[info_selector(model)],
                true,
            ))
        }
        Command::BasicInfo => return Ok(basic_info_frame(true)),
        other => return Err(super::unsupported(model, other)),
    };
    let mut payload = action_prefix(model).to_vec();
    payload.push(arg);
    Ok(CommandFrame::new(&ACTION_OPCODE, &payload, true))
}

/// Plaintext request asking the lock for a fresh IV under `key_id`.
pub(crate) fn key_request_frame(key_id: u8) -> CommandFrame {
    CommandFrame::new(&KEY_REQUEST_OPCODE, &[key_id], true)
}

/// Recognises a key request body, returning the requested key id.
pub(crate) fn parse_key_request(body: &[u8]) -> Option<u8> {
    match body.strip_prefix(&KEY_REQUEST_OPCODE[..])? {
        [key_id] => Some(*key_id),
        _ => None,
    }
}

pub(super) fn decode_command(model: DeviceModel, body: &[u8]) -> Result<Command, CodecError> {
    if body == [0x02] {
        return Ok(Command::BasicInfo);
    }
    if let Some(args) = body.strip_prefix(&INFO_OPCODE[..]) {
        return match args {
            [selector] if *selector == info_selector(model) => Ok(Command::Status),
            _ => Err(CodecError::malformed("lock info selector")),
        };
    }
    let malformed = || CodecError::malformed(format!("unknown lock request {}", hex::encode(body)));
    let args = body.strip_prefix(&ACTION_OPCODE[..]).ok_or_else(malformed)?;
    let arg = args.strip_prefix(action_prefix(model)).ok_or_else(malformed)?;
    match arg {
        [ARG_LOCK] => Ok(Command::Lock),
        [ARG_UNLOCK] => Ok(Command::Unlock),
        [ARG_UNLOCK_NO_UNLATCH] => Ok(Command::UnlockWithoutUnlatch),
        _ => Err(malformed()),
    }
}

struct LockBits {
    status: LockStatus,
    calibrated: bool,
    door_open: bool,
    unclosed_alarm: bool,
    unlocked_alarm: bool,
}

/// Lock (non-Pro) layout, shared by the info response and the advertisement.
fn lock_bits(state: u8, alarms: u8) -> LockBits {
    LockBits {
        status: LockStatus::from_code((state & 0b0111_0000) >> 4),
        calibrated: state & 0b1000_0000 != 0,
        door_open: state & 0b0000_0100 != 0,
        unclosed_alarm: alarms & 0b0010_0000 != 0,
        unlocked_alarm: alarms & 0b0001_0000 != 0,
    }
}

fn into_state(bits: LockBits, battery: Option<u8>) -> LockState {
    LockState {
        locked: bits.status == LockStatus::Locked,
        status: bits.status,
        door_open: bits.door_open,
        calibrated: bits.calibrated,
        battery,
        unclosed_alarm: bits.unclosed_alarm,
        unlocked_alarm: bits.unlocked_alarm,
        auto_lock_paused: None,
        night_latch: None,
        firmware: None,
    }
}

/// Decodes a decrypted lock-info response (status byte first).
pub(super) fn decode_info(model: DeviceModel, bytes: &[u8]) -> Result<LockState, CodecError> {
    check_len(bytes, info_len(model), "lock info")?;
    let data = &bytes[1..];
    let bits = match model {
        DeviceModel::LockPro => LockBits {
            status: LockStatus::from_code((data[0] & 0b0111_1000) >> 3),
            calibrated: data[0] & 0b1000_0000 != 0,
            door_open: data[1] & 0b0001_0000 != 0,
            unclosed_alarm: data[5] & 0b1000_0000 != 0,
            unlocked_alarm: data[5] & 0b0100_0000 != 0,
        },
        _ => lock_bits(data[0], data[1]),
    };
    Ok(into_state(bits, None))
}

pub(super) fn decode_advertisement(
    model: DeviceModel,
    bytes: &[u8],
) -> Result<LockState, CodecError> {
    check_len(bytes, advertisement_len(model), "lock advertisement")?;
    let battery = Some(percent(bytes[2]));
    let state = match model {
        DeviceModel::LockPro => {
            let bits = LockBits {
                status: LockStatus::from_code((bytes[3] & 0b0011_1000) >> 3),
                calibrated: bytes[3] & 0b1000_0000 != 0,
                door_open: bytes[4] & 0b0100_0000 != 0,
                unclosed_alarm: bytes[5] & 0b1000_0000 != 0,
                unlocked_alarm: bytes[5] & 0b0100_0000 != 0,
            };
            LockState {
                auto_lock_paused: Some(bytes[4] & 0b0010_0000 != 0),
                ..into_state(bits, battery)
            }
        }
        _ => LockState {
            auto_lock_paused: Some(bytes[4] & 0b0000_0010 != 0),
            night_latch: bytes.get(5).map(|b| b & 0b0000_0001 != 0),
            ..into_state(lock_bits(bytes[3], bytes[4]), battery)
        },
    };
    Ok(state)
}
