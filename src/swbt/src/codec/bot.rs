use std::fmt;

use super::{basic_info_frame, check_len, percent, CodecError, Command, CommandFrame};
use crate::model::DeviceModel;
use crate::state::{BotState, Firmware};

const ACTION: u8 = 0x01;
const ARG_PRESS: u8 = 0x00;
const ARG_ON: u8 = 0x01;
const ARG_OFF: u8 = 0x02;
/// High nibble set on the first opcode byte of password-protected frames.
const PASSWORD_FLAG: u8 = 0x10;
const BASIC_INFO_LEN: usize = 11;
const ADVERTISEMENT_LEN: usize = 3;

pub(super) fn encode(command: &Command) -> Result<CommandFrame, CodecError> {
    let arg = match command {
        Command::Press => ARG_PRESS,
        Command::TurnOn => ARG_ON,
        Command::TurnOff => ARG_OFF,
        Command::Status | Command::BasicInfo => return Ok(basic_info_frame(false)),
        other => return Err(super::unsupported(DeviceModel::Bot, other)),
    };
    Ok(CommandFrame::new(&[ACTION], &[arg], false))
}

pub(super) fn decode_command(body: &[u8]) -> Result<Command, CodecError> {
    let (&first, mut rest) = body
        .split_first()
        .ok_or_else(|| CodecError::malformed("empty bot request"))?;
    if first & 0xf0 == PASSWORD_FLAG {
        if rest.len() < 4 {
            return Err(CodecError::malformed("truncated bot password"));
        }
        rest = &rest[4..];
    }
    match (first & 0x0f, rest) {
        (ACTION, [ARG_PRESS]) => Ok(Command::Press),
        (ACTION, [ARG_ON]) => Ok(Command::TurnOn),
        (ACTION, [ARG_OFF]) => Ok(Command::TurnOff),
        (0x02, []) => Ok(Command::Status),
        _ => Err(CodecError::malformed(format!(
            "unknown bot request {}",
            hex::encode(body)
        ))),
    }
}

/// Settings block returned by the bot's basic-info query.
pub(super) fn decode_basic_info(bytes: &[u8]) -> Result<BotState, CodecError> {
    check_len(bytes, BASIC_INFO_LEN, "bot basic info")?;
    Ok(BotState {
        battery: Some(percent(bytes[1])),
        switch_mode: bytes[9] & 0b0001_0000 != 0,
        is_on: None,
        inverse_direction: Some(bytes[9] & 0b0000_0001 != 0),
        hold_seconds: Some(bytes[10]),
        firmware: Some(Firmware(bytes[2])),
    })
}

pub(super) fn decode_advertisement(bytes: &[u8]) -> Result<BotState, CodecError> {
    check_len(bytes, ADVERTISEMENT_LEN, "bot advertisement")?;
    let switch_mode = bytes[1] & 0b1000_0000 != 0;
    // Press-mode bots have no persistent on state.
    let is_on = switch_mode && bytes[1] & 0b0100_0000 == 0;
    Ok(BotState {
        battery: Some(percent(bytes[2])),
        switch_mode,
        is_on: Some(is_on),
        inverse_direction: None,
        hold_seconds: None,
        firmware: None,
    })
}

/// Password configured on a bot through the vendor app.
///
/// Only the CRC-32 of the password goes on the wire.
#[derive(Clone, PartialEq, Eq)]
pub struct BotPassword {
    crc: [u8; 4],
}

impl BotPassword {
    pub fn new(password: &str) -> Result<Self, CodecError> {
        if password.is_empty() {
            return Err(CodecError::InvalidArgument("bot password is empty".into()));
        }
        Ok(Self {
            crc: crc32fast::hash(password.as_bytes()).to_be_bytes(),
        })
    }

    pub fn checksum(&self) -> [u8; 4] {
        self.crc
    }

    /// Rewrites `frame` into its password-protected form: `1x <crc32> ...`.
    pub fn apply(&self, frame: &CommandFrame) -> CommandFrame {
        let Some((&first, rest)) = frame.opcode.split_first() else {
            return frame.clone();
        };
        let mut opcode = Vec::with_capacity(frame.opcode.len() + self.crc.len());
        opcode.push(PASSWORD_FLAG | (first & 0x0f));
        opcode.extend_from_slice(&self.crc);
        opcode.extend_from_slice(rest);
        CommandFrame {
            opcode,
            payload: frame.payload.clone(),
            encrypted: frame.encrypted,
        }
    }
}

impl fmt::Debug for BotPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BotPassword(..)")
    }
}
