//! Stateless translation between high-level commands and wire bytes.
//!
//! Every request starts with the `0x57` request header. Models that support
//! encryption expect three more header bytes (key id and the first two IV bytes);
//! plaintext frames to those models carry zeros there. Responses start with a status
//! byte.
use thiserror::Error;

use crate::model::{DeviceModel, ModelFamily};
use crate::state::{DeviceState, Firmware};

pub mod bot;
pub mod curtain;
pub mod lock;
pub mod meter;
pub mod plug;

pub use bot::BotPassword;
pub use curtain::CurtainSpeed;

/// First byte of every request frame.
pub const REQUEST_HEADER: u8 = 0x57;
/// Length of the plaintext header on frames to encryption-capable models.
pub const ENCRYPTED_HEADER_LEN: usize = 4;
/// Upper bound on any frame this codec accepts.
pub const MAX_FRAME_LEN: usize = 64;

/// Status byte values that acknowledge a request.
pub const STATUS_OK: u8 = 0x01;
pub const STATUS_OK_ALT: u8 = 0x05;
pub const STATUS_OK_LOW_BATTERY: u8 = 0x06;
/// The device wants a password or encrypted frame.
pub const STATUS_AUTH_REQUIRED: u8 = 0x07;
/// Password or key rejected.
pub const STATUS_AUTH_INVALID: u8 = 0x09;

const BASIC_INFO_OPCODE: u8 = 0x02;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("{command} is not supported by {model}")]
    UnsupportedCommand {
        model: DeviceModel,
        command: &'static str,
    },
    #[error("device rejected request with status 0x{status:02x}")]
    DeviceRejected { status: u8 },
}

impl CodecError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        CodecError::MalformedFrame(msg.into())
    }

    /// Whether the rejection is the device asking for (or refusing) credentials.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(
            self,
            CodecError::DeviceRejected {
                status: STATUS_AUTH_REQUIRED | STATUS_AUTH_INVALID
            }
        )
    }
}

/// High-level intent understood by at least one model family.
///
/// `Open` and `Close` are shorthands for `SetPosition` at 0 and 100; decoding a frame
/// always yields the `SetPosition` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Press,
    TurnOn,
    TurnOff,
    Toggle,
    Open { speed: CurtainSpeed },
    Close { speed: CurtainSpeed },
    Stop,
    SetPosition { position: u8, speed: CurtainSpeed },
    Lock,
    Unlock,
    UnlockWithoutUnlatch,
    /// The model's primary status query.
    Status,
    /// Battery and firmware query (bots, curtains and locks).
    BasicInfo,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Press => "press",
            Command::TurnOn => "turn_on",
            Command::TurnOff => "turn_off",
            Command::Toggle => "toggle",
            Command::Open { .. } => "open",
            Command::Close { .. } => "close",
            Command::Stop => "stop",
            Command::SetPosition { .. } => "set_position",
            Command::Lock => "lock",
            Command::Unlock => "unlock",
            Command::UnlockWithoutUnlatch => "unlock_without_unlatch",
            Command::Status => "status",
            Command::BasicInfo => "basic_info",
        }
    }

    /// Queries leave device state untouched.
    pub fn is_query(&self) -> bool {
        matches!(self, Command::Status | Command::BasicInfo)
    }
}

/// An outbound request before header and (optional) encryption are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub opcode: Vec<u8>,
    pub payload: Vec<u8>,
    /// Set for frames that must travel inside a crypto session.
    pub encrypted: bool,
}

impl CommandFrame {
    pub(crate) fn new(opcode: &[u8], payload: &[u8], encrypted: bool) -> Self {
        Self {
            opcode: opcode.to_vec(),
            payload: payload.to_vec(),
            encrypted,
        }
    }

    /// Opcode followed by payload; this is the part a crypto session encrypts.
    pub fn body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.opcode.len() + self.payload.len());
        body.extend_from_slice(&self.opcode);
        body.extend_from_slice(&self.payload);
        body
    }

    /// Plaintext wire form. Frames flagged `encrypted` get the zeroed key-id/IV header.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![REQUEST_HEADER];
        if self.encrypted {
            out.extend_from_slice(&[0, 0, 0]);
        }
        out.extend_from_slice(&self.body());
        out
    }
}

/// Builds the request frame for `command` on `model`.
///
/// Pure: the same inputs always produce the same frame.
pub fn encode(model: DeviceModel, command: &Command) -> Result<CommandFrame, CodecError> {
    match model.family() {
        ModelFamily::Bot => bot::encode(command),
        ModelFamily::Curtain => curtain::encode(command),
        ModelFamily::Lock => lock::encode(model, command),
        ModelFamily::Plug => plug::encode(command),
        ModelFamily::Meter => Err(CodecError::UnsupportedCommand {
            model,
            command: command.name(),
        }),
    }
}

/// Parses a plaintext request frame (as produced by [`CommandFrame::to_bytes`]) back
/// into the command it encodes.
pub fn decode_command(model: DeviceModel, bytes: &[u8]) -> Result<Command, CodecError> {
    let body = request_body(model, bytes)?;
    match model.family() {
        ModelFamily::Bot => bot::decode_command(body),
        ModelFamily::Curtain => curtain::decode_command(body),
        ModelFamily::Lock => lock::decode_command(model, body),
        ModelFamily::Plug => plug::decode_command(body),
        ModelFamily::Meter => Err(CodecError::UnsupportedCommand {
            model,
            command: "decode",
        }),
    }
}

/// Strips the request header, returning the opcode and payload bytes.
pub fn request_body(model: DeviceModel, bytes: &[u8]) -> Result<&[u8], CodecError> {
    check_len(bytes, 2, "request")?;
    if bytes[0] != REQUEST_HEADER {
        return Err(CodecError::malformed(format!(
            "request header 0x{:02x}",
            bytes[0]
        )));
    }
    if model.requires_encryption() {
        check_len(bytes, ENCRYPTED_HEADER_LEN + 1, "request")?;
        Ok(&bytes[ENCRYPTED_HEADER_LEN..])
    } else {
        Ok(&bytes[1..])
    }
}

/// Checks the status byte of a response.
///
/// Returns the status on success so callers can notice the low-battery variant.
pub fn check_status(response: &[u8]) -> Result<u8, CodecError> {
    let status = *response
        .first()
        .ok_or_else(|| CodecError::malformed("empty response"))?;
    match status {
        STATUS_OK | STATUS_OK_ALT | STATUS_OK_LOW_BATTERY => Ok(status),
        other => Err(CodecError::DeviceRejected { status: other }),
    }
}

/// Decodes a status-query response into a full snapshot.
///
/// Lock responses carry no battery reading; callers merge one in from
/// [`decode_basic_info`].
pub fn decode(model: DeviceModel, bytes: &[u8]) -> Result<DeviceState, CodecError> {
    check_status(bytes)?;
    match model.family() {
        ModelFamily::Bot => bot::decode_basic_info(bytes).map(DeviceState::Bot),
        ModelFamily::Curtain => curtain::decode_basic_info(bytes).map(DeviceState::Curtain),
        ModelFamily::Lock => lock::decode_info(model, bytes).map(DeviceState::Lock),
        ModelFamily::Plug => plug::decode_status(bytes).map(DeviceState::Plug),
        ModelFamily::Meter => Err(CodecError::UnsupportedCommand {
            model,
            command: "status",
        }),
    }
}

/// Decodes the manufacturer-data blob of an advertisement (byte 0 is the model byte).
pub fn decode_advertisement(model: DeviceModel, bytes: &[u8]) -> Result<DeviceState, CodecError> {
    match model.family() {
        ModelFamily::Bot => bot::decode_advertisement(bytes).map(DeviceState::Bot),
        ModelFamily::Curtain => curtain::decode_advertisement(bytes).map(DeviceState::Curtain),
        ModelFamily::Lock => lock::decode_advertisement(model, bytes).map(DeviceState::Lock),
        ModelFamily::Meter => meter::decode_advertisement(bytes).map(DeviceState::Meter),
        ModelFamily::Plug => plug::decode_advertisement(bytes).map(DeviceState::Plug),
    }
}

/// Battery and firmware as reported by the shared basic-info query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicInfo {
    pub battery: u8,
    pub firmware: Firmware,
}

pub fn decode_basic_info(bytes: &[u8]) -> Result<BasicInfo, CodecError> {
    check_status(bytes)?;
    check_len(bytes, 3, "basic info")?;
    Ok(BasicInfo {
        battery: percent(bytes[1]),
        firmware: Firmware(bytes[2]),
    })
}

pub(crate) fn basic_info_frame(encrypted: bool) -> CommandFrame {
    CommandFrame::new(&[BASIC_INFO_OPCODE], &[], encrypted)
}

pub(crate) fn check_len(bytes: &[u8], min: usize, what: &str) -> Result<(), CodecError> {
    if bytes.len() < min {
        return Err(CodecError::malformed(format!(
            "{what} needs {min} bytes, got {}",
            bytes.len()
        )));
    }
    if bytes.len() > MAX_FRAME_LEN {
        return Err(CodecError::malformed(format!(
            "{what} of {} bytes exceeds {MAX_FRAME_LEN}",
            bytes.len()
        )));
    }
    Ok(())
}

/// Battery-style fields use the low seven bits; clamp stray values to 100.
pub(crate) fn percent(byte: u8) -> u8 {
    (byte & 0x7f).min(100)
}

pub(crate) fn unsupported(model: DeviceModel, command: &Command) -> CodecError {
    CodecError::UnsupportedCommand {
        model,
        command: command.name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_byte_classification() {
        assert_eq!(check_status(&[0x01]), Ok(0x01));
        assert_eq!(check_status(&[0x06, 0x00]), Ok(0x06));
        let err = check_status(&[0x09]).unwrap_err();
        assert!(err.is_auth_rejection());
        let err = check_status(&[0x03]).unwrap_err();
        assert!(!err.is_auth_rejection());
        assert!(matches!(check_status(&[]), Err(CodecError::MalformedFrame(_))));
    }

    #[test]
    fn basic_info_matches_vendor_vector() {
        let info = decode_basic_info(&hex::decode("016401").unwrap()).unwrap();
        assert_eq!(info.battery, 100);
        assert_eq!(info.firmware, Firmware(1));
    }

    #[test]
    fn meter_rejects_every_command() {
        let err = encode(DeviceModel::MeterPlus, &Command::Status).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedCommand { .. }));
    }

    #[test]
    fn encrypted_frames_carry_zeroed_header_in_plaintext_form() {
        let frame = encode(DeviceModel::Lock, &Command::BasicInfo).unwrap();
        assert_eq!(frame.to_bytes(), vec![0x57, 0, 0, 0, 0x02]);
    }

    #[test]
    fn oversized_frames_are_malformed() {
        let mut frame = vec![0x01u8; MAX_FRAME_LEN + 1];
        frame[0] = STATUS_OK;
        assert!(matches!(
            decode_basic_info(&frame),
            Err(CodecError::MalformedFrame(_))
        ));
    }
}
