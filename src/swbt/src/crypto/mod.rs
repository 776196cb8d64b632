//! Lock key exchange and per-command AES-CTR sessions.
//!
//! The device hands out a fresh 16-byte IV for every key request. A session is
//! good for exactly one request and its response; the next command runs a new
//! handshake.
use std::fmt;

use thiserror::Error;
use tracing::debug;

use crate::codec::{self, lock, CommandFrame, REQUEST_HEADER};
use crate::transport::{FrameExchange, TransportError};

pub(crate) mod cipher;

const KEY_LEN: usize = 16;
pub const IV_LEN: usize = 16;
/// Status byte plus three reserved bytes ahead of the IV / ciphertext.
const RESPONSE_PREFIX_LEN: usize = 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("device refused key id 0x{key_id:02x} (status 0x{status:02x})")]
    AuthenticationFailed { key_id: u8, status: u8 },
    #[error("encryption handshake timed out")]
    HandshakeTimeout,
    #[error("handshake transport failure: {0}")]
    Transport(TransportError),
    #[error("crypto protocol violation: {0}")]
    Protocol(String),
    #[error("device repeated the previous session IV")]
    IvReuse,
    #[error("{0}")]
    InvalidKey(String),
}

impl From<TransportError> for CryptoError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(_) => CryptoError::HandshakeTimeout,
            other => CryptoError::Transport(other),
        }
    }
}

/// Key id and AES-128 key provisioned for one lock.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    key_id: u8,
    key: [u8; KEY_LEN],
}

impl KeyMaterial {
    pub fn new(key_id: u8, key: [u8; KEY_LEN]) -> Self {
        Self { key_id, key }
    }

    /// Parses the hex strings the vendor cloud hands out (`"ff"`, 32 hex chars).
    pub fn from_hex(key_id: &str, key: &str) -> Result<Self, CryptoError> {
        let key_id = key_id.trim();
        let key = key.trim();
        if key_id.is_empty() {
            return Err(CryptoError::InvalidKey("key_id is missing".into()));
        }
        let mut id = [0u8; 1];
        hex::decode_to_slice(key_id, &mut id)
            .map_err(|_| CryptoError::InvalidKey("key_id is invalid".into()))?;
        if key.is_empty() {
            return Err(CryptoError::InvalidKey("encryption_key is missing".into()));
        }
        let mut bytes = [0u8; KEY_LEN];
        hex::decode_to_slice(key, &mut bytes)
            .map_err(|_| CryptoError::InvalidKey("encryption_key is invalid".into()))?;
        Ok(Self::new(id[0], bytes))
    }

    pub fn key_id(&self) -> u8 {
        self.key_id
    }

    pub(crate) fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key_id", &format_args!("0x{:02x}", self.key_id))
            .field("key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Start,
    NonceSent,
    ConfirmReceived,
    Established,
}

/// Client side of the key request, one step per message.
#[derive(Debug)]
pub struct Handshake {
    key: KeyMaterial,
    state: HandshakeState,
    iv: Option<[u8; IV_LEN]>,
}

impl Handshake {
    pub fn new(key: KeyMaterial) -> Self {
        Self {
            key,
            state: HandshakeState::Start,
            iv: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Builds the key request. Start -> NonceSent.
    pub fn request(&mut self) -> Result<Vec<u8>, CryptoError> {
        self.expect(HandshakeState::Start)?;
        self.state = HandshakeState::NonceSent;
        Ok(lock::key_request_frame(self.key.key_id).to_bytes())
    }

    /// Validates the device's reply and captures its IV. NonceSent -> ConfirmReceived.
    ///
    /// `previous_iv` is the IV of the last session on this link; a device that hands
    /// it out again is refused.
    pub fn accept(
        &mut self,
        response: &[u8],
        previous_iv: Option<&[u8; IV_LEN]>,
    ) -> Result<(), CryptoError> {
        self.expect(HandshakeState::NonceSent)?;
        if let Err(err) = codec::check_status(response) {
            return Err(match err {
                codec::CodecError::DeviceRejected { status } => CryptoError::AuthenticationFailed {
                    key_id: self.key.key_id,
                    status,
                },
                other => CryptoError::Protocol(other.to_string()),
            });
        }
        let iv: [u8; IV_LEN] = response
            .get(RESPONSE_PREFIX_LEN..RESPONSE_PREFIX_LEN + IV_LEN)
            .and_then(|slice| slice.try_into().ok())
            .ok_or_else(|| {
                CryptoError::Protocol(format!("key response of {} bytes", response.len()))
            })?;
        if previous_iv == Some(&iv) {
            return Err(CryptoError::IvReuse);
        }
        self.iv = Some(iv);
        self.state = HandshakeState::ConfirmReceived;
        Ok(())
    }

    /// ConfirmReceived -> Established.
    pub fn finish(self) -> Result<CryptoSession, CryptoError> {
        self.expect(HandshakeState::ConfirmReceived)?;
        let iv = self
            .iv
            .ok_or_else(|| CryptoError::Protocol("no IV captured".into()))?;
        Ok(CryptoSession {
            key: self.key,
            iv,
            sealed: false,
        })
    }

    fn expect(&self, state: HandshakeState) -> Result<(), CryptoError> {
        if self.state == state {
            Ok(())
        } else {
            Err(CryptoError::Protocol(format!(
                "handshake in {:?}, expected {:?}",
                self.state, state
            )))
        }
    }
}

/// Established session: seals one request and opens its response.
#[derive(Debug)]
pub struct CryptoSession {
    key: KeyMaterial,
    iv: [u8; IV_LEN],
    sealed: bool,
}

impl CryptoSession {
    /// Runs the key request over `link`.
    pub async fn establish<E>(
        key: &KeyMaterial,
        link: &mut E,
        previous_iv: Option<&[u8; IV_LEN]>,
    ) -> Result<Self, CryptoError>
    where
        E: FrameExchange + ?Sized,
    {
        let mut handshake = Handshake::new(key.clone());
        let request = handshake.request()?;
        debug!(key_id = key.key_id, frame = %hex::encode(&request), "requesting session iv");
        let response = link.exchange(&request).await?;
        handshake.accept(&response, previous_iv)?;
        debug!(key_id = key.key_id, "session established");
        handshake.finish()
    }

    pub fn state(&self) -> HandshakeState {
        HandshakeState::Established
    }

    pub fn iv(&self) -> [u8; IV_LEN] {
        self.iv
    }

    /// Encrypts `frame`: `57 <key_id> <iv[0..2]> AES-CTR(opcode ++ payload)`.
    pub fn seal(&mut self, frame: &CommandFrame) -> Result<Vec<u8>, CryptoError> {
        if self.sealed {
            return Err(CryptoError::Protocol("session already used".into()));
        }
        let mut body = frame.body();
        cipher::apply_keystream(self.key.key(), &self.iv, &mut body);
        let mut out = Vec::with_capacity(codec::ENCRYPTED_HEADER_LEN + body.len());
        out.extend_from_slice(&[REQUEST_HEADER, self.key.key_id, self.iv[0], self.iv[1]]);
        out.extend_from_slice(&body);
        self.sealed = true;
        Ok(out)
    }

    /// Decrypts the response to the sealed request, returning `status ++ plaintext`.
    pub fn open(self, response: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if !self.sealed {
            return Err(CryptoError::Protocol("response without request".into()));
        }
        match response.len() {
            0 => Err(CryptoError::Protocol("empty response".into())),
            // Error statuses come back bare.
            1 => Ok(response.to_vec()),
            n if n < RESPONSE_PREFIX_LEN => {
                Err(CryptoError::Protocol(format!("response of {n} bytes")))
            }
            _ => {
                let mut out = Vec::with_capacity(response.len() - RESPONSE_PREFIX_LEN + 1);
                out.push(response[0]);
                let mut data = response[RESPONSE_PREFIX_LEN..].to_vec();
                cipher::apply_keystream(self.key.key(), &self.iv, &mut data);
                out.extend_from_slice(&data);
                Ok(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode, Command};
    use crate::model::DeviceModel;
    use async_trait::async_trait;

    fn key() -> KeyMaterial {
        KeyMaterial::from_hex("ff", "2b7e151628aed2a6abf7158809cf4f3c").unwrap()
    }

    struct FixedIv(Vec<u8>);

    #[async_trait]
    impl FrameExchange for FixedIv {
        async fn exchange(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
            assert_eq!(hex::encode(frame), "570000000f2103ff");
            Ok(self.0.clone())
        }
    }

    fn iv_response(iv: &[u8; 16]) -> Vec<u8> {
        let mut response = vec![0x01, 0x00, 0x00, 0x00];
        response.extend_from_slice(iv);
        response
    }

    #[test]
    fn key_material_validation_messages() {
        let cases = [
            ("", "00112233445566778899aabbccddeeff", "key_id is missing"),
            ("fff", "00112233445566778899aabbccddeeff", "key_id is invalid"),
            ("ff", "", "encryption_key is missing"),
            ("ff", "0011", "encryption_key is invalid"),
        ];
        for (id, key, message) in cases {
            assert_eq!(
                KeyMaterial::from_hex(id, key),
                Err(CryptoError::InvalidKey(message.into()))
            );
        }
    }

    #[test]
    fn key_material_debug_hides_key() {
        let rendered = format!("{:?}", key());
        assert!(rendered.contains("0xff"));
        assert!(!rendered.contains("2b7e"));
    }

    #[test]
    fn handshake_steps_are_ordered() {
        let mut handshake = Handshake::new(key());
        assert!(handshake.accept(&iv_response(&[7; 16]), None).is_err());
        handshake.request().unwrap();
        assert_eq!(handshake.state(), HandshakeState::NonceSent);
        assert!(handshake.request().is_err());
        handshake.accept(&iv_response(&[7; 16]), None).unwrap();
        assert_eq!(handshake.state(), HandshakeState::ConfirmReceived);
        let session = handshake.finish().unwrap();
        assert_eq!(session.state(), HandshakeState::Established);
        assert_eq!(session.iv(), [7; 16]);
    }

    #[test]
    fn rejected_key_id_is_an_authentication_failure() {
        let mut handshake = Handshake::new(key());
        handshake.request().unwrap();
        assert_eq!(
            handshake.accept(&[0x09], None),
            Err(CryptoError::AuthenticationFailed {
                key_id: 0xff,
                status: 0x09
            })
        );
    }

    #[test]
    fn repeated_iv_is_refused() {
        let mut handshake = Handshake::new(key());
        handshake.request().unwrap();
        assert_eq!(
            handshake.accept(&iv_response(&[3; 16]), Some(&[3; 16])),
            Err(CryptoError::IvReuse)
        );
    }

    #[tokio::test]
    async fn sealed_frame_layout_and_single_use() {
        let iv = [0xa5; 16];
        let mut link = FixedIv(iv_response(&iv));
        let mut session = CryptoSession::establish(&key(), &mut link, None)
            .await
            .unwrap();
        let frame = encode(DeviceModel::Lock, &Command::Unlock).unwrap();
        let sealed = session.seal(&frame).unwrap();
        assert_eq!(sealed[..4], [0x57, 0xff, 0xa5, 0xa5]);
        assert_ne!(sealed[4..], frame.body()[..]);

        let mut plain = sealed[4..].to_vec();
        cipher::apply_keystream(key().key(), &iv, &mut plain);
        assert_eq!(plain, frame.body());

        assert!(session.seal(&frame).is_err());
    }

    #[tokio::test]
    async fn open_decrypts_after_status_prefix() {
        let iv = [0x11; 16];
        let mut link = FixedIv(iv_response(&iv));
        let mut session = CryptoSession::establish(&key(), &mut link, None)
            .await
            .unwrap();
        session
            .seal(&encode(DeviceModel::Lock, &Command::Status).unwrap())
            .unwrap();

        let mut data = vec![0x80, 0x00];
        cipher::apply_keystream(key().key(), &iv, &mut data);
        let mut response = vec![0x01, 0x00, 0x00, 0x00];
        response.extend_from_slice(&data);

        assert_eq!(session.open(&response).unwrap(), vec![0x01, 0x80, 0x00]);
    }
}
