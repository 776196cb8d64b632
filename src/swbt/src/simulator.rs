//! In-memory peripherals speaking the real wire format, for tests and demos.
//!
//! [`SimulatedDevice`] implements [`BleTransport`] and answers requests the way the
//! firmware does, lock key exchange and AES-CTR included. Faults queued with
//! [`SimulatedDevice::push_fault`] are consumed one per connect or write.
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time;

use crate::address::Address;
use crate::codec::{self, lock, Command, STATUS_AUTH_INVALID, STATUS_AUTH_REQUIRED, STATUS_OK};
use crate::crypto::{cipher, KeyMaterial, IV_LEN};
use crate::model::{DeviceModel, ModelFamily};
use crate::state::LockStatus;
use crate::transport::{BleTransport, ScanEvent, Scanner, TransportError};

/// Answer to requests the firmware does not understand.
const STATUS_UNKNOWN: u8 = 0x03;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The next connect attempt fails.
    ConnectFailure,
    /// The link drops during the next write.
    Disconnect,
    /// The next write is never answered.
    Stall,
    /// The next write is answered with these bytes verbatim.
    Reply(Vec<u8>),
    /// The next key request hands out the previous IV again.
    RepeatIv,
}

/// Handle to a connected simulated peripheral.
#[derive(Debug)]
pub struct SimLink {
    generation: u64,
}

#[derive(Debug)]
struct Sim {
    model: DeviceModel,
    key: Option<KeyMaterial>,
    password: Option<[u8; 4]>,
    faults: VecDeque<Fault>,
    inline_replies: bool,
    latency: Duration,

    battery: u8,
    firmware: u8,
    switch_mode: bool,
    bot_on: bool,
    presses: u32,
    position: u8,
    lock_status: LockStatus,
    door_open: bool,
    plug_on: bool,

    generation: u64,
    notify: Option<mpsc::Sender<Vec<u8>>>,
    session_iv: Option<[u8; IV_LEN]>,
    issued_ivs: Vec<[u8; IV_LEN]>,
    repeat_iv: bool,
    connects: u32,
    disconnects: u32,
    writes: Vec<Vec<u8>>,
}

enum WriteOutcome {
    Fail(TransportError),
    Stall,
    Inline(Vec<u8>),
    Notified,
}

#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    inner: Arc<Mutex<Sim>>,
}

impl SimulatedDevice {
    pub fn new(model: DeviceModel) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Sim {
                model,
                key: None,
                password: None,
                faults: VecDeque::new(),
                inline_replies: false,
                latency: Duration::ZERO,
                battery: 87,
                firmware: 11,
                switch_mode: true,
                bot_on: false,
                presses: 0,
                position: 0,
                lock_status: LockStatus::Locked,
                door_open: false,
                plug_on: false,
                generation: 0,
                notify: None,
                session_iv: None,
                issued_ivs: Vec::new(),
                repeat_iv: false,
                connects: 0,
                disconnects: 0,
                writes: Vec::new(),
            })),
        }
    }

    pub fn bot() -> Self {
        Self::new(DeviceModel::Bot)
    }

    pub fn curtain() -> Self {
        Self::new(DeviceModel::Curtain)
    }

    pub fn plug() -> Self {
        Self::new(DeviceModel::PlugMini)
    }

    pub fn lock(model: DeviceModel, key: KeyMaterial) -> Self {
        let device = Self::new(model);
        device.inner.lock().key = Some(key);
        device
    }

    pub fn with_password(self, password: &str) -> Self {
        self.inner.lock().password = Some(crc32fast::hash(password.as_bytes()).to_be_bytes());
        self
    }

    pub fn with_position(self, position: u8) -> Self {
        self.inner.lock().position = position.min(100);
        self
    }

    pub fn with_lock_status(self, status: LockStatus) -> Self {
        self.inner.lock().lock_status = status;
        self
    }

    /// Answer writes inline instead of through notifications.
    pub fn with_inline_replies(self) -> Self {
        self.inner.lock().inline_replies = true;
        self
    }

    /// Delay applied to every write before it is processed.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.inner.lock().latency = latency;
        self
    }

    pub fn push_fault(&self, fault: Fault) {
        self.inner.lock().faults.push_back(fault);
    }

    pub fn model(&self) -> DeviceModel {
        self.inner.lock().model
    }

    pub fn battery(&self) -> u8 {
        self.inner.lock().battery
    }

    pub fn position(&self) -> u8 {
        self.inner.lock().position
    }

    pub fn lock_status(&self) -> LockStatus {
        self.inner.lock().lock_status
    }

    pub fn presses(&self) -> u32 {
        self.inner.lock().presses
    }

    pub fn connects(&self) -> u32 {
        self.inner.lock().connects
    }

    pub fn disconnects(&self) -> u32 {
        self.inner.lock().disconnects
    }

    /// Every frame written, in order, as it appeared on the wire.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.inner.lock().writes.clone()
    }

    pub fn issued_ivs(&self) -> Vec<[u8; IV_LEN]> {
        self.inner.lock().issued_ivs.clone()
    }

    /// Manufacturer data the device would currently broadcast.
    pub fn advertisement(&self) -> Vec<u8> {
        self.inner.lock().advertisement()
    }

    pub fn scan_event(&self, address: Address, rssi: i16) -> ScanEvent {
        ScanEvent {
            address,
            rssi,
            manufacturer_data: self.advertisement(),
        }
    }
}

impl Sim {
    fn on_write(&mut self, generation: u64, bytes: &[u8]) -> WriteOutcome {
        self.writes.push(bytes.to_vec());
        if generation != self.generation || self.notify.is_none() && !self.inline_replies {
            return WriteOutcome::Fail(TransportError::Disconnected("stale link".into()));
        }
        let reply = match self.take_write_fault() {
            Some(Fault::Disconnect) => {
                self.drop_link();
                return WriteOutcome::Fail(TransportError::Disconnected(
                    "peripheral went away".into(),
                ));
            }
            Some(Fault::Stall) => return WriteOutcome::Stall,
            Some(Fault::Reply(reply)) => reply,
            Some(Fault::RepeatIv) => {
                self.repeat_iv = true;
                self.handle(bytes)
            }
            Some(Fault::ConnectFailure) | None => self.handle(bytes),
        };
        if self.inline_replies {
            return WriteOutcome::Inline(reply);
        }
        match &self.notify {
            Some(tx) => match tx.try_send(reply) {
                Ok(()) => WriteOutcome::Notified,
                Err(_) => WriteOutcome::Fail(TransportError::Io("notification queue full".into())),
            },
            None => WriteOutcome::Fail(TransportError::Disconnected("not subscribed".into())),
        }
    }

    fn take_write_fault(&mut self) -> Option<Fault> {
        match self.faults.front() {
            Some(Fault::ConnectFailure) | None => None,
            Some(_) => self.faults.pop_front(),
        }
    }

    fn drop_link(&mut self) {
        self.generation += 1;
        self.notify = None;
        self.session_iv = None;
    }

    fn handle(&mut self, bytes: &[u8]) -> Vec<u8> {
        if bytes.first() != Some(&codec::REQUEST_HEADER) {
            return vec![STATUS_UNKNOWN];
        }
        match self.model.family() {
            ModelFamily::Lock => self.handle_lock(bytes),
            ModelFamily::Meter => vec![STATUS_UNKNOWN],
            _ => self.handle_plain(bytes),
        }
    }

    fn handle_plain(&mut self, bytes: &[u8]) -> Vec<u8> {
        if self.model == DeviceModel::Bot {
            if let Some(expected) = self.password {
                let protected = bytes.get(1).map_or(false, |b| b & 0xf0 == 0x10);
                if !protected {
                    return vec![STATUS_AUTH_REQUIRED];
                }
                if bytes.get(2..6) != Some(&expected[..]) {
                    return vec![STATUS_AUTH_INVALID];
                }
            }
        }
        let Ok(command) = codec::decode_command(self.model, bytes) else {
            return vec![STATUS_UNKNOWN];
        };
        match command {
            Command::Press => {
                self.presses += 1;
                if self.switch_mode {
                    self.bot_on = !self.bot_on;
                }
                vec![STATUS_OK]
            }
            Command::TurnOn if self.model == DeviceModel::Bot => {
                self.bot_on = true;
                vec![STATUS_OK]
            }
            Command::TurnOff if self.model == DeviceModel::Bot => {
                self.bot_on = false;
                vec![STATUS_OK]
            }
            Command::TurnOn => self.switch_plug(true),
            Command::TurnOff => self.switch_plug(false),
            Command::Toggle => self.switch_plug(!self.plug_on),
            Command::SetPosition { position, .. } => {
                self.position = position;
                vec![STATUS_OK]
            }
            Command::Stop => vec![STATUS_OK],
            Command::Status | Command::BasicInfo => self.status_reply(),
            _ => vec![STATUS_UNKNOWN],
        }
    }

    fn switch_plug(&mut self, on: bool) -> Vec<u8> {
        self.plug_on = on;
        vec![STATUS_OK, if on { 0x80 } else { 0x00 }]
    }

    fn status_reply(&self) -> Vec<u8> {
        match self.model.family() {
            ModelFamily::Bot => {
                let mut reply = vec![STATUS_OK, self.battery, self.firmware, 0x50, 0, 0, 0, 0, 0];
                reply.push(if self.switch_mode { 0x10 } else { 0x00 });
                reply.push(0);
                reply
            }
            ModelFamily::Curtain => vec![
                STATUS_OK,
                self.battery,
                self.firmware,
                0x01,
                0x00,
                0x04,
                self.position,
                0x00,
            ],
            ModelFamily::Plug => vec![STATUS_OK, if self.plug_on { 0x80 } else { 0x00 }],
            _ => vec![STATUS_UNKNOWN],
        }
    }

    fn handle_lock(&mut self, bytes: &[u8]) -> Vec<u8> {
        if bytes.len() <= codec::ENCRYPTED_HEADER_LEN {
            return vec![STATUS_UNKNOWN];
        }
        let Some(key) = self.key.clone() else {
            return vec![STATUS_UNKNOWN];
        };
        let body = &bytes[codec::ENCRYPTED_HEADER_LEN..];
        if bytes[1..codec::ENCRYPTED_HEADER_LEN] == [0, 0, 0] {
            return match lock::parse_key_request(body) {
                Some(key_id) if key_id == key.key_id() => self.issue_iv(),
                Some(_) => vec![STATUS_AUTH_INVALID],
                None => vec![STATUS_AUTH_REQUIRED],
            };
        }
        // A session IV serves exactly one request.
        let Some(iv) = self.session_iv.take() else {
            return vec![STATUS_AUTH_REQUIRED];
        };
        if bytes[1] != key.key_id() || bytes[2..4] != iv[..2] {
            return vec![STATUS_AUTH_INVALID];
        }
        let mut plain = body.to_vec();
        cipher::apply_keystream(key.key(), &iv, &mut plain);
        let mut request = vec![codec::REQUEST_HEADER, 0, 0, 0];
        request.extend_from_slice(&plain);
        let Ok(command) = codec::decode_command(self.model, &request) else {
            return vec![STATUS_AUTH_INVALID];
        };
        let mut data = match command {
            Command::Lock => {
                self.lock_status = LockStatus::Locked;
                Vec::new()
            }
            Command::Unlock | Command::UnlockWithoutUnlatch => {
                self.lock_status = LockStatus::Unlocked;
                Vec::new()
            }
            Command::Status => self.lock_info(),
            Command::BasicInfo => vec![self.battery, self.firmware],
            _ => return vec![STATUS_UNKNOWN],
        };
        cipher::apply_keystream(key.key(), &iv, &mut data);
        let mut reply = vec![STATUS_OK, 0, 0, 0];
        reply.extend_from_slice(&data);
        reply
    }

    fn issue_iv(&mut self) -> Vec<u8> {
        let iv = match (self.repeat_iv, self.issued_ivs.last()) {
            (true, Some(previous)) => *previous,
            _ => rand::thread_rng().gen::<[u8; IV_LEN]>(),
        };
        self.repeat_iv = false;
        self.issued_ivs.push(iv);
        self.session_iv = Some(iv);
        let mut reply = vec![STATUS_OK, 0, 0, 0];
        reply.extend_from_slice(&iv);
        reply
    }

    fn lock_info(&self) -> Vec<u8> {
        let status = self.lock_status.code();
        match self.model {
            DeviceModel::LockPro => vec![
                0x80 | (status << 3),
                if self.door_open { 0x10 } else { 0x00 },
                0,
                0,
                0,
                0,
            ],
            _ => vec![
                0x80 | (status << 4) | if self.door_open { 0x04 } else { 0x00 },
                0x00,
            ],
        }
    }

    fn advertisement(&self) -> Vec<u8> {
        let model = self.model.model_byte();
        match self.model.family() {
            ModelFamily::Bot => {
                let mut flags = if self.switch_mode { 0x80 } else { 0x00 };
                if !self.bot_on {
                    flags |= 0x40;
                }
                vec![model, flags, self.battery]
            }
            ModelFamily::Curtain => vec![model, 0x40, self.position, self.battery, 0x11],
            ModelFamily::Lock => {
                let status = self.lock_status.code();
                if self.model == DeviceModel::LockPro {
                    vec![
                        model | 0x80,
                        0x00,
                        self.battery,
                        0x80 | ((status & 0x07) << 3),
                        if self.door_open { 0x40 } else { 0x00 },
                        0x00,
                    ]
                } else {
                    vec![
                        model | 0x80,
                        0x00,
                        self.battery,
                        0x80 | ((status & 0x07) << 4) | if self.door_open { 0x04 } else { 0x00 },
                        0x00,
                    ]
                }
            }
            ModelFamily::Meter => vec![model, 0x00, self.battery, 0x05, 0x96, 0x2d],
            ModelFamily::Plug => vec![
                model,
                if self.plug_on { 0x80 } else { 0x00 },
                0x00,
                0x3c,
                0x00,
                0x00,
            ],
        }
    }
}

#[async_trait]
impl BleTransport for SimulatedDevice {
    type Link = SimLink;

    async fn connect(&self, _address: &Address) -> Result<SimLink, TransportError> {
        let mut sim = self.inner.lock();
        if sim.faults.front() == Some(&Fault::ConnectFailure) {
            sim.faults.pop_front();
            return Err(TransportError::Io("connection refused".into()));
        }
        sim.drop_link();
        sim.connects += 1;
        Ok(SimLink {
            generation: sim.generation,
        })
    }

    async fn write(
        &self,
        link: &mut SimLink,
        bytes: &[u8],
        _with_response: bool,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let latency = self.inner.lock().latency;
        if !latency.is_zero() {
            time::sleep(latency).await;
        }
        let outcome = self.inner.lock().on_write(link.generation, bytes);
        match outcome {
            WriteOutcome::Fail(err) => Err(err),
            WriteOutcome::Stall => {
                time::sleep(Duration::from_secs(3600)).await;
                Ok(None)
            }
            WriteOutcome::Inline(reply) => Ok(Some(reply)),
            WriteOutcome::Notified => Ok(None),
        }
    }

    async fn subscribe_notifications(
        &self,
        link: &mut SimLink,
    ) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        let mut sim = self.inner.lock();
        if link.generation != sim.generation {
            return Err(TransportError::Disconnected("stale link".into()));
        }
        let (tx, rx) = mpsc::channel(8);
        sim.notify = Some(tx);
        Ok(rx)
    }

    async fn disconnect(&self, link: SimLink) -> Result<(), TransportError> {
        let mut sim = self.inner.lock();
        sim.disconnects += 1;
        if link.generation == sim.generation {
            sim.drop_link();
        }
        Ok(())
    }
}

/// Scanner replaying queued advertisements; more can be pushed while a scan runs.
#[derive(Debug, Clone, Default)]
pub struct SimulatedScanner {
    inner: Arc<Mutex<ScanSim>>,
}

#[derive(Debug, Default)]
struct ScanSim {
    queued: Vec<ScanEvent>,
    live: Option<mpsc::Sender<ScanEvent>>,
    starts: u32,
    stops: u32,
}

impl SimulatedScanner {
    pub fn new(events: Vec<ScanEvent>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ScanSim {
                queued: events,
                ..ScanSim::default()
            })),
        }
    }

    /// Delivers `event` to the running scan, or queues it for the next one.
    pub fn emit(&self, event: ScanEvent) {
        let mut sim = self.inner.lock();
        let undelivered = match &sim.live {
            Some(tx) => tx.try_send(event).err().map(|e| e.into_inner()),
            None => Some(event),
        };
        if let Some(event) = undelivered {
            sim.queued.push(event);
        }
    }

    pub fn starts(&self) -> u32 {
        self.inner.lock().starts
    }

    pub fn stops(&self) -> u32 {
        self.inner.lock().stops
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.lock().live.is_some()
    }
}

#[async_trait]
impl Scanner for SimulatedScanner {
    async fn start_scan(&self) -> Result<mpsc::Receiver<ScanEvent>, TransportError> {
        let mut sim = self.inner.lock();
        let queued = std::mem::take(&mut sim.queued);
        let (tx, rx) = mpsc::channel(queued.len() + 16);
        for event in queued {
            let _ = tx.try_send(event);
        }
        sim.live = Some(tx);
        sim.starts += 1;
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        let mut sim = self.inner.lock();
        sim.live = None;
        sim.stops += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advertisement;

    #[test]
    fn broadcasts_decode_with_the_parser() {
        let addr: Address = "01:02:03:04:05:06".parse().unwrap();
        let curtain = SimulatedDevice::curtain().with_position(30);
        let adv = advertisement::parse(addr, -50, &curtain.advertisement()).unwrap();
        assert_eq!(adv.state.as_curtain().unwrap().position, 30);

        let key = KeyMaterial::new(1, [0; 16]);
        let lock = SimulatedDevice::lock(DeviceModel::LockPro, key)
            .with_lock_status(LockStatus::Unlocked);
        let adv = advertisement::parse(addr, -50, &lock.advertisement()).unwrap();
        assert!(adv.encrypted);
        assert_eq!(adv.state.as_lock().unwrap().status, LockStatus::Unlocked);
    }

    #[tokio::test]
    async fn stale_links_are_refused() {
        let device = SimulatedDevice::plug().with_inline_replies();
        let addr: Address = "01:02:03:04:05:06".parse().unwrap();
        let mut first = device.connect(&addr).await.unwrap();
        let mut second = device.connect(&addr).await.unwrap();
        assert!(device.write(&mut first, &[0x57, 0x0f, 0x50, 0x81], false).await.is_err());
        let reply = device
            .write(&mut second, &[0x57, 0x0f, 0x50, 0x81], false)
            .await
            .unwrap();
        assert_eq!(reply, Some(vec![0x01, 0x00]));
    }
}
