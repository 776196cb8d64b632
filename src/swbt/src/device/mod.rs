//! One controller per physical device.
//!
//! The controller owns the GATT link, the cached state snapshot, and the retry
//! policy. At most one command is in flight per controller: a second caller is
//! rejected with [`DeviceError::Busy`] or queued, depending on [`BusyPolicy`].
//! The idle-disconnect timer never waits for the slot and only holds it long
//! enough to detach the link; it skips its turn if a command is running.
//! Toggle-style commands are not deduplicated; issuing one twice toggles twice.
//!
//! A command future dropped before it finishes (for example under a caller's
//! `tokio::time::timeout`) disconnects the link, since the device may still
//! answer the abandoned request.
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::advertisement::{Advertisement, ParseError};
use crate::codec::{self, BotPassword, CodecError, Command, CommandFrame, CurtainSpeed};
use crate::crypto::{CryptoError, CryptoSession, KeyMaterial, IV_LEN};
use crate::model::DeviceModel;
use crate::provisioning::{KeyProvisioner, ProvisionError};
use crate::state::DeviceState;
use crate::transport::{BleTransport, FrameExchange, TimeoutTransport, Timeouts, TransportError};

pub mod config;
pub mod status;

pub use config::{BusyPolicy, ConfigError, ControllerConfig, RetryPolicy};
pub use status::{DeviceStatus, StateSource};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("gave up after {attempts} attempts: {last}")]
    Timeout { attempts: u32, last: String },
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("encryption handshake timed out")]
    HandshakeTimeout,
    #[error("device busy: another command is in flight")]
    Busy,
    #[error("unknown model byte 0x{0:02x}")]
    UnknownModel(u8),
    #[error("{model} requires key material")]
    MissingKeyMaterial { model: DeviceModel },
    #[error("device repeated the previous session IV")]
    IvReuse,
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl DeviceError {
    /// Failures worth a reconnect and another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeviceError::Transport(_) | DeviceError::HandshakeTimeout | DeviceError::IvReuse
        )
    }
}

impl From<CodecError> for DeviceError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::InvalidArgument(msg) => DeviceError::InvalidArgument(msg),
            CodecError::MalformedFrame(msg) => DeviceError::MalformedFrame(msg),
            unsupported @ CodecError::UnsupportedCommand { .. } => {
                DeviceError::InvalidArgument(unsupported.to_string())
            }
            rejected if rejected.is_auth_rejection() => {
                DeviceError::AuthenticationFailed(rejected.to_string())
            }
            rejected => DeviceError::Protocol(rejected.to_string()),
        }
    }
}

impl From<CryptoError> for DeviceError {
    fn from(err: CryptoError) -> Self {
        match err {
            auth @ CryptoError::AuthenticationFailed { .. } => {
                DeviceError::AuthenticationFailed(auth.to_string())
            }
            CryptoError::HandshakeTimeout => DeviceError::HandshakeTimeout,
            CryptoError::Transport(inner) => DeviceError::Transport(inner),
            CryptoError::Protocol(msg) => DeviceError::Protocol(msg),
            CryptoError::IvReuse => DeviceError::IvReuse,
            CryptoError::InvalidKey(msg) => DeviceError::InvalidArgument(msg),
        }
    }
}

impl From<ParseError> for DeviceError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::UnknownModel(byte) => DeviceError::UnknownModel(byte),
            ParseError::MalformedFrame(msg) => DeviceError::MalformedFrame(msg),
        }
    }
}

/// A failed command together with the cached state, which the failure left untouched.
#[derive(Debug, Error, Clone)]
#[error("{error}")]
pub struct CommandFailure {
    pub error: DeviceError,
    pub last_known: Option<DeviceState>,
}

/// Secrets a device may require.
#[derive(Debug, Clone, Default)]
pub enum Credentials {
    #[default]
    None,
    Password(BotPassword),
    Key(KeyMaterial),
}

struct ActiveLink<L> {
    link: L,
    notifications: mpsc::Receiver<Vec<u8>>,
}

/// Everything guarded by the single-command lock.
struct LinkSlot<T: BleTransport> {
    transport: Arc<TimeoutTransport<T>>,
    active: Option<ActiveLink<T::Link>>,
    last_iv: Option<[u8; IV_LEN]>,
    idle_disconnect: Option<JoinHandle<()>>,
}

impl<T: BleTransport> LinkSlot<T> {
    async fn drop_link(&mut self) {
        if let Some(active) = self.active.take() {
            if let Err(err) = self.transport.disconnect(active.link).await {
                debug!(error = %err, "disconnect failed");
            }
        }
    }

    fn cancel_idle_disconnect(&mut self) {
        if let Some(handle) = self.idle_disconnect.take() {
            handle.abort();
        }
    }
}

/// Exclusive hold on the link for one command.
///
/// Must be handed back through `DeviceController::release`; a guard dropped
/// any other way tears the link down in the background.
struct SlotGuard<'a, T: BleTransport + 'static> {
    slot: MutexGuard<'a, LinkSlot<T>>,
    address: Address,
    released: bool,
}

impl<'a, T: BleTransport + 'static> Deref for SlotGuard<'a, T> {
    type Target = LinkSlot<T>;

    fn deref(&self) -> &LinkSlot<T> {
        &self.slot
    }
}

impl<'a, T: BleTransport + 'static> DerefMut for SlotGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut LinkSlot<T> {
        &mut self.slot
    }
}

impl<'a, T: BleTransport + 'static> Drop for SlotGuard<'a, T> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Some(active) = self.slot.active.take() else {
            return;
        };
        warn!(address = %self.address, "command abandoned, dropping link");
        let transport = Arc::clone(&self.slot.transport);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(disconnect_detached(transport, active, self.address));
            }
            Err(_) => debug!(address = %self.address, "no runtime left, link dropped in place"),
        }
    }
}

async fn disconnect_detached<T: BleTransport>(
    transport: Arc<TimeoutTransport<T>>,
    active: ActiveLink<T::Link>,
    address: Address,
) {
    if let Err(err) = transport.disconnect(active.link).await {
        debug!(%address, error = %err, "disconnect failed");
    }
}

/// Borrowed view of the live link used for one request/response.
struct LinkExchange<'a, T: BleTransport> {
    transport: &'a TimeoutTransport<T>,
    live: &'a mut ActiveLink<T::Link>,
    response_timeout: Duration,
    with_response: bool,
}

#[async_trait]
impl<'a, T: BleTransport> FrameExchange for LinkExchange<'a, T> {
    async fn exchange(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
        // Replies belong to the single outstanding request; drop anything stale.
        while self.live.notifications.try_recv().is_ok() {}
        debug!(frame = %hex::encode(frame), "write");
        if let Some(reply) = self
            .transport
            .write(&mut self.live.link, frame, self.with_response)
            .await?
        {
            debug!(reply = %hex::encode(&reply), "inline reply");
            return Ok(reply);
        }
        match time::timeout(self.response_timeout, self.live.notifications.recv()).await {
            Ok(Some(reply)) => {
                debug!(reply = %hex::encode(&reply), "notification");
                Ok(reply)
            }
            Ok(None) => Err(TransportError::Disconnected(
                "notification stream closed".into(),
            )),
            Err(_) => Err(TransportError::Timeout("response")),
        }
    }
}

pub struct DeviceController<T: BleTransport> {
    address: Address,
    model: DeviceModel,
    credentials: Credentials,
    config: ControllerConfig,
    status: Arc<RwLock<DeviceStatus>>,
    slot: Arc<Mutex<LinkSlot<T>>>,
}

impl<T> DeviceController<T>
where
    T: BleTransport + 'static,
{
    pub fn new(
        transport: T,
        address: Address,
        model: DeviceModel,
        config: ControllerConfig,
    ) -> Result<Self, DeviceError> {
        config
            .validate()
            .map_err(|e| DeviceError::InvalidArgument(e.to_string()))?;
        let timeouts = Timeouts {
            connect: config.connect_timeout(),
            write: config.response_timeout(),
        };
        Ok(Self {
            address,
            model,
            credentials: Credentials::None,
            config,
            status: Arc::new(RwLock::new(DeviceStatus::Unknown)),
            slot: Arc::new(Mutex::new(LinkSlot {
                transport: Arc::new(TimeoutTransport::new(transport, timeouts)),
                active: None,
                last_iv: None,
                idle_disconnect: None,
            })),
        })
    }

    /// Builds a controller for an advertised device, seeding the cache from the broadcast.
    pub fn from_advertisement(
        transport: T,
        advertisement: &Advertisement,
        config: ControllerConfig,
    ) -> Result<Self, DeviceError> {
        let controller = Self::new(transport, advertisement.address, advertisement.model, config)?;
        controller.update_from_advertisement(advertisement);
        Ok(controller)
    }

    pub fn with_key(mut self, key: KeyMaterial) -> Self {
        self.credentials = Credentials::Key(key);
        self
    }

    /// Fetches this device's key from `provisioner`.
    pub async fn with_provisioned_key<P>(self, provisioner: &P) -> Result<Self, ProvisionError>
    where
        P: KeyProvisioner + ?Sized,
    {
        let key = provisioner.key_material(&self.address).await?;
        Ok(self.with_key(key))
    }

    pub fn with_password(mut self, password: BotPassword) -> Self {
        self.credentials = Credentials::Password(password);
        self
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn model(&self) -> DeviceModel {
        self.model
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn status(&self) -> DeviceStatus {
        self.status.read().clone()
    }

    /// Last installed snapshot, if any.
    pub fn state(&self) -> Option<DeviceState> {
        self.status.read().state().cloned()
    }

    /// Installs the broadcast state when it belongs to this device. Returns whether it did.
    pub fn update_from_advertisement(&self, advertisement: &Advertisement) -> bool {
        if advertisement.address != self.address
            || advertisement.model.family() != self.model.family()
        {
            debug!(
                address = %advertisement.address,
                model = %advertisement.model,
                "advertisement not for this controller"
            );
            return false;
        }
        self.status
            .write()
            .install(advertisement.state.clone(), StateSource::Advertisement);
        true
    }

    pub async fn is_connected(&self) -> bool {
        self.slot.lock().await.active.is_some()
    }

    /// Sends `command`, then refreshes and installs the device state.
    ///
    /// On failure the cached state is left exactly as it was and returned alongside
    /// the error.
    pub async fn send_command(&self, command: Command) -> Result<DeviceState, CommandFailure> {
        self.run(command).await.map_err(|error| {
            warn!(address = %self.address, command = command.name(), error = %error, "command failed");
            CommandFailure {
                error,
                last_known: self.state(),
            }
        })
    }

    pub async fn refresh(&self) -> Result<DeviceState, CommandFailure> {
        self.send_command(Command::Status).await
    }

    pub async fn press(&self) -> Result<DeviceState, CommandFailure> {
        self.send_command(Command::Press).await
    }

    pub async fn turn_on(&self) -> Result<DeviceState, CommandFailure> {
        self.send_command(Command::TurnOn).await
    }

    pub async fn turn_off(&self) -> Result<DeviceState, CommandFailure> {
        self.send_command(Command::TurnOff).await
    }

    pub async fn toggle(&self) -> Result<DeviceState, CommandFailure> {
        self.send_command(Command::Toggle).await
    }

    pub async fn open(&self) -> Result<DeviceState, CommandFailure> {
        self.send_command(Command::Open {
            speed: CurtainSpeed::Normal,
        })
        .await
    }

    pub async fn close(&self) -> Result<DeviceState, CommandFailure> {
        self.send_command(Command::Close {
            speed: CurtainSpeed::Normal,
        })
        .await
    }

    pub async fn stop(&self) -> Result<DeviceState, CommandFailure> {
        self.send_command(Command::Stop).await
    }

    pub async fn set_position(&self, position: u8) -> Result<DeviceState, CommandFailure> {
        self.set_position_with_speed(position, CurtainSpeed::Normal)
            .await
    }

    pub async fn set_position_with_speed(
        &self,
        position: u8,
        speed: CurtainSpeed,
    ) -> Result<DeviceState, CommandFailure> {
        self.send_command(Command::SetPosition { position, speed })
            .await
    }

    pub async fn lock(&self) -> Result<DeviceState, CommandFailure> {
        self.send_command(Command::Lock).await
    }

    pub async fn unlock(&self) -> Result<DeviceState, CommandFailure> {
        self.send_command(Command::Unlock).await
    }

    pub async fn unlock_without_unlatch(&self) -> Result<DeviceState, CommandFailure> {
        self.send_command(Command::UnlockWithoutUnlatch).await
    }

    /// Confirms the lock accepts the configured key by running one encrypted query.
    pub async fn verify_key_material(&self) -> Result<(), DeviceError> {
        self.key()?;
        let frame = codec::encode(self.model, &Command::BasicInfo)?;
        let mut slot = self.acquire().await?;
        let result = match self.exchange(&mut slot, &frame).await {
            Ok(response) => codec::decode_basic_info(&response)
                .map(|_| ())
                .map_err(DeviceError::from),
            Err(err) => Err(err),
        };
        self.release(slot).await;
        result
    }

    /// Drops the link now and cancels any pending idle disconnect.
    pub async fn disconnect(&self) {
        let mut slot = self.slot.lock().await;
        slot.cancel_idle_disconnect();
        slot.drop_link().await;
    }

    async fn run(&self, command: Command) -> Result<DeviceState, DeviceError> {
        let frame = codec::encode(self.model, &command)?;
        if self.model.requires_encryption() {
            self.key()?;
        }
        let mut slot = self.acquire().await?;
        let result = self.run_locked(&mut slot, &command, &frame).await;
        if let Ok(state) = &result {
            self.status.write().install(state.clone(), StateSource::Command);
            info!(
                address = %self.address,
                model = %self.model,
                command = command.name(),
                "state updated"
            );
        }
        self.release(slot).await;
        result
    }

    async fn run_locked(
        &self,
        slot: &mut LinkSlot<T>,
        command: &Command,
        frame: &CommandFrame,
    ) -> Result<DeviceState, DeviceError> {
        if !command.is_query() {
            let ack = self.exchange(slot, frame).await?;
            if codec::check_status(&ack)? == codec::STATUS_OK_LOW_BATTERY {
                warn!(address = %self.address, "device reports low battery");
            }
        }
        let mut state = self.query_state(slot).await?;
        let previous = self.state();
        carry_over(&mut state, previous.as_ref(), command);
        Ok(state)
    }

    /// Reads the full state. Locks need the lock-info and basic-info queries, each in
    /// its own crypto session.
    async fn query_state(&self, slot: &mut LinkSlot<T>) -> Result<DeviceState, DeviceError> {
        let query = codec::encode(self.model, &Command::Status)?;
        let response = self.exchange(slot, &query).await?;
        let mut state = codec::decode(self.model, &response)?;
        if let DeviceState::Lock(lock) = &mut state {
            let query = codec::encode(self.model, &Command::BasicInfo)?;
            let response = self.exchange(slot, &query).await?;
            let info = codec::decode_basic_info(&response)?;
            lock.battery = Some(info.battery);
            lock.firmware = Some(info.firmware);
        }
        Ok(state)
    }

    /// One request/response with reconnect-and-retry on transient failures.
    async fn exchange(
        &self,
        slot: &mut LinkSlot<T>,
        frame: &CommandFrame,
    ) -> Result<Vec<u8>, DeviceError> {
        let policy = &self.config.retry;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.exchange_once(slot, frame).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() => {
                    slot.drop_link().await;
                    if attempt >= policy.max_attempts {
                        warn!(
                            address = %self.address,
                            attempts = attempt,
                            error = %err,
                            "retry budget exhausted"
                        );
                        return Err(DeviceError::Timeout {
                            attempts: attempt,
                            last: err.to_string(),
                        });
                    }
                    let delay = policy.backoff(attempt);
                    warn!(
                        address = %self.address,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn exchange_once(
        &self,
        slot: &mut LinkSlot<T>,
        frame: &CommandFrame,
    ) -> Result<Vec<u8>, DeviceError> {
        let LinkSlot {
            transport,
            active,
            last_iv,
            ..
        } = slot;
        if active.is_none() {
            debug!(address = %self.address, "connecting");
            let mut link = transport.connect(&self.address).await?;
            let notifications = match transport.subscribe_notifications(&mut link).await {
                Ok(rx) => rx,
                Err(err) => {
                    if let Err(cleanup) = transport.disconnect(link).await {
                        debug!(address = %self.address, error = %cleanup, "disconnect failed");
                    }
                    return Err(err.into());
                }
            };
            *active = Some(ActiveLink {
                link,
                notifications,
            });
        }
        let live = active
            .as_mut()
            .ok_or_else(|| TransportError::Disconnected("link unavailable".into()))?;
        let mut link = LinkExchange {
            transport: &**transport,
            live,
            response_timeout: self.config.response_timeout(),
            with_response: self.config.write_with_response,
        };

        if frame.encrypted {
            let key = self.key()?;
            let mut session = CryptoSession::establish(key, &mut link, last_iv.as_ref()).await?;
            *last_iv = Some(session.iv());
            let sealed = session.seal(frame)?;
            let response = link.exchange(&sealed).await?;
            Ok(session.open(&response)?)
        } else {
            let bytes = match &self.credentials {
                Credentials::Password(password) => password.apply(frame).to_bytes(),
                _ => frame.to_bytes(),
            };
            Ok(link.exchange(&bytes).await?)
        }
    }

    async fn acquire(&self) -> Result<SlotGuard<'_, T>, DeviceError> {
        let slot = match self.config.busy_policy {
            BusyPolicy::Reject => self.slot.try_lock().map_err(|_| DeviceError::Busy)?,
            BusyPolicy::Queue => self.slot.lock().await,
        };
        let mut guard = SlotGuard {
            slot,
            address: self.address,
            released: false,
        };
        guard.cancel_idle_disconnect();
        Ok(guard)
    }

    /// Keeps the link for `disconnect_delay`, then drops it unless another command
    /// cancels the timer first.
    async fn release(&self, mut slot: SlotGuard<'_, T>) {
        slot.released = true;
        if slot.active.is_none() {
            return;
        }
        let delay = self.config.disconnect_delay();
        if delay.is_zero() {
            slot.drop_link().await;
            return;
        }
        let shared = Arc::clone(&self.slot);
        let address = self.address;
        slot.idle_disconnect = Some(tokio::spawn(async move {
            time::sleep(delay).await;
            // Whoever holds the slot re-arms the timer or drops the link on its way out.
            let (active, transport) = match shared.try_lock() {
                Ok(mut slot) => {
                    slot.idle_disconnect = None;
                    (slot.active.take(), Arc::clone(&slot.transport))
                }
                Err(_) => {
                    debug!(%address, "idle disconnect skipped, slot in use");
                    return;
                }
            };
            if let Some(active) = active {
                debug!(%address, "idle disconnect");
                disconnect_detached(transport, active, address).await;
            }
        }));
    }

    fn key(&self) -> Result<&KeyMaterial, DeviceError> {
        match &self.credentials {
            Credentials::Key(key) => Ok(key),
            _ => Err(DeviceError::MissingKeyMaterial { model: self.model }),
        }
    }
}

/// Fills fields only broadcasts report from the previous snapshot, and settles the
/// bot's on state from the acknowledged intent.
fn carry_over(state: &mut DeviceState, previous: Option<&DeviceState>, command: &Command) {
    match state {
        DeviceState::Bot(bot) => {
            bot.is_on = match command {
                Command::TurnOn => Some(true),
                Command::TurnOff => Some(false),
                _ => previous.and_then(|p| p.as_bot()).and_then(|p| p.is_on),
            };
        }
        DeviceState::Curtain(curtain) => {
            if let Some(prev) = previous.and_then(|p| p.as_curtain()) {
                curtain.light_level = curtain.light_level.or(prev.light_level);
            }
        }
        DeviceState::Lock(lock) => {
            if let Some(prev) = previous.and_then(|p| p.as_lock()) {
                lock.auto_lock_paused = lock.auto_lock_paused.or(prev.auto_lock_paused);
                lock.night_latch = lock.night_latch.or(prev.night_latch);
            }
        }
        DeviceState::Plug(plug) => {
            if let Some(prev) = previous.and_then(|p| p.as_plug()) {
                plug.wifi_rssi = plug.wifi_rssi.or(prev.wifi_rssi);
                plug.power_w = plug.power_w.or(prev.power_w);
            }
        }
        DeviceState::Meter(_) => {}
    }
}
