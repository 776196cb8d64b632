//! Seams to the platform BLE stack.
//!
//! The crate never talks to a radio directly. A host adapter (btleplug, bluer,
//! CoreBluetooth bindings) implements [`BleTransport`] for GATT traffic and
//! [`Scanner`] for advertisements; tests plug in [`crate::simulator`].
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time;

use crate::address::Address;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("link disconnected: {0}")]
    Disconnected(String),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("transport i/o: {0}")]
    Io(String),
}

/// GATT access to a single peripheral at a time per link.
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Connected-peripheral handle; dropped links must not leak platform resources.
    type Link: Send + 'static;

    async fn connect(&self, address: &Address) -> Result<Self::Link, TransportError>;

    /// Writes to the command characteristic.
    ///
    /// Stacks that return the reply inline (write-with-response carrying a value)
    /// yield `Some`; otherwise the reply arrives on the notification channel.
    async fn write(
        &self,
        link: &mut Self::Link,
        bytes: &[u8],
        with_response: bool,
    ) -> Result<Option<Vec<u8>>, TransportError>;

    async fn subscribe_notifications(
        &self,
        link: &mut Self::Link,
    ) -> Result<mpsc::Receiver<Vec<u8>>, TransportError>;

    async fn disconnect(&self, link: Self::Link) -> Result<(), TransportError>;
}

/// Request/response over an established link. Implemented by the controller's live
/// link and consumed by the crypto handshake.
#[async_trait]
pub trait FrameExchange: Send {
    async fn exchange(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransportError>;
}

/// One advertisement as surfaced by the platform scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEvent {
    pub address: Address,
    pub rssi: i16,
    pub manufacturer_data: Vec<u8>,
}

#[async_trait]
pub trait Scanner: Send + Sync {
    async fn start_scan(&self) -> Result<mpsc::Receiver<ScanEvent>, TransportError>;
    async fn stop_scan(&self) -> Result<(), TransportError>;
}

/// Per-operation deadlines applied by [`TimeoutTransport`].
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub connect: Duration,
    pub write: Duration,
}

/// Wrapper that enforces deadlines on connect and write.
#[derive(Debug)]
pub struct TimeoutTransport<T> {
    inner: T,
    timeouts: Timeouts,
}

impl<T> TimeoutTransport<T> {
    pub fn new(inner: T, timeouts: Timeouts) -> Self {
        Self { inner, timeouts }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T> BleTransport for TimeoutTransport<T>
where
    T: BleTransport,
{
    type Link = T::Link;

    async fn connect(&self, address: &Address) -> Result<Self::Link, TransportError> {
        match time::timeout(self.timeouts.connect, self.inner.connect(address)).await {
            Ok(res) => res,
            Err(_) => Err(TransportError::Timeout("connect")),
        }
    }

    async fn write(
        &self,
        link: &mut Self::Link,
        bytes: &[u8],
        with_response: bool,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        match time::timeout(
            self.timeouts.write,
            self.inner.write(link, bytes, with_response),
        )
        .await
        {
            Ok(res) => res,
            Err(_) => Err(TransportError::Timeout("write")),
        }
    }

    async fn subscribe_notifications(
        &self,
        link: &mut Self::Link,
    ) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        self.inner.subscribe_notifications(link).await
    }

    async fn disconnect(&self, link: Self::Link) -> Result<(), TransportError> {
        self.inner.disconnect(link).await
    }
}
