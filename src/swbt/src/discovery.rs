use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::advertisement::{Advertisement, ParseError};
use crate::model::{DeviceModel, ModelFamily};
use crate::transport::{ScanEvent, Scanner, TransportError};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("scanner failure: {0}")]
    Scanner(#[from] TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub duration_ms: u64,
    /// Buffer between the background watcher and its consumer.
    pub channel_capacity: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            duration_ms: 5_000,
            channel_capacity: 64,
        }
    }
}

impl ScanConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

type Seen = Arc<RwLock<HashMap<Address, Advertisement>>>;

/// Latest advertisement per address, fed by scans.
///
/// Reads take a snapshot; a newer broadcast from the same address replaces the
/// older entry wholesale.
pub struct DiscoveryRegistry<S> {
    scanner: Arc<S>,
    config: ScanConfig,
    seen: Seen,
}

impl<S> DiscoveryRegistry<S>
where
    S: Scanner + 'static,
{
    pub fn new(scanner: S, config: ScanConfig) -> Self {
        Self {
            scanner: Arc::new(scanner),
            config,
            seen: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Scans for `duration` and returns the newest advertisement per address seen
    /// during this scan. An empty result is not an error.
    pub async fn scan(
        &self,
        duration: Duration,
    ) -> Result<HashMap<Address, Advertisement>, DiscoveryError> {
        let mut events = self.scanner.start_scan().await?;
        let deadline = Instant::now() + duration;
        let mut found = HashMap::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, events.recv()).await {
                Ok(Some(event)) => {
                    if let Some(adv) = record(&self.seen, &event) {
                        found.insert(adv.address, adv);
                    }
                }
                Ok(None) => {
                    debug!("scanner closed its channel early");
                    break;
                }
                Err(_) => break,
            }
        }

        self.scanner.stop_scan().await?;
        debug!(devices = found.len(), "scan finished");
        Ok(found)
    }

    /// Scans for the configured default duration.
    pub async fn discover(&self) -> Result<HashMap<Address, Advertisement>, DiscoveryError> {
        self.scan(self.config.duration()).await
    }

    /// Starts a background scan that keeps the registry current and forwards each
    /// accepted advertisement. Stops when the watch is cancelled or dropped.
    pub async fn watch(&self) -> Result<AdvertisementWatch, DiscoveryError> {
        let mut events = self.scanner.start_scan().await?;
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let scanner = Arc::clone(&self.scanner);
        let seen = Arc::clone(&self.seen);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => {
                            if let Some(adv) = record(&seen, &event) {
                                // A slow consumer misses updates; the registry still has them.
                                let _ = tx.try_send(adv);
                            }
                        }
                        None => break,
                    },
                }
            }
            if let Err(err) = scanner.stop_scan().await {
                warn!(error = %err, "stopping background scan failed");
            }
        });

        Ok(AdvertisementWatch { rx, cancel, task })
    }

    /// Feeds one scan event through the parser into the registry.
    pub fn ingest(&self, event: &ScanEvent) -> Option<Advertisement> {
        record(&self.seen, event)
    }

    pub fn get(&self, address: &Address) -> Option<Advertisement> {
        self.seen.read().get(address).cloned()
    }

    pub fn snapshot(&self) -> HashMap<Address, Advertisement> {
        self.seen.read().clone()
    }

    pub fn by_model(&self, model: DeviceModel) -> HashMap<Address, Advertisement> {
        self.filtered(|adv| adv.model == model)
    }

    pub fn by_family(&self, family: ModelFamily) -> HashMap<Address, Advertisement> {
        self.filtered(|adv| adv.model.family() == family)
    }

    pub fn bots(&self) -> HashMap<Address, Advertisement> {
        self.by_family(ModelFamily::Bot)
    }

    pub fn curtains(&self) -> HashMap<Address, Advertisement> {
        self.by_family(ModelFamily::Curtain)
    }

    pub fn locks(&self) -> HashMap<Address, Advertisement> {
        self.by_family(ModelFamily::Lock)
    }

    pub fn meters(&self) -> HashMap<Address, Advertisement> {
        self.by_family(ModelFamily::Meter)
    }

    pub fn plugs(&self) -> HashMap<Address, Advertisement> {
        self.by_family(ModelFamily::Plug)
    }

    pub fn len(&self) -> usize {
        self.seen.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.read().is_empty()
    }

    pub fn clear(&self) {
        self.seen.write().clear();
    }

    fn filtered(&self, keep: impl Fn(&Advertisement) -> bool) -> HashMap<Address, Advertisement> {
        self.seen
            .read()
            .iter()
            .filter(|(_, adv)| keep(adv))
            .map(|(addr, adv)| (*addr, adv.clone()))
            .collect()
    }
}

/// Parses `event` and stores it. Unknown and malformed broadcasts are skipped.
fn record(seen: &Seen, event: &ScanEvent) -> Option<Advertisement> {
    match Advertisement::from_event(event) {
        Ok(adv) => {
            let previous = seen.write().insert(adv.address, adv.clone());
            if previous.is_none() {
                info!(address = %adv.address, model = %adv.model, rssi = adv.rssi, "discovered device");
            }
            Some(adv)
        }
        Err(ParseError::UnknownModel(byte)) => {
            debug!(address = %event.address, model_byte = byte, "ignoring foreign advertisement");
            None
        }
        Err(err) => {
            warn!(address = %event.address, error = %err, "discarding advertisement");
            None
        }
    }
}

/// Handle to a running background scan.
#[derive(Debug)]
pub struct AdvertisementWatch {
    rx: mpsc::Receiver<Advertisement>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl AdvertisementWatch {
    /// Next accepted advertisement; `None` once the scan has stopped.
    pub async fn next(&mut self) -> Option<Advertisement> {
        self.rx.recv().await
    }

    /// Stops the scan and waits for the scanner to be released.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        let _ = (&mut self.task).await;
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for AdvertisementWatch {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::SimulatedScanner;

    fn event(addr: &str, data: &[u8]) -> ScanEvent {
        ScanEvent {
            address: addr.parse().unwrap(),
            rssi: -55,
            manufacturer_data: data.to_vec(),
        }
    }

    #[tokio::test]
    async fn newer_advertisement_supersedes_older() {
        let scanner = SimulatedScanner::new(vec![
            event("aa:00:00:00:00:01", &[0x63, 0x40, 0x0a, 0x50, 0x00]),
            event("aa:00:00:00:00:01", &[0x63, 0x40, 0x32, 0x50, 0x00]),
        ]);
        let registry = DiscoveryRegistry::new(scanner, ScanConfig::default());
        let found = registry.scan(Duration::from_millis(30)).await.unwrap();
        assert_eq!(found.len(), 1);
        let addr: Address = "aa:00:00:00:00:01".parse().unwrap();
        let curtain = registry.get(&addr).unwrap();
        assert_eq!(curtain.state.as_curtain().unwrap().position, 50);
    }

    #[tokio::test]
    async fn foreign_and_malformed_broadcasts_are_skipped() {
        let scanner = SimulatedScanner::new(vec![
            event("aa:00:00:00:00:01", &[0x01, 0x02]),
            event("aa:00:00:00:00:02", &[0x63, 0x40]),
            event("aa:00:00:00:00:03", &[b'T', 0x00, 0x64, 0x05, 0x96, 0x2d]),
        ]);
        let registry = DiscoveryRegistry::new(scanner.clone(), ScanConfig::default());
        let found = registry.scan(Duration::from_millis(30)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(registry.meters().len(), 1);
        assert!(registry.curtains().is_empty());
        assert_eq!(scanner.stops(), 1);
    }

    #[tokio::test]
    async fn empty_scan_is_not_an_error() {
        let registry = DiscoveryRegistry::new(SimulatedScanner::default(), ScanConfig::default());
        let found = registry.scan(Duration::from_millis(10)).await.unwrap();
        assert!(found.is_empty());
        assert!(registry.is_empty());
    }
}
