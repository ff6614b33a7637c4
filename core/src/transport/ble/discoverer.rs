//! BLE peer discoverer
//!
//! Owns one advertiser and one scanner. What gets advertised depends on
//! whether the local radio address is known: presence when it is, a
//! provide-address request when it is not, and temporarily an assist
//! advertisement while helping another peer. Every scan hit is classified and
//! reported to the owner as a [`BleDiscoveryEvent`].

use crate::config::DiscoveryConfig;
use crate::peer::PeerProperties;
use crate::timer::OneShotTimer;
use crate::transport::ble::address::MacAddress;
use crate::transport::ble::advertisement::{
    self, classify, decode_for_service, AdvertisementPurpose, CodecError,
};
use crate::transport::ble::gatt::GattAssistQueue;
use crate::transport::ble::platform::{
    AdvertiseError, AdvertiseSettings, BleDevice, BlePlatform, GattError, ScanError, ScanSettings,
    MAX_ADVERTISEMENT_DATA_LENGTH,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BleDiscovererError {
    #[error("Advertising failed: {0}")]
    Advertise(#[from] AdvertiseError),
    #[error("Scanning failed: {0}")]
    Scan(#[from] ScanError),
    #[error("GATT failed: {0}")]
    Gatt(#[from] GattError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("No address resolution request pending")]
    NoPendingRequest,
}

// ============================================================================
// EVENTS AND STATE
// ============================================================================

/// Messages posted by the discoverer to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum BleDiscoveryEvent {
    PeerDiscovered(PeerProperties),
    /// A peer that does not know its own address asked for help
    ProvideMacAddressRequest { request_id: String, device: BleDevice },
    /// A peer is ready to help resolve our address
    PeerReadyToAssist { request_id: String },
    BluetoothMacAddressResolved(MacAddress),
    /// Assist advertising ended; says nothing about whether the peer resolved its address
    AssistOperationFinished { request_id: String },
    AssistRequestSucceeded { request_id: String },
    AssistRequestFailed { request_id: String },
}

/// What the advertiser is currently broadcasting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvertisingPurpose {
    SelfPresence,
    MacAddressRequest,
    Assistance { request_id: String, address: MacAddress },
}

/// Independent activity flags of the discoverer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BleDiscovererState {
    pub scanning: bool,
    pub advertising_self: bool,
    pub advertising_mac_request: bool,
    pub advertising_assistance: bool,
}

impl BleDiscovererState {
    pub fn is_started(&self) -> bool {
        self.scanning
            || self.advertising_self
            || self.advertising_mac_request
            || self.advertising_assistance
    }
}

/// Which halves of [`BlePeerDiscoverer::start`] succeeded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartOutcome {
    pub scanning: bool,
    pub advertising: bool,
}

impl StartOutcome {
    pub fn is_success(&self) -> bool {
        self.scanning && self.advertising
    }
}

#[derive(Default)]
struct Inner {
    local_address: MacAddress,
    peer_name: Option<String>,
    /// Pending provide-address request while our address is unknown
    our_request_id: Option<String>,
    scanning: bool,
    advertising: Option<AdvertisingPurpose>,
    /// Purpose to restore once assist advertising ends
    before_assist: Option<AdvertisingPurpose>,
    scan_task: Option<JoinHandle<()>>,
    gatt_task: Option<JoinHandle<()>>,
}

// ============================================================================
// DISCOVERER
// ============================================================================

#[derive(Clone)]
pub struct BlePeerDiscoverer {
    config: DiscoveryConfig,
    platform: BlePlatform,
    assist_queue: GattAssistQueue,
    assist_timer: OneShotTimer,
    /// Serializes advertiser start/stop sequences
    advertiser_lock: Arc<tokio::sync::Mutex<()>>,
    inner: Arc<Mutex<Inner>>,
    events: mpsc::UnboundedSender<BleDiscoveryEvent>,
}

impl BlePeerDiscoverer {
    pub fn new(
        config: DiscoveryConfig,
        platform: BlePlatform,
        local_address: MacAddress,
        peer_name: Option<String>,
    ) -> (Self, mpsc::UnboundedReceiver<BleDiscoveryEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let assist_queue = GattAssistQueue::new(
            platform.gatt_client.clone(),
            config.service_uuid,
            config.gatt_request_timeout,
            config.gatt_max_request_attempts,
            events.clone(),
        );

        let inner = Inner {
            local_address,
            peer_name,
            ..Default::default()
        };

        let discoverer = Self {
            config,
            platform,
            assist_queue,
            assist_timer: OneShotTimer::new(),
            advertiser_lock: Arc::new(tokio::sync::Mutex::new(())),
            inner: Arc::new(Mutex::new(inner)),
            events,
        };
        (discoverer, receiver)
    }

    pub fn state(&self) -> BleDiscovererState {
        let inner = self.inner.lock();
        BleDiscovererState {
            scanning: inner.scanning,
            advertising_self: inner.advertising == Some(AdvertisingPurpose::SelfPresence),
            advertising_mac_request: inner.advertising == Some(AdvertisingPurpose::MacAddressRequest),
            advertising_assistance: matches!(
                inner.advertising,
                Some(AdvertisingPurpose::Assistance { .. })
            ),
        }
    }

    pub fn local_address(&self) -> MacAddress {
        self.inner.lock().local_address
    }

    /// Our pending provide-address request ID, if the local address is unknown
    pub fn request_id(&self) -> Option<String> {
        self.inner.lock().our_request_id.clone()
    }

    pub fn advertising_purpose(&self) -> Option<AdvertisingPurpose> {
        self.inner.lock().advertising.clone()
    }

    /// Start advertising and scanning.
    ///
    /// A failure of one half does not stop the other; the caller decides.
    pub async fn start(&self) -> StartOutcome {
        let purpose = self.base_purpose();
        info!("Starting BLE discoverer, advertising {:?}", purpose);

        let (advertised, scanned) = futures::join!(self.advertise(purpose), self.start_scanning());
        if let Err(e) = &advertised {
            warn!("BLE advertiser failed to start: {}", e);
        }
        if let Err(e) = &scanned {
            warn!("BLE scanner failed to start: {}", e);
        }

        StartOutcome {
            scanning: scanned.is_ok(),
            advertising: advertised.is_ok(),
        }
    }

    pub async fn stop(&self) {
        info!("Stopping BLE discoverer");
        self.assist_timer.cancel();
        self.assist_queue.clear();

        let (was_scanning, scan_task, gatt_task) = {
            let mut inner = self.inner.lock();
            inner.before_assist = None;
            let was_scanning = std::mem::replace(&mut inner.scanning, false);
            (was_scanning, inner.scan_task.take(), inner.gatt_task.take())
        };

        if let Some(task) = scan_task {
            task.abort();
        }
        if was_scanning {
            self.platform.scanner.stop_scan().await;
        }
        if let Some(task) = gatt_task {
            task.abort();
            self.platform.gatt_server.close().await;
        }

        let _guard = self.advertiser_lock.lock().await;
        let was_advertising = self.inner.lock().advertising.take().is_some();
        if was_advertising {
            self.platform.advertiser.stop_advertising().await;
        }
    }

    /// Handle one scan hit and report what it was
    pub async fn on_scan_hit(&self, device: &BleDevice, manufacturer_data: &[u8]) -> AdvertisementPurpose {
        let service_uuid = self.config.service_uuid;
        let parsed = match decode_for_service(manufacturer_data, service_uuid) {
            Some(parsed) => parsed,
            None => {
                trace!("Ignoring {} byte advertisement from {}", manufacturer_data.len(), device.address);
                return AdvertisementPurpose::Unknown;
            }
        };

        let (our_request_id, address_unknown) = {
            let inner = self.inner.lock();
            (inner.our_request_id.clone(), inner.local_address.is_unknown())
        };
        let purpose = classify(&parsed, service_uuid, our_request_id.as_deref());
        trace!("Scan hit from {}: {}", device.address, purpose);

        match purpose {
            AdvertisementPurpose::PeerPresence => {
                if let Some(address) = parsed.bluetooth_address.filter(|a| !a.is_unknown()) {
                    self.emit(BleDiscoveryEvent::PeerDiscovered(PeerProperties::from_mac(&address)));
                }
            }
            AdvertisementPurpose::ProvideMacAddressRequest => {
                let Some(request_id) = parsed.provide_request_id else {
                    return purpose;
                };
                // Both sides unresolved: only the smaller request ID helps
                if address_unknown {
                    if let Some(ours) = &our_request_id {
                        if request_id.as_str() > ours.as_str() {
                            debug!("Not assisting {}: our request {} wins the tie-break", request_id, ours);
                            return purpose;
                        }
                    }
                }
                self.emit(BleDiscoveryEvent::ProvideMacAddressRequest {
                    request_id,
                    device: device.clone(),
                });
            }
            AdvertisementPurpose::PeerReadyToAssist => {
                if let Some(request_id) = our_request_id {
                    self.emit(BleDiscoveryEvent::PeerReadyToAssist { request_id });
                }
            }
            AdvertisementPurpose::PeerProvidingOurAddress => {
                if let Some(address) = parsed.bluetooth_address {
                    self.resolve_local_address(address).await;
                }
            }
            AdvertisementPurpose::Unknown => {}
        }
        purpose
    }

    /// Adopt a resolved local address: drop the pending request, close the
    /// resolution GATT server and switch to presence advertising.
    pub async fn set_local_address(&self, address: MacAddress) {
        let (restart_advertising, gatt_task) = {
            let mut inner = self.inner.lock();
            inner.local_address = address;
            inner.our_request_id = None;
            (
                inner.advertising == Some(AdvertisingPurpose::MacAddressRequest),
                inner.gatt_task.take(),
            )
        };

        if let Some(task) = gatt_task {
            task.abort();
            self.platform.gatt_server.close().await;
        }
        if restart_advertising {
            if let Err(e) = self.advertise(AdvertisingPurpose::SelfPresence).await {
                warn!("Failed to switch to presence advertising: {}", e);
            }
        }
    }

    /// Broadcast an assist advertisement for `duration`, then restore what
    /// was advertised before.
    ///
    /// With an unknown `address` this announces "ready to assist"; with a
    /// known one it broadcasts that address for the requester to pick up.
    pub async fn start_assist_advertising(
        &self,
        request_id: &str,
        address: MacAddress,
        duration: Duration,
    ) -> Result<(), BleDiscovererError> {
        let purpose = AdvertisingPurpose::Assistance {
            request_id: request_id.to_string(),
            address,
        };
        {
            let mut inner = self.inner.lock();
            if !matches!(inner.advertising, Some(AdvertisingPurpose::Assistance { .. })) {
                inner.before_assist = inner.advertising.clone();
            }
        }

        if let Err(e) = self.advertise(purpose).await {
            warn!("Assist advertising for {} failed: {}", request_id, e);
            self.restore_advertising().await;
            return Err(e);
        }
        info!("Assist advertising for {} ({:?})", request_id, duration);

        let this = self.clone();
        let request_id = request_id.to_string();
        self.assist_timer.arm(duration, async move {
            this.restore_advertising().await;
            debug!("Assist operation {} finished", request_id);
            this.emit(BleDiscoveryEvent::AssistOperationFinished { request_id });
        });
        Ok(())
    }

    /// End assist advertising early without reporting it
    pub async fn stop_assist_advertising(&self) {
        self.assist_timer.cancel();
        self.restore_advertising().await;
    }

    /// Queue a GATT write giving `device` the address we observe for it
    pub fn enqueue_assist(&self, request_id: &str, device: BleDevice) -> bool {
        self.assist_queue.enqueue(request_id, device)
    }

    pub fn cancel_assist(&self, request_id: &str) -> bool {
        self.assist_queue.cancel(request_id)
    }

    /// Open the GATT server through which a helper delivers our address.
    ///
    /// Returns `Ok(false)` if it is already open.
    pub async fn open_resolution_gatt_server(&self) -> Result<bool, BleDiscovererError> {
        let request_id = {
            let inner = self.inner.lock();
            if inner.gatt_task.is_some() {
                return Ok(false);
            }
            inner
                .our_request_id
                .clone()
                .ok_or(BleDiscovererError::NoPendingRequest)?
        };

        let characteristic = advertisement::provide_mac_address_uuid(self.config.service_uuid, &request_id)?;
        let mut writes = self
            .platform
            .gatt_server
            .open(self.config.service_uuid, characteristic)
            .await?;
        info!("Opened address resolution GATT server for {}", request_id);

        let this = self.clone();
        let task = tokio::spawn(async move {
            while let Some(write) = writes.recv().await {
                if write.characteristic != characteristic {
                    continue;
                }
                match MacAddress::from_slice(&write.value) {
                    Ok(address) if !address.is_unknown() => {
                        // Detach before closing so the close does not abort this task
                        this.inner.lock().gatt_task.take();
                        this.platform.gatt_server.close().await;
                        this.resolve_local_address(address).await;
                        break;
                    }
                    _ => warn!("Ignoring malformed address write from {}", write.remote.address),
                }
            }
        });

        let mut inner = self.inner.lock();
        if inner.gatt_task.is_some() {
            // Lost a race with a concurrent open
            task.abort();
            return Ok(false);
        }
        inner.gatt_task = Some(task);
        Ok(true)
    }

    pub async fn close_resolution_gatt_server(&self) {
        let task = self.inner.lock().gatt_task.take();
        if let Some(task) = task {
            task.abort();
            self.platform.gatt_server.close().await;
        }
    }

    fn emit(&self, event: BleDiscoveryEvent) {
        if self.events.send(event).is_err() {
            trace!("BLE discovery event dropped, owner gone");
        }
    }

    async fn resolve_local_address(&self, address: MacAddress) {
        let pending = self.inner.lock().our_request_id.take().is_some();
        if !pending {
            return;
        }
        info!("Resolved local Bluetooth address {}", address);
        self.set_local_address(address).await;
        self.emit(BleDiscoveryEvent::BluetoothMacAddressResolved(address));
    }

    /// Purpose advertised outside assist operations
    fn base_purpose(&self) -> AdvertisingPurpose {
        let mut inner = self.inner.lock();
        if inner.local_address.is_unknown() {
            if inner.our_request_id.is_none() {
                inner.our_request_id = Some(advertisement::generate_request_id_for(self.config.service_uuid));
            }
            AdvertisingPurpose::MacAddressRequest
        } else {
            AdvertisingPurpose::SelfPresence
        }
    }

    async fn restore_advertising(&self) {
        let previous = self.inner.lock().before_assist.take();
        match previous {
            Some(_) => {
                let purpose = self.base_purpose();
                if let Err(e) = self.advertise(purpose).await {
                    warn!("Failed to restore advertising: {}", e);
                }
            }
            None => {
                let _guard = self.advertiser_lock.lock().await;
                let was_assisting = {
                    let mut inner = self.inner.lock();
                    let assisting = matches!(inner.advertising, Some(AdvertisingPurpose::Assistance { .. }));
                    if assisting {
                        inner.advertising = None;
                    }
                    assisting
                };
                if was_assisting {
                    self.platform.advertiser.stop_advertising().await;
                }
            }
        }
    }

    fn payload_for(&self, purpose: &AdvertisingPurpose) -> Result<Vec<u8>, BleDiscovererError> {
        let service_uuid = self.config.service_uuid;
        let inner = self.inner.lock();
        let name = inner.peer_name.as_deref();

        let payload = match purpose {
            AdvertisingPurpose::SelfPresence => advertisement::encode(name, service_uuid, &inner.local_address),
            AdvertisingPurpose::MacAddressRequest => {
                let request_id = inner
                    .our_request_id
                    .as_deref()
                    .ok_or(BleDiscovererError::NoPendingRequest)?;
                let uuid = advertisement::provide_mac_address_uuid(service_uuid, request_id)?;
                advertisement::encode(name, uuid, &MacAddress::UNKNOWN)
            }
            AdvertisingPurpose::Assistance { request_id, address } if address.is_unknown() => {
                let uuid = advertisement::assist_uuid(service_uuid, request_id)?;
                advertisement::encode(name, uuid, &MacAddress::UNKNOWN)
            }
            AdvertisingPurpose::Assistance { request_id, address } => {
                let uuid = advertisement::provide_mac_address_uuid(service_uuid, request_id)?;
                advertisement::encode(name, uuid, address)
            }
        };
        Ok(payload.to_vec())
    }

    async fn advertise(&self, purpose: AdvertisingPurpose) -> Result<(), BleDiscovererError> {
        let payload = self.payload_for(&purpose)?;
        if payload.len() > MAX_ADVERTISEMENT_DATA_LENGTH {
            return Err(AdvertiseError::DataTooLarge(payload.len()).into());
        }

        let settings = AdvertiseSettings {
            mode: self.config.advertise_mode,
            tx_power: self.config.advertise_tx_power,
            connectable: matches!(purpose, AdvertisingPurpose::Assistance { .. }),
        };

        let _guard = self.advertiser_lock.lock().await;
        let was_advertising = self.inner.lock().advertising.take().is_some();
        if was_advertising {
            self.platform.advertiser.stop_advertising().await;
        }

        self.platform
            .advertiser
            .start_advertising(settings, self.config.manufacturer_id, &payload)
            .await?;
        debug!("Advertising {:?}", purpose);
        self.inner.lock().advertising = Some(purpose);
        Ok(())
    }

    async fn start_scanning(&self) -> Result<(), BleDiscovererError> {
        if self.inner.lock().scanning {
            return Ok(());
        }

        let settings = ScanSettings {
            mode: self.config.scan_mode,
        };
        let mut hits = self
            .platform
            .scanner
            .start_scan(settings, Some(self.config.manufacturer_id))
            .await?;

        let this = self.clone();
        let task = tokio::spawn(async move {
            while let Some(hit) = hits.recv().await {
                this.on_scan_hit(&hit.device, &hit.manufacturer_data).await;
            }
            debug!("BLE scan stream ended");
        });

        let mut inner = self.inner.lock();
        inner.scanning = true;
        if let Some(previous) = inner.scan_task.replace(task) {
            previous.abort();
        }
        Ok(())
    }
}

impl std::fmt::Debug for BlePeerDiscoverer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlePeerDiscoverer")
            .field("state", &self.state())
            .field("local_address", &self.local_address())
            .finish()
    }
}
