//! Discovery manager: multiplexes BLE and Wi-Fi discovery
//!
//! Owns zero or one BLE discoverer and zero or one Wi-Fi discoverer, folds
//! their status into a single [`DiscoveryState`], reacts to radios being
//! switched on and off, and keeps the table of currently visible peers.

use crate::config::{DiscoveryConfig, DiscoveryMode};
use crate::peer::{PeerChange, PeerProperties, PeerTable};
use crate::timer::OneShotTimer;
use crate::transport::ble::address::MacAddress;
use crate::transport::ble::discoverer::{BleDiscoveryEvent, BlePeerDiscoverer};
use crate::transport::ble::platform::{BleDevice, BlePlatform};
use crate::transport::radio::{Radio, RadioEvent, RadioStatus};
use crate::transport::wifi::WifiPeerDiscoverer;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Externally visible state of the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryState {
    NotStarted,
    /// Started, but every radio the mode needs is switched off
    WaitingForServicesEnabled,
    RunningBle,
    RunningWifi,
    RunningBleAndWifi,
    /// BLE is running and asking peers for our own address
    WaitingForBluetoothMacAddress,
    /// Our address is still unresolved and we are helping a peer learn its own
    ProvidingBluetoothMacAddress,
}

impl fmt::Display for DiscoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Messages posted by the manager to the application
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    StateChanged(DiscoveryState),
    PeerDiscovered(PeerProperties),
    PeerUpdated(PeerProperties),
    PeerLost(PeerProperties),
    BluetoothMacAddressResolved(MacAddress),
    /// The platform should make this device discoverable for `duration`
    DiscoverableRequested { duration: Duration },
}

#[derive(Debug)]
struct ManagerState {
    mode: DiscoveryMode,
    started: bool,
    running_ble: bool,
    running_wifi: bool,
    waiting_for_address: bool,
    /// Request ID we are currently assisting
    providing: Option<String>,
    /// Request IDs already assisted since the last start
    assisted: HashSet<String>,
    reported: DiscoveryState,
}

impl ManagerState {
    fn derive(&self) -> DiscoveryState {
        if !self.started {
            return DiscoveryState::NotStarted;
        }
        // Address sub-states only apply while our own address is unresolved
        if self.running_ble && self.waiting_for_address {
            return match self.providing {
                Some(_) => DiscoveryState::ProvidingBluetoothMacAddress,
                None => DiscoveryState::WaitingForBluetoothMacAddress,
            };
        }
        match (self.running_ble, self.running_wifi) {
            (true, true) => DiscoveryState::RunningBleAndWifi,
            (true, false) => DiscoveryState::RunningBle,
            (false, true) => DiscoveryState::RunningWifi,
            (false, false) => DiscoveryState::WaitingForServicesEnabled,
        }
    }
}

/// Handle to the discovery manager. Clones share one manager.
///
/// Background tasks only hold weak references, so dropping the last handle
/// aborts them. Call [`DiscoveryManager::stop`] first to release the radios.
#[derive(Clone)]
pub struct DiscoveryManager {
    shared: Arc<Shared>,
}

struct Shared {
    config: DiscoveryConfig,
    radio: Arc<dyn RadioStatus>,
    ble: Option<BlePeerDiscoverer>,
    wifi: Option<Arc<dyn WifiPeerDiscoverer>>,
    state: Mutex<ManagerState>,
    peers: Mutex<PeerTable>,
    expiry_timer: OneShotTimer,
    /// Serializes start, stop and event handling
    op_lock: tokio::sync::Mutex<()>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    wifi_peers: mpsc::UnboundedSender<PeerProperties>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.expiry_timer.cancel();
        for pump in self.pumps.get_mut().drain(..) {
            pump.abort();
        }
    }
}

impl DiscoveryManager {
    /// Create a manager. Must be called from within a tokio runtime.
    ///
    /// `ble` and `wifi` are the platform pieces available on this device;
    /// either may be absent.
    pub fn new(
        config: DiscoveryConfig,
        local_address: MacAddress,
        peer_name: Option<String>,
        radio: Arc<dyn RadioStatus>,
        ble: Option<BlePlatform>,
        wifi: Option<Arc<dyn WifiPeerDiscoverer>>,
    ) -> (Self, mpsc::UnboundedReceiver<DiscoveryEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let (wifi_peers, mut wifi_rx) = mpsc::unbounded_channel();

        let (ble, ble_rx) = match ble {
            Some(platform) => {
                let (discoverer, rx) =
                    BlePeerDiscoverer::new(config.clone(), platform, local_address, peer_name);
                (Some(discoverer), Some(rx))
            }
            None => (None, None),
        };

        let state = ManagerState {
            mode: config.discovery_mode,
            started: false,
            running_ble: false,
            running_wifi: false,
            waiting_for_address: false,
            providing: None,
            assisted: HashSet::new(),
            reported: DiscoveryState::NotStarted,
        };

        let manager = Self {
            shared: Arc::new(Shared {
                config,
                radio,
                ble,
                wifi,
                state: Mutex::new(state),
                peers: Mutex::new(PeerTable::new()),
                expiry_timer: OneShotTimer::new(),
                op_lock: tokio::sync::Mutex::new(()),
                events,
                wifi_peers,
                pumps: Mutex::new(Vec::new()),
            }),
        };

        let mut pumps = Vec::new();
        if let Some(mut ble_rx) = ble_rx {
            let weak = Arc::downgrade(&manager.shared);
            pumps.push(tokio::spawn(async move {
                while let Some(event) = ble_rx.recv().await {
                    let Some(this) = Self::upgrade(&weak) else { break };
                    this.handle_ble_event(event).await;
                }
            }));
        }
        let weak = Arc::downgrade(&manager.shared);
        pumps.push(tokio::spawn(async move {
            while let Some(peer) = wifi_rx.recv().await {
                let Some(this) = Self::upgrade(&weak) else { break };
                if this.shared.state.lock().running_wifi {
                    this.on_peer_sighted(peer);
                } else {
                    debug!("Dropping Wi-Fi peer {} while Wi-Fi discovery is stopped", peer);
                }
            }
        }));
        *manager.shared.pumps.lock() = pumps;

        (manager, receiver)
    }

    fn upgrade(weak: &Weak<Shared>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    pub fn state(&self) -> DiscoveryState {
        self.shared.state.lock().derive()
    }

    pub fn discovery_mode(&self) -> DiscoveryMode {
        self.shared.state.lock().mode
    }

    pub fn peers(&self) -> Vec<PeerProperties> {
        self.shared.peers.lock().peers()
    }

    /// Our Bluetooth address as currently known to the BLE discoverer
    pub fn local_address(&self) -> Option<MacAddress> {
        self.shared.ble.as_ref().map(BlePeerDiscoverer::local_address)
    }

    /// Channel on which the platform reports Wi-Fi Direct peers
    pub fn wifi_peer_sender(&self) -> mpsc::UnboundedSender<PeerProperties> {
        self.shared.wifi_peers.clone()
    }

    /// Start discovery in the configured mode.
    ///
    /// Returns false only if discovery could not be started at all. Waiting
    /// for a radio to be switched on counts as started, and so does calling
    /// this on a manager that is already started.
    pub async fn start(&self) -> bool {
        let _op = self.shared.op_lock.lock().await;
        if self.shared.state.lock().started {
            debug!("Discovery already started");
            return true;
        }
        self.start_locked().await
    }

    /// Stop everything and return to `NotStarted`. Idempotent.
    pub async fn stop(&self) {
        let _op = self.shared.op_lock.lock().await;
        self.stop_locked().await;
    }

    /// Stop discovery and the background event pumps
    pub async fn shutdown(&self) {
        self.stop().await;
        let pumps: Vec<JoinHandle<()>> = self.shared.pumps.lock().drain(..).collect();
        for pump in pumps {
            pump.abort();
        }
    }

    /// Switch the discovery mode.
    ///
    /// Refuses modes needing a radio capability this device lacks and leaves
    /// the current mode in place. A running manager restarts in the new mode.
    pub async fn set_discovery_mode(&self, mode: DiscoveryMode) -> bool {
        let _op = self.shared.op_lock.lock().await;

        let shared = &self.shared;
        if mode.uses_ble() && (shared.ble.is_none() || !shared.radio.is_ble_multiple_advertisement_supported()) {
            warn!("Cannot switch to {}: BLE advertising is not supported", mode);
            return false;
        }
        if mode.uses_wifi() && (shared.wifi.is_none() || !shared.radio.is_wifi_direct_supported()) {
            warn!("Cannot switch to {}: Wi-Fi Direct is not supported", mode);
            return false;
        }

        let was_started = {
            let mut state = self.shared.state.lock();
            if state.mode == mode {
                return true;
            }
            info!("Discovery mode {} -> {}", state.mode, mode);
            state.mode = mode;
            state.started
        };

        if was_started {
            self.stop_locked().await;
            self.start_locked().await;
        }
        true
    }

    /// React to a radio being switched on or off
    pub async fn on_radio_event(&self, event: RadioEvent) {
        let _op = self.shared.op_lock.lock().await;
        let radio = event.radio();

        let (started, mode, current, running) = {
            let state = self.shared.state.lock();
            let running = match radio {
                Radio::Bluetooth => state.running_ble,
                Radio::Wifi => state.running_wifi,
            };
            (state.started, state.mode, state.derive(), running)
        };
        if !started || !uses_radio(mode, radio) {
            debug!("Ignoring {:?}", event);
            return;
        }

        match event {
            RadioEvent::Disabled(_) if running => {
                warn!("{} switched off, stopping its discoverer", radio);
                match radio {
                    Radio::Bluetooth => self.stop_ble().await,
                    Radio::Wifi => self.stop_wifi().await,
                }
            }
            RadioEvent::Disabled(_) => {}
            RadioEvent::Enabled(_) if current == DiscoveryState::WaitingForServicesEnabled => {
                info!("{} switched on, starting discovery", radio);
                self.start_locked().await;
                return;
            }
            RadioEvent::Enabled(_) if !running => {
                info!("{} switched on, starting its discoverer", radio);
                let started = match radio {
                    Radio::Bluetooth => self.start_ble().await,
                    Radio::Wifi => self.start_wifi().await,
                };
                if started {
                    self.arm_expiry();
                }
            }
            RadioEvent::Enabled(_) => {}
        }

        if !self.any_running() {
            self.shared.expiry_timer.cancel();
        }
        self.publish_state();
    }

    async fn start_locked(&self) -> bool {
        let mode = {
            let mut state = self.shared.state.lock();
            state.started = true;
            state.mode
        };

        let want_ble = mode.uses_ble() && self.shared.radio.is_bluetooth_enabled();
        let want_wifi = mode.uses_wifi() && self.shared.radio.is_wifi_enabled();

        if !want_ble && !want_wifi {
            info!("Discovery mode {} waiting for radios to be switched on", mode);
            self.publish_state();
            return true;
        }

        let mut started_any = false;
        if want_ble {
            started_any |= self.start_ble().await;
        }
        if want_wifi {
            started_any |= self.start_wifi().await;
        }

        if !started_any {
            warn!("Failed to start discovery in mode {}", mode);
            self.shared.state.lock().started = false;
            self.publish_state();
            return false;
        }

        self.arm_expiry();
        self.publish_state();
        true
    }

    async fn stop_locked(&self) {
        self.shared.expiry_timer.cancel();
        self.stop_ble().await;
        self.stop_wifi().await;
        {
            let mut state = self.shared.state.lock();
            state.started = false;
            state.assisted.clear();
        }
        self.shared.peers.lock().clear();
        self.publish_state();
    }

    async fn start_ble(&self) -> bool {
        let Some(ble) = &self.shared.ble else {
            warn!("BLE discovery requested but no BLE platform is available");
            return false;
        };

        let outcome = ble.start().await;
        if !outcome.is_success() {
            warn!("BLE discoverer failed to start: {:?}", outcome);
            ble.stop().await;
            return false;
        }

        let waiting = ble.request_id().is_some();
        let mut state = self.shared.state.lock();
        state.running_ble = true;
        state.waiting_for_address = waiting;
        true
    }

    async fn stop_ble(&self) {
        let was_running = {
            let mut state = self.shared.state.lock();
            state.waiting_for_address = false;
            state.providing = None;
            std::mem::replace(&mut state.running_ble, false)
        };
        if let (true, Some(ble)) = (was_running, &self.shared.ble) {
            ble.stop().await;
        }
    }

    async fn start_wifi(&self) -> bool {
        let Some(wifi) = &self.shared.wifi else {
            warn!("Wi-Fi discovery requested but no Wi-Fi discoverer is available");
            return false;
        };

        match wifi.start().await {
            Ok(()) => {
                self.shared.state.lock().running_wifi = true;
                true
            }
            Err(e) => {
                warn!("Wi-Fi discoverer failed to start: {}", e);
                false
            }
        }
    }

    async fn stop_wifi(&self) {
        let was_running = std::mem::replace(&mut self.shared.state.lock().running_wifi, false);
        if let (true, Some(wifi)) = (was_running, &self.shared.wifi) {
            wifi.stop().await;
        }
    }

    fn any_running(&self) -> bool {
        let state = self.shared.state.lock();
        state.running_ble || state.running_wifi
    }

    async fn handle_ble_event(&self, event: BleDiscoveryEvent) {
        let _op = self.shared.op_lock.lock().await;
        if !self.shared.state.lock().running_ble {
            debug!("Dropping BLE event while BLE discovery is stopped: {:?}", event);
            return;
        }

        match event {
            BleDiscoveryEvent::PeerDiscovered(peer) => self.on_peer_sighted(peer),
            BleDiscoveryEvent::ProvideMacAddressRequest { request_id, device } => {
                self.assist_peer(request_id, device).await;
            }
            BleDiscoveryEvent::PeerReadyToAssist { request_id } => {
                let Some(ble) = &self.shared.ble else { return };
                match ble.open_resolution_gatt_server().await {
                    Ok(true) => {
                        info!("Peer ready to assist with {}, requesting discoverability", request_id);
                        self.emit(DiscoveryEvent::DiscoverableRequested {
                            duration: self.shared.config.mac_address_resolution_timeout,
                        });
                    }
                    Ok(false) => {}
                    Err(e) => warn!("Could not open address resolution GATT server: {}", e),
                }
            }
            BleDiscoveryEvent::BluetoothMacAddressResolved(address) => {
                info!("Local Bluetooth address resolved: {}", address);
                self.shared.state.lock().waiting_for_address = false;
                self.emit(DiscoveryEvent::BluetoothMacAddressResolved(address));
            }
            BleDiscoveryEvent::AssistOperationFinished { request_id } => {
                let mut state = self.shared.state.lock();
                if state.providing.as_deref() == Some(request_id.as_str()) {
                    state.providing = None;
                }
            }
            BleDiscoveryEvent::AssistRequestSucceeded { request_id } => {
                info!("Delivered observed address to {}", request_id);
            }
            BleDiscoveryEvent::AssistRequestFailed { request_id } => {
                warn!("Giving up delivering observed address to {}", request_id);
            }
        }
        self.publish_state();
    }

    /// Help a peer that does not know its own address
    async fn assist_peer(&self, request_id: String, device: BleDevice) {
        if !self.shared.config.provide_bluetooth_mac_address {
            debug!("Ignoring address request {}, assisting is disabled", request_id);
            return;
        }
        {
            let mut state = self.shared.state.lock();
            if state.providing.is_some() || !state.assisted.insert(request_id.clone()) {
                debug!("Ignoring address request {}", request_id);
                return;
            }
            state.providing = Some(request_id.clone());
        }

        let Some(ble) = &self.shared.ble else { return };
        let address = device.mac_address().unwrap_or(MacAddress::UNKNOWN);
        info!("Assisting {} at {}", request_id, device.address);

        let duration = self.shared.config.mac_address_resolution_timeout;
        if let Err(e) = ble.start_assist_advertising(&request_id, address, duration).await {
            warn!("Could not assist {}: {}", request_id, e);
            self.shared.state.lock().providing = None;
            return;
        }
        ble.enqueue_assist(&request_id, device);
    }

    fn on_peer_sighted(&self, peer: PeerProperties) {
        if peer.has_unknown_address() {
            debug!("Ignoring peer without a usable address: {}", peer);
            return;
        }

        let now = tokio::time::Instant::now().into_std();
        let (change, merged) = self.shared.peers.lock().upsert(peer, now);
        match change {
            PeerChange::Added => {
                info!("Peer discovered: {}", merged);
                self.emit(DiscoveryEvent::PeerDiscovered(merged));
            }
            PeerChange::Updated => {
                debug!("Peer updated: {}", merged);
                self.emit(DiscoveryEvent::PeerUpdated(merged));
            }
            PeerChange::Unchanged => {}
        }
    }

    fn arm_expiry(&self) {
        let period = (self.shared.config.peer_expiration / 2).max(Duration::from_secs(1));
        let weak = Arc::downgrade(&self.shared);
        self.shared.expiry_timer.arm(period, async move {
            let Some(this) = Self::upgrade(&weak) else { return };
            this.expire_peers();
            if this.any_running() {
                this.arm_expiry();
            }
        });
    }

    fn expire_peers(&self) {
        let now = tokio::time::Instant::now().into_std();
        let lost = self
            .shared
            .peers
            .lock()
            .expire_older_than(now, self.shared.config.peer_expiration);
        for peer in lost {
            info!("Peer lost: {}", peer);
            self.emit(DiscoveryEvent::PeerLost(peer));
        }
    }

    /// Emit `StateChanged` if the derived state moved
    fn publish_state(&self) {
        let changed = {
            let mut state = self.shared.state.lock();
            let current = state.derive();
            if current == state.reported {
                None
            } else {
                state.reported = current;
                Some(current)
            }
        };
        if let Some(current) = changed {
            info!("Discovery state: {}", current);
            self.emit(DiscoveryEvent::StateChanged(current));
        }
    }

    fn emit(&self, event: DiscoveryEvent) {
        if self.shared.events.send(event).is_err() {
            debug!("Discovery event dropped, owner gone");
        }
    }
}

fn uses_radio(mode: DiscoveryMode, radio: Radio) -> bool {
    match radio {
        Radio::Bluetooth => mode.uses_ble(),
        Radio::Wifi => mode.uses_wifi(),
    }
}

impl fmt::Debug for DiscoveryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryManager")
            .field("state", &self.state())
            .field("mode", &self.discovery_mode())
            .field("peers", &self.shared.peers.lock().len())
            .finish_non_exhaustive()
    }
}
