//! In-memory fakes for the platform traits, shared by unit tests

use crate::transport::ble::address::MacAddress;
use crate::transport::ble::advertisement::provide_mac_address_uuid;
use crate::transport::ble::platform::{
    AdvertiseError, AdvertiseSettings, BleAdvertiser, BleDevice, BlePlatform, BleScanner, GattClient,
    GattConnection, GattError, GattServer, GattWrite, RawScanHit, ScanError, ScanSettings,
};
use crate::transport::bluetooth::socket::{BoxedSocket, ServerSocket, StreamSocketFactory};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Service UUID the BLE fakes are set up for
pub const TEST_SERVICE_UUID: Uuid = Uuid::from_u128(0xb6574f6a_1c3d_4e5f_8a9b_0c1d2e3f4a5b);

const DUPLEX_BUFFER: usize = 4096;

// ============================================================================
// BLE
// ============================================================================

#[derive(Default)]
pub struct FakeAdvertiser {
    state: Mutex<AdvertiserState>,
}

#[derive(Default)]
struct AdvertiserState {
    payload: Option<Vec<u8>>,
    manufacturer_id: Option<u16>,
    settings: Option<AdvertiseSettings>,
    failure: Option<AdvertiseError>,
    starts: usize,
}

impl FakeAdvertiser {
    /// Payload currently on air
    pub fn current(&self) -> Option<Vec<u8>> {
        self.state.lock().payload.clone()
    }

    pub fn manufacturer_id(&self) -> Option<u16> {
        self.state.lock().manufacturer_id
    }

    pub fn last_settings(&self) -> Option<AdvertiseSettings> {
        self.state.lock().settings
    }

    /// Fail every following start with `error`
    pub fn fail_with(&self, error: AdvertiseError) {
        self.state.lock().failure = Some(error);
    }

    pub fn clear_failure(&self) {
        self.state.lock().failure = None;
    }

    pub fn start_count(&self) -> usize {
        self.state.lock().starts
    }
}

#[async_trait]
impl BleAdvertiser for FakeAdvertiser {
    async fn start_advertising(
        &self,
        settings: AdvertiseSettings,
        manufacturer_id: u16,
        payload: &[u8],
    ) -> Result<(), AdvertiseError> {
        let mut state = self.state.lock();
        if let Some(error) = state.failure.clone() {
            return Err(error);
        }
        state.payload = Some(payload.to_vec());
        state.manufacturer_id = Some(manufacturer_id);
        state.settings = Some(settings);
        state.starts += 1;
        Ok(())
    }

    async fn stop_advertising(&self) {
        self.state.lock().payload = None;
    }
}

#[derive(Default)]
pub struct FakeScanner {
    state: Mutex<ScannerState>,
}

#[derive(Default)]
struct ScannerState {
    hits: Option<mpsc::UnboundedSender<RawScanHit>>,
    failure: Option<ScanError>,
}

impl FakeScanner {
    pub fn is_scanning(&self) -> bool {
        self.state.lock().hits.is_some()
    }

    pub fn fail_with(&self, error: ScanError) {
        self.state.lock().failure = Some(error);
    }

    /// Report a scan hit. Dropped when not scanning.
    pub fn deliver(&self, device: BleDevice, manufacturer_data: Vec<u8>) {
        if let Some(hits) = self.state.lock().hits.as_ref() {
            let _ = hits.send(RawScanHit {
                device,
                manufacturer_data,
                rssi: -60,
            });
        }
    }
}

#[async_trait]
impl BleScanner for FakeScanner {
    async fn start_scan(
        &self,
        _settings: ScanSettings,
        _manufacturer_filter: Option<u16>,
    ) -> Result<mpsc::UnboundedReceiver<RawScanHit>, ScanError> {
        let mut state = self.state.lock();
        if let Some(error) = state.failure.clone() {
            return Err(error);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.hits = Some(tx);
        Ok(rx)
    }

    async fn stop_scan(&self) {
        self.state.lock().hits = None;
    }
}

#[derive(Default)]
pub struct FakeGattServer {
    state: Mutex<Option<OpenServer>>,
}

struct OpenServer {
    service_uuid: Uuid,
    characteristic_uuid: Uuid,
    writes: mpsc::UnboundedSender<GattWrite>,
}

impl FakeGattServer {
    /// Service and characteristic of the open server
    pub fn opened(&self) -> Option<(Uuid, Uuid)> {
        self.state
            .lock()
            .as_ref()
            .map(|server| (server.service_uuid, server.characteristic_uuid))
    }

    pub fn deliver(&self, write: GattWrite) {
        if let Some(server) = self.state.lock().as_ref() {
            let _ = server.writes.send(write);
        }
    }
}

#[async_trait]
impl GattServer for FakeGattServer {
    async fn open(
        &self,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
    ) -> Result<mpsc::UnboundedReceiver<GattWrite>, GattError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.state.lock() = Some(OpenServer {
            service_uuid,
            characteristic_uuid,
            writes: tx,
        });
        Ok(rx)
    }

    async fn close(&self) {
        self.state.lock().take();
    }
}

/// How a fake requester reacts to a GATT client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattBehavior {
    Succeed,
    Fail,
    Hang,
    NoCharacteristic,
}

pub struct FakeGattClient {
    service_uuid: Uuid,
    requesters: Mutex<HashMap<String, (String, GattBehavior)>>,
    connects: Mutex<Vec<String>>,
    writes: Arc<Mutex<Vec<(Uuid, Vec<u8>)>>>,
}

impl FakeGattClient {
    pub fn new(service_uuid: Uuid) -> Self {
        Self {
            service_uuid,
            requesters: Mutex::new(HashMap::new()),
            connects: Mutex::new(Vec::new()),
            writes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a requester at `device_address` waiting under `request_id`
    pub fn add_requester(&self, device_address: &str, request_id: &str, behavior: GattBehavior) {
        self.requesters
            .lock()
            .insert(device_address.to_string(), (request_id.to_string(), behavior));
    }

    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.writes.lock().clone()
    }

    /// Device addresses in the order connections were attempted
    pub fn connect_order(&self) -> Vec<String> {
        self.connects.lock().clone()
    }
}

#[async_trait]
impl GattClient for FakeGattClient {
    async fn connect(&self, device: &BleDevice) -> Result<Box<dyn GattConnection>, GattError> {
        self.connects.lock().push(device.address.clone());
        let requester = self.requesters.lock().get(&device.address).cloned();

        let (request_id, behavior) = match requester {
            Some(requester) => requester,
            None => return Err(GattError::ConnectFailed(format!("unknown device {}", device.address))),
        };

        match behavior {
            GattBehavior::Hang => std::future::pending().await,
            GattBehavior::Fail => Err(GattError::ConnectFailed("refused".to_string())),
            GattBehavior::Succeed | GattBehavior::NoCharacteristic => {
                let characteristics = if behavior == GattBehavior::Succeed {
                    provide_mac_address_uuid(self.service_uuid, &request_id)
                        .map(|uuid| vec![uuid])
                        .unwrap_or_default()
                } else {
                    Vec::new()
                };
                Ok(Box::new(FakeGattConnection {
                    remote: device.mac_address(),
                    characteristics,
                    writes: self.writes.clone(),
                }))
            }
        }
    }
}

struct FakeGattConnection {
    remote: Option<MacAddress>,
    characteristics: Vec<Uuid>,
    writes: Arc<Mutex<Vec<(Uuid, Vec<u8>)>>>,
}

#[async_trait]
impl GattConnection for FakeGattConnection {
    async fn discover_characteristics(&mut self) -> Result<Vec<Uuid>, GattError> {
        Ok(self.characteristics.clone())
    }

    fn remote_address(&self) -> Option<MacAddress> {
        self.remote
    }

    async fn write(&mut self, characteristic: Uuid, value: &[u8]) -> Result<(), GattError> {
        self.writes.lock().push((characteristic, value.to_vec()));
        Ok(())
    }

    async fn disconnect(&mut self) {}
}

/// All four BLE fakes wired for [`TEST_SERVICE_UUID`]
pub struct FakeBlePlatform {
    pub advertiser: Arc<FakeAdvertiser>,
    pub scanner: Arc<FakeScanner>,
    pub gatt_server: Arc<FakeGattServer>,
    pub gatt_client: Arc<FakeGattClient>,
}

impl FakeBlePlatform {
    pub fn new() -> Self {
        Self {
            advertiser: Arc::new(FakeAdvertiser::default()),
            scanner: Arc::new(FakeScanner::default()),
            gatt_server: Arc::new(FakeGattServer::default()),
            gatt_client: Arc::new(FakeGattClient::new(TEST_SERVICE_UUID)),
        }
    }

    pub fn platform(&self) -> BlePlatform {
        BlePlatform {
            advertiser: self.advertiser.clone(),
            scanner: self.scanner.clone(),
            gatt_server: self.gatt_server.clone(),
            gatt_client: self.gatt_client.clone(),
        }
    }
}

// ============================================================================
// RFCOMM
// ============================================================================

/// One outbound dial seen by [`FakeSocketFactory`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dial {
    Service(MacAddress),
    Channel(MacAddress, u8),
}

/// Socket factory backed by in-memory duplex pipes.
///
/// Outbound dials hand the far end of each pipe to [`next_remote`]; the
/// listener side is driven with [`open_inbound`] and [`break_listener`].
///
/// [`next_remote`]: FakeSocketFactory::next_remote
/// [`open_inbound`]: FakeSocketFactory::open_inbound
/// [`break_listener`]: FakeSocketFactory::break_listener
pub struct FakeSocketFactory {
    failures_left: Mutex<u32>,
    dials: Mutex<Vec<Dial>>,
    remotes_tx: mpsc::UnboundedSender<DuplexStream>,
    remotes_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<io::Result<BoxedSocket>>>>,
    listens: Mutex<usize>,
    fail_listen: Mutex<bool>,
}

impl FakeSocketFactory {
    pub fn new() -> Arc<Self> {
        let (remotes_tx, remotes_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            failures_left: Mutex::new(0),
            dials: Mutex::new(Vec::new()),
            remotes_tx,
            remotes_rx: tokio::sync::Mutex::new(remotes_rx),
            inbound: Mutex::new(None),
            listens: Mutex::new(0),
            fail_listen: Mutex::new(false),
        })
    }

    /// Fail the next `count` dials
    pub fn fail_dials(&self, count: u32) {
        *self.failures_left.lock() = count;
    }

    pub fn dials(&self) -> Vec<Dial> {
        self.dials.lock().clone()
    }

    /// Far end of the next successful outbound dial
    pub async fn next_remote(&self) -> DuplexStream {
        match self.remotes_rx.lock().await.recv().await {
            Some(remote) => remote,
            None => panic!("socket factory dropped"),
        }
    }

    pub fn fail_listen(&self, fail: bool) {
        *self.fail_listen.lock() = fail;
    }

    pub fn listen_count(&self) -> usize {
        *self.listens.lock()
    }

    /// Connect a new client to the bound listener, returning the client end
    pub fn open_inbound(&self) -> Option<DuplexStream> {
        let (client, server) = tokio::io::duplex(DUPLEX_BUFFER);
        let inbound = self.inbound.lock();
        inbound.as_ref()?.send(Ok(Box::new(server))).ok()?;
        Some(client)
    }

    /// Make the bound listener's next accept fail
    pub fn break_listener(&self) {
        if let Some(inbound) = self.inbound.lock().as_ref() {
            let _ = inbound.send(Err(io::Error::new(io::ErrorKind::Other, "listener broken")));
        }
    }

    fn dial(&self, dial: Dial) -> io::Result<BoxedSocket> {
        self.dials.lock().push(dial);
        {
            let mut failures_left = self.failures_left.lock();
            if *failures_left > 0 {
                *failures_left -= 1;
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "dial refused"));
            }
        }

        let (local, remote) = tokio::io::duplex(DUPLEX_BUFFER);
        self.remotes_tx
            .send(remote)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "remote end gone"))?;
        Ok(Box::new(local))
    }
}

#[async_trait]
impl StreamSocketFactory for FakeSocketFactory {
    async fn connect(&self, device: MacAddress, _service_uuid: Uuid) -> io::Result<BoxedSocket> {
        self.dial(Dial::Service(device))
    }

    async fn connect_on_channel(&self, device: MacAddress, channel: u8) -> io::Result<BoxedSocket> {
        self.dial(Dial::Channel(device, channel))
    }

    async fn listen(&self, _service_uuid: Uuid, _service_name: &str) -> io::Result<Box<dyn ServerSocket>> {
        if *self.fail_listen.lock() {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, "bind failed"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound.lock() = Some(tx);
        *self.listens.lock() += 1;
        Ok(Box::new(FakeServerSocket { inbound: rx }))
    }
}

struct FakeServerSocket {
    inbound: mpsc::UnboundedReceiver<io::Result<BoxedSocket>>,
}

#[async_trait]
impl ServerSocket for FakeServerSocket {
    async fn accept(&mut self) -> io::Result<BoxedSocket> {
        match self.inbound.recv().await {
            Some(result) => result,
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "listener closed")),
        }
    }
}
