// BLE Platform Bridge
//
// The radio primitives themselves (advertiser, scanner, GATT server and
// client) live in platform code. The discoverer drives them through the
// traits below; each platform binding implements them on top of its native
// Bluetooth stack.

use crate::config::{AdvertiseMode, AdvertiseTxPower, ScanMode};
use crate::transport::ble::address::MacAddress;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Largest legacy advertisement payload a controller accepts
pub const MAX_ADVERTISEMENT_DATA_LENGTH: usize = 31;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Advertiser start failures as reported by the platform
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdvertiseError {
    #[error("Advertisement data too large: {0} bytes")]
    DataTooLarge(usize),
    #[error("Too many advertisers")]
    TooManyAdvertisers,
    #[error("Advertising already started")]
    AlreadyStarted,
    #[error("Advertising not supported on this device")]
    Unsupported,
    #[error("Advertiser internal error: {0}")]
    InternalError(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScanError {
    #[error("Scanning already started")]
    AlreadyStarted,
    #[error("Scanning not supported on this device")]
    Unsupported,
    #[error("Scanner internal error: {0}")]
    InternalError(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GattError {
    #[error("GATT unavailable")]
    Unavailable,
    #[error("GATT connect failed: {0}")]
    ConnectFailed(String),
    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),
    #[error("GATT write failed: {0}")]
    WriteFailed(String),
    #[error("GATT server error: {0}")]
    ServerFailed(String),
    #[error("GATT request timed out")]
    Timeout,
}

// ============================================================================
// DATA STRUCTURES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertiseSettings {
    pub mode: AdvertiseMode,
    pub tx_power: AdvertiseTxPower,
    /// Assist advertisements must accept GATT connections
    pub connectable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSettings {
    pub mode: ScanMode,
}

/// A remote BLE device as reported by the scanner.
///
/// `address` is whatever the platform observed; it may be a random
/// private address or missing altogether.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BleDevice {
    pub address: String,
}

impl BleDevice {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    /// Parsed radio address, if the platform reported a usable one
    pub fn mac_address(&self) -> Option<MacAddress> {
        self.address
            .parse::<MacAddress>()
            .ok()
            .filter(|mac| !mac.is_unknown())
    }
}

/// One scan result carrying our manufacturer data
#[derive(Debug, Clone)]
pub struct RawScanHit {
    pub device: BleDevice,
    pub manufacturer_data: Vec<u8>,
    pub rssi: i32,
}

/// A write accepted by our GATT server
#[derive(Debug, Clone)]
pub struct GattWrite {
    pub characteristic: Uuid,
    pub value: Vec<u8>,
    pub remote: BleDevice,
}

// ============================================================================
// PLATFORM TRAITS
// ============================================================================

#[async_trait]
pub trait BleAdvertiser: Send + Sync {
    /// Broadcast `payload` as manufacturer data under `manufacturer_id`
    async fn start_advertising(
        &self,
        settings: AdvertiseSettings,
        manufacturer_id: u16,
        payload: &[u8],
    ) -> Result<(), AdvertiseError>;

    async fn stop_advertising(&self);
}

#[async_trait]
pub trait BleScanner: Send + Sync {
    /// Start scanning. Hits arrive on the returned channel until the scan is
    /// stopped; the platform drops the sender on stop.
    async fn start_scan(
        &self,
        settings: ScanSettings,
        manufacturer_filter: Option<u16>,
    ) -> Result<mpsc::UnboundedReceiver<RawScanHit>, ScanError>;

    async fn stop_scan(&self);
}

#[async_trait]
pub trait GattServer: Send + Sync {
    /// Open a server exposing one write-only characteristic under `service_uuid`
    async fn open(
        &self,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
    ) -> Result<mpsc::UnboundedReceiver<GattWrite>, GattError>;

    async fn close(&self);
}

#[async_trait]
pub trait GattClient: Send + Sync {
    async fn connect(&self, device: &BleDevice) -> Result<Box<dyn GattConnection>, GattError>;
}

/// A live GATT client connection
#[async_trait]
pub trait GattConnection: Send {
    /// Discover services and return every characteristic UUID found
    async fn discover_characteristics(&mut self) -> Result<Vec<Uuid>, GattError>;

    /// Transport address of the remote end as seen by this connection
    fn remote_address(&self) -> Option<MacAddress>;

    async fn write(&mut self, characteristic: Uuid, value: &[u8]) -> Result<(), GattError>;

    async fn disconnect(&mut self);
}

/// The full set of BLE primitives a discoverer drives
#[derive(Clone)]
pub struct BlePlatform {
    pub advertiser: Arc<dyn BleAdvertiser>,
    pub scanner: Arc<dyn BleScanner>,
    pub gatt_server: Arc<dyn GattServer>,
    pub gatt_client: Arc<dyn GattClient>,
}

impl std::fmt::Debug for BlePlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlePlatform").finish_non_exhaustive()
    }
}
