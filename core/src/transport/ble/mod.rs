/// BLE (Bluetooth Low Energy) discovery
///
/// - **address**: six-byte radio address value type
/// - **advertisement**: 24-byte manufacturer payload codec and the UUID
///   rotation scheme used to ask peers for our own address
/// - **platform**: advertiser, scanner and GATT traits implemented by the
///   platform binding
/// - **gatt**: queue of GATT writes delivering observed addresses to peers
/// - **discoverer**: advertises, scans and classifies every scan hit
///
/// All radio access goes through the platform traits, so everything here is
/// testable without hardware.

pub mod address;
pub mod advertisement;
pub mod discoverer;
pub mod gatt;
pub mod platform;

pub use address::{MacAddress, MacAddressError, UNKNOWN_BLUETOOTH_MAC_ADDRESS};
pub use advertisement::{
    classify, decode, decode_for_service, encode, AdvertisementPurpose, CodecError, ParsedAdvertisement,
};
pub use discoverer::{
    AdvertisingPurpose, BleDiscovererError, BleDiscovererState, BleDiscoveryEvent, BlePeerDiscoverer,
    StartOutcome,
};
pub use gatt::{AssistRequest, GattAssistQueue};
pub use platform::{
    AdvertiseError, AdvertiseSettings, BleAdvertiser, BleDevice, BlePlatform, BleScanner, GattClient,
    GattConnection, GattError, GattServer, GattWrite, RawScanHit, ScanError, ScanSettings,
};
