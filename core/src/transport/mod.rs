// Transport module: peer discovery and Bluetooth connections

pub mod ble;
pub mod bluetooth;
pub mod manager;
pub mod radio;
pub mod wifi;

pub use ble::{BleDiscoveryEvent, BlePeerDiscoverer, BlePlatform, MacAddress};
pub use bluetooth::{BluetoothConnector, ConnectionFailure, ConnectorEvent, IdentityMessage};
pub use manager::{DiscoveryEvent, DiscoveryManager, DiscoveryState};
pub use radio::{Radio, RadioEvent, RadioStatus};
pub use wifi::{WifiDiscoveryError, WifiPeerDiscoverer};
