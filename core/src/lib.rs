// Proxlink Core: proximity discovery and Bluetooth links
//
// Finds nearby peers over BLE (and Wi-Fi Direct through the platform),
// helps devices that cannot read their own Bluetooth address learn it from
// a neighbour, and opens RFCOMM links whose first exchange is an identity
// handshake. Radio access is abstracted behind platform traits.

pub mod config;
pub mod peer;
pub mod timer;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ConfigError, ConnectorConfig, DiscoveryConfig, DiscoveryMode, ProxlinkConfig};
pub use peer::{PeerChange, PeerProperties, PeerTable};
pub use timer::OneShotTimer;
pub use transport::ble::{MacAddress, UNKNOWN_BLUETOOTH_MAC_ADDRESS};
pub use transport::bluetooth::{BluetoothConnector, ConnectionFailure, ConnectorEvent, IdentityMessage};
pub use transport::manager::{DiscoveryEvent, DiscoveryManager, DiscoveryState};

/// Install a `fmt` subscriber filtered by `RUST_LOG`, or by
/// `default_directive` when unset. Idempotent; later calls are no-ops.
pub fn init_tracing(default_directive: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive)),
        )
        .try_init();
}
