// Wi-Fi peer discovery seam
//
// Wi-Fi Direct service discovery is driven entirely by the platform. The
// manager only starts and stops it; discovered peers are pushed into the
// manager through `DiscoveryManager::wifi_peer_sender`.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WifiDiscoveryError {
    #[error("Wi-Fi Direct is not supported on this device")]
    Unsupported,
    #[error("Wi-Fi is disabled")]
    Disabled,
    #[error("Platform error: {0}")]
    PlatformError(String),
}

/// Platform Wi-Fi Direct discoverer.
///
/// Implementations report peers as `PeerProperties` with the Wi-Fi fields
/// (`device_address`, `device_name`, `service_type`) filled in.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WifiPeerDiscoverer: Send + Sync {
    async fn start(&self) -> Result<(), WifiDiscoveryError>;

    async fn stop(&self);

    fn is_running(&self) -> bool;
}
