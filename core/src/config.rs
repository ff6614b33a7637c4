//! Discovery and connector configuration
//!
//! Configuration is consumed, never owned, by the discovery and connection
//! layers: the application builds a `ProxlinkConfig` (or loads one from JSON)
//! and hands the relevant section to each component at construction.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Default service UUID shared by all proxlink peers
pub const DEFAULT_SERVICE_UUID: Uuid = Uuid::from_u128(0xb6a44ad1_d319_4b3a_815d_8b805a47fb51);

/// Default manufacturer ID under which the 24-byte payload is advertised
pub const DEFAULT_MANUFACTURER_ID: u16 = 76;

/// Default RFCOMM service record name
pub const DEFAULT_SERVICE_NAME: &str = "proxlink";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

// ============================================================================
// ENUMS
// ============================================================================

/// Which radios are used for peer discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscoveryMode {
    Ble,
    Wifi,
    BleAndWifi,
}

impl DiscoveryMode {
    pub fn uses_ble(&self) -> bool {
        matches!(self, Self::Ble | Self::BleAndWifi)
    }

    pub fn uses_wifi(&self) -> bool {
        matches!(self, Self::Wifi | Self::BleAndWifi)
    }
}

impl Default for DiscoveryMode {
    fn default() -> Self {
        Self::Ble
    }
}

impl std::fmt::Display for DiscoveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ble => write!(f, "BLE"),
            Self::Wifi => write!(f, "WIFI"),
            Self::BleAndWifi => write!(f, "BLE_AND_WIFI"),
        }
    }
}

/// BLE advertise mode (platform-defined small integers)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvertiseMode {
    LowPower = 0,
    Balanced = 1,
    LowLatency = 2,
}

impl Default for AdvertiseMode {
    fn default() -> Self {
        Self::LowLatency
    }
}

/// BLE advertise transmission power level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvertiseTxPower {
    UltraLow = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl Default for AdvertiseTxPower {
    fn default() -> Self {
        Self::High
    }
}

/// BLE scan mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanMode {
    LowPower = 0,
    Balanced = 1,
    LowLatency = 2,
}

impl Default for ScanMode {
    fn default() -> Self {
        Self::LowLatency
    }
}

// ============================================================================
// DISCOVERY
// ============================================================================

/// Settings for BLE/Wi-Fi peer discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// 128-bit identifier shared by all peers of this application
    pub service_uuid: Uuid,
    /// Manufacturer ID of the advertised payload
    pub manufacturer_id: u16,
    pub discovery_mode: DiscoveryMode,
    pub advertise_mode: AdvertiseMode,
    pub advertise_tx_power: AdvertiseTxPower,
    pub scan_mode: ScanMode,
    /// How long a peer survives without being seen again
    pub peer_expiration: Duration,
    /// How long assist advertising runs when helping a peer resolve its address
    pub mac_address_resolution_timeout: Duration,
    /// Deadline for one GATT assist write
    pub gatt_request_timeout: Duration,
    /// GATT assist attempts before a request is dropped
    pub gatt_max_request_attempts: u32,
    /// Automatically help peers that ask for their Bluetooth address
    pub provide_bluetooth_mac_address: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_uuid: DEFAULT_SERVICE_UUID,
            manufacturer_id: DEFAULT_MANUFACTURER_ID,
            discovery_mode: DiscoveryMode::default(),
            advertise_mode: AdvertiseMode::default(),
            advertise_tx_power: AdvertiseTxPower::default(),
            scan_mode: ScanMode::default(),
            peer_expiration: Duration::from_secs(60),
            mac_address_resolution_timeout: Duration::from_secs(30),
            gatt_request_timeout: Duration::from_secs(10),
            gatt_max_request_attempts: 5,
            provide_bluetooth_mac_address: true,
        }
    }
}

impl DiscoveryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service_uuid(mut self, service_uuid: Uuid) -> Self {
        self.service_uuid = service_uuid;
        self
    }

    pub fn with_discovery_mode(mut self, mode: DiscoveryMode) -> Self {
        self.discovery_mode = mode;
        self
    }

    pub fn with_peer_expiration(mut self, expiration: Duration) -> Self {
        self.peer_expiration = expiration;
        self
    }

    pub fn with_mac_address_resolution_timeout(mut self, timeout: Duration) -> Self {
        self.mac_address_resolution_timeout = timeout;
        self
    }

    pub fn with_gatt_request_timeout(mut self, timeout: Duration) -> Self {
        self.gatt_request_timeout = timeout;
        self
    }

    pub fn with_provide_bluetooth_mac_address(mut self, enabled: bool) -> Self {
        self.provide_bluetooth_mac_address = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_uuid.is_nil() {
            return Err(ConfigError::Invalid("service_uuid cannot be nil".to_string()));
        }
        if self.peer_expiration.is_zero() {
            return Err(ConfigError::Invalid("peer_expiration must be > 0".to_string()));
        }
        if self.mac_address_resolution_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "mac_address_resolution_timeout must be > 0".to_string(),
            ));
        }
        if self.gatt_request_timeout.is_zero() {
            return Err(ConfigError::Invalid("gatt_request_timeout must be > 0".to_string()));
        }
        if self.gatt_max_request_attempts == 0 {
            return Err(ConfigError::Invalid(
                "gatt_max_request_attempts must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// CONNECTOR
// ============================================================================

/// Settings for the RFCOMM listener and outbound connector
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    pub service_uuid: Uuid,
    pub service_name: String,
    /// Budget for each phase of an outbound connection (dial, then handshake)
    pub connection_timeout: Duration,
    pub max_connect_attempts: u32,
    pub retry_delay: Duration,
    /// Alternate RFCOMM channels rotate through `1..=max_alternate_channel`
    pub max_alternate_channel: u8,
    pub max_handshake_message_size: usize,
    pub max_listener_restarts: u32,
    pub listener_restart_delay: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            service_uuid: DEFAULT_SERVICE_UUID,
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            connection_timeout: Duration::from_secs(15),
            max_connect_attempts: 5,
            retry_delay: Duration::from_secs(1),
            max_alternate_channel: 30,
            max_handshake_message_size: 4096,
            max_listener_restarts: 5,
            listener_restart_delay: Duration::from_secs(1),
        }
    }
}

impl ConnectorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service_uuid(mut self, service_uuid: Uuid) -> Self {
        self.service_uuid = service_uuid;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_max_connect_attempts(mut self, attempts: u32) -> Self {
        self.max_connect_attempts = attempts;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::Invalid("service_name cannot be empty".to_string()));
        }
        if self.connection_timeout.is_zero() {
            return Err(ConfigError::Invalid("connection_timeout must be > 0".to_string()));
        }
        if self.max_connect_attempts == 0 {
            return Err(ConfigError::Invalid("max_connect_attempts must be >= 1".to_string()));
        }
        if !(1..=30).contains(&self.max_alternate_channel) {
            return Err(ConfigError::Invalid(format!(
                "max_alternate_channel must be 1-30, got {}",
                self.max_alternate_channel
            )));
        }
        if self.max_handshake_message_size < 16 {
            return Err(ConfigError::Invalid(
                "max_handshake_message_size too small".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// TOP LEVEL
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxlinkConfig {
    pub discovery: DiscoveryConfig,
    pub connector: ConnectorConfig,
}

impl ProxlinkConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.discovery.validate()?;
        self.connector.validate()?;
        if self.discovery.service_uuid != self.connector.service_uuid {
            tracing::warn!(
                "Discovery service UUID {} differs from connector service UUID {}",
                self.discovery.service_uuid,
                self.connector.service_uuid
            );
        }
        Ok(())
    }

    /// Parse and validate a JSON document. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
