// Radio availability as reported by the platform

use std::fmt;

/// A radio the discovery manager depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Radio {
    Bluetooth,
    Wifi,
}

impl fmt::Display for Radio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Radio::Bluetooth => write!(f, "Bluetooth"),
            Radio::Wifi => write!(f, "Wi-Fi"),
        }
    }
}

/// System broadcast about a radio being switched on or off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioEvent {
    Enabled(Radio),
    Disabled(Radio),
}

impl RadioEvent {
    pub fn radio(&self) -> Radio {
        match self {
            RadioEvent::Enabled(radio) | RadioEvent::Disabled(radio) => *radio,
        }
    }
}

/// Current radio state and capabilities
#[cfg_attr(test, mockall::automock)]
pub trait RadioStatus: Send + Sync {
    fn is_bluetooth_enabled(&self) -> bool;

    fn is_wifi_enabled(&self) -> bool;

    /// BLE peripheral mode with more than one advertiser
    fn is_ble_multiple_advertisement_supported(&self) -> bool;

    fn is_wifi_direct_supported(&self) -> bool;
}
