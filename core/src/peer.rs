//! Peer identity and the peer table
//!
//! `PeerProperties` is the identity value produced by scan hits and identity
//! handshakes. Two instances describe the same peer iff their Bluetooth
//! addresses match; nothing else takes part in equality.

use crate::transport::ble::address::{MacAddress, UNKNOWN_BLUETOOTH_MAC_ADDRESS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Extra information value assigned to peers created by this crate
pub const DEFAULT_EXTRA_INFORMATION: u8 = 0;

/// Identity of a remote peer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerProperties {
    /// Canonical colon-hex Bluetooth address, the primary identity key
    pub bluetooth_address: String,
    /// Application-level peer identifier exchanged during the handshake
    pub peer_id: Option<String>,
    pub name: Option<String>,
    pub service_type: Option<String>,
    /// Wi-Fi Direct device address
    pub device_address: Option<String>,
    /// Wi-Fi Direct device name
    pub device_name: Option<String>,
    pub extra_info: Option<u8>,
}

impl PeerProperties {
    /// Create properties for a peer known only by its Bluetooth address
    pub fn new(bluetooth_address: impl Into<String>) -> Self {
        Self {
            bluetooth_address: bluetooth_address.into(),
            extra_info: Some(DEFAULT_EXTRA_INFORMATION),
            ..Default::default()
        }
    }

    /// Create properties for a peer seen in a presence advertisement
    pub fn from_mac(address: &MacAddress) -> Self {
        Self::new(address.to_string())
    }

    /// Properties of a peer whose address has not been resolved yet
    pub fn unknown() -> Self {
        Self::new(UNKNOWN_BLUETOOTH_MAC_ADDRESS)
    }

    /// Properties learned from an identity handshake. Empty strings are
    /// treated as absent.
    pub fn from_identity(peer_id: &str, name: &str, bluetooth_address: &str) -> Self {
        let mut properties = Self::new(bluetooth_address);
        if !peer_id.is_empty() {
            properties.peer_id = Some(peer_id.to_string());
        }
        if !name.is_empty() {
            properties.name = Some(name.to_string());
        }
        properties
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.peer_id = Some(peer_id.into());
        self
    }

    pub fn with_service_type(mut self, service_type: impl Into<String>) -> Self {
        self.service_type = Some(service_type.into());
        self
    }

    pub fn with_device(mut self, device_address: impl Into<String>, device_name: impl Into<String>) -> Self {
        self.device_address = Some(device_address.into());
        self.device_name = Some(device_name.into());
        self
    }

    pub fn with_extra_info(mut self, extra_info: Option<u8>) -> Self {
        self.extra_info = extra_info;
        self
    }

    /// A peer is usable once it has an address and an extra-info value
    pub fn is_valid(&self) -> bool {
        !self.bluetooth_address.is_empty() && self.extra_info.is_some()
    }

    pub fn has_unknown_address(&self) -> bool {
        MacAddress::is_unknown_str(&self.bluetooth_address)
    }

    /// Upper-cased address used as the peer table key
    pub fn key(&self) -> String {
        self.bluetooth_address.to_ascii_uppercase()
    }

    /// Overwrite every field with the values of `other`
    pub fn copy_from(&mut self, other: &PeerProperties) {
        self.clone_from(other);
    }

    /// Fill empty fields of `new` from `old`.
    ///
    /// `extra_info` is never copied: it is expected to change between
    /// sightings. Returns true if any field was copied.
    pub fn merge_missing(old: &PeerProperties, new: &mut PeerProperties) -> bool {
        let mut changed = false;

        if new.bluetooth_address.is_empty() && !old.bluetooth_address.is_empty() {
            new.bluetooth_address = old.bluetooth_address.clone();
            changed = true;
        }
        changed |= fill(&old.peer_id, &mut new.peer_id);
        changed |= fill(&old.name, &mut new.name);
        changed |= fill(&old.service_type, &mut new.service_type);
        changed |= fill(&old.device_address, &mut new.device_address);
        changed |= fill(&old.device_name, &mut new.device_name);

        changed
    }

    /// True when every identity field matches, including the ones equality ignores
    fn same_details(&self, other: &PeerProperties) -> bool {
        self.bluetooth_address.eq_ignore_ascii_case(&other.bluetooth_address)
            && self.peer_id == other.peer_id
            && self.name == other.name
            && self.service_type == other.service_type
            && self.device_address == other.device_address
            && self.device_name == other.device_name
            && self.extra_info == other.extra_info
    }
}

fn fill(old: &Option<String>, new: &mut Option<String>) -> bool {
    let new_is_empty = new.as_deref().map_or(true, str::is_empty);
    match old {
        Some(value) if new_is_empty && !value.is_empty() => {
            *new = Some(value.clone());
            true
        }
        _ => false,
    }
}

impl PartialEq for PeerProperties {
    fn eq(&self, other: &Self) -> bool {
        !self.bluetooth_address.is_empty()
            && !other.bluetooth_address.is_empty()
            && self
                .bluetooth_address
                .eq_ignore_ascii_case(&other.bluetooth_address)
    }
}

impl fmt::Display for PeerProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} (extra: {:?})",
            self.bluetooth_address,
            self.name.as_deref().unwrap_or("<no name>"),
            self.extra_info
        )
    }
}

// ============================================================================
// PEER TABLE
// ============================================================================

/// Outcome of inserting a sighting into the peer table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerChange {
    Added,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone)]
struct PeerEntry {
    properties: PeerProperties,
    last_seen: Instant,
}

/// Peers keyed by Bluetooth address, with last-seen times for expiration
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<String, PeerEntry>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sighting at `now`.
    ///
    /// Fields missing from `properties` are filled from the stored copy.
    /// Peers without a usable address are ignored.
    pub fn upsert(&mut self, mut properties: PeerProperties, now: Instant) -> (PeerChange, PeerProperties) {
        if properties.bluetooth_address.is_empty() || properties.has_unknown_address() {
            return (PeerChange::Unchanged, properties);
        }

        let key = properties.key();
        match self.peers.get_mut(&key) {
            Some(entry) => {
                PeerProperties::merge_missing(&entry.properties, &mut properties);
                let change = if entry.properties.same_details(&properties) {
                    PeerChange::Unchanged
                } else {
                    PeerChange::Updated
                };
                entry.properties = properties.clone();
                entry.last_seen = now;
                (change, properties)
            }
            None => {
                self.peers.insert(
                    key,
                    PeerEntry {
                        properties: properties.clone(),
                        last_seen: now,
                    },
                );
                (PeerChange::Added, properties)
            }
        }
    }

    pub fn get(&self, bluetooth_address: &str) -> Option<&PeerProperties> {
        self.peers
            .get(&bluetooth_address.to_ascii_uppercase())
            .map(|entry| &entry.properties)
    }

    pub fn remove(&mut self, bluetooth_address: &str) -> Option<PeerProperties> {
        self.peers
            .remove(&bluetooth_address.to_ascii_uppercase())
            .map(|entry| entry.properties)
    }

    /// Remove and return every peer not seen within `max_age` of `now`
    pub fn expire_older_than(&mut self, now: Instant, max_age: Duration) -> Vec<PeerProperties> {
        let stale: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_seen) > max_age)
            .map(|(key, _)| key.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|key| self.peers.remove(&key))
            .map(|entry| entry.properties)
            .collect()
    }

    pub fn peers(&self) -> Vec<PeerProperties> {
        self.peers.values().map(|entry| entry.properties.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}
