/// BLE advertisement codec and Bluetooth-address-resolution UUID scheme
///
/// Every advertisement we broadcast is a fixed 24-byte manufacturer payload:
///
/// ```text
/// [0..2)   0x02 0x15 beacon length/type marker
/// [2..18)  128-bit UUID, big-endian
/// [18..24) 6 raw Bluetooth address bytes, in address order
/// ```
///
/// A device that does not know its own radio address advertises a UUID whose
/// trailing 12 hex characters are replaced by a random request ID. Helpers
/// answer with the same UUID after bumping one marker byte, which lets both
/// sides signal intent without any side channel.

use crate::transport::ble::address::{MacAddress, MacAddressError, MAC_ADDRESS_LENGTH};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Total manufacturer payload length in bytes
pub const ADVERTISEMENT_LENGTH: usize = 24;

/// Beacon length-and-type marker (bytes 0-1)
pub const BEACON_MARKER: [u8; 2] = [0x02, 0x15];

/// Length of a provide-address request ID in hex characters (6 bytes)
pub const REQUEST_ID_LENGTH: usize = 12;

/// Byte of the UUID that is bumped to mark "ready to assist" advertisements.
///
/// It is the last byte of the prefix compared against the service UUID and
/// sits before the request ID bytes (10..16).
pub const ASSIST_MARKER_BYTE_INDEX: usize = 9;

const UUID_OFFSET: usize = 2;
const ADDRESS_OFFSET: usize = UUID_OFFSET + 16;
const UUID_STRING_LENGTH: usize = 36;
const SERVICE_PREFIX_BYTES: usize = 10;

/// Errors for advertisement codec operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Invalid request ID: {0}")]
    InvalidRequestId(String),
    #[error("UUID byte index out of range: {0}")]
    ByteIndexOutOfRange(usize),
    #[error(transparent)]
    MacAddress(#[from] MacAddressError),
}

/// Result of decoding one manufacturer payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAdvertisement {
    pub uuid: Uuid,
    pub bluetooth_address: Option<MacAddress>,
    pub provide_request_id: Option<String>,
}

impl ParsedAdvertisement {
    fn has_unknown_address(&self) -> bool {
        self.bluetooth_address.map_or(true, |mac| mac.is_unknown())
    }
}

/// Why a peer broadcast an advertisement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdvertisementPurpose {
    /// Plain presence: "I am here, this is my address"
    PeerPresence,
    /// A peer does not know its own address and asks for help
    ProvideMacAddressRequest,
    /// A peer is willing to help us resolve our address
    PeerReadyToAssist,
    /// A peer is broadcasting our resolved address
    PeerProvidingOurAddress,
    Unknown,
}

impl fmt::Display for AdvertisementPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerPresence => write!(f, "PeerPresence"),
            Self::ProvideMacAddressRequest => write!(f, "ProvideMacAddressRequest"),
            Self::PeerReadyToAssist => write!(f, "PeerReadyToAssist"),
            Self::PeerProvidingOurAddress => write!(f, "PeerProvidingOurAddress"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Encode a manufacturer payload.
///
/// `peer_name` is not part of the current wire format.
pub fn encode(
    _peer_name: Option<&str>,
    service_uuid: Uuid,
    bluetooth_address: &MacAddress,
) -> [u8; ADVERTISEMENT_LENGTH] {
    let mut payload = [0u8; ADVERTISEMENT_LENGTH];
    payload[..UUID_OFFSET].copy_from_slice(&BEACON_MARKER);
    payload[UUID_OFFSET..ADDRESS_OFFSET].copy_from_slice(service_uuid.as_bytes());
    payload[ADDRESS_OFFSET..].copy_from_slice(bluetooth_address.as_bytes());
    payload
}

/// Encode a payload from a textual address
pub fn encode_str(
    peer_name: Option<&str>,
    service_uuid: Uuid,
    bluetooth_address: &str,
) -> Result<[u8; ADVERTISEMENT_LENGTH], CodecError> {
    let mac: MacAddress = bluetooth_address.parse()?;
    Ok(encode(peer_name, service_uuid, &mac))
}

/// Decode a manufacturer payload. The beacon marker is not validated.
pub fn decode(manufacturer_payload: &[u8]) -> Option<ParsedAdvertisement> {
    if manufacturer_payload.len() < ADVERTISEMENT_LENGTH {
        return None;
    }

    let uuid_bytes: [u8; 16] = manufacturer_payload[UUID_OFFSET..ADDRESS_OFFSET]
        .try_into()
        .ok()?;
    let address = MacAddress::from_slice(
        &manufacturer_payload[ADDRESS_OFFSET..ADDRESS_OFFSET + MAC_ADDRESS_LENGTH],
    )
    .ok()?;

    Some(ParsedAdvertisement {
        uuid: Uuid::from_bytes(uuid_bytes),
        bluetooth_address: Some(address),
        provide_request_id: None,
    })
}

/// Decode a payload and extract the provide-address request ID, which is
/// present whenever the advertised UUID differs from our service UUID.
pub fn decode_for_service(
    manufacturer_payload: &[u8],
    service_uuid: Uuid,
) -> Option<ParsedAdvertisement> {
    let mut parsed = decode(manufacturer_payload)?;
    if parsed.uuid != service_uuid {
        parsed.provide_request_id = Some(request_id_of(&parsed.uuid));
    }
    Some(parsed)
}

/// Trailing request ID characters of a UUID's string form
pub fn request_id_of(uuid: &Uuid) -> String {
    let s = uuid.hyphenated().to_string();
    s[UUID_STRING_LENGTH - REQUEST_ID_LENGTH..].to_string()
}

/// Embed a request ID into the tail of the service UUID.
///
/// The last `request_id.len()` characters of the canonical string form are
/// replaced, everything before them is kept verbatim.
pub fn provide_mac_address_uuid(service_uuid: Uuid, request_id: &str) -> Result<Uuid, CodecError> {
    let base = service_uuid.hyphenated().to_string();
    if request_id.is_empty() || request_id.len() > base.len() || !request_id.is_ascii() {
        return Err(CodecError::InvalidRequestId(request_id.to_string()));
    }

    let candidate = format!("{}{}", &base[..base.len() - request_id.len()], request_id);
    Uuid::parse_str(&candidate).map_err(|_| CodecError::InvalidRequestId(request_id.to_string()))
}

/// Increment one byte of the UUID. `0xFF` wraps to `0x00`.
pub fn rotate_marker_byte(uuid: Uuid, byte_index: usize) -> Result<Uuid, CodecError> {
    adjust_byte(uuid, byte_index, |b| b.wrapping_add(1))
}

/// Inverse of [`rotate_marker_byte`]
pub fn unrotate_marker_byte(uuid: Uuid, byte_index: usize) -> Result<Uuid, CodecError> {
    adjust_byte(uuid, byte_index, |b| b.wrapping_sub(1))
}

fn adjust_byte(uuid: Uuid, byte_index: usize, f: impl Fn(u8) -> u8) -> Result<Uuid, CodecError> {
    let mut bytes = *uuid.as_bytes();
    let byte = bytes
        .get_mut(byte_index)
        .ok_or(CodecError::ByteIndexOutOfRange(byte_index))?;
    *byte = f(*byte);
    Ok(Uuid::from_bytes(bytes))
}

/// UUID advertised by a helper that is ready to assist `request_id`
pub fn assist_uuid(service_uuid: Uuid, request_id: &str) -> Result<Uuid, CodecError> {
    let request_uuid = provide_mac_address_uuid(service_uuid, request_id)?;
    rotate_marker_byte(request_uuid, ASSIST_MARKER_BYTE_INDEX)
}

/// Six random bytes as twelve lowercase hex characters
pub fn generate_request_id() -> String {
    let bytes: [u8; REQUEST_ID_LENGTH / 2] = rand::random();
    hex::encode(bytes)
}

/// Generate a request ID whose request UUID differs from the service UUID
pub fn generate_request_id_for(service_uuid: Uuid) -> String {
    loop {
        let request_id = generate_request_id();
        match provide_mac_address_uuid(service_uuid, &request_id) {
            Ok(uuid) if uuid != service_uuid => return request_id,
            _ => continue,
        }
    }
}

fn shares_service_prefix(uuid: &Uuid, service_uuid: &Uuid) -> bool {
    uuid.as_bytes()[..SERVICE_PREFIX_BYTES] == service_uuid.as_bytes()[..SERVICE_PREFIX_BYTES]
}

/// Work out why a peer sent an advertisement
pub fn classify(
    parsed: &ParsedAdvertisement,
    service_uuid: Uuid,
    our_request_id: Option<&str>,
) -> AdvertisementPurpose {
    let request_id = match &parsed.provide_request_id {
        None => return AdvertisementPurpose::PeerPresence,
        Some(request_id) => request_id,
    };

    if parsed.has_unknown_address() {
        if let Some(ours) = our_request_id {
            let our_request_uuid = provide_mac_address_uuid(service_uuid, ours);
            let unrotated = unrotate_marker_byte(parsed.uuid, ASSIST_MARKER_BYTE_INDEX);
            if let (Ok(expected), Ok(actual)) = (our_request_uuid, unrotated) {
                if expected == actual {
                    return AdvertisementPurpose::PeerReadyToAssist;
                }
            }
        }

        if shares_service_prefix(&parsed.uuid, &service_uuid) {
            return AdvertisementPurpose::ProvideMacAddressRequest;
        }
        return AdvertisementPurpose::Unknown;
    }

    match our_request_id {
        Some(ours) if ours.eq_ignore_ascii_case(request_id) => {
            AdvertisementPurpose::PeerProvidingOurAddress
        }
        _ => AdvertisementPurpose::Unknown,
    }
}
