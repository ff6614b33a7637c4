//! Identity handshake run over every freshly opened socket
//!
//! Both roles exchange one identity message, a 4-byte big-endian length
//! followed by the JSON object `{"pi": peer id, "pn": peer name, "ra":
//! Bluetooth address}`. The server reads first and echoes its own identity;
//! the client writes first and then reads the echo.

use crate::peer::PeerProperties;
use crate::transport::bluetooth::connector::ConnectionFailure;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the frame length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default upper bound for one identity message
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4096;

/// Which side of the handshake we are on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Malformed identity message: {0}")]
    Parse(String),
    #[error("Identity message too large: {0} bytes")]
    TooLarge(usize),
    #[error("Peer closed the connection")]
    Disconnected,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl HandshakeError {
    /// Failure reported to the application for this error
    pub fn into_failure(self, role: Role) -> ConnectionFailure {
        match self {
            HandshakeError::Parse(_) | HandshakeError::TooLarge(_) => {
                ConnectionFailure::HandshakeParseFailed(role)
            }
            HandshakeError::Disconnected | HandshakeError::Io(_) => {
                ConnectionFailure::PeerDisconnectedDuringHandshake(role)
            }
        }
    }
}

/// Identity exchanged by both sides
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityMessage {
    #[serde(rename = "pi")]
    pub peer_id: String,
    #[serde(rename = "pn", default)]
    pub peer_name: String,
    #[serde(rename = "ra")]
    pub bluetooth_address: String,
}

impl IdentityMessage {
    pub fn new(
        peer_id: impl Into<String>,
        peer_name: impl Into<String>,
        bluetooth_address: impl Into<String>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            peer_name: peer_name.into(),
            bluetooth_address: bluetooth_address.into(),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, HandshakeError> {
        serde_json::to_vec(self).map_err(|e| HandshakeError::Parse(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, HandshakeError> {
        serde_json::from_slice(bytes).map_err(|e| HandshakeError::Parse(e.to_string()))
    }

    pub fn to_peer_properties(&self) -> PeerProperties {
        PeerProperties::from_identity(&self.peer_id, &self.peer_name, &self.bluetooth_address)
    }
}

/// Write one length-prefixed identity message
pub async fn write_identity<S>(socket: &mut S, identity: &IdentityMessage) -> Result<(), HandshakeError>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    let body = identity.to_json()?;
    let length = u32::try_from(body.len()).map_err(|_| HandshakeError::TooLarge(body.len()))?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(&body);

    socket.write_all(&frame).await.map_err(map_io)?;
    socket.flush().await.map_err(map_io)?;
    Ok(())
}

/// Read one length-prefixed identity message of at most `max_size` bytes
pub async fn read_identity<S>(socket: &mut S, max_size: usize) -> Result<IdentityMessage, HandshakeError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    socket.read_exact(&mut prefix).await.map_err(map_io)?;

    let length = u32::from_be_bytes(prefix) as usize;
    if length == 0 {
        return Err(HandshakeError::Parse("empty identity message".to_string()));
    }
    if length > max_size {
        return Err(HandshakeError::TooLarge(length));
    }

    let mut body = vec![0u8; length];
    socket.read_exact(&mut body).await.map_err(map_io)?;
    IdentityMessage::from_json(&body)
}

/// Server role: read the peer identity, then echo ours
pub async fn run_server_handshake<S>(
    socket: &mut S,
    local: &IdentityMessage,
    max_size: usize,
) -> Result<PeerProperties, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let remote = read_identity(socket, max_size).await?;
    write_identity(socket, local).await?;
    Ok(remote.to_peer_properties())
}

/// Client role: write our identity, then read the peer's echo
pub async fn run_client_handshake<S>(
    socket: &mut S,
    local: &IdentityMessage,
    max_size: usize,
) -> Result<PeerProperties, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    write_identity(socket, local).await?;
    let remote = read_identity(socket, max_size).await?;
    Ok(remote.to_peer_properties())
}

fn map_io(e: io::Error) -> HandshakeError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => HandshakeError::Disconnected,
        _ => HandshakeError::Io(e),
    }
}
