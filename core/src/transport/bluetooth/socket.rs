// RFCOMM stream socket abstraction
//
// Platform code owns the real Bluetooth sockets. The connector only needs a
// byte stream it can read and write during the handshake and then hand over
// to the application, so any tokio AsyncRead + AsyncWrite type qualifies.

use crate::transport::ble::address::MacAddress;
use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

/// A connected, bidirectional Bluetooth stream
pub trait BluetoothSocket: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> BluetoothSocket for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Owned socket handle transferred to the application on success
pub type BoxedSocket = Box<dyn BluetoothSocket>;

/// Bound server socket. Dropping it closes the listening socket.
#[async_trait]
pub trait ServerSocket: Send {
    async fn accept(&mut self) -> io::Result<BoxedSocket>;
}

/// Platform factory for outbound and listening RFCOMM sockets
#[async_trait]
pub trait StreamSocketFactory: Send + Sync {
    /// Connect to the service record `service_uuid` on `device`
    async fn connect(&self, device: MacAddress, service_uuid: Uuid) -> io::Result<BoxedSocket>;

    /// Connect directly to an RFCOMM channel, bypassing service discovery
    async fn connect_on_channel(&self, device: MacAddress, channel: u8) -> io::Result<BoxedSocket>;

    /// Register a service record and bind a server socket for it
    async fn listen(&self, service_uuid: Uuid, service_name: &str) -> io::Result<Box<dyn ServerSocket>>;
}
