// Bluetooth RFCOMM transport: outbound connector, listener and the identity
// handshake run on every new socket before it reaches the application.

pub mod connector;
pub mod handshake;
pub mod listener;
pub mod socket;

pub use connector::{AttemptId, BluetoothConnector, ConnectionFailure, ConnectorError, ConnectorEvent};
pub use handshake::{HandshakeError, IdentityMessage, Role};
pub use socket::{BluetoothSocket, BoxedSocket, ServerSocket, StreamSocketFactory};
