// Integration test: RFCOMM identity handshake end to end
//
// Two connectors share an in-memory loopback "radio": every outbound dial
// lands on the listener of whichever connector is listening. Verifies that:
// - Both sides complete the handshake and receive each other's identity
// - A server fed garbage closes that session without replying and keeps serving
// - A socket that opens but never answers fails with HandshakeTimeout

use async_trait::async_trait;
use parking_lot::Mutex;
use proxlink_core::transport::bluetooth::handshake::{read_identity, write_identity};
use proxlink_core::transport::bluetooth::{BoxedSocket, ServerSocket, StreamSocketFactory};
use proxlink_core::{
    BluetoothConnector, ConnectionFailure, ConnectorConfig, ConnectorEvent, IdentityMessage, MacAddress,
    PeerProperties,
};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

/// Outbound dials are delivered to the listener; with `silent` set they are
/// parked instead and nobody ever answers.
struct LoopbackRadio {
    inbound: Mutex<Option<mpsc::UnboundedSender<BoxedSocket>>>,
    silent: bool,
    parked: Mutex<Vec<DuplexStream>>,
}

impl LoopbackRadio {
    fn new(silent: bool) -> Arc<Self> {
        Arc::new(Self {
            inbound: Mutex::new(None),
            silent,
            parked: Mutex::new(Vec::new()),
        })
    }

    /// Open a raw connection to the listener, bypassing any connector
    fn raw_inbound(&self) -> DuplexStream {
        let (client, server) = tokio::io::duplex(4096);
        let inbound = self.inbound.lock();
        inbound
            .as_ref()
            .expect("nobody is listening")
            .send(Box::new(server))
            .expect("listener gone");
        client
    }

    fn dial(&self) -> io::Result<BoxedSocket> {
        let (local, remote) = tokio::io::duplex(4096);
        if self.silent {
            self.parked.lock().push(remote);
            return Ok(Box::new(local));
        }
        let inbound = self.inbound.lock();
        let sender = inbound
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "nobody listening"))?;
        sender
            .send(Box::new(remote))
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener gone"))?;
        Ok(Box::new(local))
    }
}

#[async_trait]
impl StreamSocketFactory for LoopbackRadio {
    async fn connect(&self, _device: MacAddress, _service_uuid: Uuid) -> io::Result<BoxedSocket> {
        self.dial()
    }

    async fn connect_on_channel(&self, _device: MacAddress, _channel: u8) -> io::Result<BoxedSocket> {
        self.dial()
    }

    async fn listen(&self, _service_uuid: Uuid, _service_name: &str) -> io::Result<Box<dyn ServerSocket>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound.lock() = Some(tx);
        Ok(Box::new(LoopbackServer { inbound: rx }))
    }
}

struct LoopbackServer {
    inbound: mpsc::UnboundedReceiver<BoxedSocket>,
}

#[async_trait]
impl ServerSocket for LoopbackServer {
    async fn accept(&mut self) -> io::Result<BoxedSocket> {
        self.inbound
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "radio dropped"))
    }
}

fn alice() -> IdentityMessage {
    IdentityMessage::new("p1", "n1", "11:22:33:44:55:66")
}

fn bob() -> IdentityMessage {
    IdentityMessage::new("p2", "n2", "AA:BB:CC:DD:EE:FF")
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<ConnectorEvent>) -> ConnectorEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for connector event")
        .expect("connector dropped")
}

#[tokio::test]
async fn test_both_sides_connect_with_role_flags() {
    proxlink_core::init_tracing("debug");

    let radio = LoopbackRadio::new(false);
    let (server, mut server_events) = BluetoothConnector::new(ConnectorConfig::default(), radio.clone(), bob());
    let (client, mut client_events) = BluetoothConnector::new(ConnectorConfig::default(), radio.clone(), alice());

    server.start_listening().await.unwrap();
    client.connect(PeerProperties::new("AA:BB:CC:DD:EE:FF")).unwrap();

    let ConnectorEvent::Connected {
        socket: mut server_socket,
        incoming,
        peer,
    } = next_event(&mut server_events).await
    else {
        panic!("server did not connect");
    };
    assert!(incoming);
    assert_eq!(peer.peer_id.as_deref(), Some("p1"));
    assert_eq!(peer.name.as_deref(), Some("n1"));
    assert_eq!(peer.bluetooth_address, "11:22:33:44:55:66");

    let ConnectorEvent::Connected {
        socket: mut client_socket,
        incoming,
        peer,
    } = next_event(&mut client_events).await
    else {
        panic!("client did not connect");
    };
    assert!(!incoming);
    assert_eq!(peer.peer_id.as_deref(), Some("p2"));
    assert_eq!(peer.name.as_deref(), Some("n2"));

    // The handed-over sockets carry application data
    client_socket.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    server_socket.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
}

#[tokio::test]
async fn test_garbage_gets_no_reply_and_listener_survives() {
    let radio = LoopbackRadio::new(false);
    let (server, mut server_events) = BluetoothConnector::new(ConnectorConfig::default(), radio.clone(), bob());
    server.start_listening().await.unwrap();

    let mut rogue = radio.raw_inbound();
    rogue.write_all(b"\x00\x00\x00\x05hello").await.unwrap();

    match next_event(&mut server_events).await {
        ConnectorEvent::ConnectionFailed { reason, incoming, .. } => {
            assert!(matches!(reason, ConnectionFailure::HandshakeParseFailed(_)));
            assert!(incoming);
        }
        other => panic!("unexpected event {:?}", other),
    }
    let mut reply = Vec::new();
    rogue.read_to_end(&mut reply).await.unwrap();
    assert!(reply.is_empty());

    let mut honest = radio.raw_inbound();
    write_identity(&mut honest, &alice()).await.unwrap();
    assert_eq!(read_identity(&mut honest, 4096).await.unwrap(), bob());
    assert!(matches!(
        next_event(&mut server_events).await,
        ConnectorEvent::Connected { incoming: true, .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_handshake_times_out_with_supplied_peer() {
    let radio = LoopbackRadio::new(true);
    let (client, mut client_events) = BluetoothConnector::new(ConnectorConfig::default(), radio.clone(), alice());

    let supplied = PeerProperties::new("AA:BB:CC:DD:EE:FF").with_name("from-scan");
    client.connect(supplied).unwrap();

    match client_events.recv().await.unwrap() {
        ConnectorEvent::ConnectionFailed { reason, peer, incoming } => {
            assert_eq!(reason, ConnectionFailure::HandshakeTimeout);
            assert_eq!(reason.to_string(), "Handshake timed out");
            let peer = peer.unwrap();
            assert_eq!(peer.bluetooth_address, "AA:BB:CC:DD:EE:FF");
            assert_eq!(peer.name.as_deref(), Some("from-scan"));
            assert!(!incoming);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(client.pending_attempts(), 0);
}
