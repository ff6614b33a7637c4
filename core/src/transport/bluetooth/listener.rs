// RFCOMM listener
//
// One accept loop per connector. Each accepted socket gets its own handshake
// session in the server role; a failing session never affects the loop. If
// accept() itself fails the loop reports ListenerStopped and rebinds after a
// delay, up to max_listener_restarts consecutive failures.

use super::connector::{BluetoothConnector, ConnectionFailure, ConnectorError, ConnectorEvent};
use super::handshake::{run_server_handshake, Role};
use super::socket::{BoxedSocket, ServerSocket};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

impl BluetoothConnector {
    /// Bind the server socket and start accepting connections
    pub async fn start_listening(&self) -> Result<(), ConnectorError> {
        if self.is_listening() {
            return Err(ConnectorError::ListenerAlreadyRunning);
        }

        let server = self
            .factory
            .listen(self.config.service_uuid, &self.config.service_name)
            .await?;
        info!(
            "Listening for RFCOMM connections on {} ({})",
            self.config.service_uuid, self.config.service_name
        );

        let this = self.clone();
        let task = tokio::spawn(async move { this.supervise_listener(server).await });

        let mut listener = self.listener.lock();
        if let Some(previous) = listener.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    pub fn stop_listening(&self) {
        if let Some(task) = self.listener.lock().take() {
            task.abort();
            info!("Stopped RFCOMM listener");
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listener
            .lock()
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }

    async fn supervise_listener(&self, mut server: Box<dyn ServerSocket>) {
        let mut failures: u32 = 0;

        loop {
            match server.accept().await {
                Ok(socket) => {
                    failures = 0;
                    let this = self.clone();
                    tokio::spawn(async move { this.serve_session(socket).await });
                }
                Err(e) => {
                    failures += 1;
                    let restarting = failures <= self.config.max_listener_restarts;
                    warn!("RFCOMM accept failed ({} consecutive): {}", failures, e);
                    self.emit(ConnectorEvent::ListenerStopped { restarting });
                    drop(server);

                    match self.rebind(restarting, &mut failures).await {
                        Some(rebound) => server = rebound,
                        None => {
                            error!("RFCOMM listener gave up after {} failures", failures);
                            self.listener.lock().take();
                            self.emit(ConnectorEvent::ListenerFailed);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Rebind the server socket, counting bind failures against the same budget
    async fn rebind(&self, mut restarting: bool, failures: &mut u32) -> Option<Box<dyn ServerSocket>> {
        while restarting {
            tokio::time::sleep(self.config.listener_restart_delay).await;
            match self
                .factory
                .listen(self.config.service_uuid, &self.config.service_name)
                .await
            {
                Ok(server) => {
                    info!("RFCOMM listener restarted");
                    return Some(server);
                }
                Err(e) => {
                    *failures += 1;
                    restarting = *failures <= self.config.max_listener_restarts;
                    warn!("RFCOMM listener rebind failed: {}", e);
                }
            }
        }
        None
    }

    async fn serve_session(&self, mut socket: BoxedSocket) {
        let local = self.local_identity();
        let max_size = self.config.max_handshake_message_size;

        let result = tokio::time::timeout(
            self.config.connection_timeout,
            run_server_handshake(&mut socket, &local, max_size),
        )
        .await;

        let reason = match result {
            Ok(Ok(peer)) => {
                info!("Connected to {} (incoming)", peer);
                self.emit(ConnectorEvent::Connected {
                    socket,
                    incoming: true,
                    peer,
                });
                return;
            }
            Ok(Err(e)) => {
                warn!("Server handshake failed: {}", e);
                e.into_failure(Role::Server)
            }
            Err(_) => {
                warn!("Server handshake timed out");
                ConnectionFailure::HandshakeTimeout
            }
        };

        if let Err(e) = socket.shutdown().await {
            debug!("Closing failed handshake socket: {}", e);
        }
        self.emit(ConnectorEvent::ConnectionFailed {
            reason,
            peer: None,
            incoming: true,
        });
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ConnectorConfig;
    use crate::testing::FakeSocketFactory;
    use crate::transport::bluetooth::connector::{
        BluetoothConnector, ConnectionFailure, ConnectorError, ConnectorEvent,
    };
    use crate::transport::bluetooth::handshake::{read_identity, write_identity, IdentityMessage, Role};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn local() -> IdentityMessage {
        IdentityMessage::new("server-id", "server", "AA:BB:CC:DD:EE:FF")
    }

    fn remote() -> IdentityMessage {
        IdentityMessage::new("p1", "n1", "11:22:33:44:55:66")
    }

    #[tokio::test]
    async fn test_server_handshake_echoes_identity() {
        let factory = FakeSocketFactory::new();
        let (connector, mut events) = BluetoothConnector::new(ConnectorConfig::default(), factory.clone(), local());
        connector.start_listening().await.unwrap();

        let mut client = factory.open_inbound().unwrap();
        write_identity(&mut client, &remote()).await.unwrap();
        let echoed = read_identity(&mut client, 4096).await.unwrap();
        assert_eq!(echoed, local());

        match events.recv().await.unwrap() {
            ConnectorEvent::Connected { incoming, peer, .. } => {
                assert!(incoming);
                assert_eq!(peer.bluetooth_address, "11:22:33:44:55:66");
                assert_eq!(peer.peer_id.as_deref(), Some("p1"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_garbage_closes_session_and_listener_continues() {
        let factory = FakeSocketFactory::new();
        let (connector, mut events) = BluetoothConnector::new(ConnectorConfig::default(), factory.clone(), local());
        connector.start_listening().await.unwrap();

        let mut bad = factory.open_inbound().unwrap();
        bad.write_all(b"this is not an identity message").await.unwrap();

        match events.recv().await.unwrap() {
            ConnectorEvent::ConnectionFailed { reason, peer, incoming } => {
                assert_eq!(reason, ConnectionFailure::HandshakeParseFailed(Role::Server));
                assert!(peer.is_none());
                assert!(incoming);
            }
            other => panic!("unexpected event {:?}", other),
        }

        // No reply was written before the socket closed
        let mut reply = Vec::new();
        bad.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty());

        // The next connection is still served
        let mut good = factory.open_inbound().unwrap();
        write_identity(&mut good, &remote()).await.unwrap();
        assert_eq!(read_identity(&mut good, 4096).await.unwrap(), local());
        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectorEvent::Connected { incoming: true, .. }
        ));
        assert!(connector.is_listening());
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let factory = FakeSocketFactory::new();
        let (connector, _events) = BluetoothConnector::new(ConnectorConfig::default(), factory.clone(), local());
        connector.start_listening().await.unwrap();
        assert!(matches!(
            connector.start_listening().await,
            Err(ConnectorError::ListenerAlreadyRunning)
        ));
        assert_eq!(factory.listen_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_failure_restarts_listener() {
        let factory = FakeSocketFactory::new();
        let (connector, mut events) = BluetoothConnector::new(ConnectorConfig::default(), factory.clone(), local());
        connector.start_listening().await.unwrap();

        factory.break_listener();
        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectorEvent::ListenerStopped { restarting: true }
        ));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(factory.listen_count(), 2);
        assert!(connector.is_listening());

        let mut client = factory.open_inbound().unwrap();
        write_identity(&mut client, &remote()).await.unwrap();
        assert_eq!(read_identity(&mut client, 4096).await.unwrap(), local());
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_gives_up_after_repeated_failures() {
        let factory = FakeSocketFactory::new();
        let mut config = ConnectorConfig::default();
        config.max_listener_restarts = 2;
        let (connector, mut events) = BluetoothConnector::new(config, factory.clone(), local());
        connector.start_listening().await.unwrap();

        factory.fail_listen(true);
        factory.break_listener();

        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectorEvent::ListenerStopped { restarting: true }
        ));
        assert!(matches!(events.recv().await.unwrap(), ConnectorEvent::ListenerFailed));
        assert!(!connector.is_listening());

        // An explicit start works again once binding succeeds
        factory.fail_listen(false);
        connector.start_listening().await.unwrap();
        assert!(connector.is_listening());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_client_times_out() {
        let factory = FakeSocketFactory::new();
        let (connector, mut events) = BluetoothConnector::new(ConnectorConfig::default(), factory.clone(), local());
        connector.start_listening().await.unwrap();

        let _client = factory.open_inbound().unwrap();
        match events.recv().await.unwrap() {
            ConnectorEvent::ConnectionFailed { reason, .. } => {
                assert_eq!(reason, ConnectionFailure::HandshakeTimeout);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_listener() {
        let factory = FakeSocketFactory::new();
        let (connector, _events) = BluetoothConnector::new(ConnectorConfig::default(), factory.clone(), local());
        connector.start_listening().await.unwrap();
        connector.shutdown();
        assert!(!connector.is_listening());
    }
}
