//! Bluetooth connector
//!
//! Dials outbound RFCOMM sockets and runs the client side of the identity
//! handshake on them. The listener half lives in `listener.rs`; both report
//! through one [`ConnectorEvent`] channel and hand the live socket to the
//! application once the handshake has completed.
//!
//! Every outbound attempt is guarded by a timer that is armed when dialing
//! starts and re-armed once the socket connects. Success, failure, timeout
//! and cancellation race to remove the attempt from the attempt table; only
//! the first one to do so reports anything.

use crate::config::ConnectorConfig;
use crate::peer::PeerProperties;
use crate::timer::OneShotTimer;
use crate::transport::ble::address::MacAddress;
use crate::transport::bluetooth::handshake::{run_client_handshake, IdentityMessage, Role};
use crate::transport::bluetooth::socket::{BoxedSocket, StreamSocketFactory};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ============================================================================
// ERRORS AND EVENTS
// ============================================================================

/// Why a connection did not reach the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ConnectionFailure {
    #[error("Socket connect failed")]
    SocketConnectFailed,
    #[error("Handshake timed out")]
    HandshakeTimeout,
    #[error("Handshake parse failed ({0} side)")]
    HandshakeParseFailed(Role),
    #[error("Peer disconnected during handshake ({0} side)")]
    PeerDisconnectedDuringHandshake(Role),
    #[error("Cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Invalid peer address: {0}")]
    InvalidPeerAddress(String),
    #[error("Listener already running")]
    ListenerAlreadyRunning,
    #[error("Failed to bind listener: {0}")]
    Listen(#[from] std::io::Error),
}

/// Messages posted by the connector to its owner
pub enum ConnectorEvent {
    /// Handshake completed; the socket now belongs to the receiver
    Connected {
        socket: BoxedSocket,
        incoming: bool,
        peer: PeerProperties,
    },
    ConnectionFailed {
        reason: ConnectionFailure,
        peer: Option<PeerProperties>,
        incoming: bool,
    },
    /// The accept loop failed; `restarting` tells whether a restart follows
    ListenerStopped { restarting: bool },
    /// The listener gave up after repeated failures
    ListenerFailed,
}

impl fmt::Debug for ConnectorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected { incoming, peer, .. } => f
                .debug_struct("Connected")
                .field("incoming", incoming)
                .field("peer", peer)
                .finish_non_exhaustive(),
            Self::ConnectionFailed {
                reason,
                peer,
                incoming,
            } => f
                .debug_struct("ConnectionFailed")
                .field("reason", reason)
                .field("peer", peer)
                .field("incoming", incoming)
                .finish(),
            Self::ListenerStopped { restarting } => f
                .debug_struct("ListenerStopped")
                .field("restarting", restarting)
                .finish(),
            Self::ListenerFailed => write!(f, "ListenerFailed"),
        }
    }
}

/// Identifier of one outbound connection attempt
pub type AttemptId = u64;

struct ConnectionAttempt {
    peer: PeerProperties,
    address: MacAddress,
    timer: OneShotTimer,
    task: Option<JoinHandle<()>>,
}

// ============================================================================
// CONNECTOR
// ============================================================================

#[derive(Clone)]
pub struct BluetoothConnector {
    pub(super) config: ConnectorConfig,
    pub(super) factory: Arc<dyn StreamSocketFactory>,
    pub(super) local_identity: Arc<RwLock<IdentityMessage>>,
    pub(super) events: mpsc::UnboundedSender<ConnectorEvent>,
    pub(super) listener: Arc<Mutex<Option<JoinHandle<()>>>>,
    attempts: Arc<Mutex<HashMap<AttemptId, ConnectionAttempt>>>,
    next_attempt_id: Arc<AtomicU64>,
    /// Last alternate RFCOMM channel tried
    channel: Arc<AtomicU8>,
}

impl BluetoothConnector {
    pub fn new(
        config: ConnectorConfig,
        factory: Arc<dyn StreamSocketFactory>,
        local_identity: IdentityMessage,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectorEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let connector = Self {
            config,
            factory,
            local_identity: Arc::new(RwLock::new(local_identity)),
            events,
            listener: Arc::new(Mutex::new(None)),
            attempts: Arc::new(Mutex::new(HashMap::new())),
            next_attempt_id: Arc::new(AtomicU64::new(1)),
            channel: Arc::new(AtomicU8::new(0)),
        };
        (connector, receiver)
    }

    pub fn local_identity(&self) -> IdentityMessage {
        self.local_identity.read().clone()
    }

    /// Replace the identity sent in future handshakes
    pub fn set_local_identity(&self, identity: IdentityMessage) {
        *self.local_identity.write() = identity;
    }

    /// Start an outbound connection to `peer`.
    ///
    /// The outcome arrives as a `Connected` or `ConnectionFailed` event; on
    /// timeout the failure carries the properties passed here.
    pub fn connect(&self, peer: PeerProperties) -> Result<AttemptId, ConnectorError> {
        let address: MacAddress = peer
            .bluetooth_address
            .parse()
            .map_err(|_| ConnectorError::InvalidPeerAddress(peer.bluetooth_address.clone()))?;
        if address.is_unknown() {
            return Err(ConnectorError::InvalidPeerAddress(peer.bluetooth_address.clone()));
        }

        let id = self.next_attempt_id.fetch_add(1, Ordering::SeqCst);
        let timer = OneShotTimer::new();
        self.attempts.lock().insert(
            id,
            ConnectionAttempt {
                peer: peer.clone(),
                address,
                timer: timer.clone(),
                task: None,
            },
        );
        self.arm_timeout(id, &timer);
        info!("Connecting to {} (attempt {})", address, id);

        let this = self.clone();
        let task = tokio::spawn(async move { this.run_attempt(id, address, peer).await });

        if let Some(attempt) = self.attempts.lock().get_mut(&id) {
            attempt.task = Some(task);
        }
        Ok(id)
    }

    /// Cancel every in-flight attempt to `bluetooth_address`
    pub fn cancel_connect(&self, bluetooth_address: &str) -> usize {
        let ids: Vec<AttemptId> = self
            .attempts
            .lock()
            .iter()
            .filter(|(_, a)| a.peer.bluetooth_address.eq_ignore_ascii_case(bluetooth_address))
            .map(|(id, _)| *id)
            .collect();

        self.cancel_attempts(ids)
    }

    pub fn cancel_all(&self) -> usize {
        let ids: Vec<AttemptId> = self.attempts.lock().keys().copied().collect();
        self.cancel_attempts(ids)
    }

    pub fn pending_attempts(&self) -> usize {
        self.attempts.lock().len()
    }

    pub fn is_connecting_to(&self, bluetooth_address: &str) -> bool {
        self.attempts
            .lock()
            .values()
            .any(|a| a.peer.bluetooth_address.eq_ignore_ascii_case(bluetooth_address))
    }

    /// Stop the listener and cancel all outbound attempts
    pub fn shutdown(&self) {
        self.stop_listening();
        let cancelled = self.cancel_all();
        info!("Connector shut down ({} attempts cancelled)", cancelled);
    }

    pub(super) fn emit(&self, event: ConnectorEvent) {
        if self.events.send(event).is_err() {
            debug!("Connector event dropped, owner gone");
        }
    }

    fn cancel_attempts(&self, ids: Vec<AttemptId>) -> usize {
        let mut cancelled = 0;
        for id in ids {
            if self.fail_attempt(id, ConnectionFailure::Cancelled, true) {
                cancelled += 1;
            }
        }
        cancelled
    }

    fn arm_timeout(&self, id: AttemptId, timer: &OneShotTimer) {
        let this = self.clone();
        timer.arm(self.config.connection_timeout, async move {
            if this.fail_attempt(id, ConnectionFailure::HandshakeTimeout, true) {
                warn!("Connection attempt {} timed out", id);
            }
        });
    }

    /// Remove an attempt, reporting `reason` if it was still pending.
    ///
    /// `abort` must be false when called from the attempt's own task.
    fn fail_attempt(&self, id: AttemptId, reason: ConnectionFailure, abort: bool) -> bool {
        let Some(attempt) = self.take_attempt(id) else {
            return false;
        };
        if abort {
            if let Some(task) = attempt.task {
                task.abort();
            }
        }
        debug!("Connection attempt {} to {} failed: {}", id, attempt.address, reason);
        self.emit(ConnectorEvent::ConnectionFailed {
            reason,
            peer: Some(attempt.peer),
            incoming: false,
        });
        true
    }

    fn take_attempt(&self, id: AttemptId) -> Option<ConnectionAttempt> {
        let attempt = self.attempts.lock().remove(&id)?;
        attempt.timer.cancel();
        Some(attempt)
    }

    async fn run_attempt(&self, id: AttemptId, address: MacAddress, supplied: PeerProperties) {
        let Some(mut socket) = self.dial(address).await else {
            self.fail_attempt(id, ConnectionFailure::SocketConnectFailed, false);
            return;
        };

        // Socket is up: the handshake gets a fresh timeout budget
        let timer = self.attempts.lock().get(&id).map(|a| a.timer.clone());
        match timer {
            Some(timer) => self.arm_timeout(id, &timer),
            None => return,
        }

        let local = self.local_identity();
        let result = run_client_handshake(&mut socket, &local, self.config.max_handshake_message_size).await;

        match result {
            Ok(mut confirmed) => {
                if confirmed.has_unknown_address() {
                    confirmed.bluetooth_address = address.to_string();
                }
                PeerProperties::merge_missing(&supplied, &mut confirmed);
                if supplied.extra_info.is_some() {
                    confirmed.extra_info = supplied.extra_info;
                }

                if self.take_attempt(id).is_some() {
                    info!("Connected to {} (outgoing)", confirmed);
                    self.emit(ConnectorEvent::Connected {
                        socket,
                        incoming: false,
                        peer: confirmed,
                    });
                }
            }
            Err(e) => {
                warn!("Client handshake with {} failed: {}", address, e);
                self.fail_attempt(id, e.into_failure(Role::Client), false);
            }
        }
    }

    /// Open a socket, falling back to rotating alternate channels
    async fn dial(&self, address: MacAddress) -> Option<BoxedSocket> {
        let attempts = self.config.max_connect_attempts.max(1);
        for attempt in 1..=attempts {
            match self.factory.connect(address, self.config.service_uuid).await {
                Ok(socket) => return Some(socket),
                Err(e) => debug!("Connect to {} failed ({}), trying alternate channel", address, e),
            }

            let channel = self.next_channel();
            match self.factory.connect_on_channel(address, channel).await {
                Ok(socket) => return Some(socket),
                Err(e) => warn!(
                    "Connect attempt {}/{} to {} on channel {} failed: {}",
                    attempt, attempts, address, channel, e
                ),
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }
        None
    }

    /// Next alternate channel in `1..=max_alternate_channel`
    fn next_channel(&self) -> u8 {
        let max = self.config.max_alternate_channel.max(1);
        let previous = self
            .channel
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some(c % max + 1))
            .unwrap_or_else(|c| c);
        previous % max + 1
    }
}

impl fmt::Debug for BluetoothConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BluetoothConnector")
            .field("pending_attempts", &self.pending_attempts())
            .field("listening", &self.is_listening())
            .finish()
    }
}
