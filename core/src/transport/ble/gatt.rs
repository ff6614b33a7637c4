/// GATT assist queue for Bluetooth address resolution
///
/// A helper that decided to assist a peer connects to the peer's short-lived
/// GATT server and writes the address it observed for that peer into the
/// characteristic derived from the peer's request ID. Only one GATT client
/// connection is active at a time; pending requests wait in a FIFO queue and
/// failed requests go to the back of the queue until their attempts run out.

use crate::transport::ble::advertisement::provide_mac_address_uuid;
use crate::transport::ble::discoverer::BleDiscoveryEvent;
use crate::transport::ble::platform::{BleDevice, GattClient, GattConnection, GattError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One pending assist write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistRequest {
    pub request_id: String,
    pub device: BleDevice,
    /// Attempts made so far
    pub attempts: u32,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<AssistRequest>,
    /// Request ID of the request currently being executed
    in_flight: Option<String>,
    worker: Option<JoinHandle<()>>,
}

/// Single-flight FIFO queue of GATT assist writes
#[derive(Clone)]
pub struct GattAssistQueue {
    client: Arc<dyn GattClient>,
    service_uuid: Uuid,
    request_timeout: Duration,
    max_attempts: u32,
    state: Arc<Mutex<QueueState>>,
    events: mpsc::UnboundedSender<BleDiscoveryEvent>,
}

impl GattAssistQueue {
    pub fn new(
        client: Arc<dyn GattClient>,
        service_uuid: Uuid,
        request_timeout: Duration,
        max_attempts: u32,
        events: mpsc::UnboundedSender<BleDiscoveryEvent>,
    ) -> Self {
        Self {
            client,
            service_uuid,
            request_timeout,
            max_attempts: max_attempts.max(1),
            state: Arc::new(Mutex::new(QueueState::default())),
            events,
        }
    }

    /// Queue an assist write. Returns false if the request is already queued
    /// or running.
    pub fn enqueue(&self, request_id: &str, device: BleDevice) -> bool {
        let mut state = self.state.lock();
        let known = state.in_flight.as_deref() == Some(request_id)
            || state.pending.iter().any(|r| r.request_id == request_id);
        if known {
            debug!("Assist request {} already queued", request_id);
            return false;
        }

        state.pending.push_back(AssistRequest {
            request_id: request_id.to_string(),
            device,
            attempts: 0,
        });
        debug!(
            "Queued assist request {} ({} pending)",
            request_id,
            state.pending.len()
        );

        if state.worker.is_none() {
            let queue = self.clone();
            state.worker = Some(tokio::spawn(async move { queue.run().await }));
        }
        true
    }

    /// Drop a request without reporting an outcome.
    ///
    /// A request already in flight finishes its current attempt, but its
    /// result is discarded.
    pub fn cancel(&self, request_id: &str) -> bool {
        let mut state = self.state.lock();
        let before = state.pending.len();
        state.pending.retain(|r| r.request_id != request_id);
        let mut removed = state.pending.len() != before;

        if state.in_flight.as_deref() == Some(request_id) {
            state.in_flight = None;
            removed = true;
        }
        removed
    }

    /// Drop every request and stop the worker
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.pending.clear();
        state.in_flight = None;
        if let Some(worker) = state.worker.take() {
            worker.abort();
        }
    }

    pub fn pending(&self) -> Vec<AssistRequest> {
        self.state.lock().pending.iter().cloned().collect()
    }

    pub fn is_busy(&self) -> bool {
        let state = self.state.lock();
        state.in_flight.is_some() || !state.pending.is_empty()
    }

    async fn run(&self) {
        loop {
            let mut request = {
                let mut state = self.state.lock();
                match state.pending.pop_front() {
                    Some(request) => {
                        state.in_flight = Some(request.request_id.clone());
                        request
                    }
                    None => {
                        state.in_flight = None;
                        state.worker = None;
                        return;
                    }
                }
            };
            request.attempts += 1;

            let outcome = match tokio::time::timeout(self.request_timeout, self.execute(&request)).await {
                Ok(result) => result,
                Err(_) => Err(GattError::Timeout),
            };

            let mut state = self.state.lock();
            let still_wanted = state.in_flight.take().as_deref() == Some(request.request_id.as_str());
            if !still_wanted {
                debug!("Assist request {} was cancelled", request.request_id);
                continue;
            }

            match outcome {
                Ok(()) => {
                    info!("Assist request {} delivered", request.request_id);
                    let _ = self.events.send(BleDiscoveryEvent::AssistRequestSucceeded {
                        request_id: request.request_id,
                    });
                }
                Err(e) if request.attempts >= self.max_attempts => {
                    warn!(
                        "Assist request {} failed after {} attempts: {}",
                        request.request_id, request.attempts, e
                    );
                    let _ = self.events.send(BleDiscoveryEvent::AssistRequestFailed {
                        request_id: request.request_id,
                    });
                }
                Err(e) => {
                    debug!(
                        "Assist request {} attempt {} failed: {}, re-queueing",
                        request.request_id, request.attempts, e
                    );
                    state.pending.push_back(request);
                }
            }
        }
    }

    async fn execute(&self, request: &AssistRequest) -> Result<(), GattError> {
        let characteristic = provide_mac_address_uuid(self.service_uuid, &request.request_id)
            .map_err(|e| GattError::WriteFailed(e.to_string()))?;

        let mut connection = self.client.connect(&request.device).await?;
        let result = write_observed_address(connection.as_mut(), &request.device, characteristic).await;
        connection.disconnect().await;
        result
    }
}

/// Write the requester's address as observed over the connection, never our own
async fn write_observed_address(
    connection: &mut dyn GattConnection,
    device: &BleDevice,
    characteristic: Uuid,
) -> Result<(), GattError> {
    let characteristics = connection.discover_characteristics().await?;
    if !characteristics.contains(&characteristic) {
        return Err(GattError::CharacteristicNotFound(characteristic));
    }

    let address = connection
        .remote_address()
        .or_else(|| device.mac_address())
        .ok_or_else(|| GattError::WriteFailed("remote address not observable".to_string()))?;

    connection.write(characteristic, address.as_bytes()).await
}

impl std::fmt::Debug for GattAssistQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("GattAssistQueue")
            .field("pending", &state.pending.len())
            .field("in_flight", &state.in_flight)
            .finish()
    }
}
