//! Request/response correlation over one persistent relay connection
//!
//! Every outgoing request is registered in a pending table under its
//! correlation id before its frame is written. Incoming frames are routed to
//! the matching entry: `EVENT` accumulates, `EOSE` completes a fetch, `OK`
//! completes a submit, `CLOSED` fails the request. A lost connection fails
//! every request it carried; the next dispatch opens a fresh one.

use crate::framing::{ClientMessage, RelayMessage};
use crate::transport::{SubmitResponse, TransportError};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use scp_core::{FetchRequest, ProtocolEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

/// Decimal digits in a generated request id
pub const REQUEST_ID_DIGITS: usize = 10;

/// Text channels of an open connection
pub struct Connection {
    /// Frames to write to the relay. Dropping every sender closes the link.
    pub outbound: mpsc::UnboundedSender<String>,
    /// Frames read from the relay. Yields `None` once the link is gone.
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens connections to a relay
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Connection, TransportError>;
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    /// Explicitly closed; terminal
    Closed,
}

type FetchReply = oneshot::Sender<Result<Vec<ProtocolEvent>, TransportError>>;
type SubmitReply = oneshot::Sender<Result<(bool, String), TransportError>>;

enum PendingSink {
    Fetch { events: Vec<ProtocolEvent>, reply: FetchReply },
    Submit { reply: SubmitReply },
}

impl PendingSink {
    fn fail(self, err: TransportError) {
        match self {
            Self::Fetch { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Self::Submit { reply } => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

struct PendingRequest {
    sink: PendingSink,
    /// Connection generation the request was written to
    generation: u64,
    /// Registration sequence, distinguishes reuses of the same id
    seq: u64,
    created_at: Instant,
}

#[derive(Default)]
struct PendingTable {
    /// Generation of the connection currently accepting requests
    live_generation: Option<u64>,
    requests: HashMap<String, PendingRequest>,
}

#[derive(Clone)]
struct Link {
    generation: u64,
    outbound: mpsc::UnboundedSender<String>,
}

struct RouterInner {
    url: String,
    state: RwLock<ConnectionState>,
    pending: Mutex<PendingTable>,
    next_seq: AtomicU64,
}

/// Multiplexes fetches and submits over a single relay connection
pub struct CorrelationRouter {
    inner: Arc<RouterInner>,
    connector: Arc<dyn Connector>,
    /// Held across an open so concurrent dispatchers share it
    link: AsyncMutex<Option<Link>>,
    next_generation: AtomicU64,
    request_timeout: Duration,
}

impl CorrelationRouter {
    pub fn new(url: impl Into<String>, connector: Arc<dyn Connector>, request_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                url: url.into(),
                state: RwLock::new(ConnectionState::Disconnected),
                pending: Mutex::new(PendingTable::default()),
                next_seq: AtomicU64::new(0),
            }),
            connector,
            link: AsyncMutex::new(None),
            next_generation: AtomicU64::new(0),
            request_timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    /// Requests awaiting a terminal frame
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().requests.len()
    }

    /// Send `["REQ", id, requests...]` and collect events until `EOSE`
    pub async fn fetch(&self, requests: &[FetchRequest]) -> Result<Vec<ProtocolEvent>, TransportError> {
        let link = self.ensure_open().await?;
        let (reply, rx) = oneshot::channel();
        let guard = self.inner.register(
            link.generation,
            None,
            PendingSink::Fetch {
                events: Vec::new(),
                reply,
            },
        )?;

        self.send(
            &link,
            &ClientMessage::Req {
                id: guard.id.clone(),
                requests: requests.to_vec(),
            },
        )?;
        let events = self.await_reply(&guard.id, rx).await?;

        // The relay keeps the subscription alive past EOSE until told otherwise
        if let Ok(text) = ClientMessage::Close(guard.id.clone()).to_text() {
            let _ = link.outbound.send(text);
        }
        Ok(events)
    }

    /// Send `["EVENT", event]` keyed by the event id and wait for `OK`
    pub async fn submit(&self, event: &ProtocolEvent) -> Result<SubmitResponse, TransportError> {
        let link = self.ensure_open().await?;
        let (reply, rx) = oneshot::channel();
        let guard = self
            .inner
            .register(link.generation, Some(&event.id), PendingSink::Submit { reply })?;

        self.send(&link, &ClientMessage::Event(event.clone()))?;
        let (accepted, message) = self.await_reply(&guard.id, rx).await?;

        let message = (!message.is_empty()).then_some(message);
        Ok(if accepted {
            SubmitResponse::accepted(&self.inner.url, message)
        } else {
            SubmitResponse {
                success: false,
                message,
                relay: self.inner.url.clone(),
            }
        })
    }

    /// Close the connection for good. Pending requests fail with
    /// [`TransportError::Shutdown`] and later dispatches are refused.
    pub async fn close(&self) {
        let mut slot = self.link.lock().await;
        *self.inner.state.write() = ConnectionState::Closed;
        slot.take();

        let drained: Vec<PendingRequest> = {
            let mut table = self.inner.pending.lock();
            table.live_generation = None;
            table.requests.drain().map(|(_, r)| r).collect()
        };
        info!(url = %self.inner.url, failed = drained.len(), "relay connection closed");
        for request in drained {
            request.sink.fail(TransportError::Shutdown);
        }
    }

    async fn ensure_open(&self) -> Result<Link, TransportError> {
        let mut slot = self.link.lock().await;
        if self.state() == ConnectionState::Closed {
            return Err(TransportError::Shutdown);
        }
        if let Some(link) = slot.as_ref() {
            if self.inner.is_live(link.generation) && !link.outbound.is_closed() {
                return Ok(link.clone());
            }
        }
        *slot = None;

        *self.inner.state.write() = ConnectionState::Connecting;
        debug!(url = %self.inner.url, "opening relay connection");

        let connection = match self.connector.connect(&self.inner.url).await {
            Ok(connection) => connection,
            Err(err) => {
                *self.inner.state.write() = ConnectionState::Disconnected;
                warn!(url = %self.inner.url, error = %err, "relay connection failed");
                return Err(err);
            }
        };

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.pending.lock().live_generation = Some(generation);
        *self.inner.state.write() = ConnectionState::Open;
        info!(url = %self.inner.url, generation, "relay connection open");

        tokio::spawn(read_loop(Arc::clone(&self.inner), connection.inbound, generation));

        let link = Link {
            generation,
            outbound: connection.outbound,
        };
        *slot = Some(link.clone());
        Ok(link)
    }

    fn send(&self, link: &Link, message: &ClientMessage) -> Result<(), TransportError> {
        let text = message.to_text()?;
        link.outbound
            .send(text)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn await_reply<T>(
        &self,
        id: &str,
        rx: oneshot::Receiver<Result<T, TransportError>>,
    ) -> Result<T, TransportError> {
        match timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            // Sink dropped without an answer
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                warn!(url = %self.inner.url, id, timeout_ms = self.request_timeout.as_millis() as u64, "relay request timed out");
                Err(TransportError::Timeout(self.request_timeout))
            }
        }
    }
}

impl RouterInner {
    fn is_live(&self, generation: u64) -> bool {
        self.pending.lock().live_generation == Some(generation)
    }

    /// Add a pending entry. With `id == None` a fresh request id is drawn;
    /// the uniqueness check and the insert happen under the same lock.
    fn register(
        self: &Arc<Self>,
        generation: u64,
        id: Option<&str>,
        sink: PendingSink,
    ) -> Result<PendingGuard, TransportError> {
        let mut table = self.pending.lock();
        if table.live_generation != Some(generation) {
            return Err(TransportError::ConnectionClosed);
        }

        let id = match id {
            Some(id) if table.requests.contains_key(id) => {
                return Err(TransportError::DuplicateRequest(id.to_string()));
            }
            Some(id) => id.to_string(),
            None => {
                let mut rng = rand::thread_rng();
                loop {
                    let candidate = generate_request_id(&mut rng);
                    if !table.requests.contains_key(&candidate) {
                        break candidate;
                    }
                }
            }
        };

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        table.requests.insert(
            id.clone(),
            PendingRequest {
                sink,
                generation,
                seq,
                created_at: Instant::now(),
            },
        );
        trace!(url = %self.url, %id, "request registered");

        Ok(PendingGuard {
            inner: Arc::clone(self),
            id,
            seq,
        })
    }

    fn route(&self, text: &str) {
        let message = match RelayMessage::from_text(text) {
            Ok(message) => message,
            Err(err) => {
                debug!(url = %self.url, error = %err, "ignoring undecodable frame");
                return;
            }
        };

        let mut table = self.pending.lock();
        match message {
            RelayMessage::Event { id, event } => match table.requests.get_mut(&id) {
                Some(PendingRequest {
                    sink: PendingSink::Fetch { events, .. },
                    ..
                }) => events.push(event),
                Some(_) => debug!(url = %self.url, %id, "event frame for a submit request"),
                None => trace!(url = %self.url, %id, "event for unknown request"),
            },
            RelayMessage::Eose { id } => match table.requests.remove(&id) {
                Some(PendingRequest {
                    sink: PendingSink::Fetch { events, reply },
                    created_at,
                    ..
                }) => {
                    debug!(
                        url = %self.url,
                        %id,
                        events = events.len(),
                        elapsed_ms = created_at.elapsed().as_millis() as u64,
                        "fetch complete"
                    );
                    let _ = reply.send(Ok(events));
                }
                Some(other) => {
                    table.requests.insert(id, other);
                }
                None => trace!(url = %self.url, %id, "EOSE for unknown request"),
            },
            RelayMessage::Ok { id, accepted, message } => match table.requests.remove(&id) {
                Some(PendingRequest {
                    sink: PendingSink::Submit { reply },
                    ..
                }) => {
                    debug!(url = %self.url, %id, accepted, "submit acknowledged");
                    let _ = reply.send(Ok((accepted, message)));
                }
                Some(other) => {
                    table.requests.insert(id, other);
                }
                None => trace!(url = %self.url, %id, "OK for unknown request"),
            },
            RelayMessage::Closed { id, message } => {
                if let Some(request) = table.requests.remove(&id) {
                    debug!(url = %self.url, %id, %message, "request closed by relay");
                    request.sink.fail(TransportError::Relay(message));
                }
            }
            RelayMessage::Notice(notice) => info!(url = %self.url, %notice, "relay notice"),
        }
    }

    fn connection_lost(&self, generation: u64) {
        let (was_live, failed) = {
            let mut table = self.pending.lock();
            let was_live = table.live_generation == Some(generation);
            if was_live {
                table.live_generation = None;
            }
            let ids: Vec<String> = table
                .requests
                .iter()
                .filter(|(_, r)| r.generation == generation)
                .map(|(id, _)| id.clone())
                .collect();
            let failed: Vec<PendingRequest> = ids
                .iter()
                .filter_map(|id| table.requests.remove(id))
                .collect();
            (was_live, failed)
        };

        if was_live {
            let mut state = self.state.write();
            if *state == ConnectionState::Open {
                *state = ConnectionState::Disconnected;
            }
        }

        if was_live || !failed.is_empty() {
            warn!(url = %self.url, generation, failed = failed.len(), "relay connection lost");
        }
        for request in failed {
            request.sink.fail(TransportError::ConnectionClosed);
        }
    }
}

/// Removes its pending entry on drop unless the entry was already answered
/// or replaced by a later registration under the same id.
struct PendingGuard {
    inner: Arc<RouterInner>,
    id: String,
    seq: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut table = self.inner.pending.lock();
        if table.requests.get(&self.id).map(|r| r.seq) == Some(self.seq) {
            table.requests.remove(&self.id);
        }
    }
}

async fn read_loop(inner: Arc<RouterInner>, mut inbound: mpsc::UnboundedReceiver<String>, generation: u64) {
    while let Some(text) = inbound.recv().await {
        inner.route(&text);
    }
    inner.connection_lost(generation);
}

fn generate_request_id<R: Rng>(rng: &mut R) -> String {
    (0..REQUEST_ID_DIGITS)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}
