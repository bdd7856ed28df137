//! One live connection to a watch.
//!
//! A `DeviceSession` multiplexes request/response pairs (matched by request
//! id) and pushed readings over a single `TransportLink`. The receive loop
//! never waits on a subscriber: each subscriber owns a bounded buffer, and a
//! reading that does not fit is dropped for that subscriber only.

mod subscription;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::Reading;
use crate::error::SessionError;
use crate::transport::{Inbound, Outbound, ParamValue, TransportLink};

pub use subscription::{Subscription, SubscriptionHandle};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

type Reply = Result<Vec<ParamValue>, SessionError>;

struct PendingRequest {
    param: String,
    reply: oneshot::Sender<Reply>,
}

struct SessionInner {
    id: Uuid,
    peer: String,
    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Reading>>>,
    next_request_id: AtomicU64,
    next_subscriber_id: AtomicU64,
    subscriber_buffer: usize,
    dropped_readings: AtomicU64,
    closed: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<SessionInner>,
}

impl DeviceSession {
    /// Take ownership of `link` and start its receive loop on the current
    /// tokio runtime.
    pub fn spawn(link: TransportLink, subscriber_buffer: usize) -> Self {
        let TransportLink {
            peer,
            outbound,
            inbound,
        } = link;

        let inner = Arc::new(SessionInner {
            id: Uuid::new_v4(),
            peer,
            outbound: Mutex::new(Some(outbound)),
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            next_subscriber_id: AtomicU64::new(1),
            subscriber_buffer: subscriber_buffer.max(1),
            dropped_readings: AtomicU64::new(0),
            closed: CancellationToken::new(),
        });

        tokio::spawn(receive_loop(inner.clone(), inbound));

        Self { inner }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the session has closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    /// Close the session: pending requests fail with `SessionError::Closed`
    /// and every subscription ends. Idempotent.
    pub fn close(&self) {
        self.inner.shutdown();
    }

    /// Read the values of a remote parameter.
    pub async fn request(&self, param: &str) -> Result<Vec<ParamValue>, SessionError> {
        self.send_request(param, |id| Outbound::Get {
            id,
            param: param.to_string(),
        })
        .await
    }

    /// Write a remote parameter and wait for the acknowledgement.
    pub async fn set_value(&self, param: &str, value: ParamValue) -> Result<(), SessionError> {
        self.send_request(param, |id| Outbound::Set {
            id,
            param: param.to_string(),
            value,
        })
        .await
        .map(|_| ())
    }

    async fn send_request<F>(&self, param: &str, build: F) -> Reply
    where
        F: FnOnce(u64) -> Outbound,
    {
        let id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();

        let outbound = {
            let mut pending = lock(&self.inner.pending);
            // Checked under the lock that `shutdown` drains, so a request can
            // never be registered after the drain.
            let outbound = match lock(&self.inner.outbound).clone() {
                Some(outbound) if !self.inner.closed.is_cancelled() => outbound,
                _ => return Err(SessionError::Closed),
            };
            pending.insert(
                id,
                PendingRequest {
                    param: param.to_string(),
                    reply: reply_tx,
                },
            );
            outbound
        };

        let sent = outbound.send(build(id)).await;
        drop(outbound);
        if sent.is_err() {
            log_warn!("session {}: transport refused request {id}", self.inner.id);
            self.close();
            return Err(SessionError::Closed);
        }

        reply_rx.await.unwrap_or(Err(SessionError::Closed))
    }

    /// Register a new subscriber for pushed readings. On a closed session the
    /// returned stream ends immediately.
    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.subscriber_buffer);

        {
            let mut subscribers = lock(&self.inner.subscribers);
            if !self.inner.closed.is_cancelled() {
                subscribers.insert(id, tx);
            }
        }

        Subscription::new(SubscriptionHandle::new(self.clone(), id), rx)
    }

    /// Drop a subscriber. Readings already buffered for it are still
    /// yielded, then its stream ends.
    pub fn unsubscribe(&self, subscriber_id: u64) -> bool {
        lock(&self.inner.subscribers).remove(&subscriber_id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers).len()
    }

    /// Readings discarded because a subscriber's buffer was full.
    pub fn dropped_readings(&self) -> u64 {
        self.inner.dropped_readings.load(Ordering::Relaxed)
    }

    pub fn pending_requests(&self) -> usize {
        lock(&self.inner.pending).len()
    }
}

impl SessionInner {
    fn shutdown(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        // Releases the transport's write side even while subscription
        // handles keep this session alive.
        lock(&self.outbound).take();

        let drained: Vec<PendingRequest> = lock(&self.pending).drain().map(|(_, p)| p).collect();
        for request in drained {
            let _ = request.reply.send(Err(SessionError::Closed));
        }
        lock(&self.subscribers).clear();
    }

    fn dispatch(&self, message: Inbound) {
        match message {
            Inbound::Response { id, values } => self.complete(id, Ok(values)),
            Inbound::Error { id, message } => {
                let param = lock(&self.pending)
                    .get(&id)
                    .map(|request| request.param.clone())
                    .unwrap_or_default();
                self.complete(id, Err(SessionError::Remote { param, message }));
            }
            Inbound::Increment {
                sensor,
                timestamp,
                values,
            } => match Reading::from_millis(sensor, timestamp, values) {
                Ok(reading) => self.deliver(&reading),
                Err(err) => log_warn!("session {}: discarding pushed reading: {err}", self.id),
            },
        }
    }

    fn complete(&self, id: u64, reply: Reply) {
        match lock(&self.pending).remove(&id) {
            Some(request) => {
                // The caller may have given up waiting; nothing to do then.
                let _ = request.reply.send(reply);
            }
            None => log_warn!("session {}: response for unknown request {id}", self.id),
        }
    }

    fn deliver(&self, reading: &Reading) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|subscriber_id, tx| match tx.try_send(reading.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped_readings.fetch_add(1, Ordering::Relaxed);
                log_warn!(
                    "session {}: subscriber {subscriber_id} is lagging, dropped reading from {}",
                    self.id,
                    reading.sensor
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

async fn receive_loop(inner: Arc<SessionInner>, mut inbound: mpsc::Receiver<Inbound>) {
    log_info!("session {} opened for {}", inner.id, inner.peer);
    loop {
        tokio::select! {
            biased;
            _ = inner.closed.cancelled() => break,
            message = inbound.recv() => match message {
                Some(message) => inner.dispatch(message),
                None => {
                    log_info!("session {}: transport closed", inner.id);
                    break;
                }
            },
        }
    }
    inner.shutdown();
    log_info!("session {} closed", inner.id);
}
