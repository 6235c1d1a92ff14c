//! One multiplexed client connection.
//!
//! Any number of requests may be outstanding at once. Each registers a
//! oneshot waiter keyed by its [`RequestId`] before the frame is sent; the
//! reader task completes the waiter whose id matches an incoming reply and
//! discards replies nobody waits for (timed out or evicted requests). When the
//! transport ends, every remaining waiter receives a `Transport` error and the
//! connection refuses new requests.
//!
//! Outgoing frames go through a queue drained by a writer task. Sending only
//! enqueues; [`ClientConnection::flush`] waits until everything queued so far
//! has been written.

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::ToSocketAddrs;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use super::proxy::ObjectProxy;
use super::reply_cache::{Missing, PendingReply, ReplyCache};
use crate::config::ClientSettings;
use crate::error::{RemoteError, RemoteResult};
use crate::event::{DispatchMode, EventCallback, SubscriberList, SubscriptionId};
use crate::limits::{validate_frame_len, MAX_FRAME_BYTES};
use crate::protocol::{Codec, EventNotification, JsonCodec, Message, Reply, Request, RequestId};
use crate::transport::tcp::TcpTransport;
use crate::transport::{FrameSink, FrameSource, Transport};

#[derive(Default)]
struct PendingMap {
    waiters: HashMap<RequestId, oneshot::Sender<Reply>>,
    // set once the transport is gone
    closed: Option<String>,
}

enum Outgoing {
    Frame(Bytes),
    // answered once every earlier frame is written
    Flush(oneshot::Sender<()>),
}

struct Inner {
    outbound: mpsc::UnboundedSender<Outgoing>,
    pending: Mutex<PendingMap>,
    replies: Mutex<ReplyCache>,
    listeners: Mutex<HashMap<(String, String), Arc<SubscriberList>>>,
    codec: Arc<dyn Codec>,
    settings: ClientSettings,
    tasks: Mutex<Vec<AbortHandle>>,
}

/// Client side of one transport connection. Cheap to clone.
#[derive(Clone)]
pub struct ClientConnection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ClientConnection {
    /// Start serving `transport` with the JSON codec.
    pub fn new<T: Transport>(transport: T, settings: ClientSettings) -> Self {
        Self::with_codec(transport, settings, Arc::new(JsonCodec))
    }

    /// Start serving `transport` with a custom codec.
    pub fn with_codec<T: Transport>(transport: T, settings: ClientSettings, codec: Arc<dyn Codec>) -> Self {
        let (sink, source) = transport.split();
        let (outbound, queue) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            outbound,
            pending: Mutex::new(PendingMap::default()),
            replies: Mutex::new(ReplyCache::new(
                settings.reply_cache_capacity,
                settings.reply_cache_ttl(),
            )),
            listeners: Mutex::new(HashMap::new()),
            codec,
            settings,
            tasks: Mutex::new(Vec::new()),
        });

        let writer = tokio::spawn(write_loop(Arc::clone(&inner), sink, queue));
        let reader = tokio::spawn(read_loop(Arc::clone(&inner), source));
        inner
            .tasks
            .lock()
            .extend([writer.abort_handle(), reader.abort_handle()]);
        Self { inner }
    }

    /// Connect over TCP.
    pub async fn connect_tcp(addr: impl ToSocketAddrs, settings: ClientSettings) -> RemoteResult<Self> {
        let transport = TcpTransport::connect(addr).await?;
        Ok(Self::new(transport, settings))
    }

    /// Proxy for one remote thing.
    pub fn proxy(&self, thing_id: impl Into<String>) -> ObjectProxy {
        ObjectProxy::new(self.clone(), thing_id)
    }

    /// Settings this connection was created with.
    pub fn settings(&self) -> &ClientSettings {
        &self.inner.settings
    }

    /// Whether the transport has ended.
    pub fn is_closed(&self) -> bool {
        self.inner.pending.lock().closed.is_some()
    }

    /// Requests still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().waiters.len()
    }

    /// Noblock replies parked and not yet read.
    pub fn cached_reply_count(&self) -> usize {
        self.inner.replies.lock().len()
    }

    /// Stop the connection, failing every outstanding request.
    pub fn close(&self) {
        self.inner.close("connection closed by client");
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn register(&self, id: RequestId) -> RemoteResult<oneshot::Receiver<Reply>> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.inner.pending.lock();
        if let Some(reason) = &pending.closed {
            return Err(RemoteError::Transport(reason.clone()));
        }
        pending.waiters.insert(id, tx);
        Ok(rx)
    }

    fn forget(&self, id: &RequestId) {
        self.inner.pending.lock().waiters.remove(id);
    }

    fn transmit(&self, request: Request) -> RemoteResult<()> {
        let frame = self.inner.codec.encode(&Message::Request(request))?;
        validate_frame_len(frame.len(), MAX_FRAME_BYTES)?;
        self.enqueue(Outgoing::Frame(frame))
    }

    fn enqueue(&self, outgoing: Outgoing) -> RemoteResult<()> {
        self.inner
            .outbound
            .send(outgoing)
            .map_err(|_| RemoteError::Transport("connection writer has stopped".into()))
    }

    /// Wait until every frame queued before this call has been written.
    ///
    /// Fails with `Transport` if the writer stops first.
    pub async fn flush(&self) -> RemoteResult<()> {
        let (done, flushed) = oneshot::channel();
        self.enqueue(Outgoing::Flush(done))?;
        flushed
            .await
            .map_err(|_| RemoteError::Transport("connection closed before queued frames were written".into()))
    }

    /// Send and wait up to `wait` for the reply.
    ///
    /// On timeout the waiter is dropped; a late reply is discarded on arrival.
    pub async fn call(&self, request: Request, wait: Duration) -> RemoteResult<Value> {
        let id = request.id;
        let rx = self.register(id)?;
        if let Err(e) = self.transmit(request) {
            self.forget(&id);
            return Err(e);
        }

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(reply)) => reply.into_result(),
            Ok(Err(_)) => Err(RemoteError::Transport(format!("reply slot for {} was dropped", id))),
            Err(_) => {
                self.forget(&id);
                tracing::debug!("request {} timed out after {} ms", id, wait.as_millis());
                Err(RemoteError::Timeout(format!(
                    "no reply to {} within {} ms",
                    id,
                    wait.as_millis()
                )))
            }
        }
    }

    /// Send without registering a waiter.
    pub fn send_oneway(&self, mut request: Request) -> RemoteResult<()> {
        if let Some(reason) = &self.inner.pending.lock().closed {
            return Err(RemoteError::Transport(reason.clone()));
        }
        request.oneway = true;
        self.transmit(request)
    }

    /// Send and park the reply slot in the reply cache.
    pub fn send_noblock(&self, request: Request) -> RemoteResult<RequestId> {
        let id = request.id;
        let rx = self.register(id)?;
        let dropped = self.inner.replies.lock().insert(id, rx);
        for evicted in &dropped {
            self.forget(evicted);
        }
        if let Err(e) = self.transmit(request) {
            self.forget(&id);
            let _ = self.inner.replies.lock().take(&id);
            return Err(e);
        }
        Ok(id)
    }

    /// Read the reply to a noblock request, waiting up to `timeout`.
    ///
    /// A reply is returned exactly once; reading it again fails with
    /// `NotFound`. A timed-out read leaves the reply readable later. A reply
    /// carrying a server-side error raises that error here.
    pub async fn read_reply(&self, id: RequestId, timeout: Option<Duration>) -> RemoteResult<Value> {
        let taken = self.inner.replies.lock().take(&id);
        let entry = match taken {
            Ok(entry) => entry,
            Err(Missing::Unknown) => {
                return Err(RemoteError::NotFound(format!("no such pending reply {}", id)));
            }
            Err(Missing::Expired) => {
                self.forget(&id);
                return Err(RemoteError::NotFound(format!("reply {} expired before it was read", id)));
            }
        };

        // puts the entry back if this future is dropped or times out
        let mut parked = ParkedRead {
            inner: &self.inner,
            id,
            entry: Some(entry),
        };
        let received = match (parked.entry.as_mut(), timeout) {
            (None, _) => return Err(RemoteError::NotFound(format!("no such pending reply {}", id))),
            (Some(entry), None) => (&mut entry.receiver).await,
            (Some(entry), Some(limit)) => match tokio::time::timeout(limit, &mut entry.receiver).await {
                Ok(received) => received,
                Err(_) => {
                    return Err(RemoteError::Timeout(format!(
                        "reply {} not available within {} ms",
                        id,
                        limit.as_millis()
                    )));
                }
            },
        };
        parked.entry = None;

        match received {
            Ok(reply) => reply.into_result(),
            Err(_) => Err(RemoteError::Transport(format!("reply slot for {} was dropped", id))),
        }
    }

    /// Route notifications for `(thing_id, event)` to `callback`.
    ///
    /// Returns the listener id and whether it is the first for that event.
    pub fn add_listener(
        &self,
        thing_id: &str,
        event: &str,
        callback: EventCallback,
        mode: DispatchMode,
    ) -> (SubscriptionId, bool) {
        let list = {
            let mut listeners = self.inner.listeners.lock();
            Arc::clone(
                listeners
                    .entry((thing_id.to_string(), event.to_string()))
                    .or_insert_with(|| Arc::new(SubscriberList::new(format!("{}/{}", thing_id, event)))),
            )
        };
        let first = list.is_empty();
        (list.subscribe(callback, mode), first)
    }

    /// Remove a listener. Returns how many remain for that event.
    pub fn remove_listener(&self, thing_id: &str, event: &str, id: SubscriptionId) -> usize {
        let mut listeners = self.inner.listeners.lock();
        let key = (thing_id.to_string(), event.to_string());
        let remaining = match listeners.get(&key) {
            Some(list) => {
                list.unsubscribe(id);
                list.len()
            }
            None => 0,
        };
        if remaining == 0 {
            listeners.remove(&key);
        }
        remaining
    }
}

/// A reply slot taken out of the cache while a read waits on it.
struct ParkedRead<'a> {
    inner: &'a Inner,
    id: RequestId,
    entry: Option<PendingReply>,
}

impl Drop for ParkedRead<'_> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.inner.replies.lock().restore(self.id, entry);
        }
    }
}

impl Inner {
    fn close(&self, reason: &str) {
        let waiters: Vec<(RequestId, oneshot::Sender<Reply>)> = {
            let mut pending = self.pending.lock();
            if pending.closed.is_none() {
                pending.closed = Some(reason.to_string());
            }
            pending.waiters.drain().collect()
        };
        if !waiters.is_empty() {
            tracing::warn!("{}: failing {} pending requests", reason, waiters.len());
        }
        for (id, waiter) in waiters {
            let error = RemoteError::Transport(reason.to_string());
            // the caller may have stopped waiting already
            let _ = waiter.send(Reply::from_result(id, Err(error)));
        }
    }

    fn complete(&self, reply: Reply) {
        let waiter = self.pending.lock().waiters.remove(&reply.id);
        match waiter {
            Some(waiter) => {
                if waiter.send(reply).is_err() {
                    tracing::debug!("reply arrived after its caller stopped waiting");
                }
            }
            None => tracing::debug!("discarding reply {} with no pending request", reply.id),
        }
    }

    fn route_event(&self, notification: EventNotification) {
        let list = self
            .listeners
            .lock()
            .get(&(notification.thing_id.clone(), notification.event.clone()))
            .cloned();
        match list {
            Some(list) => {
                list.deliver(&notification.payload);
            }
            None => tracing::trace!(
                "no listener for {}/{}",
                notification.thing_id,
                notification.event
            ),
        }
    }
}

async fn write_loop<S: FrameSink>(inner: Arc<Inner>, mut sink: S, mut queue: mpsc::UnboundedReceiver<Outgoing>) {
    while let Some(outgoing) = queue.recv().await {
        match outgoing {
            Outgoing::Frame(frame) => {
                if let Err(e) = sink.send(frame).await {
                    tracing::warn!("client write failed: {}", e);
                    inner.close(&format!("write failed: {}", e.message()));
                    break;
                }
            }
            Outgoing::Flush(done) => {
                // the caller may have given up waiting
                let _ = done.send(());
            }
        }
    }
}

async fn read_loop<S: FrameSource>(inner: Arc<Inner>, mut source: S) {
    let reason = loop {
        match source.receive().await {
            Ok(Some(frame)) => match inner.codec.decode(&frame) {
                Ok(Message::Reply(reply)) => inner.complete(reply),
                Ok(Message::Event(notification)) => inner.route_event(notification),
                Ok(Message::Request(request)) => {
                    tracing::warn!("ignoring request {} sent by server", request.id);
                }
                Err(e) => tracing::warn!("dropping malformed frame: {}", e),
            },
            Ok(None) => break "connection closed by server".to_string(),
            Err(e) => break format!("connection lost: {}", e.message()),
        }
    };
    tracing::info!("{}", reason);
    inner.close(&reason);
}
