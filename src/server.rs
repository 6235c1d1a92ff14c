//! Request router hosting things over any [`Transport`].
//!
//! Every connection gets a reader loop and a writer task. Decoded requests
//! are routed to one lane per target thing: a lane runs its requests strictly
//! in arrival order, while lanes for different things run concurrently.
//! Replies and event notifications share the connection's outbound queue.
//!
//! The writer checks every encoded frame against `max_frame_bytes`. An
//! oversized reply is replaced by a `Protocol` error for the same request id
//! and an oversized event is dropped; only a failing sink ends the
//! connection, which also stops the reader.
//!
//! Execution of property and action operations happens on tokio's blocking
//! pool because handlers are synchronous and may talk to hardware. The
//! request's `invocation_timeout` bounds acquisition of the thing's lock and
//! its `execution_timeout` bounds the wait for the handler; a handler that
//! overruns still completes, only its reply becomes a `Timeout`.
//!
//! Oneway requests never produce a reply. Their failures are logged at
//! `error` level and the connection carries on.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ServerSettings;
use crate::error::{RemoteError, RemoteResult};
use crate::event::{DispatchMode, SubscriptionId};
use crate::limits::validate_frame_len;
use crate::protocol::{Codec, EventNotification, JsonCodec, Message, Operation, Reply, Request, RequestId};
use crate::thing::Thing;
use crate::transport::tcp::TcpTransport;
use crate::transport::{FrameSink, FrameSource, Transport};

/// Per-connection state shared by the lanes of that connection.
struct Connection {
    id: u64,
    outbound: mpsc::UnboundedSender<Message>,
    // (thing id, canonical event name) -> subscription on that thing
    subscriptions: Mutex<HashMap<(String, String), SubscriptionId>>,
}

/// Hosts things and routes requests to them.
pub struct Server {
    things: RwLock<HashMap<String, Arc<Thing>>>,
    codec: Arc<dyn Codec>,
    settings: ServerSettings,
    next_connection: AtomicU64,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("things", &self.thing_ids())
            .field("codec", &self.codec.name())
            .field("settings", &self.settings)
            .finish()
    }
}

impl Server {
    /// Server using the JSON codec.
    pub fn new(settings: ServerSettings) -> Arc<Self> {
        Self::with_codec(settings, Arc::new(JsonCodec))
    }

    /// Server using a custom codec.
    pub fn with_codec(settings: ServerSettings, codec: Arc<dyn Codec>) -> Arc<Self> {
        Arc::new(Self {
            things: RwLock::new(HashMap::new()),
            codec,
            settings,
            next_connection: AtomicU64::new(1),
        })
    }

    /// Host a thing. Ids must be unique.
    pub fn register(&self, thing: Arc<Thing>) -> RemoteResult<()> {
        let mut things = self.things.write();
        if things.contains_key(thing.id()) {
            return Err(RemoteError::Config(format!("thing '{}' already registered", thing.id())));
        }
        tracing::info!("registered thing {} ({})", thing.id(), thing.thing_type().name());
        things.insert(thing.id().to_string(), thing);
        Ok(())
    }

    /// Stop hosting a thing.
    pub fn unregister(&self, id: &str) -> Option<Arc<Thing>> {
        self.things.write().remove(id)
    }

    /// Look up a hosted thing.
    pub fn thing(&self, id: &str) -> Option<Arc<Thing>> {
        self.things.read().get(id).cloned()
    }

    /// Ids of all hosted things, sorted.
    pub fn thing_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.things.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Serve one connection until the peer disconnects.
    pub fn serve_connection<T: Transport>(self: &Arc<Self>, transport: T) -> JoinHandle<()> {
        let server = Arc::clone(self);
        tokio::spawn(async move { server.run_connection(transport).await })
    }

    async fn run_connection<T: Transport>(self: Arc<Self>, transport: T) {
        let (sink, mut source) = transport.split();
        let (outbound, queue) = mpsc::unbounded_channel::<Message>();
        let connection = Arc::new(Connection {
            id: self.next_connection.fetch_add(1, Ordering::Relaxed),
            outbound,
            subscriptions: Mutex::new(HashMap::new()),
        });
        tracing::debug!("connection {} opened", connection.id);

        let mut writer = tokio::spawn(write_loop(
            Arc::clone(&self.codec),
            sink,
            queue,
            connection.id,
            self.settings.max_frame_bytes,
        ));
        let mut lanes: HashMap<String, mpsc::UnboundedSender<Request>> = HashMap::new();

        loop {
            let received = tokio::select! {
                received = source.receive() => received,
                _ = &mut writer => {
                    tracing::warn!("connection {}: writer stopped, closing", connection.id);
                    break;
                }
            };
            match received {
                Ok(Some(frame)) => match self.codec.decode(&frame) {
                    Ok(Message::Request(request)) => self.route(&mut lanes, request, &connection),
                    Ok(other) => {
                        tracing::warn!("connection {}: ignoring unexpected {:?}", connection.id, other);
                    }
                    Err(e) => {
                        tracing::warn!("connection {}: dropping malformed frame: {}", connection.id, e);
                    }
                },
                Ok(None) => {
                    tracing::debug!("connection {} closed by peer", connection.id);
                    break;
                }
                Err(e) => {
                    tracing::warn!("connection {} failed: {}", connection.id, e);
                    break;
                }
            }
        }

        drop(lanes);
        self.drop_subscriptions(&connection);
    }

    /// Queue `request` on the lane of its target thing, opening it if needed.
    fn route(
        self: &Arc<Self>,
        lanes: &mut HashMap<String, mpsc::UnboundedSender<Request>>,
        request: Request,
        connection: &Arc<Connection>,
    ) {
        let lane = lanes
            .entry(request.thing_id.clone())
            .or_insert_with(|| self.open_lane(connection));
        if let Err(mpsc::error::SendError(request)) = lane.send(request) {
            tracing::error!(
                "connection {}: lane for {} is gone, dropping request {}",
                connection.id,
                request.thing_id,
                request.id
            );
        }
    }

    fn open_lane(self: &Arc<Self>, connection: &Arc<Connection>) -> mpsc::UnboundedSender<Request> {
        let (lane, mut pending) = mpsc::unbounded_channel::<Request>();
        let server = Arc::clone(self);
        let connection = Arc::clone(connection);
        tokio::spawn(async move {
            while let Some(request) = pending.recv().await {
                Arc::clone(&server).dispatch(request, Arc::clone(&connection)).await;
            }
        });
        lane
    }

    fn drop_subscriptions(&self, connection: &Connection) {
        let subscriptions: Vec<_> = connection.subscriptions.lock().drain().collect();
        for ((thing_id, event), id) in subscriptions {
            if let Some(thing) = self.thing(&thing_id) {
                if let Err(e) = thing.unsubscribe(&event, id) {
                    tracing::debug!("connection {}: {}", connection.id, e);
                }
            }
        }
    }

    async fn dispatch(self: Arc<Self>, request: Request, connection: Arc<Connection>) {
        let id = request.id;
        let oneway = request.oneway;
        tracing::trace!(
            "connection {}: {} {} on {}",
            connection.id,
            request.operation.kind(),
            request.operation.target().unwrap_or(""),
            request.thing_id
        );

        if oneway && request.operation.requires_reply() {
            tracing::warn!(
                "connection {}: dropping oneway {} on {}, it only makes sense with a reply",
                connection.id,
                request.operation.kind(),
                request.thing_id
            );
            return;
        }

        let kind = request.operation.kind();
        let thing_id = request.thing_id.clone();
        let result = self.handle(request, &connection).await;

        if oneway {
            if let Err(e) = result {
                tracing::error!("oneway {} on {} failed: {}", kind, thing_id, e);
            }
            return;
        }

        if connection
            .outbound
            .send(Message::Reply(Reply::from_result(id, result)))
            .is_err()
        {
            tracing::debug!("connection {}: reply {} dropped, connection closed", connection.id, id);
        }
    }

    async fn handle(&self, request: Request, connection: &Arc<Connection>) -> RemoteResult<Value> {
        let thing = self
            .thing(&request.thing_id)
            .ok_or_else(|| RemoteError::NotFound(format!("no thing '{}'", request.thing_id)))?;

        match &request.operation {
            Operation::SubscribeEvent { name } => return self.subscribe(&thing, name, connection),
            Operation::UnsubscribeEvent { name } => return self.unsubscribe(&thing, name, connection),
            Operation::InvokeAction { name, .. } if request.oneway => {
                if let Some(action) = thing.thing_type().action(name) {
                    if !action.is_oneway_eligible() {
                        return Err(RemoteError::Protocol(format!("action '{}' cannot be invoked oneway", name)));
                    }
                }
            }
            _ => {}
        }

        let lock_timeout = request.invocation_timeout();
        let execution_timeout = request.execution_timeout();
        let operation = request.operation;
        let handle = tokio::task::spawn_blocking(move || thing.execute(&operation, lock_timeout));

        let joined = match execution_timeout {
            Some(limit) => tokio::time::timeout(limit, handle).await.map_err(|_| {
                RemoteError::Timeout(format!("execution exceeded {} ms", limit.as_millis()))
            })?,
            None => handle.await,
        };

        joined.map_err(|e| {
            if e.is_panic() {
                RemoteError::Execution("handler panicked".into())
            } else {
                RemoteError::Execution(format!("handler task failed: {}", e))
            }
        })?
    }

    fn subscribe(&self, thing: &Arc<Thing>, name: &str, connection: &Arc<Connection>) -> RemoteResult<Value> {
        let canonical = thing
            .thing_type()
            .event(name)
            .map(|descriptor| descriptor.name.clone())
            .ok_or_else(|| RemoteError::NotFound(format!("{} has no event '{}'", thing.id(), name)))?;

        let key = (thing.id().to_string(), canonical.clone());
        let mut subscriptions = connection.subscriptions.lock();
        if subscriptions.contains_key(&key) {
            return Ok(Value::String(canonical));
        }

        let outbound = connection.outbound.clone();
        let thing_id = thing.id().to_string();
        let event = canonical.clone();
        let (_, id) = thing.subscribe(
            &canonical,
            Arc::new(move |payload: &Value| {
                outbound
                    .send(Message::Event(EventNotification {
                        thing_id: thing_id.clone(),
                        event: event.clone(),
                        payload: payload.clone(),
                    }))
                    .map_err(|_| anyhow::anyhow!("connection closed"))
            }),
            DispatchMode::Inline,
        )?;
        subscriptions.insert(key, id);
        tracing::debug!("connection {} subscribed to {}/{}", connection.id, thing.id(), canonical);
        Ok(Value::String(canonical))
    }

    fn unsubscribe(&self, thing: &Arc<Thing>, name: &str, connection: &Arc<Connection>) -> RemoteResult<Value> {
        let canonical = thing
            .thing_type()
            .event(name)
            .map(|descriptor| descriptor.name.clone())
            .ok_or_else(|| RemoteError::NotFound(format!("{} has no event '{}'", thing.id(), name)))?;

        let removed = connection
            .subscriptions
            .lock()
            .remove(&(thing.id().to_string(), canonical.clone()));
        match removed {
            Some(id) => {
                thing.unsubscribe(&canonical, id)?;
                Ok(Value::Bool(true))
            }
            None => Ok(Value::Bool(false)),
        }
    }

    /// Bind the configured TCP address.
    pub async fn bind(&self) -> RemoteResult<TcpListener> {
        let listener = TcpListener::bind(&self.settings.bind_address).await?;
        tracing::info!("listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept TCP connections until `shutdown` resolves.
    pub async fn listen_until<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> RemoteResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::info!("accepted connection from {}", peer);
                            let transport = TcpTransport::new(stream)
                                .with_max_frame_bytes(self.settings.max_frame_bytes);
                            self.serve_connection(transport);
                        }
                        Err(e) => tracing::warn!("accept failed: {}", e),
                    }
                }
            }
        }
    }

    /// Accept TCP connections forever.
    pub async fn listen(self: Arc<Self>, listener: TcpListener) -> RemoteResult<()> {
        self.listen_until(listener, std::future::pending()).await
    }
}

/// Drain the outbound queue into `sink`. Returns only when the queue closes
/// or the sink fails.
async fn write_loop<S: FrameSink>(
    codec: Arc<dyn Codec>,
    mut sink: S,
    mut queue: mpsc::UnboundedReceiver<Message>,
    connection_id: u64,
    max_frame_bytes: usize,
) {
    while let Some(message) = queue.recv().await {
        let Some(frame) = encode_bounded(codec.as_ref(), message, connection_id, max_frame_bytes) else {
            continue;
        };
        if let Err(e) = sink.send(frame).await {
            tracing::warn!("connection {}: write failed: {}", connection_id, e);
            return;
        }
    }
}

/// Encode `message`, substituting a `Protocol` error reply when a reply does
/// not fit in one frame. `None` means nothing is sent.
fn encode_bounded(
    codec: &dyn Codec,
    message: Message,
    connection_id: u64,
    max_frame_bytes: usize,
) -> Option<Bytes> {
    let frame = match codec.encode(&message) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!("connection {}: failed to encode message: {}", connection_id, e);
            return match message {
                Message::Reply(reply) => encode_replacement(codec, reply.id, e, connection_id, max_frame_bytes),
                _ => None,
            };
        }
    };
    let oversized = match validate_frame_len(frame.len(), max_frame_bytes) {
        Ok(()) => return Some(frame),
        Err(e) => e,
    };
    match message {
        Message::Reply(reply) => {
            tracing::warn!("connection {}: reply {} too large: {}", connection_id, reply.id, oversized);
            encode_replacement(codec, reply.id, oversized, connection_id, max_frame_bytes)
        }
        other => {
            tracing::warn!("connection {}: dropping {} frame: {}", connection_id, kind_of(&other), oversized);
            None
        }
    }
}

fn encode_replacement(
    codec: &dyn Codec,
    id: RequestId,
    error: RemoteError,
    connection_id: u64,
    max_frame_bytes: usize,
) -> Option<Bytes> {
    let error = match error {
        RemoteError::Protocol(_) => error,
        other => RemoteError::Protocol(other.message().to_string()),
    };
    let replacement = Message::Reply(Reply::from_result(id, Err(error)));
    match codec.encode(&replacement) {
        Ok(frame) if validate_frame_len(frame.len(), max_frame_bytes).is_ok() => Some(frame),
        _ => {
            tracing::error!("connection {}: no reply can be sent for {}", connection_id, id);
            None
        }
    }
}

fn kind_of(message: &Message) -> &'static str {
    match message {
        Message::Request(_) => "request",
        Message::Reply(_) => "reply",
        Message::Event(_) => "event",
    }
}
