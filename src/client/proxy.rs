//! Local-looking façade for one remote thing.
//!
//! Every method becomes one correlated request. Three invocation modes are
//! available through [`InvocationMode`]:
//!
//! | Mode | Caller gets | Errors surface |
//! |---|---|---|
//! | `Wait` | the result | at the call |
//! | `Oneway` | nothing | never (logged by the server) |
//! | `Noblock` | a [`RequestId`] | at [`ObjectProxy::read_reply`] |
//!
//! The async methods suspend the calling task instead of a thread, so many
//! calls can be outstanding on one connection. For plain threads use
//! [`BlockingProxy`](super::BlockingProxy).
//!
//! # Example
//!
//! ```rust,ignore
//! let meter = connection.proxy("energy-meter");
//! meter.invoke_action("connect", Value::Null).await?;
//! meter.write_property("wavelength", json!(800.0)).await?;
//! let id = meter.invoke_action_noblock("measure", json!([10])).await?;
//! // ... do something else ...
//! let energies = meter.read_reply(id, Some(Duration::from_secs(2))).await?;
//! ```

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use super::connection::ClientConnection;
use crate::action::mixed_arguments;
use crate::error::{RemoteError, RemoteResult};
use crate::event::{DispatchMode, SubscriptionId};
use crate::protocol::{Operation, Request, RequestId};
use crate::thing::ThingDescription;

/// How a request waits for its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvocationMode {
    /// Wait for the reply (suspending the task in async code).
    #[default]
    Wait,
    /// Ask the server not to reply at all.
    Oneway,
    /// Return the request id immediately; the reply is cached for later.
    Noblock,
}

/// What an invocation produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    /// Reply received
    Completed(Value),
    /// Oneway request sent
    Sent,
    /// Noblock request sent; read the reply with this id
    Pending(RequestId),
}

/// Per-proxy request timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    /// Server lock acquisition budget, also the base client wait
    pub invocation_timeout: Duration,
    /// Server handler budget, added to the client wait when set
    pub execution_timeout: Option<Duration>,
}

impl CallOptions {
    /// How long the client waits for a reply.
    pub fn reply_wait(&self) -> Duration {
        self.invocation_timeout + self.execution_timeout.unwrap_or_default()
    }
}

/// Handle for a local event listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSubscription {
    /// Publishing thing
    pub thing_id: String,
    /// Canonical event name
    pub event: String,
    /// Listener id on this connection
    pub id: SubscriptionId,
}

/// Client-side proxy for one remote thing. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ObjectProxy {
    connection: ClientConnection,
    thing_id: String,
    options: CallOptions,
    allow_foreign_attributes: bool,
    description: Arc<RwLock<Option<Arc<ThingDescription>>>>,
}

impl ObjectProxy {
    /// Proxy using the connection's default settings.
    pub fn new(connection: ClientConnection, thing_id: impl Into<String>) -> Self {
        let settings = connection.settings();
        let options = CallOptions {
            invocation_timeout: settings.invocation_timeout(),
            execution_timeout: settings.execution_timeout(),
        };
        let allow_foreign_attributes = settings.allow_foreign_attributes;
        Self {
            connection,
            thing_id: thing_id.into(),
            options,
            allow_foreign_attributes,
            description: Arc::new(RwLock::new(None)),
        }
    }

    /// Id of the remote thing.
    pub fn thing_id(&self) -> &str {
        &self.thing_id
    }

    /// Current timeouts.
    pub fn options(&self) -> CallOptions {
        self.options
    }

    /// Copy with a different invocation timeout.
    pub fn with_invocation_timeout(mut self, timeout: Duration) -> Self {
        self.options.invocation_timeout = timeout;
        self
    }

    /// Copy with a server-side execution timeout.
    pub fn with_execution_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.options.execution_timeout = timeout;
        self
    }

    /// Copy that sends names missing from the loaded description anyway.
    pub fn with_foreign_attributes(mut self, allow: bool) -> Self {
        self.allow_foreign_attributes = allow;
        self
    }

    /// The underlying connection.
    pub fn connection(&self) -> &ClientConnection {
        &self.connection
    }

    // =========================================================================
    // Description
    // =========================================================================

    /// Fetch and cache the thing's description.
    pub async fn load_description(&self) -> RemoteResult<Arc<ThingDescription>> {
        let value = self.call(Operation::Describe).await?;
        let description: ThingDescription = serde_json::from_value(value)?;
        let description = Arc::new(description);
        *self.description.write() = Some(Arc::clone(&description));
        Ok(description)
    }

    /// The cached description, if loaded.
    pub fn description(&self) -> Option<Arc<ThingDescription>> {
        self.description.read().clone()
    }

    fn precheck(&self, operation: &Operation) -> RemoteResult<()> {
        if self.allow_foreign_attributes {
            return Ok(());
        }
        let Some(description) = self.description() else {
            return Ok(());
        };

        let unknown_property = |name: &str| {
            (!description.has_property(name)).then(|| {
                RemoteError::NotFound(format!("{} has no property '{}'", self.thing_id, name))
            })
        };
        let missing = match operation {
            Operation::ReadProperty { name } | Operation::WriteProperty { name, .. } => unknown_property(name.as_str()),
            Operation::ReadMultiple { names } => names.iter().find_map(|n| unknown_property(n.as_str())),
            Operation::WriteMultiple { values } => values.keys().find_map(|n| unknown_property(n.as_str())),
            Operation::InvokeAction { name, .. } => description
                .action(name)
                .is_none()
                .then(|| RemoteError::NotFound(format!("{} has no action '{}'", self.thing_id, name))),
            Operation::SubscribeEvent { name } | Operation::UnsubscribeEvent { name } => description
                .resolve_event(name)
                .is_none()
                .then(|| RemoteError::NotFound(format!("{} has no event '{}'", self.thing_id, name))),
            Operation::Describe => None,
        };
        missing.map_or(Ok(()), Err)
    }

    // =========================================================================
    // Generic execution
    // =========================================================================

    fn request(&self, operation: Operation) -> Request {
        let mut request = Request::new(self.thing_id.clone(), operation);
        request.invocation_timeout_ms = Some(self.options.invocation_timeout.as_millis() as u64);
        request.execution_timeout_ms = self.options.execution_timeout.map(|d| d.as_millis() as u64);
        request
    }

    /// Send `operation` in the given mode.
    pub async fn execute(&self, operation: Operation, mode: InvocationMode) -> RemoteResult<Invocation> {
        self.precheck(&operation)?;
        if mode == InvocationMode::Oneway && operation.requires_reply() {
            return Err(RemoteError::Protocol(format!(
                "{} cannot be sent oneway",
                operation.kind()
            )));
        }

        let request = self.request(operation);
        match mode {
            InvocationMode::Wait => {
                let value = self.connection.call(request, self.options.reply_wait()).await?;
                Ok(Invocation::Completed(value))
            }
            InvocationMode::Oneway => {
                self.connection.send_oneway(request)?;
                Ok(Invocation::Sent)
            }
            InvocationMode::Noblock => Ok(Invocation::Pending(self.connection.send_noblock(request)?)),
        }
    }

    async fn call(&self, operation: Operation) -> RemoteResult<Value> {
        match self.execute(operation, InvocationMode::Wait).await? {
            Invocation::Completed(value) => Ok(value),
            other => Err(RemoteError::Protocol(format!("unexpected invocation result {:?}", other))),
        }
    }

    async fn oneway(&self, operation: Operation) -> RemoteResult<()> {
        self.execute(operation, InvocationMode::Oneway).await.map(|_| ())
    }

    async fn noblock(&self, operation: Operation) -> RemoteResult<RequestId> {
        match self.execute(operation, InvocationMode::Noblock).await? {
            Invocation::Pending(id) => Ok(id),
            other => Err(RemoteError::Protocol(format!("unexpected invocation result {:?}", other))),
        }
    }

    /// Collect the reply of a noblock request. See [`ClientConnection::read_reply`].
    pub async fn read_reply(&self, id: RequestId, timeout: Option<Duration>) -> RemoteResult<Value> {
        self.connection.read_reply(id, timeout).await
    }

    // =========================================================================
    // Properties
    // =========================================================================

    /// Read one property.
    pub async fn read_property(&self, name: &str) -> RemoteResult<Value> {
        self.call(Operation::ReadProperty { name: name.to_string() }).await
    }

    /// Read one property without waiting.
    pub async fn read_property_noblock(&self, name: &str) -> RemoteResult<RequestId> {
        self.noblock(Operation::ReadProperty { name: name.to_string() }).await
    }

    /// Write one property.
    pub async fn write_property(&self, name: &str, value: Value) -> RemoteResult<()> {
        self.call(Operation::WriteProperty {
            name: name.to_string(),
            value,
        })
        .await
        .map(|_| ())
    }

    /// Write one property without a reply.
    pub async fn write_property_oneway(&self, name: &str, value: Value) -> RemoteResult<()> {
        self.oneway(Operation::WriteProperty {
            name: name.to_string(),
            value,
        })
        .await
    }

    /// Write one property without waiting.
    pub async fn write_property_noblock(&self, name: &str, value: Value) -> RemoteResult<RequestId> {
        self.noblock(Operation::WriteProperty {
            name: name.to_string(),
            value,
        })
        .await
    }

    /// Read several properties as a name → value map.
    pub async fn read_multiple_properties(&self, names: &[&str]) -> RemoteResult<BTreeMap<String, Value>> {
        let value = self
            .call(Operation::ReadMultiple {
                names: names.iter().map(|n| n.to_string()).collect(),
            })
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Write several properties; nothing is applied unless all validate.
    pub async fn write_multiple_properties(&self, values: BTreeMap<String, Value>) -> RemoteResult<()> {
        self.call(Operation::WriteMultiple { values }).await.map(|_| ())
    }

    /// Batch write without a reply.
    pub async fn write_multiple_properties_oneway(&self, values: BTreeMap<String, Value>) -> RemoteResult<()> {
        self.oneway(Operation::WriteMultiple { values }).await
    }

    /// Batch write without waiting.
    pub async fn write_multiple_properties_noblock(&self, values: BTreeMap<String, Value>) -> RemoteResult<RequestId> {
        self.noblock(Operation::WriteMultiple { values }).await
    }

    /// Read a property and deserialize it.
    pub async fn get<T: DeserializeOwned>(&self, name: &str) -> RemoteResult<T> {
        let value = self.read_property(name).await?;
        serde_json::from_value(value)
            .map_err(|e| RemoteError::Validation(format!("{}: unexpected value: {}", name, e)))
    }

    /// Serialize and write a property.
    pub async fn set<T: Serialize>(&self, name: &str, value: T) -> RemoteResult<()> {
        let value = serde_json::to_value(value)
            .map_err(|e| RemoteError::Validation(format!("{}: cannot serialize value: {}", name, e)))?;
        self.write_property(name, value).await
    }

    // =========================================================================
    // Actions
    // =========================================================================

    /// Invoke an action and wait for its result.
    ///
    /// `arguments` may be an object (keyword), an array (positional) or null.
    pub async fn invoke_action(&self, name: &str, arguments: Value) -> RemoteResult<Value> {
        self.call(Operation::InvokeAction {
            name: name.to_string(),
            arguments,
        })
        .await
    }

    /// Invoke an action with positional and keyword arguments together.
    pub async fn invoke_action_with(
        &self,
        name: &str,
        positional: Vec<Value>,
        keyword: Map<String, Value>,
    ) -> RemoteResult<Value> {
        self.invoke_action(name, mixed_arguments(positional, keyword)).await
    }

    /// Invoke an action without a reply.
    pub async fn invoke_action_oneway(&self, name: &str, arguments: Value) -> RemoteResult<()> {
        self.oneway(Operation::InvokeAction {
            name: name.to_string(),
            arguments,
        })
        .await
    }

    /// Invoke an action without waiting.
    pub async fn invoke_action_noblock(&self, name: &str, arguments: Value) -> RemoteResult<RequestId> {
        self.noblock(Operation::InvokeAction {
            name: name.to_string(),
            arguments,
        })
        .await
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Listen to an event by name or alias.
    ///
    /// Inline callbacks run on the connection's reader task and must not make
    /// blocking calls on the same connection.
    pub async fn subscribe_event(
        &self,
        name: &str,
        callback: impl Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
        mode: DispatchMode,
    ) -> RemoteResult<EventSubscription> {
        let canonical = self
            .call(Operation::SubscribeEvent { name: name.to_string() })
            .await?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RemoteError::Protocol("subscribe reply carried no event name".into()))?;

        let (id, _) = self
            .connection
            .add_listener(&self.thing_id, &canonical, Arc::new(callback), mode);
        tracing::debug!("listening to {}/{}", self.thing_id, canonical);
        Ok(EventSubscription {
            thing_id: self.thing_id.clone(),
            event: canonical,
            id,
        })
    }

    /// Stop a listener; the server subscription ends with the last one.
    pub async fn unsubscribe_event(&self, subscription: EventSubscription) -> RemoteResult<()> {
        let remaining = self
            .connection
            .remove_listener(&subscription.thing_id, &subscription.event, subscription.id);
        if remaining == 0 {
            self.call(Operation::UnsubscribeEvent {
                name: subscription.event,
            })
            .await?;
        }
        Ok(())
    }
}
