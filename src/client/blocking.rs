//! Thread-blocking wrapper around [`ObjectProxy`].
//!
//! Each call parks the calling thread on the runtime handle until the reply
//! arrives or the invocation timeout elapses. Use it from plain threads or
//! `spawn_blocking` closures; calling it from inside an async task panics.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::runtime::Handle;

use super::proxy::{EventSubscription, ObjectProxy};
use crate::error::RemoteResult;
use crate::event::DispatchMode;
use crate::protocol::RequestId;

/// Synchronous proxy for one remote thing.
#[derive(Debug, Clone)]
pub struct BlockingProxy {
    proxy: ObjectProxy,
    handle: Handle,
}

impl BlockingProxy {
    /// Wrap `proxy`, driving its futures on `handle`.
    pub fn new(proxy: ObjectProxy, handle: Handle) -> Self {
        Self { proxy, handle }
    }

    /// The wrapped async proxy.
    pub fn inner(&self) -> &ObjectProxy {
        &self.proxy
    }

    /// Read one property.
    pub fn read_property(&self, name: &str) -> RemoteResult<Value> {
        self.handle.block_on(self.proxy.read_property(name))
    }

    /// Write one property.
    pub fn write_property(&self, name: &str, value: Value) -> RemoteResult<()> {
        self.handle.block_on(self.proxy.write_property(name, value))
    }

    /// Write one property without a reply.
    pub fn write_property_oneway(&self, name: &str, value: Value) -> RemoteResult<()> {
        self.handle.block_on(self.proxy.write_property_oneway(name, value))
    }

    /// Read several properties.
    pub fn read_multiple_properties(&self, names: &[&str]) -> RemoteResult<BTreeMap<String, Value>> {
        self.handle.block_on(self.proxy.read_multiple_properties(names))
    }

    /// Write several properties atomically.
    pub fn write_multiple_properties(&self, values: BTreeMap<String, Value>) -> RemoteResult<()> {
        self.handle.block_on(self.proxy.write_multiple_properties(values))
    }

    /// Read and deserialize a property.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> RemoteResult<T> {
        self.handle.block_on(self.proxy.get(name))
    }

    /// Serialize and write a property.
    pub fn set<T: Serialize>(&self, name: &str, value: T) -> RemoteResult<()> {
        self.handle.block_on(self.proxy.set(name, value))
    }

    /// Invoke an action and wait for the result.
    pub fn invoke_action(&self, name: &str, arguments: Value) -> RemoteResult<Value> {
        self.handle.block_on(self.proxy.invoke_action(name, arguments))
    }

    /// Invoke an action with positional and keyword arguments together.
    pub fn invoke_action_with(
        &self,
        name: &str,
        positional: Vec<Value>,
        keyword: Map<String, Value>,
    ) -> RemoteResult<Value> {
        self.handle
            .block_on(self.proxy.invoke_action_with(name, positional, keyword))
    }

    /// Invoke an action without a reply.
    pub fn invoke_action_oneway(&self, name: &str, arguments: Value) -> RemoteResult<()> {
        self.handle.block_on(self.proxy.invoke_action_oneway(name, arguments))
    }

    /// Invoke an action and return its request id immediately.
    pub fn invoke_action_noblock(&self, name: &str, arguments: Value) -> RemoteResult<RequestId> {
        self.handle.block_on(self.proxy.invoke_action_noblock(name, arguments))
    }

    /// Collect a noblock reply.
    pub fn read_reply(&self, id: RequestId, timeout: Option<Duration>) -> RemoteResult<Value> {
        self.handle.block_on(self.proxy.read_reply(id, timeout))
    }

    /// Listen to an event.
    pub fn subscribe_event(
        &self,
        name: &str,
        callback: impl Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
        mode: DispatchMode,
    ) -> RemoteResult<EventSubscription> {
        self.handle.block_on(self.proxy.subscribe_event(name, callback, mode))
    }

    /// Stop listening.
    pub fn unsubscribe_event(&self, subscription: EventSubscription) -> RemoteResult<()> {
        self.handle.block_on(self.proxy.unsubscribe_event(subscription))
    }
}
