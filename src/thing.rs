//! Remote objects ("things") and their type registry.
//!
//! A [`ThingType`] holds the immutable descriptor registry shared by every
//! instance: properties, actions, events, the optional state machine, and the
//! storage cell for `class_member` properties. A [`Thing`] is one instance of
//! a type with its own identity, property values and current state.
//!
//! # Concurrency
//!
//! Each thing owns a single `parking_lot::Mutex` around its mutable state.
//! Every gated operation holds it across the gate check and the handler, so two
//! requests can never both pass the gate for a state one of them is about to
//! leave. Different things never contend with each other. Class-member storage
//! is a second, short-lived lock taken only while the object lock is held.
//!
//! Handlers run synchronously under the lock; the router moves execution onto
//! a blocking thread so device I/O inside a handler does not stall the runtime.

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::action::{ActionDescriptor, ActionInfo};
use crate::error::{ErrorDescriptor, RemoteError, RemoteResult};
use crate::event::{DispatchMode, EventCallback, EventChannel, EventDescriptor, SubscriptionId};
use crate::property::{change_event_name, PropertyDescriptor, PropertyInfo, WriteOrigin};
use crate::protocol::Operation;
use crate::schema::Schema;
use crate::state_machine::{StateMachine, STATE_CHANGE_EVENT, STATE_PROPERTY};

// =============================================================================
// Thing type registry
// =============================================================================

#[derive(Debug, Default)]
struct ClassStorage {
    values: HashMap<String, Value>,
    committed: HashSet<String>,
}

/// Immutable registry of descriptors shared by all instances of a type.
pub struct ThingType {
    name: String,
    doc: Option<String>,
    properties: BTreeMap<String, Arc<PropertyDescriptor>>,
    actions: BTreeMap<String, Arc<ActionDescriptor>>,
    events: BTreeMap<String, Arc<EventDescriptor>>,
    state_machine: Option<StateMachine>,
    class_storage: Mutex<ClassStorage>,
}

impl std::fmt::Debug for ThingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThingType")
            .field("name", &self.name)
            .field("properties", &self.properties.keys().collect::<Vec<_>>())
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .field("events", &self.events.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ThingType {
    /// Start defining a type.
    pub fn builder(name: impl Into<String>) -> ThingTypeBuilder {
        ThingTypeBuilder {
            name: name.into(),
            doc: None,
            properties: Vec::new(),
            actions: Vec::new(),
            events: Vec::new(),
            state_machine: None,
        }
    }

    /// Type name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a property descriptor.
    pub fn property(&self, name: &str) -> Option<&Arc<PropertyDescriptor>> {
        self.properties.get(name)
    }

    /// Look up an action descriptor.
    pub fn action(&self, name: &str) -> Option<&Arc<ActionDescriptor>> {
        self.actions.get(name)
    }

    /// Look up an event by canonical name or alias.
    pub fn event(&self, name_or_alias: &str) -> Option<&Arc<EventDescriptor>> {
        self.events
            .get(name_or_alias)
            .or_else(|| self.events.values().find(|e| e.answers_to(name_or_alias)))
    }

    /// The state machine, if the type has one.
    pub fn state_machine(&self) -> Option<&StateMachine> {
        self.state_machine.as_ref()
    }
}

/// Builder for [`ThingType`].
pub struct ThingTypeBuilder {
    name: String,
    doc: Option<String>,
    properties: Vec<PropertyDescriptor>,
    actions: Vec<ActionDescriptor>,
    events: Vec<EventDescriptor>,
    state_machine: Option<StateMachine>,
}

impl ThingTypeBuilder {
    /// Set description
    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    /// Add a property.
    pub fn property(mut self, property: PropertyDescriptor) -> Self {
        self.properties.push(property);
        self
    }

    /// Add an action.
    pub fn action(mut self, action: ActionDescriptor) -> Self {
        self.actions.push(action);
        self
    }

    /// Add an event.
    pub fn event(mut self, event: EventDescriptor) -> Self {
        self.events.push(event);
        self
    }

    /// Attach a state machine.
    pub fn state_machine(mut self, state_machine: StateMachine) -> Self {
        self.state_machine = Some(state_machine);
        self
    }

    /// Validate the definition and freeze it.
    ///
    /// Implicit events are added here: `<property>_change_event` for every
    /// observable property and `state_change_event` when the state machine
    /// pushes transitions.
    pub fn build(self) -> RemoteResult<Arc<ThingType>> {
        let ThingTypeBuilder {
            name,
            doc,
            properties,
            actions,
            mut events,
            state_machine,
        } = self;

        if let Some(sm) = &state_machine {
            sm.validate()?;
        }

        let mut property_map = BTreeMap::new();
        for property in properties {
            if state_machine.is_some() && property.name() == STATE_PROPERTY {
                return Err(RemoteError::Config(format!(
                    "'{}' is reserved for the current state",
                    STATE_PROPERTY
                )));
            }
            check_declared_states(&name, property.name(), property.states(), state_machine.as_ref())?;
            if property.is_observable() {
                let schema = if property.allows_none() {
                    property.schema().clone().nullable()
                } else {
                    property.schema().clone()
                };
                events.push(
                    EventDescriptor::new(change_event_name(property.name()))
                        .doc(format!("new value of {}", property.name()))
                        .schema(schema),
                );
            }
            let key = property.name().to_string();
            if property_map.insert(key.clone(), Arc::new(property)).is_some() {
                return Err(RemoteError::Config(format!("{}: duplicate property '{}'", name, key)));
            }
        }

        let mut action_map = BTreeMap::new();
        for action in actions {
            if property_map.contains_key(action.name()) {
                return Err(RemoteError::Config(format!(
                    "{}: '{}' is both a property and an action",
                    name,
                    action.name()
                )));
            }
            check_declared_states(&name, action.name(), action.states_declared(), state_machine.as_ref())?;
            let key = action.name().to_string();
            if action_map.insert(key.clone(), Arc::new(action)).is_some() {
                return Err(RemoteError::Config(format!("{}: duplicate action '{}'", name, key)));
            }
        }

        if let Some(sm) = &state_machine {
            for (state, operation) in sm.allow_listed() {
                if !property_map.contains_key(operation) && !action_map.contains_key(operation) {
                    return Err(RemoteError::Config(format!(
                        "{}: state {} allows unknown operation '{}'",
                        name, state, operation
                    )));
                }
            }
            if sm.pushes_state_change_event() {
                events.push(
                    EventDescriptor::new(STATE_CHANGE_EVENT)
                        .doc("state machine transitions")
                        .schema(
                            Schema::object()
                                .field("previous", Schema::string(), true)
                                .field("current", Schema::string(), true),
                        ),
                );
            }
        }

        let mut event_map: BTreeMap<String, Arc<EventDescriptor>> = BTreeMap::new();
        let mut known_names = HashSet::new();
        for event in events {
            let names = std::iter::once(event.name.as_str()).chain(event.alias.as_deref());
            for n in names {
                if !known_names.insert(n.to_string()) {
                    return Err(RemoteError::Config(format!("{}: duplicate event name '{}'", name, n)));
                }
            }
            event_map.insert(event.name.clone(), Arc::new(event));
        }

        tracing::debug!(
            "defined thing type {} ({} properties, {} actions, {} events)",
            name,
            property_map.len(),
            action_map.len(),
            event_map.len()
        );

        Ok(Arc::new(ThingType {
            name,
            doc,
            properties: property_map,
            actions: action_map,
            events: event_map,
            state_machine,
            class_storage: Mutex::new(ClassStorage::default()),
        }))
    }
}

fn check_declared_states(
    type_name: &str,
    operation: &str,
    states: &[String],
    state_machine: Option<&StateMachine>,
) -> RemoteResult<()> {
    if states.is_empty() {
        return Ok(());
    }
    let Some(sm) = state_machine else {
        return Err(RemoteError::Config(format!(
            "{}: '{}' declares states but the type has no state machine",
            type_name, operation
        )));
    };
    match states.iter().find(|s| !sm.has_state(s)) {
        Some(unknown) => Err(RemoteError::Config(format!(
            "{}: '{}' declares unknown state '{}'",
            type_name, operation, unknown
        ))),
        None => Ok(()),
    }
}

// =============================================================================
// Thing
// =============================================================================

/// Mutable per-instance state, guarded by the thing's lock.
#[derive(Debug, Default)]
pub struct ObjectState {
    values: HashMap<String, Value>,
    committed: HashSet<String>,
    current_state: Option<String>,
}

/// A remote object: one instance of a [`ThingType`].
pub struct Thing {
    id: String,
    thing_type: Arc<ThingType>,
    state: Mutex<ObjectState>,
    channels: HashMap<String, EventChannel>,
}

impl std::fmt::Debug for Thing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thing")
            .field("id", &self.id)
            .field("type", &self.thing_type.name)
            .finish()
    }
}

impl Thing {
    /// Create an instance in the type's initial state.
    pub fn new(id: impl Into<String>, thing_type: Arc<ThingType>) -> Arc<Self> {
        let channels = thing_type
            .events
            .values()
            .map(|descriptor| (descriptor.name.clone(), EventChannel::new(descriptor.clone())))
            .collect();
        let state = ObjectState {
            current_state: thing_type
                .state_machine
                .as_ref()
                .map(|sm| sm.initial_state().to_string()),
            ..ObjectState::default()
        };
        let id = id.into();
        tracing::info!("created {} '{}'", thing_type.name, id);
        Arc::new(Self {
            id,
            thing_type,
            state: Mutex::new(state),
            channels,
        })
    }

    /// Instance id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The instance's type.
    pub fn thing_type(&self) -> &Arc<ThingType> {
        &self.thing_type
    }

    /// Current state, if the type has a state machine.
    pub fn current_state(&self) -> Option<String> {
        self.state.lock().current_state.clone()
    }

    fn lock(&self, timeout: Option<Duration>) -> RemoteResult<MutexGuard<'_, ObjectState>> {
        match timeout {
            None => Ok(self.state.lock()),
            Some(timeout) => self.state.try_lock_for(timeout).ok_or_else(|| {
                RemoteError::Timeout(format!(
                    "could not acquire {} within {} ms",
                    self.id,
                    timeout.as_millis()
                ))
            }),
        }
    }

    /// Run `f` with exclusive access to this thing.
    pub fn with_context<R>(&self, f: impl FnOnce(&mut ThingContext<'_>) -> R) -> R {
        let mut guard = self.state.lock();
        let mut ctx = ThingContext {
            thing: self,
            state: &mut *guard,
        };
        f(&mut ctx)
    }

    /// Execute one request operation as a client would.
    ///
    /// `lock_timeout` bounds the wait for the object lock; expiry fails with
    /// `Timeout` before anything runs. Subscriptions are connection-scoped and
    /// are handled by the router, not here.
    pub fn execute(&self, operation: &Operation, lock_timeout: Option<Duration>) -> RemoteResult<Value> {
        match operation {
            Operation::Describe => return Ok(serde_json::to_value(self.describe())?),
            Operation::SubscribeEvent { .. } | Operation::UnsubscribeEvent { .. } => {
                return Err(RemoteError::Protocol(format!(
                    "{} must be routed through a connection",
                    operation.kind()
                )))
            }
            _ => {}
        }

        let mut guard = self.lock(lock_timeout)?;
        let mut ctx = ThingContext {
            thing: self,
            state: &mut *guard,
        };
        match operation {
            Operation::ReadProperty { name } => ctx.property(name),
            Operation::WriteProperty { name, value } => {
                ctx.write_gated(name, value)?;
                Ok(Value::Null)
            }
            Operation::ReadMultiple { names } => ctx.read_multiple(names),
            Operation::WriteMultiple { values } => {
                ctx.write_multiple(values)?;
                Ok(Value::Null)
            }
            Operation::InvokeAction { name, arguments } => ctx.invoke(name, arguments.clone()),
            Operation::Describe | Operation::SubscribeEvent { .. } | Operation::UnsubscribeEvent { .. } => {
                Err(RemoteError::Protocol(format!("unexpected {}", operation.kind())))
            }
        }
    }

    /// Read a property (or the `state` pseudo-property).
    pub fn read_property(&self, name: &str) -> RemoteResult<Value> {
        self.execute(&Operation::ReadProperty { name: name.to_string() }, None)
    }

    /// Client-semantics write: `readonly`, `constant` and the state gate all apply.
    pub fn write_property(&self, name: &str, value: Value) -> RemoteResult<()> {
        self.execute(
            &Operation::WriteProperty {
                name: name.to_string(),
                value,
            },
            None,
        )
        .map(|_| ())
    }

    /// Read several properties into a name → value object.
    pub fn read_multiple(&self, names: &[String]) -> RemoteResult<Value> {
        self.execute(&Operation::ReadMultiple { names: names.to_vec() }, None)
    }

    /// Atomically validated batch write.
    pub fn write_multiple(&self, values: BTreeMap<String, Value>) -> RemoteResult<()> {
        self.execute(&Operation::WriteMultiple { values }, None).map(|_| ())
    }

    /// Invoke an action through the state gate.
    pub fn invoke_action(&self, name: &str, arguments: Value) -> RemoteResult<Value> {
        self.execute(
            &Operation::InvokeAction {
                name: name.to_string(),
                arguments,
            },
            None,
        )
    }

    fn channel(&self, name_or_alias: &str) -> RemoteResult<&EventChannel> {
        self.thing_type
            .event(name_or_alias)
            .and_then(|descriptor| self.channels.get(&descriptor.name))
            .ok_or_else(|| RemoteError::NotFound(format!("{} has no event '{}'", self.id, name_or_alias)))
    }

    /// Subscribe to an event by name or alias. Returns the canonical name.
    pub fn subscribe(
        &self,
        name_or_alias: &str,
        callback: EventCallback,
        mode: DispatchMode,
    ) -> RemoteResult<(String, SubscriptionId)> {
        let channel = self.channel(name_or_alias)?;
        let id = channel.subscribe(callback, mode);
        Ok((channel.name().to_string(), id))
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, name_or_alias: &str, id: SubscriptionId) -> RemoteResult<bool> {
        Ok(self.channel(name_or_alias)?.unsubscribe(id))
    }

    /// Publish on an event without holding the object lock.
    pub fn emit(&self, event: &str, payload: Value) -> RemoteResult<()> {
        self.channel(event)?.publish(payload).map(|_| ())
    }

    /// Number of subscribers on an event.
    pub fn subscriber_count(&self, event: &str) -> RemoteResult<usize> {
        Ok(self.channel(event)?.subscriber_count())
    }

    /// Metadata describing this thing to clients.
    pub fn describe(&self) -> ThingDescription {
        let ty = &self.thing_type;
        ThingDescription {
            id: self.id.clone(),
            type_name: ty.name.clone(),
            doc: ty.doc.clone(),
            properties: ty.properties.values().map(|p| p.info()).collect(),
            actions: ty.actions.values().map(|a| a.info()).collect(),
            events: ty.events.values().map(|e| e.as_ref().clone()).collect(),
            state_machine: ty.state_machine.clone(),
        }
    }
}

// =============================================================================
// ThingContext
// =============================================================================

/// Exclusive view of a thing handed to getters, setters and action handlers.
///
/// Holding a context means holding the object lock. Writes made through the
/// context are server-initiated: they skip the state gate and may change
/// `readonly` properties, but `constant` and validation still apply.
pub struct ThingContext<'a> {
    thing: &'a Thing,
    state: &'a mut ObjectState,
}

impl<'a> ThingContext<'a> {
    /// Id of the thing being operated on.
    pub fn thing_id(&self) -> &str {
        &self.thing.id
    }

    /// Current state, if the type has a state machine.
    pub fn state(&self) -> Option<&str> {
        self.state.current_state.as_deref()
    }

    /// Transition to `new_state`, publishing the change if configured.
    pub fn set_state(&mut self, new_state: &str) -> RemoteResult<()> {
        let Some(sm) = self.thing.thing_type.state_machine.as_ref() else {
            return Err(RemoteError::State(format!("{} has no state machine", self.thing.id)));
        };
        let current = self
            .state
            .current_state
            .get_or_insert_with(|| sm.initial_state().to_string());
        let change = sm.transition(current, new_state)?;
        if sm.pushes_state_change_event() {
            self.emit(STATE_CHANGE_EVENT, serde_json::to_value(change)?)?;
        }
        Ok(())
    }

    /// Read a property (or `state`).
    pub fn property(&self, name: &str) -> RemoteResult<Value> {
        if name == STATE_PROPERTY && self.thing.thing_type.state_machine.is_some() {
            return Ok(self.state.current_state.clone().map_or(Value::Null, Value::String));
        }
        self.descriptor(name)?.get(self)
    }

    /// Server-side write. Skips the gate and `readonly`.
    pub fn write_property(&mut self, name: &str, value: Value) -> RemoteResult<()> {
        let descriptor = self.descriptor(name)?;
        descriptor.set(self, &value, WriteOrigin::Server)
    }

    /// Publish on an event of this thing.
    ///
    /// Inline subscribers run while the object lock is held and must not call
    /// back into the same thing.
    pub fn emit(&self, event: &str, payload: Value) -> RemoteResult<()> {
        self.thing.emit(event, payload)
    }

    fn descriptor(&self, name: &str) -> RemoteResult<Arc<PropertyDescriptor>> {
        if name == STATE_PROPERTY && self.thing.thing_type.state_machine.is_some() {
            return Err(RemoteError::Access(format!(
                "'{}' changes only through state transitions",
                STATE_PROPERTY
            )));
        }
        self.thing
            .thing_type
            .property(name)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("{} has no property '{}'", self.thing.id, name)))
    }

    fn gate(&self, operation: &str, declared: &[String]) -> RemoteResult<()> {
        match (&self.thing.thing_type.state_machine, self.state()) {
            (Some(sm), Some(current)) => sm.check(current, operation, declared),
            _ => Ok(()),
        }
    }

    // lookup, gate and validation for a client write; no side effects
    fn check_write(&self, name: &str, value: &Value) -> RemoteResult<(Arc<PropertyDescriptor>, Value)> {
        let descriptor = self.descriptor(name)?;
        self.gate(name, descriptor.states())?;
        let validated = descriptor.prepare_write(self, value, WriteOrigin::Client)?;
        Ok((descriptor, validated))
    }

    fn write_gated(&mut self, name: &str, value: &Value) -> RemoteResult<()> {
        let (descriptor, validated) = self.check_write(name, value)?;
        descriptor.commit_write(self, validated)
    }

    fn read_multiple(&self, names: &[String]) -> RemoteResult<Value> {
        let mut values = Map::new();
        for name in names {
            values.insert(name.clone(), self.property(name)?);
        }
        Ok(Value::Object(values))
    }

    fn write_multiple(&mut self, values: &BTreeMap<String, Value>) -> RemoteResult<()> {
        let mut prepared = Vec::with_capacity(values.len());
        let mut failures: Vec<(String, RemoteError)> = Vec::new();

        for (name, value) in values {
            match self.check_write(name, value) {
                Ok(entry) => prepared.push(entry),
                Err(e) => failures.push((name.clone(), e)),
            }
        }

        if let Some((_, first)) = failures.first() {
            let details: Vec<String> = failures
                .iter()
                .map(|(name, e)| format!("{}: {}", name, e.message()))
                .collect();
            return Err(RemoteError::from_descriptor(ErrorDescriptor {
                kind: first.kind(),
                message: format!(
                    "{} of {} writes rejected, nothing applied ({})",
                    failures.len(),
                    values.len(),
                    details.join("; ")
                ),
            }));
        }

        for (descriptor, validated) in prepared {
            descriptor.commit_write(self, validated)?;
        }
        Ok(())
    }

    fn invoke(&mut self, name: &str, arguments: Value) -> RemoteResult<Value> {
        let action = self
            .thing
            .thing_type
            .action(name)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("{} has no action '{}'", self.thing.id, name)))?;
        self.gate(name, action.states_declared())?;
        action.invoke(self, arguments)
    }

    pub(crate) fn stored_value(&self, property: &PropertyDescriptor) -> Option<Value> {
        if property.is_class_member() {
            self.thing
                .thing_type
                .class_storage
                .lock()
                .values
                .get(property.name())
                .cloned()
        } else {
            self.state.values.get(property.name()).cloned()
        }
    }

    pub(crate) fn store_value(&mut self, property: &PropertyDescriptor, value: Value) {
        let name = property.name().to_string();
        if property.is_class_member() {
            self.thing.thing_type.class_storage.lock().values.insert(name, value);
        } else {
            self.state.values.insert(name, value);
        }
    }

    pub(crate) fn is_committed(&self, property: &PropertyDescriptor) -> bool {
        if property.is_class_member() {
            self.thing
                .thing_type
                .class_storage
                .lock()
                .committed
                .contains(property.name())
        } else {
            self.state.committed.contains(property.name())
        }
    }

    /// Mark `property` as committed. Returns `false` if it already was.
    ///
    /// Class members check and mark under one hold of the class lock.
    pub(crate) fn claim_committed(&mut self, property: &PropertyDescriptor) -> bool {
        let name = property.name().to_string();
        if property.is_class_member() {
            self.thing.thing_type.class_storage.lock().committed.insert(name)
        } else {
            self.state.committed.insert(name)
        }
    }

    pub(crate) fn release_committed(&mut self, property: &PropertyDescriptor) {
        if property.is_class_member() {
            self.thing
                .thing_type
                .class_storage
                .lock()
                .committed
                .remove(property.name());
        } else {
            self.state.committed.remove(property.name());
        }
    }
}

// =============================================================================
// ThingDescription
// =============================================================================

/// Serializable description of a thing, returned by `Describe`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ThingDescription {
    pub id: String,
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
    pub properties: Vec<PropertyInfo>,
    pub actions: Vec<ActionInfo>,
    pub events: Vec<EventDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_machine: Option<StateMachine>,
}

impl ThingDescription {
    /// Property metadata by name.
    pub fn property(&self, name: &str) -> Option<&PropertyInfo> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Whether `name` is readable (a property or the `state` pseudo-property).
    pub fn has_property(&self, name: &str) -> bool {
        self.property(name).is_some() || (name == STATE_PROPERTY && self.state_machine.is_some())
    }

    /// Action metadata by name.
    pub fn action(&self, name: &str) -> Option<&ActionInfo> {
        self.actions.iter().find(|a| a.name == name)
    }

    /// Canonical event name for a name or alias.
    pub fn resolve_event(&self, name_or_alias: &str) -> Option<&str> {
        self.events
            .iter()
            .find(|e| e.answers_to(name_or_alias))
            .map(|e| e.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::NumericBounds;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn camera_type() -> Arc<ThingType> {
        ThingType::builder("camera")
            .property(
                PropertyDescriptor::builder("exposure_ms")
                    .schema(Schema::number())
                    .bounds(NumericBounds::new(1.0, 1000.0))
                    .default(json!(100.0))
                    .observable()
                    .build()
                    .unwrap(),
            )
            .property(
                PropertyDescriptor::builder("gain")
                    .schema(Schema::integer())
                    .bounds(NumericBounds::new(0.0, 10.0))
                    .default(json!(1))
                    .build()
                    .unwrap(),
            )
            .property(
                PropertyDescriptor::builder("model")
                    .schema(Schema::string())
                    .default(json!("sim-1"))
                    .readonly()
                    .build()
                    .unwrap(),
            )
            .property(
                PropertyDescriptor::builder("serial")
                    .schema(Schema::string())
                    .allow_none()
                    .constant()
                    .build()
                    .unwrap(),
            )
            .property(
                PropertyDescriptor::builder("site")
                    .schema(Schema::string())
                    .default(json!("lab"))
                    .class_member()
                    .build()
                    .unwrap(),
            )
            .action(ActionDescriptor::new("configure", |ctx, _| {
                ctx.write_property("exposure_ms", json!(7.0))?;
                ctx.write_property("gain", json!(99))?;
                Ok(Value::Null)
            }))
            .action(ActionDescriptor::new("open", |ctx, _| {
                ctx.set_state("ON")?;
                Ok(Value::Null)
            }))
            .action(
                ActionDescriptor::new("close", |ctx, _| {
                    ctx.set_state("OFF")?;
                    Ok(Value::Null)
                })
                .states(["ON"]),
            )
            .state_machine(
                StateMachine::new(["OFF", "ON"], "OFF")
                    .allow("OFF", ["open"])
                    .allow("ON", ["gain"])
                    .push_state_change_event(true),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_defaults_and_state_pseudo_property() {
        let cam = Thing::new("cam", camera_type());
        assert_eq!(cam.read_property("exposure_ms").unwrap(), json!(100.0));
        assert_eq!(cam.read_property("state").unwrap(), json!("OFF"));
        let err = cam.write_property("state", json!("ON")).unwrap_err();
        assert!(matches!(err, RemoteError::Access(_)));
    }

    #[test]
    fn test_rejected_write_leaves_value() {
        let cam = Thing::new("cam", camera_type());
        let err = cam.write_property("exposure_ms", json!(5000.0)).unwrap_err();
        assert!(matches!(err, RemoteError::Validation(_)));
        assert_eq!(cam.read_property("exposure_ms").unwrap(), json!(100.0));
    }

    #[test]
    fn test_readonly_and_constant() {
        let cam = Thing::new("cam", camera_type());
        assert!(matches!(
            cam.write_property("model", json!("x")).unwrap_err(),
            RemoteError::Access(_)
        ));
        assert_eq!(cam.read_property("model").unwrap(), json!("sim-1"));

        // server-side code may still change it
        cam.with_context(|ctx| ctx.write_property("model", json!("sim-2"))).unwrap();
        assert_eq!(cam.read_property("model").unwrap(), json!("sim-2"));

        assert_eq!(cam.read_property("serial").unwrap(), Value::Null);
        cam.write_property("serial", json!("A-1")).unwrap();
        assert!(matches!(
            cam.write_property("serial", json!("B-2")).unwrap_err(),
            RemoteError::Access(_)
        ));
        assert_eq!(cam.read_property("serial").unwrap(), json!("A-1"));
    }

    #[test]
    fn test_state_gating_and_transition_event() {
        let cam = Thing::new("cam", camera_type());
        let transitions = Arc::new(AtomicUsize::new(0));
        let counter = transitions.clone();
        cam.subscribe(
            STATE_CHANGE_EVENT,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            DispatchMode::Inline,
        )
        .unwrap();

        assert!(matches!(
            cam.write_property("gain", json!(3)).unwrap_err(),
            RemoteError::State(_)
        ));
        assert!(matches!(
            cam.invoke_action("close", Value::Null).unwrap_err(),
            RemoteError::State(_)
        ));

        cam.invoke_action("open", Value::Null).unwrap();
        assert_eq!(cam.current_state().as_deref(), Some("ON"));
        cam.write_property("gain", json!(3)).unwrap();
        assert!(matches!(
            cam.invoke_action("open", Value::Null).unwrap_err(),
            RemoteError::State(_)
        ));
        cam.invoke_action("close", Value::Null).unwrap();
        assert_eq!(transitions.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_batch_write_is_atomic() {
        let cam = Thing::new("cam", camera_type());
        let mut values = BTreeMap::new();
        values.insert("exposure_ms".to_string(), json!(250.0));
        values.insert("serial".to_string(), json!(42));

        let err = cam.write_multiple(values).unwrap_err();
        assert!(matches!(err, RemoteError::Validation(_)));
        assert!(err.message().contains("serial"));
        assert_eq!(cam.read_property("exposure_ms").unwrap(), json!(100.0));
        assert_eq!(cam.read_property("serial").unwrap(), Value::Null);
    }

    #[test]
    fn test_read_multiple() {
        let cam = Thing::new("cam", camera_type());
        let values = cam
            .read_multiple(&["exposure_ms".to_string(), "state".to_string()])
            .unwrap();
        assert_eq!(values, json!({"exposure_ms": 100.0, "state": "OFF"}));
        assert!(matches!(
            cam.read_multiple(&["nope".to_string()]).unwrap_err(),
            RemoteError::NotFound(_)
        ));
    }

    #[test]
    fn test_class_member_shared_between_instances() {
        let ty = camera_type();
        let a = Thing::new("a", ty.clone());
        let b = Thing::new("b", ty);
        a.write_property("site", json!("cleanroom")).unwrap();
        assert_eq!(b.read_property("site").unwrap(), json!("cleanroom"));
        // instance properties are not shared
        a.write_property("exposure_ms", json!(10.0)).unwrap();
        assert_eq!(b.read_property("exposure_ms").unwrap(), json!(100.0));
    }

    #[test]
    fn test_observable_publishes_change_event() {
        let cam = Thing::new("cam", camera_type());
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        cam.subscribe(
            "exposure_ms_change_event",
            Arc::new(move |v| {
                sink.lock().push(v.clone());
                Ok(())
            }),
            DispatchMode::Inline,
        )
        .unwrap();
        cam.write_property("exposure_ms", json!(20.0)).unwrap();
        assert_eq!(seen.lock().as_slice(), &[json!(20.0)]);
    }

    #[test]
    fn test_lock_timeout() {
        let cam = Thing::new("cam", camera_type());
        let _guard = cam.state.lock();
        let err = cam
            .execute(
                &Operation::ReadProperty {
                    name: "gain".into(),
                },
                Some(Duration::from_millis(20)),
            )
            .unwrap_err();
        assert!(matches!(err, RemoteError::Timeout(_)));
    }

    #[test]
    fn test_constant_class_member_written_once_across_instances() {
        let applied = Arc::new(AtomicUsize::new(0));
        let counter = applied.clone();
        let ty = ThingType::builder("calibrated")
            .property(
                PropertyDescriptor::builder("calibration")
                    .schema(Schema::string())
                    .allow_none()
                    .constant()
                    .class_member()
                    .setter(move |_, _| {
                        std::thread::sleep(Duration::from_millis(200));
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        let a = Thing::new("a", ty.clone());
        let b = Thing::new("b", ty);

        let first = std::thread::spawn(move || a.write_property("calibration", json!("a")));
        let second = std::thread::spawn(move || b.write_property("calibration", json!("b")));
        let results = [first.join().unwrap(), second.join().unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(RemoteError::Access(_)))));
        assert_eq!(applied.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_setter_leaves_constant_unset() {
        let ty = ThingType::builder("flaky")
            .property(
                PropertyDescriptor::builder("serial")
                    .schema(Schema::string())
                    .allow_none()
                    .constant()
                    .setter(|_, value| {
                        if value == json!("bad") {
                            anyhow::bail!("head rejected serial");
                        }
                        Ok(())
                    })
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        let thing = Thing::new("flaky", ty);
        let err = thing.write_property("serial", json!("bad")).unwrap_err();
        assert!(matches!(err, RemoteError::Execution(_)));
        thing.write_property("serial", json!("good")).unwrap();
        assert!(matches!(
            thing.write_property("serial", json!("again")).unwrap_err(),
            RemoteError::Access(_)
        ));
    }

    #[test]
    fn test_errors_inside_handler_are_execution_errors() {
        let cam = Thing::new("cam", camera_type());
        let err = cam.invoke_action("configure", Value::Null).unwrap_err();
        // the handler already changed exposure_ms, so this is not a validation fault
        assert!(matches!(err, RemoteError::Execution(_)));
        assert!(err.message().contains("out of bounds"), "{}", err);
        assert_eq!(cam.read_property("exposure_ms").unwrap(), json!(7.0));
        assert_eq!(cam.read_property("gain").unwrap(), json!(1));
    }

    #[test]
    fn test_type_validation() {
        let bad = ThingType::builder("bad")
            .state_machine(StateMachine::new(["A"], "A").allow("A", ["missing"]))
            .build();
        assert!(bad.is_err());

        let no_sm = ThingType::builder("bad")
            .action(ActionDescriptor::new("x", |_, _| Ok(Value::Null)).states(["A"]))
            .build();
        assert!(no_sm.is_err());
    }

    #[test]
    fn test_description_lists_implicit_events() {
        let cam = Thing::new("cam", camera_type());
        let description = cam.describe();
        assert!(description.has_property("state"));
        assert!(description.resolve_event("exposure_ms_change_event").is_some());
        assert!(description.resolve_event(STATE_CHANGE_EVENT).is_some());
        assert!(description.action("close").is_some());
    }
}
