//! Finite state machine gating property writes and action invocations.
//!
//! A [`StateMachine`] is the immutable definition shared by every instance of a
//! thing type: the set of states, the initial state, and per-state allow-lists.
//! The current state itself lives with each remote object and only changes
//! through [`StateMachine::transition`].
//!
//! # Gating
//!
//! The states in which an operation may run are the union of
//! - the states its own descriptor declares, and
//! - every state whose allow-list names it.
//!
//! An empty union means the operation is unrestricted. There is no terminal
//! state; self-transitions are allowed and still produce a [`StateChange`].
//!
//! ```text
//! DISCONNECTED --connect--> ON --start_acquisition--> MEASURING
//!      ^                     |  ^                         |
//!      +-----disconnect------+  +----stop_acquisition-----+
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::RemoteError;

/// Name of the implicit event carrying state transitions.
pub const STATE_CHANGE_EVENT: &str = "state_change_event";

/// Name of the read-only pseudo-property exposing the current state.
pub const STATE_PROPERTY: &str = "state";

/// A completed transition, as published on [`STATE_CHANGE_EVENT`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    /// State before the transition
    pub previous: String,
    /// State after the transition
    pub current: String,
}

/// Immutable state machine definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMachine {
    states: Vec<String>,
    initial_state: String,
    allowed: BTreeMap<String, BTreeSet<String>>,
    push_state_change_event: bool,
}

impl StateMachine {
    /// Define a machine over `states` starting in `initial_state`.
    pub fn new<I, S>(states: I, initial_state: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            states: states.into_iter().map(Into::into).collect(),
            initial_state: initial_state.into(),
            allowed: BTreeMap::new(),
            push_state_change_event: false,
        }
    }

    /// Permit the named properties/actions in `state`.
    pub fn allow<I, S>(mut self, state: impl Into<String>, operations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed
            .entry(state.into())
            .or_default()
            .extend(operations.into_iter().map(Into::into));
        self
    }

    /// Publish a [`StateChange`] on every transition.
    pub fn push_state_change_event(mut self, push: bool) -> Self {
        self.push_state_change_event = push;
        self
    }

    /// All declared states, in declaration order.
    pub fn states(&self) -> &[String] {
        &self.states
    }

    /// State every new instance starts in.
    pub fn initial_state(&self) -> &str {
        &self.initial_state
    }

    /// Whether transitions publish [`STATE_CHANGE_EVENT`].
    pub fn pushes_state_change_event(&self) -> bool {
        self.push_state_change_event
    }

    /// Whether `state` is one of the declared states.
    pub fn has_state(&self, state: &str) -> bool {
        self.states.iter().any(|s| s == state)
    }

    /// Operation names mentioned in any allow-list.
    pub fn allow_listed(&self) -> impl Iterator<Item = (&str, &str)> {
        self.allowed.iter().flat_map(|(state, ops)| {
            ops.iter().map(move |op| (state.as_str(), op.as_str()))
        })
    }

    /// Check the definition is self-consistent.
    pub fn validate(&self) -> Result<(), RemoteError> {
        if self.states.is_empty() {
            return Err(RemoteError::Config("state machine has no states".into()));
        }
        let mut seen = BTreeSet::new();
        for state in &self.states {
            if !seen.insert(state.as_str()) {
                return Err(RemoteError::Config(format!("duplicate state '{}'", state)));
            }
        }
        if !self.has_state(&self.initial_state) {
            return Err(RemoteError::Config(format!(
                "initial state '{}' is not a declared state",
                self.initial_state
            )));
        }
        if let Some(unknown) = self.allowed.keys().find(|s| !self.has_state(s)) {
            return Err(RemoteError::Config(format!(
                "allow-list given for undeclared state '{}'",
                unknown
            )));
        }
        Ok(())
    }

    /// States in which `operation` may run; empty means any state.
    pub fn permitted_states(&self, operation: &str, declared: &[String]) -> BTreeSet<String> {
        let mut permitted: BTreeSet<String> = declared.iter().cloned().collect();
        permitted.extend(
            self.allowed
                .iter()
                .filter(|(_, ops)| ops.contains(operation))
                .map(|(state, _)| state.clone()),
        );
        permitted
    }

    /// Whether `operation` (with descriptor-declared `declared` states) may run in `current`.
    pub fn is_allowed(&self, current: &str, operation: &str, declared: &[String]) -> bool {
        let permitted = self.permitted_states(operation, declared);
        permitted.is_empty() || permitted.contains(current)
    }

    /// Gate check returning a `StateError` when the operation is not permitted.
    pub fn check(&self, current: &str, operation: &str, declared: &[String]) -> Result<(), RemoteError> {
        if self.is_allowed(current, operation, declared) {
            Ok(())
        } else {
            let permitted: Vec<String> = self.permitted_states(operation, declared).into_iter().collect();
            Err(RemoteError::State(format!(
                "'{}' is not allowed in state {} (allowed in: {})",
                operation,
                current,
                permitted.join(", ")
            )))
        }
    }

    /// Replace `current` with `new_state`.
    ///
    /// No inter-state guard is applied beyond requiring `new_state` to exist.
    pub fn transition(&self, current: &mut String, new_state: &str) -> Result<StateChange, RemoteError> {
        if !self.has_state(new_state) {
            return Err(RemoteError::State(format!(
                "cannot enter undeclared state '{}'",
                new_state
            )));
        }
        let previous = std::mem::replace(current, new_state.to_string());
        tracing::debug!("state transition {} -> {}", previous, new_state);
        Ok(StateChange {
            previous,
            current: new_state.to_string(),
        })
    }
}
