//! Network-addressable remote objects for laboratory instruments.
//!
//! A *thing* exposes typed properties, invocable actions and events, with a
//! finite state machine deciding which writes and actions are reachable. The
//! [`server::Server`] hosts things over any [`transport::Transport`]; the
//! [`client::ObjectProxy`] turns property and action access into correlated
//! requests with wait, oneway and noblock invocation modes.
//!
//! Layers, leaves first:
//!
//! - [`schema`]: value validation and bounds cropping
//! - [`property`], [`action`], [`event`], [`state_machine`]: descriptors
//! - [`thing`]: the remote object and its per-object lock
//! - [`protocol`], [`transport`]: wire messages and connections
//! - [`server`], [`client`]: request routing and the client proxy

pub mod action;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod limits;
pub mod logging;
pub mod property;
pub mod protocol;
pub mod schema;
pub mod server;
pub mod simulated;
pub mod state_machine;
pub mod thing;
pub mod transport;

pub use error::{RemoteError, RemoteResult};
