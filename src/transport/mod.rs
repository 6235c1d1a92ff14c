//! Transport bindings.
//!
//! A transport is a connection-oriented, order-preserving pipe of opaque
//! frames. It is split into a [`FrameSink`] and a [`FrameSource`] so that one
//! task can write while another reads; the client multiplexes every
//! outstanding request over one such pair and the server pushes event
//! notifications over the same sink as replies.
//!
//! Two bindings are provided:
//!
//! - [`memory`]: in-process channel pair, used by tests and embedded setups.
//! - [`tcp`]: length-prefixed frames over a TCP stream.

pub mod memory;
pub mod tcp;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::RemoteResult;

/// Writing half of a connection.
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Send one frame. Fails with `Transport` once the peer is gone.
    async fn send(&mut self, frame: Bytes) -> RemoteResult<()>;
}

/// Reading half of a connection.
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Next frame, or `None` when the peer closed the connection cleanly.
    async fn receive(&mut self) -> RemoteResult<Option<Bytes>>;
}

/// A full-duplex connection that can be split into its two halves.
pub trait Transport: Send + 'static {
    /// Writing half
    type Sink: FrameSink;
    /// Reading half
    type Source: FrameSource;

    /// Split into independently owned halves.
    fn split(self) -> (Self::Sink, Self::Source);
}
