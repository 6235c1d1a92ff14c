//! In-process transport backed by tokio channels.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::{FrameSink, FrameSource, Transport};
use crate::error::{RemoteError, RemoteResult};

/// One end of an in-memory connection.
#[derive(Debug)]
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

/// Writing half of a [`MemoryTransport`].
#[derive(Debug, Clone)]
pub struct MemorySink {
    tx: mpsc::UnboundedSender<Bytes>,
}

/// Reading half of a [`MemoryTransport`].
#[derive(Debug)]
pub struct MemorySource {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

/// Two connected ends: frames sent on one are received on the other.
pub fn pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        MemoryTransport { tx: a_tx, rx: a_rx },
        MemoryTransport { tx: b_tx, rx: b_rx },
    )
}

impl Transport for MemoryTransport {
    type Sink = MemorySink;
    type Source = MemorySource;

    fn split(self) -> (MemorySink, MemorySource) {
        (MemorySink { tx: self.tx }, MemorySource { rx: self.rx })
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Bytes) -> RemoteResult<()> {
        self.tx
            .send(frame)
            .map_err(|_| RemoteError::Transport("peer closed the connection".into()))
    }
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn receive(&mut self) -> RemoteResult<Option<Bytes>> {
        Ok(self.rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_cross_over() {
        let (a, b) = pair();
        let (mut a_sink, _a_source) = a.split();
        let (_b_sink, mut b_source) = b.split();

        a_sink.send(Bytes::from_static(b"one")).await.unwrap();
        a_sink.send(Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(b_source.receive().await.unwrap().unwrap(), Bytes::from_static(b"one"));
        assert_eq!(b_source.receive().await.unwrap().unwrap(), Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn test_closed_peer() {
        let (a, b) = pair();
        let (mut a_sink, _a_source) = a.split();
        let (b_sink, b_source) = b.split();
        drop(b_sink);
        drop(b_source);
        assert!(a_sink.send(Bytes::from_static(b"x")).await.is_err());

        let (a, b) = pair();
        let (_, mut a_source) = a.split();
        drop(b);
        assert!(a_source.receive().await.unwrap().is_none());
    }
}
