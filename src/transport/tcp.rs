//! Length-prefixed frames over TCP.
//!
//! Each frame is a 4-byte big-endian payload length followed by the payload.
//! Lengths above the configured maximum are rejected before any allocation.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use super::{FrameSink, FrameSource, Transport};
use crate::error::{RemoteError, RemoteResult};
use crate::limits::{validate_frame_len, FRAME_HEADER_BYTES, MAX_FRAME_BYTES};

/// Reads frames from any byte stream.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    max_frame_bytes: usize,
}

impl<R> FrameReader<R> {
    /// Wrap `inner` with the default frame limit.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }

    /// Override the frame limit.
    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Read one frame; `None` on a clean EOF between frames.
    pub async fn read_frame(&mut self) -> RemoteResult<Option<Bytes>> {
        let mut header = [0u8; FRAME_HEADER_BYTES];
        let mut filled = 0;
        while filled < FRAME_HEADER_BYTES {
            let n = self.inner.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(RemoteError::Transport("connection closed inside frame header".into()));
            }
            filled += n;
        }

        let len = u32::from_be_bytes(header) as usize;
        validate_frame_len(len, self.max_frame_bytes)?;

        let mut payload = BytesMut::zeroed(len);
        self.inner.read_exact(&mut payload).await.map_err(|e| {
            RemoteError::Transport(format!("incomplete frame: expected {} bytes: {}", len, e))
        })?;
        Ok(Some(payload.freeze()))
    }
}

/// Writes frames to any byte stream.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
    max_frame_bytes: usize,
}

impl<W> FrameWriter<W> {
    /// Wrap `inner` with the default frame limit.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }

    /// Override the frame limit.
    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Write one frame and flush.
    pub async fn write_frame(&mut self, payload: &[u8]) -> RemoteResult<()> {
        validate_frame_len(payload.len(), self.max_frame_bytes)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| RemoteError::Protocol(format!("frame of {} bytes too large", payload.len())))?;
        self.inner.write_all(&len.to_be_bytes()).await?;
        self.inner.write_all(payload).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// A TCP connection carrying length-prefixed frames.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    max_frame_bytes: usize,
}

impl TcpTransport {
    /// Wrap an accepted or connected stream.
    pub fn new(stream: TcpStream) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("could not set TCP_NODELAY: {}", e);
        }
        Self {
            stream,
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }

    /// Connect to a server.
    pub async fn connect(addr: impl ToSocketAddrs) -> RemoteResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        if let Ok(peer) = stream.peer_addr() {
            tracing::debug!("connected to {}", peer);
        }
        Ok(Self::new(stream))
    }

    /// Override the frame limit for both directions.
    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }
}

impl Transport for TcpTransport {
    type Sink = FrameWriter<OwnedWriteHalf>;
    type Source = FrameReader<OwnedReadHalf>;

    fn split(self) -> (Self::Sink, Self::Source) {
        let (read, write) = self.stream.into_split();
        (
            FrameWriter::new(write).with_max_frame_bytes(self.max_frame_bytes),
            FrameReader::new(read).with_max_frame_bytes(self.max_frame_bytes),
        )
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> FrameSink for FrameWriter<W> {
    async fn send(&mut self, frame: Bytes) -> RemoteResult<()> {
        self.write_frame(&frame).await
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send + 'static> FrameSource for FrameReader<R> {
    async fn receive(&mut self) -> RemoteResult<Option<Bytes>> {
        self.read_frame().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (client, server) = duplex(1024);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        let write_handle = tokio::spawn(async move {
            writer.write_frame(b"hello").await.unwrap();
            writer.write_frame(b"").await.unwrap();
            writer.write_frame(b"world").await.unwrap();
        });

        assert_eq!(reader.read_frame().await.unwrap().unwrap().as_ref(), b"hello");
        assert_eq!(reader.read_frame().await.unwrap().unwrap().as_ref(), b"");
        assert_eq!(reader.read_frame().await.unwrap().unwrap().as_ref(), b"world");
        write_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_clean_eof_between_frames() {
        let (client, server) = duplex(64);
        let mut reader = FrameReader::new(server);
        drop(client);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_frame() {
        let (mut client, server) = duplex(64);
        let mut reader = FrameReader::new(server);
        client.write_all(&10u32.to_be_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);

        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, RemoteError::Transport(_)));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, server) = duplex(64);
        let mut reader = FrameReader::new(server).with_max_frame_bytes(8);
        client.write_all(&1000u32.to_be_bytes()).await.unwrap();

        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, RemoteError::Protocol(_)));

        let (sink, _source) = duplex(64);
        let mut writer = FrameWriter::new(sink).with_max_frame_bytes(4);
        assert!(writer.write_frame(b"too long").await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_transport() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut sink, mut source) = TcpTransport::new(stream).split();
            let frame = source.receive().await.unwrap().unwrap();
            sink.send(frame).await.unwrap();
        });

        let (mut sink, mut source) = TcpTransport::connect(addr).await.unwrap().split();
        sink.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(source.receive().await.unwrap().unwrap().as_ref(), b"ping");
        server.await.unwrap();
    }
}
