// One lazily opened stream to an endpoint.
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::{BoxedStream, Dial, Result, TransportError};

// Upper bound on sending close_notify to a peer that stopped reading.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Stable connection identifier used for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Opening,
    Open,
}

/// A stream that is opened on demand and closed at most once.
///
/// ```no_run
/// use courier_transport::{Connection, Dial};
///
/// async fn ping<D: Dial>(dialer: &D) -> courier_transport::Result<()> {
///     let mut connection = Connection::new();
///     connection.open(dialer).await?;
///     connection.write(b"ping").await?;
///     let _reply = connection.read(4).await?;
///     connection.close().await;
///     Ok(())
/// }
/// ```
pub struct Connection {
    id: ConnectionId,
    state: ConnectionState,
    stream: Option<BoxedStream>,
}

impl Connection {
    pub fn new() -> Self {
        Self {
            id: ConnectionId::next(),
            state: ConnectionState::Closed,
            stream: None,
        }
    }

    /// Wrap a stream that is already established.
    pub fn from_stream(stream: BoxedStream) -> Self {
        Self {
            id: ConnectionId::next(),
            state: ConnectionState::Open,
            stream: Some(stream),
        }
    }

    /// Dial and open a new connection in one step.
    pub async fn connect<D: Dial>(dialer: &D) -> Result<Self> {
        let mut connection = Self::new();
        connection.open(dialer).await?;
        Ok(connection)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Establish the stream. Opening an open connection does nothing.
    pub async fn open<D: Dial>(&mut self, dialer: &D) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        self.state = ConnectionState::Opening;
        match dialer.dial().await {
            Ok(stream) => {
                self.stream = Some(stream);
                self.state = ConnectionState::Open;
                tracing::debug!(id = %self.id, endpoint = %dialer.endpoint(), "connection opened");
                Ok(())
            }
            Err(err) => {
                self.state = ConnectionState::Closed;
                Err(err)
            }
        }
    }

    /// Read exactly `len` bytes.
    ///
    /// Returns `None` when the peer closed before sending anything and a
    /// shorter buffer when it closed part way through.
    pub async fn read(&mut self, len: usize) -> Result<Option<Bytes>> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        read_up_to(stream, len).await
    }

    /// Write and flush all of `bytes`.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        stream
            .write_all(bytes)
            .await
            .map_err(TransportError::WriteFailed)?;
        stream.flush().await.map_err(TransportError::WriteFailed)
    }

    /// Shut the stream down. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            shutdown(&mut stream, self.id).await;
            tracing::debug!(id = %self.id, "connection closed");
        }
        self.state = ConnectionState::Closed;
    }

    /// Split into independently usable read and write halves.
    pub fn into_split(mut self) -> Result<(ConnectionReader, ConnectionWriter)> {
        let stream = self.stream.take().ok_or(TransportError::NotOpen)?;
        let (read, write) = tokio::io::split(stream);
        Ok((
            ConnectionReader { id: self.id, inner: read },
            ConnectionWriter {
                id: self.id,
                inner: Some(write),
            },
        ))
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish()
    }
}

/// Read half of a split [`Connection`].
pub struct ConnectionReader {
    id: ConnectionId,
    inner: ReadHalf<BoxedStream>,
}

impl ConnectionReader {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Same contract as [`Connection::read`].
    pub async fn read(&mut self, len: usize) -> Result<Option<Bytes>> {
        read_up_to(&mut self.inner, len).await
    }
}

/// Write half of a split [`Connection`].
pub struct ConnectionWriter {
    id: ConnectionId,
    inner: Option<WriteHalf<BoxedStream>>,
}

impl ConnectionWriter {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let inner = self.inner.as_mut().ok_or(TransportError::NotOpen)?;
        inner
            .write_all(bytes)
            .await
            .map_err(TransportError::WriteFailed)?;
        inner.flush().await.map_err(TransportError::WriteFailed)
    }

    /// Close the write side. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        if let Some(mut inner) = self.inner.take() {
            shutdown(&mut inner, self.id).await;
        }
    }
}

async fn shutdown<W: tokio::io::AsyncWrite + Unpin>(stream: &mut W, id: ConnectionId) {
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, stream.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::debug!(%id, error = %err, "shutdown failed"),
        Err(_) => tracing::debug!(%id, "shutdown timed out"),
    }
}

async fn read_up_to<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> Result<Option<Bytes>> {
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            // rustls reports a peer that hangs up without close_notify this way.
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(TransportError::ReadFailed(err)),
        }
    }
    if filled == 0 && len > 0 {
        return Ok(None);
    }
    buf.truncate(filled);
    Ok(Some(Bytes::from(buf)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, duplex};

    #[tokio::test]
    async fn read_returns_exact_length() {
        let (client, mut server) = duplex(64);
        let mut connection = Connection::from_stream(Box::new(client));
        server.write_all(b"abcdefgh").await.expect("write");
        let first = connection.read(6).await.expect("read").expect("bytes");
        assert_eq!(first.as_ref(), b"abcdef");
    }

    #[tokio::test]
    async fn read_signals_end_of_stream() {
        let (client, server) = duplex(64);
        let mut connection = Connection::from_stream(Box::new(client));
        drop(server);
        assert!(connection.read(6).await.expect("read").is_none());
    }

    #[tokio::test]
    async fn read_returns_partial_bytes_before_eof() {
        let (client, mut server) = duplex(64);
        let mut connection = Connection::from_stream(Box::new(client));
        server.write_all(&[8, 8, 0]).await.expect("write");
        drop(server);
        let partial = connection.read(6).await.expect("read").expect("bytes");
        assert_eq!(partial.as_ref(), &[8, 8, 0]);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (client, _server) = duplex(64);
        let mut connection = Connection::from_stream(Box::new(client));
        assert!(connection.is_open());
        connection.close().await;
        connection.close().await;
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(matches!(
            connection.write(b"x").await,
            Err(TransportError::NotOpen)
        ));
    }

    #[tokio::test]
    async fn split_halves_work_concurrently() {
        let (client, server) = duplex(64);
        let connection = Connection::from_stream(Box::new(client));
        let (mut reader, mut writer) = connection.into_split().expect("split");
        assert_eq!(reader.id(), writer.id());

        let echo = tokio::spawn(async move {
            let (mut read, mut write) = tokio::io::split(server);
            let mut buf = [0u8; 4];
            read.read_exact(&mut buf).await.expect("server read");
            write.write_all(&buf).await.expect("server write");
        });

        writer.write(b"ping").await.expect("write");
        let reply = reader.read(4).await.expect("read").expect("bytes");
        assert_eq!(reply.as_ref(), b"ping");
        echo.await.expect("join");

        writer.shutdown().await;
        writer.shutdown().await;
        assert!(matches!(writer.write(b"x").await, Err(TransportError::NotOpen)));
    }

    #[test]
    fn connection_ids_are_unique() {
        let a = Connection::new();
        let b = Connection::new();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.state(), ConnectionState::Closed);
    }
}
