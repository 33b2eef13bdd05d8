use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, BufWriter};
use tokio::net::TcpStream;

use super::EndpointKey;

/// Upper bound on a single connect attempt to the collector.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Write buffer in front of each collector socket.
const WRITE_BUFFER: usize = 8 * 1024;

/// Creates, validates and destroys the connections held by a
/// [`KeyedPool`](super::KeyedPool).
///
/// `validate` is called with the pool lock held, so it must not block:
/// implementations should only inspect state that is already available.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn create(&self, key: &EndpointKey) -> io::Result<Self::Connection>;

    fn validate(&self, key: &EndpointKey, conn: &Self::Connection) -> bool;

    fn destroy(&self, _key: &EndpointKey, conn: Self::Connection) {
        drop(conn);
    }
}

/// Buffered TCP stream to a line-oriented collector.
pub struct CollectorStream {
    writer: BufWriter<TcpStream>,
}

impl CollectorStream {
    fn new(stream: TcpStream) -> Self {
        Self {
            writer: BufWriter::with_capacity(WRITE_BUFFER, stream),
        }
    }

    /// Liveness check that never waits: a socket error, or EOF from a
    /// collector that hung up, marks the stream as dead.
    fn is_alive(&self) -> bool {
        let stream = self.writer.get_ref();
        match stream.take_error() {
            Ok(None) => {}
            Ok(Some(_)) | Err(_) => return false,
        }
        let mut peek = [0u8; 64];
        match stream.try_read(&mut peek) {
            Ok(0) => false,
            // Collectors don't talk back; whatever they sent is discarded.
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }
}

impl AsyncWrite for CollectorStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

/// Opens plain TCP connections to the collector.
#[derive(Debug, Clone)]
pub struct TcpConnectionFactory {
    connect_timeout: Duration,
}

impl TcpConnectionFactory {
    pub fn new() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpConnectionFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionFactory for TcpConnectionFactory {
    type Connection = CollectorStream;

    async fn create(&self, key: &EndpointKey) -> io::Result<CollectorStream> {
        let connect = TcpStream::connect((key.host(), key.port()));
        let stream = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        tracing::debug!(host = key.host(), port = key.port(), "opened collector connection");
        Ok(CollectorStream::new(stream))
    }

    fn validate(&self, _key: &EndpointKey, conn: &CollectorStream) -> bool {
        conn.is_alive()
    }

    fn destroy(&self, key: &EndpointKey, conn: CollectorStream) {
        tracing::debug!(host = key.host(), port = key.port(), "closing collector connection");
        drop(conn);
    }
}
