use std::fmt;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{namespaced, FlushStats, MetricBuffer, MetricTuple};
use crate::error::{BackendError, Result};
use crate::pool::{ConnectionFactory, EndpointKey, KeyedPool, PoolConfig, TcpConnectionFactory};

/// A stuck collector must not hold the flush path longer than this.
const WRITE_TIMEOUT: Duration = Duration::from_secs(3);

/// Graphite plaintext sender: one `"<name> <value> <ts>\n"` line per metric
/// over a pooled stream connection.
pub struct TextMetricsSender<F: ConnectionFactory = TcpConnectionFactory> {
    key: EndpointKey,
    prefix: String,
    buffer: MetricBuffer,
    pool: KeyedPool<F>,
}

impl TextMetricsSender {
    /// Must be called from within a Tokio runtime: it starts the pool's
    /// eviction sweep.
    pub fn setup(host: &str, port: u16, prefix: &str) -> Result<Self> {
        Self::with_factory(host, port, prefix, TcpConnectionFactory::new(), PoolConfig::default())
    }
}

impl<F> TextMetricsSender<F>
where
    F: ConnectionFactory,
    F::Connection: AsyncWrite + Unpin,
{
    pub fn with_factory(
        host: &str,
        port: u16,
        prefix: &str,
        factory: F,
        config: PoolConfig,
    ) -> Result<Self> {
        if host.trim().is_empty() {
            return Err(BackendError::InvalidConfig("collector host is empty".into()));
        }
        let pool = KeyedPool::new(factory, config);
        pool.start_evictor();
        tracing::info!(host, port, prefix, "text metrics sender ready");
        Ok(Self {
            key: EndpointKey::new(host, port),
            prefix: prefix.to_owned(),
            buffer: MetricBuffer::new(),
            pool,
        })
    }

    pub fn add_metric(&self, timestamp: i64, context: &str, name: &str, value: impl fmt::Display) {
        self.buffer.push(MetricTuple {
            name: namespaced(&self.prefix, context, name),
            timestamp,
            value: value.to_string(),
        });
    }

    /// Ship everything buffered since the previous call.
    ///
    /// The batch is gone once this returns, whether or not it reached the
    /// collector.
    pub async fn write_and_send_metrics(&self) -> FlushStats {
        let batch = self.buffer.drain();
        if batch.is_empty() {
            return FlushStats::default();
        }

        let mut conn = match self.pool.borrow(&self.key).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(
                    host = self.key.host(),
                    port = self.key.port(),
                    error = %e,
                    dropped = batch.len(),
                    "cannot reach collector, dropping metrics"
                );
                return FlushStats {
                    sent: 0,
                    dropped: batch.len(),
                };
            }
        };

        let written = tokio::time::timeout(WRITE_TIMEOUT, write_batch(&mut *conn, &batch)).await;
        let outcome = match written {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
        };

        match outcome {
            Ok(()) => {
                self.pool.return_connection(conn);
                tracing::debug!(count = batch.len(), "flushed metrics");
                FlushStats {
                    sent: batch.len(),
                    dropped: 0,
                }
            }
            Err(e) => {
                tracing::warn!(
                    host = self.key.host(),
                    port = self.key.port(),
                    error = %e,
                    dropped = batch.len(),
                    "write to collector failed, invalidating connection"
                );
                self.pool.invalidate(conn);
                FlushStats {
                    sent: 0,
                    dropped: batch.len(),
                }
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn pool(&self) -> &KeyedPool<F> {
        &self.pool
    }

    pub fn endpoint(&self) -> &EndpointKey {
        &self.key
    }

    pub fn destroy(&self) {
        self.pool.close();
    }
}

async fn write_batch<W>(out: &mut W, batch: &[MetricTuple]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    for metric in batch {
        out.write_all(metric.to_plaintext_line().as_bytes()).await?;
    }
    out.flush().await
}
