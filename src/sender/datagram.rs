use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::{lookup_host, UdpSocket};

use super::{namespaced, FlushStats, MetricBuffer, MetricTuple};
use crate::error::{BackendError, Result};

/// StatsD-style sender: one `"<name>:<value>|g"` datagram per metric.
///
/// Datagrams are connectionless, so there is no pool; a failed send is
/// logged and skipped.
pub struct DatagramMetricsSender {
    target: SocketAddr,
    prefix: String,
    buffer: MetricBuffer,
    socket: UdpSocket,
}

impl DatagramMetricsSender {
    pub async fn setup(host: &str, port: u16, prefix: &str) -> Result<Self> {
        if host.trim().is_empty() {
            return Err(BackendError::InvalidConfig("collector host is empty".into()));
        }
        let target = lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| BackendError::Resolve {
                host: host.to_owned(),
                port,
            })?;
        let bind_addr: SocketAddr = if target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        tracing::info!(collector = %target, prefix, "datagram metrics sender ready");
        Ok(Self {
            target,
            prefix: prefix.to_owned(),
            buffer: MetricBuffer::new(),
            socket,
        })
    }

    pub fn add_metric(&self, timestamp: i64, context: &str, name: &str, value: impl fmt::Display) {
        self.buffer.push(MetricTuple {
            name: namespaced(&self.prefix, context, name),
            timestamp,
            value: value.to_string(),
        });
    }

    pub async fn write_and_send_metrics(&self) -> FlushStats {
        let batch = self.buffer.drain();
        let mut stats = FlushStats::default();
        for metric in &batch {
            let payload = metric.to_gauge_datagram();
            match self.socket.send_to(payload.as_bytes(), self.target).await {
                Ok(_) => stats.sent += 1,
                Err(e) => {
                    tracing::warn!(collector = %self.target, metric = %metric.name, error = %e, "datagram send failed");
                    stats.dropped += 1;
                }
            }
        }
        if !batch.is_empty() {
            tracing::debug!(sent = stats.sent, dropped = stats.dropped, "flushed datagrams");
        }
        stats
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn destroy(&self) {
        let discarded = self.buffer.drain().len();
        if discarded > 0 {
            tracing::debug!(count = discarded, "discarding unsent datagrams");
        }
    }
}
