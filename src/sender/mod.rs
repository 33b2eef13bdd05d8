//! Metric buffering and the collector transports.
//!
//! Both senders share the same contract: [`MetricsSender::add_metric`]
//! appends to an in-memory [`MetricBuffer`] under a short lock, and
//! [`MetricsSender::write_and_send_metrics`] swaps the buffer out and ships
//! it with no lock held. A failed flush drops its batch; nothing is retried.

pub mod datagram;
pub mod text;

use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use serde::Deserialize;

use crate::error::Result;

pub use datagram::DatagramMetricsSender;
pub use text::TextMetricsSender;

/// One fully namespaced metric waiting to be flushed.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricTuple {
    pub name: String,
    pub timestamp: i64,
    pub value: String,
}

impl MetricTuple {
    /// `"<name> <value> <timestamp>\n"`, the Graphite plaintext line.
    pub fn to_plaintext_line(&self) -> String {
        format!("{} {} {}\n", self.name, self.value, self.timestamp)
    }

    /// `"<name>:<value>|g"`, a StatsD gauge.
    pub fn to_gauge_datagram(&self) -> String {
        format!("{}:{}|g", self.name, self.value)
    }
}

/// Outcome of one flush.
///
/// `sent` counts metrics the transport confirmed. `dropped` counts the
/// rest: a stream write that fails part way reports its whole batch as
/// dropped even though leading lines may have reached the collector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub sent: usize,
    pub dropped: usize,
}

impl FlushStats {
    pub fn total(&self) -> usize {
        self.sent + self.dropped
    }
}

/// Append-only buffer drained in one indivisible swap.
#[derive(Debug, Default)]
pub struct MetricBuffer {
    pending: Mutex<Vec<MetricTuple>>,
}

impl MetricBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, metric: MetricTuple) {
        self.pending.lock().push(metric);
    }

    /// Take everything appended so far, leaving an empty buffer behind.
    pub fn drain(&self) -> Vec<MetricTuple> {
        std::mem::take(&mut *self.pending.lock())
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// Replace characters the collector reserves in metric paths:
/// space and backslash become `-`, dot becomes `_`.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            ' ' | '\\' => '-',
            '.' => '_',
            other => other,
        })
        .collect()
}

/// `<prefix><context>.<name>`.
pub(crate) fn namespaced(prefix: &str, context: &str, name: &str) -> String {
    let mut full = String::with_capacity(prefix.len() + context.len() + name.len() + 1);
    full.push_str(prefix);
    full.push_str(context);
    full.push('.');
    full.push_str(name);
    full
}

// ─── Sender registry ─────────────────────────────────────────────

/// The closed set of transports a configuration may select.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum SenderKind {
    /// Graphite plaintext over pooled TCP connections.
    #[default]
    Text,
    /// StatsD-style gauges, one UDP datagram per metric.
    Datagram,
}

impl FromStr for SenderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "plaintext" | "tcp" => Ok(Self::Text),
            "datagram" | "udp" | "statsd" => Ok(Self::Datagram),
            other => Err(format!("unknown metrics sender '{other}'")),
        }
    }
}

impl TryFrom<String> for SenderKind {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for SenderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => f.write_str("text"),
            Self::Datagram => f.write_str("datagram"),
        }
    }
}

/// A configured collector transport.
pub enum MetricsSender {
    Text(TextMetricsSender),
    Datagram(DatagramMetricsSender),
}

impl MetricsSender {
    pub async fn setup(kind: SenderKind, host: &str, port: u16, prefix: &str) -> Result<Self> {
        Ok(match kind {
            SenderKind::Text => Self::Text(TextMetricsSender::setup(host, port, prefix)?),
            SenderKind::Datagram => {
                Self::Datagram(DatagramMetricsSender::setup(host, port, prefix).await?)
            }
        })
    }

    pub fn kind(&self) -> SenderKind {
        match self {
            Self::Text(_) => SenderKind::Text,
            Self::Datagram(_) => SenderKind::Datagram,
        }
    }

    pub fn add_metric(&self, timestamp: i64, context: &str, name: &str, value: impl fmt::Display) {
        match self {
            Self::Text(s) => s.add_metric(timestamp, context, name, value),
            Self::Datagram(s) => s.add_metric(timestamp, context, name, value),
        }
    }

    pub async fn write_and_send_metrics(&self) -> FlushStats {
        match self {
            Self::Text(s) => s.write_and_send_metrics().await,
            Self::Datagram(s) => s.write_and_send_metrics().await,
        }
    }

    pub fn pending(&self) -> usize {
        match self {
            Self::Text(s) => s.pending(),
            Self::Datagram(s) => s.pending(),
        }
    }

    pub fn destroy(&self) {
        match self {
            Self::Text(s) => s.destroy(),
            Self::Datagram(s) => s.destroy(),
        }
    }
}
