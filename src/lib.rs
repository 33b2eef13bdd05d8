//! Backend metrics reporting for load tests.
//!
//! Sampling threads feed completed samples into a [`MetricsCollector`];
//! a [`BackendListener`] drains it once per interval and pushes the
//! aggregates to a Graphite (plaintext over pooled TCP) or StatsD
//! (UDP gauges) collector. Reporting is best effort: a failed flush drops
//! that interval's metrics and never blocks sample ingestion.

pub mod config;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod scheduler;
pub mod sender;

pub use config::BackendConfig;
pub use error::{BackendError, PoolError, Result};
pub use metrics::{MetricsCollector, SampleResult, SamplerMetric, ThreadTracker};
pub use pool::{EndpointKey, KeyedPool, PoolConfig};
pub use scheduler::{BackendListener, ListenerState};
pub use sender::{sanitize, FlushStats, MetricsSender, SenderKind};
