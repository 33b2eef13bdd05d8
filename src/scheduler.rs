//! Periodic reporting: every tick drains the collector into the sender and
//! flushes it to the collector service.
//!
//! Lifecycle: `Idle` → `setup()` → `Armed` → first tick → `Ticking` →
//! `teardown()` → `Stopped`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;

use crate::config::BackendConfig;
use crate::error::{BackendError, Result};
use crate::metrics::{
    ContextReport, MetricsCollector, PercentileSpec, ResponseTimes, SampleResult, ThreadStats,
    ThreadTracker, CUMULATED_CONTEXT,
};
use crate::sender::{sanitize, FlushStats, MetricsSender};

/// Default bound on waiting for an in-flight tick during teardown.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(30);

// Per-context metric names
const METRIC_SUCCESS: &str = "success";
const METRIC_FAILURE: &str = "failure";
const METRIC_TOTAL: &str = "total";
const METRIC_MIN: &str = "min";
const METRIC_MAX: &str = "max";
const METRIC_AVG: &str = "avg";
const METRIC_PERCENTILE: &str = "percentile";
const OK_PREFIX: &str = "ok.";
const KO_PREFIX: &str = "ko.";

// Thread metrics, reported under the cumulated context
const METRIC_MIN_ACTIVE_THREADS: &str = "minAT";
const METRIC_MAX_ACTIVE_THREADS: &str = "maxAT";
const METRIC_MEAN_ACTIVE_THREADS: &str = "meanAT";
const METRIC_STARTED_THREADS: &str = "startedT";
const METRIC_FINISHED_THREADS: &str = "endedT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Armed,
    Ticking,
    Stopped,
}

// ─── Reporter ────────────────────────────────────────────────────

/// Turns one interval of aggregates into metric tuples and flushes them.
struct Reporter {
    sender: MetricsSender,
    collector: Arc<MetricsCollector>,
    threads: Arc<ThreadTracker>,
    percentiles: Vec<PercentileSpec>,
}

impl Reporter {
    async fn send_metrics(&self) -> FlushStats {
        let timestamp = chrono::Utc::now().timestamp();
        let report = self.collector.drain_interval(&self.percentiles, &self.threads);

        self.add_context(timestamp, CUMULATED_CONTEXT, &report.cumulated);
        for sampler in &report.samplers {
            self.add_context(timestamp, &sanitize(&sampler.label), sampler);
        }
        self.add_threads(timestamp, &report.threads);

        self.sender.write_and_send_metrics().await
    }

    /// Counts always go out; response times only when the interval saw samples.
    fn add_context(&self, timestamp: i64, context: &str, report: &ContextReport) {
        self.sender.add_metric(timestamp, context, METRIC_SUCCESS, report.successes);
        self.sender.add_metric(timestamp, context, METRIC_FAILURE, report.failures);
        self.sender.add_metric(timestamp, context, METRIC_TOTAL, report.total);
        if report.total == 0 {
            return;
        }
        self.add_times(timestamp, context, "", &report.all);
        if report.successes > 0 {
            self.add_times(timestamp, context, OK_PREFIX, &report.ok);
        }
        if report.failures > 0 {
            self.add_times(timestamp, context, KO_PREFIX, &report.ko);
        }
    }

    fn add_times(&self, timestamp: i64, context: &str, prefix: &str, times: &ResponseTimes) {
        let sender = &self.sender;
        sender.add_metric(timestamp, context, &format!("{prefix}{METRIC_MIN}"), times.min);
        sender.add_metric(timestamp, context, &format!("{prefix}{METRIC_MAX}"), times.max);
        sender.add_metric(
            timestamp,
            context,
            &format!("{prefix}{METRIC_AVG}"),
            (times.mean * 100.0).round() / 100.0,
        );
        for (suffix, value) in &times.percentiles {
            sender.add_metric(
                timestamp,
                context,
                &format!("{prefix}{METRIC_PERCENTILE}{suffix}"),
                value,
            );
        }
    }

    fn add_threads(&self, timestamp: i64, stats: &ThreadStats) {
        let sender = &self.sender;
        sender.add_metric(timestamp, CUMULATED_CONTEXT, METRIC_MIN_ACTIVE_THREADS, stats.min_active);
        sender.add_metric(timestamp, CUMULATED_CONTEXT, METRIC_MAX_ACTIVE_THREADS, stats.max_active);
        sender.add_metric(timestamp, CUMULATED_CONTEXT, METRIC_MEAN_ACTIVE_THREADS, stats.mean_active);
        sender.add_metric(timestamp, CUMULATED_CONTEXT, METRIC_STARTED_THREADS, stats.started);
        sender.add_metric(timestamp, CUMULATED_CONTEXT, METRIC_FINISHED_THREADS, stats.finished);
    }
}

// ─── BackendListener ─────────────────────────────────────────────

struct Running {
    reporter: Arc<Reporter>,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    ticks: Arc<AtomicU64>,
}

/// Owns the collector, the sender and the single timer task.
pub struct BackendListener {
    config: BackendConfig,
    collector: Arc<MetricsCollector>,
    threads: Arc<ThreadTracker>,
    running: Option<Running>,
    stopped: bool,
    teardown_timeout: Duration,
}

impl BackendListener {
    pub fn new(config: BackendConfig, threads: Arc<ThreadTracker>) -> Result<Self> {
        config.validate()?;
        let collector = Arc::new(MetricsCollector::new(config.sampler_filter()?));
        Ok(Self {
            config,
            collector,
            threads,
            running: None,
            stopped: false,
            teardown_timeout: TEARDOWN_TIMEOUT,
        })
    }

    /// How long teardown waits for an in-flight tick before aborting it.
    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = timeout;
        self
    }

    /// Handle for sampling threads.
    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    pub fn handle_sample_results(&self, results: &[SampleResult]) {
        self.collector.record_all(results);
    }

    pub fn state(&self) -> ListenerState {
        match &self.running {
            _ if self.stopped => ListenerState::Stopped,
            None => ListenerState::Idle,
            Some(running) if running.ticks.load(Ordering::Acquire) == 0 => ListenerState::Armed,
            Some(_) => ListenerState::Ticking,
        }
    }

    /// Number of completed timer ticks.
    pub fn ticks(&self) -> u64 {
        self.running
            .as_ref()
            .map_or(0, |running| running.ticks.load(Ordering::Acquire))
    }

    /// Open the sender and arm the timer. The first tick fires one interval
    /// from now.
    pub async fn setup(&mut self) -> Result<()> {
        if self.state() != ListenerState::Idle {
            return Err(BackendError::InvalidState(format!(
                "setup called in state {:?}",
                self.state()
            )));
        }

        let sender = MetricsSender::setup(
            self.config.sender,
            &self.config.host,
            self.config.port,
            &self.config.root_metrics_prefix,
        )
        .await?;

        let reporter = Arc::new(Reporter {
            sender,
            collector: self.collector.clone(),
            threads: self.threads.clone(),
            percentiles: self.config.percentile_specs(),
        });
        let ticks = Arc::new(AtomicU64::new(0));
        let (stop, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(run_timer(
            reporter.clone(),
            self.config.send_interval(),
            stop_rx,
            ticks.clone(),
        ));

        tracing::info!(
            sender = %self.config.sender,
            host = %self.config.host,
            port = self.config.port,
            interval_secs = self.config.send_interval_secs,
            "metrics backend armed"
        );
        self.running = Some(Running {
            reporter,
            stop,
            handle,
            ticks,
        });
        Ok(())
    }

    /// Run one reporting cycle right now, outside the timer.
    pub async fn send_metrics(&self) -> Result<FlushStats> {
        match &self.running {
            Some(running) => Ok(running.reporter.send_metrics().await),
            None => Err(BackendError::InvalidState(format!(
                "send_metrics called in state {:?}",
                self.state()
            ))),
        }
    }

    /// Cancel the timer, wait (bounded) for an in-flight tick, report the
    /// trailing partial interval, then release the sender.
    pub async fn teardown(&mut self) -> Result<FlushStats> {
        let Some(running) = self.running.take() else {
            return Err(BackendError::InvalidState(format!(
                "teardown called in state {:?}",
                self.state()
            )));
        };
        let Running {
            reporter,
            stop,
            mut handle,
            ..
        } = running;

        // The timer may already be gone; nothing to signal then.
        let _ = stop.send(());
        match tokio::time::timeout(self.teardown_timeout, &mut handle).await {
            Ok(Ok(())) => tracing::debug!("metrics timer stopped"),
            Ok(Err(e)) => tracing::warn!(error = %e, "metrics timer ended abnormally"),
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.teardown_timeout.as_millis() as u64,
                    "timed out waiting for the last metrics tick, continuing shutdown"
                );
                handle.abort();
            }
        }

        let last = reporter.send_metrics().await;
        reporter.sender.destroy();
        self.stopped = true;
        tracing::info!(sent = last.sent, dropped = last.dropped, "metrics backend stopped");
        Ok(last)
    }
}

async fn run_timer(
    reporter: Arc<Reporter>,
    period: Duration,
    mut stop: oneshot::Receiver<()>,
    ticks: Arc<AtomicU64>,
) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticker = IntervalStream::new(interval);

    loop {
        tokio::select! {
            _ = &mut stop => break,
            Some(_) = ticker.next() => {
                // Runs to completion: `stop` is only observed between ticks.
                let stats = reporter.send_metrics().await;
                ticks.fetch_add(1, Ordering::AcqRel);
                tracing::debug!(sent = stats.sent, dropped = stats.dropped, "metrics tick");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::SenderKind;
    use tokio::net::UdpSocket;

    async fn udp_collector() -> (UdpSocket, BackendConfig) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = BackendConfig {
            sender: SenderKind::Datagram,
            host: "127.0.0.1".into(),
            port: socket.local_addr().unwrap().port(),
            summary_only: false,
            samplers_list: "login page".into(),
            percentiles: "90".into(),
            ..BackendConfig::default()
        };
        (socket, config)
    }

    async fn drain_datagrams(socket: &UdpSocket, expected: usize) -> Vec<String> {
        let mut buf = [0u8; 512];
        let mut out = Vec::new();
        while out.len() < expected {
            let n = tokio::time::timeout(Duration::from_secs(2), socket.recv(&mut buf))
                .await
                .unwrap()
                .unwrap();
            out.push(String::from_utf8_lossy(&buf[..n]).into_owned());
        }
        out
    }

    #[tokio::test]
    async fn test_state_machine() {
        let (_socket, config) = udp_collector().await;
        let mut listener = BackendListener::new(config, Arc::new(ThreadTracker::new())).unwrap();
        assert_eq!(listener.state(), ListenerState::Idle);
        assert!(listener.send_metrics().await.is_err());
        assert!(listener.teardown().await.is_err());

        listener.setup().await.unwrap();
        assert_eq!(listener.state(), ListenerState::Armed);
        assert!(matches!(listener.setup().await, Err(BackendError::InvalidState(_))));

        listener.teardown().await.unwrap();
        assert_eq!(listener.state(), ListenerState::Stopped);
        assert!(listener.setup().await.is_err());
    }

    #[tokio::test]
    async fn test_tick_reports_contexts_and_threads() {
        let (socket, config) = udp_collector().await;
        let threads = Arc::new(ThreadTracker::new());
        threads.thread_started();
        let mut listener = BackendListener::new(config, threads).unwrap();
        listener.setup().await.unwrap();

        listener.handle_sample_results(&[
            SampleResult::success("login page", 10).with_active_threads(1),
            SampleResult::failure("login page", 30).with_active_threads(1),
        ]);
        let stats = listener.send_metrics().await.unwrap();
        assert_eq!(stats.dropped, 0);

        let lines = drain_datagrams(&socket, stats.sent).await;
        for expected in [
            "jmeter.cumulated.success:1|g",
            "jmeter.cumulated.failure:1|g",
            "jmeter.cumulated.total:2|g",
            "jmeter.cumulated.min:10|g",
            "jmeter.cumulated.max:30|g",
            "jmeter.cumulated.avg:20|g",
            "jmeter.cumulated.ok.percentile90:10|g",
            "jmeter.cumulated.ko.max:30|g",
            "jmeter.login-page.total:2|g",
            "jmeter.cumulated.startedT:1|g",
            "jmeter.cumulated.maxAT:1|g",
        ] {
            assert!(lines.iter().any(|l| l == expected), "missing {expected} in {lines:?}");
        }

        // Next interval only carries counts.
        let quiet = listener.send_metrics().await.unwrap();
        let lines = drain_datagrams(&socket, quiet.sent).await;
        assert!(lines.contains(&"jmeter.cumulated.total:0|g".to_owned()));
        assert!(!lines.iter().any(|l| l.starts_with("jmeter.cumulated.min:")));

        listener.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_timer_ticks_every_interval() {
        let (_socket, config) = udp_collector().await;
        let mut listener = BackendListener::new(config, Arc::new(ThreadTracker::new())).unwrap();
        listener.setup().await.unwrap();

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(listener.ticks() >= 2, "ticks = {}", listener.ticks());
        assert_eq!(listener.state(), ListenerState::Ticking);

        listener.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_teardown_gives_up_on_stuck_tick() {
        let (socket, config) = udp_collector().await;
        let mut listener = BackendListener::new(config, Arc::new(ThreadTracker::new()))
            .unwrap()
            .with_teardown_timeout(Duration::from_millis(100));
        listener.setup().await.unwrap();

        // Stand in for a tick whose flush never completes.
        let (alive, gone) = oneshot::channel::<()>();
        let running = listener.running.as_mut().unwrap();
        running.handle.abort();
        running.handle = tokio::spawn(async move {
            let _alive = alive;
            std::future::pending::<()>().await;
        });

        listener.handle_sample_results(&[SampleResult::success("login page", 12)]);
        let started = Instant::now();
        let last = tokio::time::timeout(Duration::from_secs(5), listener.teardown())
            .await
            .expect("teardown must not wait on the stuck tick")
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(listener.state(), ListenerState::Stopped);
        assert!(gone.await.is_err(), "stuck tick was not aborted");

        let lines = drain_datagrams(&socket, last.sent).await;
        assert!(lines.contains(&"jmeter.cumulated.total:1|g".to_owned()));
    }
}
