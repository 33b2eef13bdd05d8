use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use regex::Regex;

use super::percentiles::{PercentileSpec, ResponseTimes};
use super::sampler::SamplerMetric;
use super::threads::{ThreadMetric, ThreadStats, ThreadTracker};
use super::SampleResult;
use crate::error::{BackendError, Result};

/// Context covering every sample, whatever its label.
pub const CUMULATED_CONTEXT: &str = "cumulated";

// ─── Public types ────────────────────────────────────────────────

/// Which labels get their own reporting context besides the cumulated one.
#[derive(Debug, Clone)]
pub enum SamplerFilter {
    SummaryOnly,
    Labels(HashSet<String>),
    /// Anchored at both ends: the whole label must match.
    Pattern(Regex),
}

impl SamplerFilter {
    /// `list` is `;`-separated and matched exactly; empty entries are ignored.
    pub fn new(summary_only: bool, list: &str) -> Self {
        if summary_only {
            return Self::SummaryOnly;
        }
        Self::Labels(
            list.split(';')
                .filter(|label| !label.is_empty())
                .map(str::to_owned)
                .collect(),
        )
    }

    /// Compile `expr` as a filter matching entire labels.
    pub fn pattern(expr: &str) -> Result<Self> {
        Regex::new(&format!("^(?:{expr})$"))
            .map(Self::Pattern)
            .map_err(|e| BackendError::InvalidConfig(format!("invalid samplers_list pattern: {e}")))
    }

    pub fn is_summary_only(&self) -> bool {
        matches!(self, Self::SummaryOnly)
    }

    pub fn matches(&self, label: &str) -> bool {
        match self {
            Self::SummaryOnly => false,
            Self::Labels(labels) => labels.contains(label),
            Self::Pattern(re) => re.is_match(label),
        }
    }
}

/// Everything one context reports for one interval.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextReport {
    /// Raw sampler label; not yet sanitized.
    pub label: String,
    pub successes: u64,
    pub failures: u64,
    pub total: u64,
    pub all: ResponseTimes,
    pub ok: ResponseTimes,
    pub ko: ResponseTimes,
}

impl ContextReport {
    fn read(label: &str, metric: &SamplerMetric, specs: &[PercentileSpec]) -> Self {
        Self {
            label: label.to_owned(),
            successes: metric.successes(),
            failures: metric.failures(),
            total: metric.total(),
            all: metric.all().response_times(specs),
            ok: metric.ok().response_times(specs),
            ko: metric.ko().response_times(specs),
        }
    }
}

/// Snapshot taken by one reporting tick.
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalReport {
    pub cumulated: ContextReport,
    /// Individually reported labels, sorted by label.
    pub samplers: Vec<ContextReport>,
    pub threads: ThreadStats,
}

/// Thread-safe per-label aggregation.
/// Sampling threads call `record()`, the reporting tick calls `drain_interval()`.
pub struct MetricsCollector {
    filter: SamplerFilter,
    inner: Mutex<Inner>,
}

// ─── Internal state ──────────────────────────────────────────────

struct Inner {
    cumulated: SamplerMetric,
    samplers: HashMap<String, SamplerMetric>,
    threads: ThreadMetric,
}

impl Inner {
    fn new() -> Self {
        Self {
            cumulated: SamplerMetric::new(),
            samplers: HashMap::new(),
            threads: ThreadMetric::new(),
        }
    }
}

// ─── MetricsCollector impl ───────────────────────────────────────

impl MetricsCollector {
    pub fn new(filter: SamplerFilter) -> Self {
        Self {
            filter,
            inner: Mutex::new(Inner::new()),
        }
    }

    /// Record one completed sample. Touches in-memory counters only.
    pub fn record(&self, result: &SampleResult) {
        let tracked = self.filter.matches(&result.label);
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.threads.observe(result.active_threads);
        if tracked {
            match inner.samplers.get_mut(&result.label) {
                Some(metric) => metric.add(result),
                None => {
                    let mut metric = SamplerMetric::new();
                    metric.add(result);
                    inner.samplers.insert(result.label.clone(), metric);
                }
            }
        }
        inner.cumulated.add(result);
    }

    pub fn record_all(&self, results: &[SampleResult]) {
        for result in results {
            self.record(result);
        }
    }

    /// Read every context and reset it for the next interval.
    ///
    /// Read and reset happen under the same lock as `record()`, so each
    /// sample lands in exactly one interval.
    pub fn drain_interval(&self, specs: &[PercentileSpec], tracker: &ThreadTracker) -> IntervalReport {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let cumulated = ContextReport::read(CUMULATED_CONTEXT, &inner.cumulated, specs);
        inner.cumulated.reset_for_time_interval();

        let mut samplers = Vec::with_capacity(inner.samplers.len());
        for (label, metric) in inner.samplers.iter_mut() {
            samplers.push(ContextReport::read(label, metric, specs));
            metric.reset_for_time_interval();
        }
        samplers.sort_by(|a, b| a.label.cmp(&b.label));

        let threads = inner.threads.stats(tracker);
        inner.threads.reset_for_time_interval();

        IntervalReport {
            cumulated,
            samplers,
            threads,
        }
    }

    pub fn filter(&self) -> &SamplerFilter {
        &self.filter
    }

    /// Labels seen so far that have their own context.
    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<_> = self.inner.lock().samplers.keys().cloned().collect();
        labels.sort();
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::parse_percentiles;
    use std::sync::Arc;

    #[test]
    fn test_filter() {
        let filter = SamplerFilter::new(false, "login;search;");
        assert!(filter.matches("login"));
        assert!(!filter.matches("checkout"));
        assert!(!filter.matches(""));
        assert!(!SamplerFilter::new(true, "login").matches("login"));
    }

    #[test]
    fn test_pattern_filter_matches_whole_label() {
        let filter = SamplerFilter::pattern("log.*|search").unwrap();
        assert!(filter.matches("login"));
        assert!(filter.matches("logout"));
        assert!(filter.matches("search"));
        assert!(!filter.matches("search page"));
        assert!(!filter.matches("catalog"));
    }

    #[test]
    fn test_pattern_filter_rejects_bad_expression() {
        let err = SamplerFilter::pattern("checkout(").unwrap_err();
        assert!(matches!(err, BackendError::InvalidConfig(_)));
    }

    #[test]
    fn test_pattern_filter_tracks_matching_labels() {
        let collector = MetricsCollector::new(SamplerFilter::pattern("api/.*").unwrap());
        collector.record(&SampleResult::success("api/users", 5));
        collector.record(&SampleResult::success("api/orders", 8));
        collector.record(&SampleResult::success("home", 3));
        assert_eq!(collector.labels(), vec!["api/orders", "api/users"]);
    }

    #[test]
    fn test_summary_only_keeps_cumulated() {
        let collector = MetricsCollector::new(SamplerFilter::SummaryOnly);
        collector.record(&SampleResult::success("login", 5));
        collector.record(&SampleResult::failure("search", 7));

        let report = collector.drain_interval(&[], &ThreadTracker::new());
        assert!(report.samplers.is_empty());
        assert_eq!(report.cumulated.label, CUMULATED_CONTEXT);
        assert_eq!(report.cumulated.total, 2);
        assert_eq!(report.cumulated.successes, 1);
        assert_eq!(report.cumulated.failures, 1);
    }

    #[test]
    fn test_labels_are_reset_not_removed() {
        let collector = MetricsCollector::new(SamplerFilter::new(false, "login"));
        let specs = parse_percentiles("90");
        let tracker = ThreadTracker::new();

        collector.record(&SampleResult::success("login", 5));
        collector.record(&SampleResult::success("other", 5));
        let first = collector.drain_interval(&specs, &tracker);
        assert_eq!(first.samplers.len(), 1);
        assert_eq!(first.samplers[0].label, "login");
        assert_eq!(first.samplers[0].total, 1);
        assert_eq!(first.cumulated.total, 2);

        let second = collector.drain_interval(&specs, &tracker);
        assert_eq!(second.samplers.len(), 1);
        assert_eq!(second.samplers[0].total, 0);
        assert!(!second.samplers[0].all.has_data());
        assert_eq!(collector.labels(), vec!["login".to_owned()]);
    }

    #[test]
    fn test_thread_observations() {
        let collector = MetricsCollector::new(SamplerFilter::SummaryOnly);
        collector.record(&SampleResult::success("a", 1).with_active_threads(2));
        collector.record(&SampleResult::success("a", 1).with_active_threads(6));

        let report = collector.drain_interval(&[], &ThreadTracker::new());
        assert_eq!(report.threads.min_active, 2);
        assert_eq!(report.threads.max_active, 6);
        assert_eq!(report.threads.mean_active, 4);
    }

    #[test]
    fn test_concurrent_record_and_drain_loses_nothing() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 5_000;

        let collector = Arc::new(MetricsCollector::new(SamplerFilter::new(false, "t0;t1")));
        let tracker = ThreadTracker::new();

        let workers: Vec<_> = (0..THREADS)
            .map(|t| {
                let collector = collector.clone();
                std::thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        let label = format!("t{}", t % 2);
                        let result = if i % 10 == 0 {
                            SampleResult::failure(label, 3)
                        } else {
                            SampleResult::success(label, 1)
                        };
                        collector.record(&result);
                    }
                })
            })
            .collect();

        let mut total = 0;
        let mut per_label = 0;
        while workers.iter().any(|w| !w.is_finished()) {
            let report = collector.drain_interval(&[], &tracker);
            assert_eq!(
                report.cumulated.total,
                report.cumulated.successes + report.cumulated.failures
            );
            total += report.cumulated.total;
            per_label += report.samplers.iter().map(|s| s.total).sum::<u64>();
        }
        for w in workers {
            w.join().unwrap();
        }
        let report = collector.drain_interval(&[], &tracker);
        total += report.cumulated.total;
        per_label += report.samplers.iter().map(|s| s.total).sum::<u64>();

        assert_eq!(total, (THREADS * PER_THREAD) as u64);
        assert_eq!(per_label, (THREADS * PER_THREAD) as u64);
    }
}
