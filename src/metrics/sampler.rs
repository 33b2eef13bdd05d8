use hdrhistogram::Histogram;

use super::percentiles::{self, PercentileSpec, ResponseTimes};
use super::SampleResult;

/// HdrHistogram range: 1 ms → 1 h, 3 significant figures.
/// Longer samples are clamped to the upper bound.
const HIST_LOW: u64 = 1;
const HIST_HIGH: u64 = 3_600_000;
const HIST_SIGFIG: u8 = 3;

/// Response-time statistics for one outcome class (ok, ko or all).
///
/// Percentiles use nearest rank: the smallest recorded value whose
/// cumulative count reaches `ceil(q * n)`.
pub struct ResponseStats {
    hist: Histogram<u64>,
    min: u64,
    max: u64,
}

impl ResponseStats {
    fn new() -> Self {
        Self {
            hist: Histogram::<u64>::new_with_bounds(HIST_LOW, HIST_HIGH, HIST_SIGFIG)
                .expect("histogram creation"),
            min: u64::MAX,
            max: 0,
        }
    }

    fn record(&mut self, elapsed_ms: u64, count: u64) {
        self.hist.saturating_record_n(elapsed_ms, count);
        self.min = self.min.min(elapsed_ms);
        self.max = self.max.max(elapsed_ms);
    }

    fn reset(&mut self) {
        self.hist.reset();
        self.min = u64::MAX;
        self.max = 0;
    }

    pub fn count(&self) -> u64 {
        self.hist.len()
    }

    /// `0` when nothing was recorded.
    pub fn min_time(&self) -> u64 {
        if self.count() == 0 {
            0
        } else {
            self.min
        }
    }

    pub fn max_time(&self) -> u64 {
        self.max
    }

    pub fn mean(&self) -> f64 {
        if self.count() == 0 {
            0.0
        } else {
            self.hist.mean()
        }
    }

    /// `percentile` is scaled 0–100.
    pub fn percentile(&self, percentile: f64) -> u64 {
        percentiles::value_at_percentile(&self.hist, self.min_time(), self.max_time(), percentile)
    }

    /// `quantile` is scaled 0–1.
    pub fn value_at_quantile(&self, quantile: f64) -> u64 {
        self.percentile(quantile * 100.0)
    }

    pub fn response_times(&self, specs: &[PercentileSpec]) -> ResponseTimes {
        ResponseTimes::from_histogram(&self.hist, self.min_time(), self.max_time(), specs)
    }
}

/// Per-label running aggregate, reset once per reporting interval.
///
/// Not synchronised on its own: the [`MetricsCollector`](super::MetricsCollector)
/// owns every instance behind one lock, so `add` and the read-then-reset
/// done by the reporting tick never interleave.
pub struct SamplerMetric {
    successes: u64,
    failures: u64,
    ok: ResponseStats,
    ko: ResponseStats,
    all: ResponseStats,
}

impl SamplerMetric {
    pub fn new() -> Self {
        Self {
            successes: 0,
            failures: 0,
            ok: ResponseStats::new(),
            ko: ResponseStats::new(),
            all: ResponseStats::new(),
        }
    }

    /// A result carrying no samples is ignored.
    pub fn add(&mut self, result: &SampleResult) {
        if result.sample_count == 0 {
            return;
        }
        let errors = u64::from(result.error_count.min(result.sample_count));
        let oks = u64::from(result.sample_count) - errors;
        self.successes += oks;
        self.failures += errors;

        let weight = u64::from(result.sample_count);
        if result.is_success() {
            self.ok.record(result.elapsed_ms, weight);
        } else {
            self.ko.record(result.elapsed_ms, weight);
        }
        self.all.record(result.elapsed_ms, weight);
    }

    /// Start a fresh interval. Histograms keep their allocation.
    pub fn reset_for_time_interval(&mut self) {
        self.successes = 0;
        self.failures = 0;
        self.ok.reset();
        self.ko.reset();
        self.all.reset();
    }

    pub fn successes(&self) -> u64 {
        self.successes
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn total(&self) -> u64 {
        self.successes + self.failures
    }

    pub fn min_time(&self) -> u64 {
        self.all.min_time()
    }

    pub fn max_time(&self) -> u64 {
        self.all.max_time()
    }

    pub fn mean(&self) -> f64 {
        self.all.mean()
    }

    pub fn percentile(&self, percentile: f64) -> u64 {
        self.all.percentile(percentile)
    }

    pub fn value_at_quantile(&self, quantile: f64) -> u64 {
        self.all.value_at_quantile(quantile)
    }

    pub fn ok(&self) -> &ResponseStats {
        &self.ok
    }

    pub fn ko(&self) -> &ResponseStats {
        &self.ko
    }

    pub fn all(&self) -> &ResponseStats {
        &self.all
    }
}

impl Default for SamplerMetric {
    fn default() -> Self {
        Self::new()
    }
}
