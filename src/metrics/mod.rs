pub mod collector;
pub mod percentiles;
pub mod sampler;
pub mod threads;

pub use collector::{
    ContextReport, IntervalReport, MetricsCollector, SamplerFilter, CUMULATED_CONTEXT,
};
pub use percentiles::{parse_percentiles, PercentileSpec, ResponseTimes};
pub use sampler::{ResponseStats, SamplerMetric};
pub use threads::{ThreadMetric, ThreadStats, ThreadTracker};

/// One completed sample handed over by the load engine.
/// This is the "write" side: sampling threads build these and push them in.
#[derive(Debug, Clone)]
pub struct SampleResult {
    /// Sampler label, e.g. "login page"
    pub label: String,
    /// Elapsed time in milliseconds
    pub elapsed_ms: u64,
    /// Samples aggregated in this result (1 for a plain request)
    pub sample_count: u32,
    /// How many of them failed; 0 means the result is successful
    pub error_count: u32,
    /// Active virtual users when the sample completed
    pub active_threads: u64,
}

impl SampleResult {
    pub fn success(label: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            label: label.into(),
            elapsed_ms,
            sample_count: 1,
            error_count: 0,
            active_threads: 0,
        }
    }

    pub fn failure(label: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            error_count: 1,
            ..Self::success(label, elapsed_ms)
        }
    }

    pub fn with_active_threads(mut self, active: u64) -> Self {
        self.active_threads = active;
        self
    }

    pub fn is_success(&self) -> bool {
        self.error_count == 0
    }
}
