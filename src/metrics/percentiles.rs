use hdrhistogram::Histogram;

use crate::sender::sanitize;

/// One configured percentile and the metric-name suffix derived from it.
#[derive(Debug, Clone, PartialEq)]
pub struct PercentileSpec {
    /// Scaled 0–100.
    pub value: f64,
    /// `"90"`, `"99_9"`: the value printed with at most two decimals, sanitized.
    pub suffix: String,
}

impl PercentileSpec {
    /// Returns `None` outside `(0, 100]`.
    pub fn new(value: f64) -> Option<Self> {
        if !(value > 0.0 && value <= 100.0) {
            return None;
        }
        Some(Self {
            value,
            suffix: sanitize(&format_two_decimals(value)),
        })
    }
}

/// Parse a `;`-separated percentile list such as `"90;95;99"`.
///
/// Empty entries are ignored. Unparseable or out-of-range entries are
/// logged and skipped; they never fail the whole list.
pub fn parse_percentiles(list: &str) -> Vec<PercentileSpec> {
    let mut specs: Vec<PercentileSpec> = Vec::new();
    for raw in list.split(';') {
        let entry = raw.trim();
        if entry.is_empty() {
            continue;
        }
        let parsed = entry.parse::<f64>().ok().and_then(PercentileSpec::new);
        match parsed {
            Some(spec) if specs.iter().any(|s| s.suffix == spec.suffix) => {
                tracing::warn!(percentile = entry, "duplicate percentile ignored");
            }
            Some(spec) => specs.push(spec),
            None => tracing::error!(percentile = entry, "error parsing percentile, skipping it"),
        }
    }
    specs
}

/// `0.##`: drop trailing zeros and a dangling decimal point.
fn format_two_decimals(value: f64) -> String {
    let text = format!("{value:.2}");
    text.trim_end_matches('0').trim_end_matches('.').to_owned()
}

/// Nearest-rank value at `percentile` (0–100), kept inside the exact
/// `[min, max]` seen for the interval. HdrHistogram answers with a bucket
/// bound; above 2048 ms a bucket spans several milliseconds.
pub(crate) fn value_at_percentile(
    hist: &Histogram<u64>,
    min: u64,
    max: u64,
    percentile: f64,
) -> u64 {
    if hist.len() == 0 {
        return 0;
    }
    let bucket = hist.value_at_percentile(percentile);
    hist.lowest_equivalent(bucket).clamp(min, max)
}

/// Response-time breakdown for one interval and one outcome class.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseTimes {
    pub count: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    /// `(suffix, value)` in configuration order.
    pub percentiles: Vec<(String, u64)>,
}

impl ResponseTimes {
    /// Extract the configured percentiles from an HdrHistogram.
    /// `min`/`max` come from the exact trackers kept beside it.
    pub fn from_histogram(
        hist: &Histogram<u64>,
        min: u64,
        max: u64,
        specs: &[PercentileSpec],
    ) -> Self {
        if hist.len() == 0 {
            return Self::empty(specs);
        }
        Self {
            count: hist.len(),
            min,
            max,
            mean: hist.mean(),
            percentiles: specs
                .iter()
                .map(|s| (s.suffix.clone(), value_at_percentile(hist, min, max, s.value)))
                .collect(),
        }
    }

    /// All-zero placeholder used when no samples were recorded.
    pub fn empty(specs: &[PercentileSpec]) -> Self {
        Self {
            count: 0,
            min: 0,
            max: 0,
            mean: 0.0,
            percentiles: specs.iter().map(|s| (s.suffix.clone(), 0)).collect(),
        }
    }

    pub fn has_data(&self) -> bool {
        self.count > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_list() {
        let specs = parse_percentiles("90;95;99");
        let suffixes: Vec<_> = specs.iter().map(|s| s.suffix.as_str()).collect();
        assert_eq!(suffixes, vec!["90", "95", "99"]);
        assert_eq!(specs[0].value, 90.0);
    }

    #[test]
    fn test_parse_skips_garbage() {
        let specs = parse_percentiles(" 90 ; ;abc;99.9;150;0;90");
        let suffixes: Vec<_> = specs.iter().map(|s| s.suffix.as_str()).collect();
        assert_eq!(suffixes, vec!["90", "99_9"]);
    }

    #[test]
    fn test_suffix_formatting() {
        assert_eq!(PercentileSpec::new(99.99).unwrap().suffix, "99_99");
        assert_eq!(PercentileSpec::new(99.999).unwrap().suffix, "100");
        assert_eq!(PercentileSpec::new(50.5).unwrap().suffix, "50_5");
        assert_eq!(PercentileSpec::new(100.0).unwrap().suffix, "100");
        assert!(PercentileSpec::new(f64::NAN).is_none());
    }

    #[test]
    fn test_from_histogram() {
        let specs = parse_percentiles("50;90");
        let mut hist = Histogram::<u64>::new_with_bounds(1, 3_600_000, 3).unwrap();
        for v in 1..=10u64 {
            hist.record(v * 10).unwrap();
        }
        let times = ResponseTimes::from_histogram(&hist, 10, 100, &specs);
        assert_eq!(times.count, 10);
        assert_eq!(times.percentiles, vec![("50".to_owned(), 50), ("90".to_owned(), 90)]);
        assert!((times.mean - 55.0).abs() < 0.5);

        let empty = Histogram::<u64>::new_with_bounds(1, 3_600_000, 3).unwrap();
        let times = ResponseTimes::from_histogram(&empty, 0, 0, &specs);
        assert!(!times.has_data());
        assert_eq!(times.percentiles[1], ("90".to_owned(), 0));
    }
}
