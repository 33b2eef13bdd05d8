use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{BackendError, Result};
use crate::metrics::{parse_percentiles, PercentileSpec, SamplerFilter};
use crate::sender::SenderKind;

/// Settings for the metrics backend, normally read from a JSON file.
/// Every field has a default except `host`, which must be set.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Transport: "text" (Graphite plaintext) or "datagram" (StatsD gauges)
    #[serde(default)]
    pub sender: SenderKind,

    #[serde(default)]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Prepended verbatim to every metric path
    #[serde(default = "default_prefix")]
    pub root_metrics_prefix: String,

    /// Only report the cumulated context
    #[serde(default = "default_summary_only")]
    pub summary_only: bool,

    /// `;`-separated labels that get their own context, or a regular
    /// expression when `use_regexp_for_samplers_list` is set
    #[serde(default)]
    pub samplers_list: String,

    #[serde(default)]
    pub use_regexp_for_samplers_list: bool,

    /// `;`-separated percentiles, each in (0, 100]
    #[serde(default = "default_percentiles")]
    pub percentiles: String,

    #[serde(default = "default_send_interval")]
    pub send_interval_secs: u64,
}

fn default_port() -> u16 {
    2003
}
fn default_prefix() -> String {
    "jmeter.".into()
}
fn default_summary_only() -> bool {
    true
}
fn default_percentiles() -> String {
    "90;95;99".into()
}
fn default_send_interval() -> u64 {
    1
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            sender: SenderKind::default(),
            host: String::new(),
            port: default_port(),
            root_metrics_prefix: default_prefix(),
            summary_only: default_summary_only(),
            samplers_list: String::new(),
            use_regexp_for_samplers_list: false,
            percentiles: default_percentiles(),
            send_interval_secs: default_send_interval(),
        }
    }
}

impl BackendConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(BackendError::InvalidConfig("host must be set".into()));
        }
        if self.port == 0 {
            return Err(BackendError::InvalidConfig("port must be between 1 and 65535".into()));
        }
        if self.send_interval_secs == 0 {
            return Err(BackendError::InvalidConfig(
                "send_interval_secs must be at least 1".into(),
            ));
        }
        self.sampler_filter()?;
        Ok(())
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_secs(self.send_interval_secs)
    }

    /// Malformed entries are logged and dropped.
    pub fn percentile_specs(&self) -> Vec<PercentileSpec> {
        parse_percentiles(&self.percentiles)
    }

    /// Fails only on a malformed pattern, which is checked even in
    /// summary-only mode.
    pub fn sampler_filter(&self) -> Result<SamplerFilter> {
        if self.use_regexp_for_samplers_list {
            let pattern = SamplerFilter::pattern(&self.samplers_list)?;
            if !self.summary_only {
                return Ok(pattern);
            }
        }
        Ok(SamplerFilter::new(self.summary_only, &self.samplers_list))
    }
}
