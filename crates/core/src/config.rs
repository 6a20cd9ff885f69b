//! Engine tunables, read from `SLUICE_*` environment variables.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{SluiceError, SluiceResult};

/// Boundary used to skip the supplementary page-count request when a cached total
/// already covers the requested window (`total > from + size` or `>=`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PageCountSkip {
    #[default]
    Greater,
    GreaterOrEqual,
}

impl PageCountSkip {
    pub fn skips(&self, cached_total: u64, from: u64, size: u64) -> bool {
        let window = from.saturating_add(size);
        match self {
            PageCountSkip::Greater => cached_total > window,
            PageCountSkip::GreaterOrEqual => cached_total >= window,
        }
    }
}

impl FromStr for PageCountSkip {
    type Err = SluiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gt" | ">" | "greater" => Ok(PageCountSkip::Greater),
            "ge" | ">=" | "greater_or_equal" => Ok(PageCountSkip::GreaterOrEqual),
            other => Err(SluiceError::Config(format!("invalid page-count skip rule: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Cap on live trace ids kept by the registry and the partition tracker.
    pub max_traces: usize,
    /// User-visible error messages are cut to this many characters.
    pub error_max_chars: usize,
    /// Records processed between yield points when flattening rows.
    pub flatten_batch: usize,
    /// Upper bound on backfilled histogram buckets.
    pub max_histogram_buckets: usize,
    pub debounce_ms: u64,
    pub page_count_skip: PageCountSkip,
    pub queue_cap: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_traces: 256,
            error_max_chars: 300,
            flatten_batch: 5_000,
            max_histogram_buckets: 100_000,
            debounce_ms: 300,
            page_count_skip: PageCountSkip::Greater,
            queue_cap: 2048,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok())
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let page_count_skip = match std::env::var("SLUICE_PAGE_COUNT_SKIP") {
            Ok(v) => v.parse::<PageCountSkip>().unwrap_or_else(|e: SluiceError| {
                warn!(error = %e, "ignoring SLUICE_PAGE_COUNT_SKIP");
                d.page_count_skip
            }),
            Err(_) => d.page_count_skip,
        };
        Self {
            max_traces: env_parse("SLUICE_MAX_TRACES").unwrap_or(d.max_traces),
            error_max_chars: env_parse("SLUICE_ERROR_MAX_CHARS").unwrap_or(d.error_max_chars),
            flatten_batch: env_parse("SLUICE_FLATTEN_BATCH").unwrap_or(d.flatten_batch),
            max_histogram_buckets: env_parse("SLUICE_MAX_HISTOGRAM_BUCKETS").unwrap_or(d.max_histogram_buckets),
            debounce_ms: env_parse("SLUICE_DEBOUNCE_MS").unwrap_or(d.debounce_ms),
            page_count_skip,
            queue_cap: env_parse("SLUICE_QUEUE_CAP").unwrap_or(d.queue_cap),
        }
    }

    pub fn validate(&self) -> SluiceResult<()> {
        if self.max_traces == 0 { return Err(SluiceError::Config("max_traces must be > 0".into())); }
        if self.flatten_batch == 0 { return Err(SluiceError::Config("flatten_batch must be > 0".into())); }
        if self.queue_cap == 0 { return Err(SluiceError::Config("queue_cap must be > 0".into())); }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_rule_boundary() {
        assert!(!PageCountSkip::Greater.skips(100, 50, 50));
        assert!(PageCountSkip::GreaterOrEqual.skips(100, 50, 50));
        assert!(PageCountSkip::Greater.skips(101, 50, 50));
    }

    #[test]
    fn skip_rule_parses_aliases() {
        assert_eq!("ge".parse::<PageCountSkip>().unwrap(), PageCountSkip::GreaterOrEqual);
        assert_eq!(">".parse::<PageCountSkip>().unwrap(), PageCountSkip::Greater);
        assert!("sometimes".parse::<PageCountSkip>().is_err());
    }

    #[test]
    fn defaults_validate() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.error_max_chars, 300);
        assert_eq!(cfg.flatten_batch, 5_000);
        assert!(cfg.validate().is_ok());
        let bad = EngineConfig { flatten_batch: 0, ..EngineConfig::default() };
        assert!(bad.validate().is_err());
    }
}
