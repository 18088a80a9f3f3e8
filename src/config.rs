use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::limits::MAX_HOLD_DURATION_MS;
use crate::model::Ms;

pub const DEFAULT_HOLD_DURATION_MS: Ms = 5 * 60_000;
pub const DEFAULT_RECLAIM_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_COMPACT_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_COMPACT_THRESHOLD: u64 = 1000;

/// Process configuration, read from `HOLDFAST_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    /// How long a pending hold lives before the reclaimer may take it back.
    pub hold_duration_ms: Ms,
    pub reclaim_interval: Duration,
    pub compact_interval: Duration,
    /// WAL appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            hold_duration_ms: DEFAULT_HOLD_DURATION_MS,
            reclaim_interval: Duration::from_millis(DEFAULT_RECLAIM_INTERVAL_MS),
            compact_interval: Duration::from_millis(DEFAULT_COMPACT_INTERVAL_MS),
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup. Unset or unparsable values fall
    /// back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            lookup(key).and_then(|s| s.trim().parse().ok())
        }

        let defaults = Self::default();
        let hold_duration_ms = parsed::<Ms>(&lookup, "HOLDFAST_HOLD_DURATION_MS")
            .filter(|ms| (1..=MAX_HOLD_DURATION_MS).contains(ms))
            .unwrap_or(defaults.hold_duration_ms);
        let reclaim_interval = parsed::<u64>(&lookup, "HOLDFAST_RECLAIM_INTERVAL_MS")
            .filter(|ms| *ms > 0)
            .map_or(defaults.reclaim_interval, Duration::from_millis);
        let compact_interval = parsed::<u64>(&lookup, "HOLDFAST_COMPACT_INTERVAL_MS")
            .filter(|ms| *ms > 0)
            .map_or(defaults.compact_interval, Duration::from_millis);

        Self {
            data_dir: lookup("HOLDFAST_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            hold_duration_ms,
            reclaim_interval,
            compact_interval,
            compact_threshold: parsed(&lookup, "HOLDFAST_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(&lookup, "HOLDFAST_METRICS_PORT"),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("holdfast.wal")
    }
}
