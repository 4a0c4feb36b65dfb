//! Typed, immutable loader configuration.
//!
//! The many ad-hoc configuration knobs of the service collapse into one
//! record loaded at startup (see `load_loader_config`). Every field has a
//! production default; deployment YAML overrides only what it names.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

fn default_batch_size() -> usize {
    1000
}
fn default_processing_threads() -> usize {
    4
}

/// Root configuration record. Loaded once, then shared read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Chunk size for bulk staging writes (500–10,000 typical).
    pub batch_size: usize,
    /// Bounded worker pool size for the EOD consumer.
    pub processing_threads: usize,
    pub dlq: DlqConfig,
    pub upstream: UpstreamConfig,
    pub retry: RetryConfig,
    pub features: FeaturesConfig,
    pub validation: ValidationConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            processing_threads: default_processing_threads(),
            dlq: DlqConfig::default(),
            upstream: UpstreamConfig::default(),
            retry: RetryConfig::default(),
            features: FeaturesConfig::default(),
            validation: ValidationConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    pub retention_days: u32,
    pub max_retries: u32,
    pub initial_backoff_secs: u64,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            max_retries: 3,
            initial_backoff_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8085".into(),
            connect_timeout_secs: 5,
            read_timeout_secs: 30,
        }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

/// In-pipeline retry budget for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeaturesConfig {
    pub eod_enabled: bool,
    pub intraday_enabled: bool,
    pub validation_enabled: bool,
    pub duplicate_detection: bool,
    pub archival: bool,
    /// When non-empty, pilot mode is on: only these accounts are admitted.
    pub pilot_accounts: BTreeSet<i64>,
    pub disabled_accounts: BTreeSet<i64>,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            eod_enabled: true,
            intraday_enabled: true,
            validation_enabled: true,
            duplicate_detection: true,
            archival: false,
            pilot_accounts: BTreeSet::new(),
            disabled_accounts: BTreeSet::new(),
        }
    }
}

impl FeaturesConfig {
    /// Pilot mode is implied by a non-empty pilot set.
    pub fn pilot_mode(&self) -> bool {
        !self.pilot_accounts.is_empty()
    }

    pub fn admits(&self, account_id: i64) -> bool {
        if self.disabled_accounts.contains(&account_id) {
            return false;
        }
        if self.pilot_mode() && !self.pilot_accounts.contains(&account_id) {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Max tolerated share of zero-priced positions before a warning (percent).
    pub zero_price_threshold_pct: u32,
    /// Per-position quantity change vs prior ACTIVE considered suspicious (percent).
    pub suspicious_change_pct: u32,
    /// Warnings become failures when strict mode is on.
    pub strict_mode: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            zero_price_threshold_pct: 10,
            suspicious_change_pct: 50,
            strict_mode: false,
        }
    }
}

/// Per-dependency breaker tuning: failure rate over a sliding window of the
/// last `window` calls, cooldown before half-open, probe budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_rate_pct: u32,
    pub window: usize,
    pub cooldown_secs: u64,
    pub half_open_probes: u32,
}

impl BreakerSettings {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub upstream: BreakerSettings,
    pub db: BreakerSettings,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            upstream: BreakerSettings {
                failure_rate_pct: 50,
                window: 10,
                cooldown_secs: 30,
                half_open_probes: 2,
            },
            db: BreakerSettings {
                failure_rate_pct: 70,
                window: 20,
                cooldown_secs: 60,
                half_open_probes: 2,
            },
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        CircuitBreakerConfig::default().upstream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_defaults_are_stable() {
        let cfg = LoaderConfig::default();
        assert_eq!(cfg.dlq.max_retries, 3);
        assert_eq!(cfg.upstream.connect_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.upstream.read_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.validation.zero_price_threshold_pct, 10);
        assert_eq!(cfg.validation.suspicious_change_pct, 50);
        assert_eq!(cfg.circuit_breaker.upstream.failure_rate_pct, 50);
        assert_eq!(cfg.circuit_breaker.upstream.window, 10);
        assert_eq!(cfg.circuit_breaker.db.failure_rate_pct, 70);
        assert_eq!(cfg.circuit_breaker.db.window, 20);
    }

    #[test]
    fn disabled_list_beats_pilot_set() {
        let mut f = FeaturesConfig::default();
        f.pilot_accounts.insert(1001);
        f.disabled_accounts.insert(1001);
        assert!(!f.admits(1001));
    }

    #[test]
    fn pilot_mode_admits_only_pilot_accounts() {
        let mut f = FeaturesConfig::default();
        assert!(f.admits(1001));
        f.pilot_accounts.insert(2002);
        assert!(f.pilot_mode());
        assert!(f.admits(2002));
        assert!(!f.admits(1001));
    }
}
