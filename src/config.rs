//! Engine configuration, loaded from the environment (teacher's
//! `models::Config::from_env` pattern: `dotenv().ok()` then
//! `env::var(..).unwrap_or_else(..).parse().unwrap_or(default)`).
//!
//! Every magic number named in spec §4/§5 is a field here with the spec's
//! default, so behavior is tunable without touching code.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// §4.C: in-process and KV price cache staleness window.
    pub price_staleness: Duration,
    /// §4.K: force a reconnect if a subscribed symbol hasn't ticked in this long.
    pub tick_reconnect_after: Duration,

    /// §4.G: default liquidation threshold when rules are missing/invalid.
    pub default_liquidation_threshold: f64,
    /// §4.G: ADL tier 2 band width above threshold; tier 3 is everything past it.
    pub adl_tier2_band: f64,
    /// §4.G: warning band below threshold.
    pub margin_warning_band: f64,
    /// §4.G: fraction of the largest position closed per ADL tier.
    pub adl_close_fraction: f64,
    /// §4.G: rules cache TTL.
    pub rules_cache_ttl: Duration,

    /// §4.G/§4.K: throttle windows for outbound broadcasts.
    pub pnl_update_throttle: Duration,
    pub margin_update_throttle: Duration,
    pub snapshot_write_throttle: Duration,

    /// §4.K: minimum time between repeated evaluations of the same account.
    pub evaluation_debounce: Duration,
    /// §4.K: periodic full-book safety sweep interval.
    pub safety_sweep_interval: Duration,
    /// §4.K: periodic book/store reconciliation interval.
    pub book_sync_interval: Duration,

    /// §4.F: "recently closed" suppression window for ghost-fill detection.
    pub recently_closed_window: Duration,
    /// §4.H: DB-level ghost guard window.
    pub ghost_guard_db_window: Duration,

    /// §4.I: default auto-claim idle threshold.
    pub claim_idle: Duration,
    /// §4.I/§4.J: max republish retries before dropping a message.
    pub max_retry: u32,

    /// §4.A/§4.H: dedup set capacity.
    pub dedup_capacity: usize,
    /// §4.A: per-account evaluation-timestamp cache capacity.
    pub evaluation_cache_capacity: usize,

    /// §5: exchange REST call timeouts.
    pub exchange_request_timeout: Duration,
    pub exchange_connect_timeout: Duration,

    /// §7: circuit breaker policy for exchange collaborator calls.
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            price_staleness: Duration::from_secs(10),
            tick_reconnect_after: Duration::from_secs(5),

            default_liquidation_threshold: 0.90,
            adl_tier2_band: 0.05,
            margin_warning_band: 0.10,
            adl_close_fraction: 0.3,
            rules_cache_ttl: Duration::from_secs(60),

            pnl_update_throttle: Duration::from_millis(50),
            margin_update_throttle: Duration::from_millis(80),
            snapshot_write_throttle: Duration::from_secs(1),

            evaluation_debounce: Duration::from_millis(100),
            safety_sweep_interval: Duration::from_secs(60),
            book_sync_interval: Duration::from_secs(10),

            recently_closed_window: Duration::from_secs(5),
            ghost_guard_db_window: Duration::from_secs(60),

            claim_idle: Duration::from_secs(30),
            max_retry: 3,

            dedup_capacity: 8_000,
            evaluation_cache_capacity: 10_000,

            exchange_request_timeout: Duration::from_secs(10),
            exchange_connect_timeout: Duration::from_secs(5),

            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown: Duration::from_secs(30),
        }
    }
}

impl RiskConfig {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let mut cfg = Self::default();

        if let Some(v) = env_f64("RISK_PRICE_STALENESS_SECS") {
            cfg.price_staleness = Duration::from_secs_f64(v);
        }
        if let Some(v) = env_f64("RISK_LIQUIDATION_THRESHOLD_DEFAULT") {
            cfg.default_liquidation_threshold = v;
        }
        if let Some(v) = env_u64("RISK_DEDUP_CAPACITY") {
            cfg.dedup_capacity = v as usize;
        }
        if let Some(v) = env_u64("RISK_MAX_RETRY") {
            cfg.max_retry = v as u32;
        }
        if let Some(v) = env_f64("RISK_SAFETY_SWEEP_SECS") {
            cfg.safety_sweep_interval = Duration::from_secs_f64(v);
        }
        if let Some(v) = env_f64("RISK_BOOK_SYNC_SECS") {
            cfg.book_sync_interval = Duration::from_secs_f64(v);
        }

        cfg
    }
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = RiskConfig::default();
        assert_eq!(cfg.default_liquidation_threshold, 0.90);
        assert_eq!(cfg.price_staleness, Duration::from_secs(10));
        assert_eq!(cfg.max_retry, 3);
    }
}
