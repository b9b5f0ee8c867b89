//! Structured error taxonomy for the risk engine core.
//!
//! Validation and domain failures are returned as `RiskError` so callers get
//! a stable `{code, message}` shape (see spec §6/§7). Collaborator I/O
//! failures stay `anyhow::Error` — they never need a caller-visible code.

use crate::models::AccountStatus;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum RiskError {
    #[error("account not found")]
    AccountNotFound,

    #[error("account frozen: {0:?}")]
    AccountFrozen(AccountStatus),

    #[error("position not found")]
    PositionNotFound,

    #[error("position already closed")]
    PositionClosed,

    #[error("leverage exceeds maximum")]
    MaxLeverage,

    #[error("notional exceeds per-trade maximum")]
    MaxNotional,

    #[error("total exposure exceeds maximum")]
    MaxExposure,

    #[error("insufficient margin: required {required:.8}, available {available:.8}")]
    InsufficientMargin { required: f64, available: f64 },

    #[error("margin usage ratio exceeded: {ratio:.4}")]
    MarginRatioExceeded { ratio: f64 },

    #[error("no reference price available")]
    NoPrice,

    #[error("no fill price returned by exchange")]
    NoFillPrice,

    #[error("desynced close failed: {reason}")]
    DesyncCloseFailed { reason: String },

    #[error("circuit breaker open, retry after cooldown")]
    CircuitBreakerOpen,

    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error("transient collaborator failure: {0}")]
    Transient(String),
}

impl RiskError {
    /// Stable wire code, independent of the `Display` message — this is what
    /// crosses the boundary to the HTTP/WS collaborators.
    pub fn code(&self) -> &'static str {
        match self {
            RiskError::AccountNotFound => "ACCOUNT_NOT_FOUND",
            RiskError::AccountFrozen(_) => "ACCOUNT_FROZEN",
            RiskError::PositionNotFound => "POSITION_NOT_FOUND",
            RiskError::PositionClosed => "POSITION_CLOSED",
            RiskError::MaxLeverage => "MAX_LEVERAGE",
            RiskError::MaxNotional => "MAX_NOTIONAL",
            RiskError::MaxExposure => "MAX_EXPOSURE",
            RiskError::InsufficientMargin { .. } => "INSUFFICIENT_MARGIN",
            RiskError::MarginRatioExceeded { .. } => "MARGIN_RATIO_EXCEEDED",
            RiskError::NoPrice => "NO_PRICE",
            RiskError::NoFillPrice => "NO_FILL_PRICE",
            RiskError::DesyncCloseFailed { .. } => "DESYNC_CLOSE_FAILED",
            RiskError::CircuitBreakerOpen => "CIRCUIT_BREAKER_OPEN",
            RiskError::SchemaViolation(_) => "SCHEMA_VIOLATION",
            RiskError::Transient(_) => "TRANSIENT",
        }
    }
}

/// Per-collaborator-call circuit breaker (spec §7: exchange transient
/// errors trip a counter; once tripped, calls fail fast until cooldown).
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: std::time::Duration,
    consecutive_failures: u32,
    tripped_at: Option<std::time::Instant>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: std::time::Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
            consecutive_failures: 0,
            tripped_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        match self.tripped_at {
            Some(at) => at.elapsed() < self.cooldown,
            None => false,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.tripped_at = None;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.failure_threshold {
            self.tripped_at = Some(std::time::Instant::now());
        }
    }
}
