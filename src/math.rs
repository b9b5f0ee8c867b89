//! Pure, deterministic math kernels (spec §4.B). No I/O, no shared state —
//! every function here is a candidate for property-based testing.

use crate::models::{Position, Side};
use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// `(close - entry) * qty` for LONG, `(entry - close) * qty` for SHORT.
pub fn pnl(side: Side, entry: f64, close: f64, qty: f64) -> f64 {
    match side {
        Side::Long => (close - entry) * qty,
        Side::Short => (entry - close) * qty,
    }
}

pub struct AvailableMarginInput {
    pub balance: f64,
    pub maintenance_rate: f64,
    pub total_upnl: f64,
    pub total_notional: f64,
    pub opposite_notional: f64,
    pub opposite_pnl: f64,
}

pub struct AvailableMargin {
    pub equity: f64,
    pub maintenance_margin: f64,
    pub available: f64,
}

pub fn available_margin(input: AvailableMarginInput) -> AvailableMargin {
    let equity = input.balance + input.total_upnl + input.opposite_pnl;
    let maintenance_margin = (input.total_notional - input.opposite_notional).max(0.0) * input.maintenance_rate;
    AvailableMargin {
        equity,
        maintenance_margin,
        available: equity - maintenance_margin,
    }
}

/// `999` sentinel when equity <= 0 means "insolvent" — callers treat it as a
/// hard failure rather than a ratio to compare against a threshold.
pub const INSOLVENT_MARGIN_USAGE: f64 = 999.0;

pub fn margin_usage_ratio(equity: f64, current_margin_used: f64, new_margin: f64) -> f64 {
    if equity <= 0.0 {
        return INSOLVENT_MARGIN_USAGE;
    }
    (current_margin_used + new_margin) / equity
}

/// Isolated-position liquidation price (spec §4.B). `threshold` is the
/// account's `liquidationThreshold`, in `(0, 1]`.
pub fn liq_price(
    side: Side,
    entry: f64,
    _leverage: f64,
    balance: f64,
    notional: f64,
    maintenance_rate: f64,
    threshold: f64,
) -> f64 {
    let qty = notional / entry;
    let mm = notional * maintenance_rate;
    let equity_floor = mm / threshold;
    let avail_for_loss = balance - equity_floor;
    match side {
        Side::Long => (entry - avail_for_loss / qty).max(0.0),
        Side::Short => (entry + avail_for_loss / qty).max(0.0),
    }
}

/// One position's view into the cross-margin calculation.
#[derive(Debug, Clone, Copy)]
pub struct PositionExposure {
    pub side: Side,
    pub entry: f64,
    pub quantity: f64,
    pub notional: f64,
    pub mark: f64,
}

/// Cross-margin dynamic liquidation prices (spec §4.B). Holding every *other*
/// position's current mark-to-market PnL fixed, returns the price at which
/// each position alone would push the account's margin ratio to `threshold`.
/// Indices in the returned `Vec` line up with `positions`.
pub fn dynamic_liq_prices(
    balance: f64,
    positions: &[PositionExposure],
    maintenance_rate: f64,
    threshold: f64,
) -> Vec<f64> {
    let upnl: Vec<f64> = positions
        .iter()
        .map(|p| pnl(p.side, p.entry, p.mark, p.quantity))
        .collect();
    let total_upnl: f64 = upnl.iter().sum();
    let total_mm: f64 = positions.iter().map(|p| p.notional * maintenance_rate).sum();
    let equity_floor = total_mm / threshold;

    positions
        .iter()
        .zip(upnl.iter())
        .map(|(p, &this_upnl)| {
            let other_upnl = total_upnl - this_upnl;
            let required_move = (equity_floor - (balance + other_upnl)) / p.quantity;
            let liq = match p.side {
                Side::Long => p.entry + required_move,
                Side::Short => p.entry - required_move,
            };
            liq.max(0.0)
        })
        .collect()
}

/// The account-level liquidation price is the dynamic liq price of the
/// largest-notional position.
pub fn account_liq_price(positions: &[PositionExposure], dynamic_liqs: &[f64]) -> f64 {
    positions
        .iter()
        .zip(dynamic_liqs.iter())
        .max_by(|(a, _), (b, _)| a.notional.partial_cmp(&b.notional).unwrap())
        .map(|(_, liq)| *liq)
        .unwrap_or(0.0)
}

/// Returns the index of the largest-notional position among still-open ones,
/// used by the liquidation engine to pick its ADL / full-liquidation target.
pub fn largest_notional_index(notionals: &[f64]) -> Option<usize> {
    notionals
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
        .map(|(i, _)| i)
}

/// Deterministic idempotency key: SHA-256 hex of the joined inputs, a
/// timestamp, and a random nonce (spec §3/§4.B).
pub fn signature(sub_account_id: &str, action: &str, position_id: &str) -> String {
    let ts = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let nonce = Uuid::new_v4();
    let joined = format!("{sub_account_id}|{action}|{position_id}|{ts}|{nonce}");
    let digest = Sha256::digest(joined.as_bytes());
    hex::encode(digest)
}

/// Builds a `PositionExposure` view for the cross-margin kernel from a live
/// `Position` and its current mark price.
pub fn exposure_of(position: &Position, mark: f64) -> PositionExposure {
    PositionExposure {
        side: position.side,
        entry: position.entry_price,
        quantity: position.quantity,
        notional: position.notional,
        mark,
    }
}
