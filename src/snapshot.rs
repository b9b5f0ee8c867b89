//! Risk snapshot construction, shared by the Trade Executor (post-trade,
//! spec §4.F step 5) and the Liquidation Engine (§4.G step 5). Keeping this
//! in one place means both call sites agree on exactly what a "fresh"
//! snapshot contains.

use crate::book::PositionBook;
use crate::math::{self, PositionExposure};
use crate::models::{PositionMark, RiskSnapshot};
use crate::price::PriceService;
use chrono::Utc;

/// Builds a `RiskSnapshot` from the book's current state and the price
/// service's latest marks. Returns `None` for accounts with no open
/// positions or no account row — there is nothing meaningful to publish.
pub fn build(book: &PositionBook, prices: &PriceService, account_id: &str, threshold: f64) -> Option<RiskSnapshot> {
    let entry = book.get_entry(account_id)?;
    let account = entry.account?;
    let positions = entry.positions;
    if positions.is_empty() {
        return None;
    }

    let exposures: Vec<(String, PositionExposure)> = positions
        .values()
        .map(|p| {
            let mark = prices.get_price(&p.symbol).unwrap_or(p.entry_price);
            (p.id.clone(), math::exposure_of(p, mark))
        })
        .collect();

    let exposure_values: Vec<PositionExposure> = exposures.iter().map(|(_, e)| *e).collect();
    let liqs = math::dynamic_liq_prices(
        account.current_balance,
        &exposure_values,
        account.maintenance_rate,
        threshold,
    );

    let total_upnl: f64 = exposure_values
        .iter()
        .map(|e| math::pnl(e.side, e.entry, e.mark, e.quantity))
        .sum();
    let total_notional: f64 = exposure_values.iter().map(|e| e.notional).sum();
    let equity_raw = account.current_balance + total_upnl;
    let maintenance_margin = total_notional * account.maintenance_rate;
    let margin_ratio = if equity_raw <= 0.0 {
        math::INSOLVENT_MARGIN_USAGE
    } else {
        maintenance_margin / equity_raw
    };
    let account_liq_price = math::account_liq_price(&exposure_values, &liqs);

    let position_marks: Vec<PositionMark> = positions
        .values()
        .zip(exposures.iter())
        .zip(liqs.iter())
        .map(|((p, (_, exp)), liq)| PositionMark {
            position_id: p.id.clone(),
            symbol: p.symbol.clone(),
            side: p.side,
            mark: exp.mark,
            unrealized_pnl: math::pnl(exp.side, exp.entry, exp.mark, exp.quantity),
            liquidation_price: *liq,
        })
        .collect();

    Some(RiskSnapshot {
        sub_account_id: account_id.to_string(),
        balance: account.current_balance,
        equity: equity_raw.max(0.0),
        equity_raw,
        unrealized_pnl: total_upnl,
        margin_used: maintenance_margin,
        available_margin: equity_raw.max(0.0) - maintenance_margin,
        total_exposure: total_notional,
        maintenance_margin,
        margin_ratio,
        account_liq_price,
        positions: position_marks,
        ts: Utc::now(),
    })
}
