//! Trade Validator (spec §4.E): a deterministic, side-effect-free pre-trade
//! check. Grounded in the teacher's `vault::risk` pre-trade gate, which runs
//! the same "load state, compute, check against rules, collect failures"
//! shape before `trade_executor` is allowed to act.

use crate::book::PositionBook;
use crate::errors::RiskError;
use crate::math::{self, AvailableMarginInput, PositionExposure};
use crate::models::{AccountStatus, PositionStatus, RiskRules, Side, SubAccount};
use crate::price::PriceService;

#[derive(Debug, Clone)]
pub struct TradeValidationInput<'a> {
    pub sub_account_id: &'a str,
    pub symbol: &'a str,
    pub side: Side,
    pub quantity: f64,
    pub leverage: f64,
}

/// Values computed along the way, surfaced so the caller (executor) doesn't
/// have to redo the work after validation passes.
#[derive(Debug, Clone, Default)]
pub struct ComputedValues {
    pub price: f64,
    pub notional: f64,
    pub required_margin: f64,
    pub opposite_notional: f64,
    pub opposite_pnl: f64,
    pub total_upnl: f64,
    pub available_margin: f64,
    pub margin_usage_ratio: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<RiskError>,
    pub computed: ComputedValues,
}

pub struct TradeValidator<'a> {
    pub book: &'a PositionBook,
    pub prices: &'a PriceService,
}

impl<'a> TradeValidator<'a> {
    pub fn new(book: &'a PositionBook, prices: &'a PriceService) -> Self {
        Self { book, prices }
    }

    pub async fn validate(
        &self,
        input: TradeValidationInput<'_>,
        rules: RiskRules,
    ) -> ValidationResult {
        let mut errors = Vec::new();
        let mut computed = ComputedValues::default();

        // Step 1: account presence and status.
        let entry = self.book.get_entry(input.sub_account_id);
        let account: SubAccount = match entry.as_ref().and_then(|e| e.account.clone()) {
            Some(a) if a.status != AccountStatus::Active => {
                errors.push(RiskError::AccountFrozen(a.status));
                return ValidationResult { valid: false, errors, computed };
            }
            Some(a) => a,
            None => {
                errors.push(RiskError::AccountNotFound);
                return ValidationResult { valid: false, errors, computed };
            }
        };

        // Step 3: reference price, preferring the layered price service.
        let price = match self.prices.fresh_price(input.symbol).await {
            Ok(p) => p,
            Err(e) => {
                errors.push(e);
                return ValidationResult { valid: false, errors, computed };
            }
        };
        computed.price = price;

        // Step 4: notional / required margin.
        computed.notional = input.quantity * price;
        computed.required_margin = computed.notional / input.leverage;

        // Step 5: rule checks.
        if input.leverage > rules.max_leverage {
            errors.push(RiskError::MaxLeverage);
        }
        if computed.notional > rules.max_notional_per_trade {
            errors.push(RiskError::MaxNotional);
        }

        // Step 6: position-aware checks — opposite-side exposure for the flip path.
        let open_positions = self.book.open_positions_for(input.sub_account_id);
        let opposite = open_positions
            .iter()
            .find(|p| p.symbol == input.symbol && p.side == input.side.opposite());
        if let Some(opp) = opposite {
            let mark = self.prices.get_price(&opp.symbol).unwrap_or(price);
            computed.opposite_notional = opp.notional;
            computed.opposite_pnl = math::pnl(opp.side, opp.entry_price, mark, opp.quantity);
        }

        // Step 7: total exposure across the account including this trade.
        let current_total_notional: f64 = open_positions.iter().map(|p| p.notional).sum();
        let projected_exposure =
            current_total_notional - computed.opposite_notional + computed.notional;
        if projected_exposure > rules.max_total_exposure {
            errors.push(RiskError::MaxExposure);
        }

        // Step 8: total unrealized PnL across open positions, synchronous marks only.
        computed.total_upnl = open_positions
            .iter()
            .map(|p| {
                let mark = self.prices.get_price(&p.symbol).unwrap_or(p.entry_price);
                math::pnl(p.side, p.entry_price, mark, p.quantity)
            })
            .sum();

        // Step 9: available margin.
        let margin_input = AvailableMarginInput {
            balance: account.current_balance,
            maintenance_rate: account.maintenance_rate,
            total_upnl: computed.total_upnl,
            total_notional: current_total_notional,
            opposite_notional: computed.opposite_notional,
            opposite_pnl: computed.opposite_pnl,
        };
        let avail = math::available_margin(margin_input);
        computed.available_margin = avail.available;
        if avail.available < computed.required_margin {
            errors.push(RiskError::InsufficientMargin {
                required: computed.required_margin,
                available: avail.available,
            });
        }

        // Step 10: margin usage ratio, excluding the opposite position being flipped.
        let current_margin_used: f64 = open_positions
            .iter()
            .filter(|p| opposite.map(|o| o.id != p.id).unwrap_or(true))
            .map(|p| p.margin)
            .sum();
        computed.margin_usage_ratio =
            math::margin_usage_ratio(avail.equity, current_margin_used, computed.required_margin);
        if computed.margin_usage_ratio >= 0.98 {
            errors.push(RiskError::MarginRatioExceeded {
                ratio: computed.margin_usage_ratio,
            });
        }

        ValidationResult {
            valid: errors.is_empty(),
            errors,
            computed,
        }
    }

    /// Builds the cross-margin exposure vector for an account's open
    /// positions against the price service's current marks; used by the
    /// liquidation engine and by post-trade recomputation (§4.F step 5).
    pub fn exposures_for(&self, account_id: &str) -> Vec<(String, PositionExposure)> {
        self.book
            .open_positions_for(account_id)
            .into_iter()
            .map(|p| {
                let mark = self.prices.get_price(&p.symbol).unwrap_or(p.entry_price);
                (p.id.clone(), math::exposure_of(&p, mark))
            })
            .collect()
    }
}
