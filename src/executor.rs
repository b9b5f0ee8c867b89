//! Trade Executor (spec §4.F). Every public method here is one externally
//! synchronous, internally transactional operation against the book and the
//! durable store — modeled on the teacher's `vault::trade_executor`, which
//! wraps each mutating vault operation in the same "place order, then one
//! atomic state transition" shape.

use crate::book::PositionBook;
use crate::collab::{Broadcaster, DurableStore, ExchangeClient, KvStore, OrderRequest};
use crate::collections::BoundedOrderedMap;
use crate::errors::RiskError;
use crate::events::order_index::{OrderIndex, ENGINE_ORDER_PREFIX};
use crate::math;
use crate::models::{
    BalanceLog, CloseOutcome, CloseSource, Position, PositionStatus, RiskRules, Side, TradeAction,
    TradeExecution,
};
use crate::price::PriceService;
use crate::snapshot;
use crate::validator::{TradeValidationInput, TradeValidator};
use anyhow::{anyhow, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

/// Error substrings the exchange is known to return for an order against a
/// position it no longer has on file — a "ghost" close, not a real failure.
const GHOST_ERROR_PATTERNS: &[&str] = &["reduceOnly", "Invalid quantity", "-2022"];

/// TTL on the reconcile advisory lock (spec §5): long enough to cover one
/// reconcile pass, short enough that a crashed holder doesn't wedge the key.
const RECONCILE_LOCK_TTL: Duration = Duration::from_secs(10);

pub struct ExecuteTradeOptions {
    pub skip_validation: bool,
    pub fallback_price: Option<f64>,
}

impl Default for ExecuteTradeOptions {
    fn default() -> Self {
        Self {
            skip_validation: false,
            fallback_price: None,
        }
    }
}

pub struct TradeExecutor {
    book: Arc<PositionBook>,
    prices: Arc<PriceService>,
    exchange: Arc<dyn ExchangeClient>,
    store: Arc<dyn DurableStore>,
    kv: Arc<dyn KvStore>,
    broadcaster: Arc<dyn Broadcaster>,
    recently_closed: Mutex<BoundedOrderedMap<String, Instant>>,
    recently_closed_window: Duration,
    order_index: Arc<OrderIndex>,
    recompute_inflight: Arc<Mutex<HashSet<String>>>,
}

impl TradeExecutor {
    pub fn new(
        book: Arc<PositionBook>,
        prices: Arc<PriceService>,
        exchange: Arc<dyn ExchangeClient>,
        store: Arc<dyn DurableStore>,
        kv: Arc<dyn KvStore>,
        broadcaster: Arc<dyn Broadcaster>,
        recently_closed_window: Duration,
        order_index: Arc<OrderIndex>,
    ) -> Self {
        Self {
            book,
            prices,
            exchange,
            store,
            kv,
            broadcaster,
            recently_closed: Mutex::new(BoundedOrderedMap::new(4_096)),
            recently_closed_window,
            order_index,
            recompute_inflight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// spec §4.F step 5: writes a fresh risk snapshot straight to the KV
    /// cache (unthrottled, unlike the liquidation engine's periodic write) so
    /// readers see the trade's effect immediately.
    async fn write_fresh_snapshot(&self, account_id: &str, threshold: f64) {
        if let Some(snap) = snapshot::build(&self.book, &self.prices, account_id, threshold) {
            match serde_json::to_string(&snap) {
                Ok(serialized) => {
                    let key = format!("risk_snapshot:{account_id}");
                    if let Err(e) = self.kv.set_with_ttl(&key, serialized, Duration::from_secs(60)).await {
                        warn!(account_id, error = %e, "failed to publish post-trade risk snapshot");
                    }
                }
                Err(e) => warn!(account_id, error = %e, "failed to serialize post-trade risk snapshot"),
            }
        }
    }

    /// spec §4.F step 5: a trade on one symbol changes the account's shared
    /// margin, which moves every other open position's dynamic liquidation
    /// price. Recomputes them out-of-band so the hot trade path doesn't wait
    /// on it; deduplicated per account so a burst of trades on the same
    /// account doesn't spawn overlapping recomputes.
    fn schedule_liq_price_recompute(&self, account_id: &str, threshold: f64) {
        if !self.recompute_inflight.lock().insert(account_id.to_string()) {
            return;
        }
        let book = self.book.clone();
        let prices = self.prices.clone();
        let store = self.store.clone();
        let inflight = self.recompute_inflight.clone();
        let account_id = account_id.to_string();
        tokio::spawn(async move {
            recompute_liq_prices(&book, &prices, &store, &account_id, threshold).await;
            inflight.lock().remove(&account_id);
        });
    }

    fn new_client_order_id(&self, account_id: &str, symbol: &str) -> String {
        let id = format!("{ENGINE_ORDER_PREFIX}{}", Uuid::new_v4());
        self.order_index.record(&id, account_id, symbol);
        id
    }

    pub fn is_recently_closed(&self, symbol: &str) -> bool {
        self.recently_closed
            .lock()
            .get(&symbol.to_string())
            .map(|at| at.elapsed() < self.recently_closed_window)
            .unwrap_or(false)
    }

    fn mark_recently_closed(&self, symbol: &str) {
        self.recently_closed.lock().set(symbol.to_string(), Instant::now());
    }

    /// spec §4.F `executeTrade`.
    pub async fn execute_trade(
        &self,
        account_id: &str,
        symbol: &str,
        side: Side,
        quantity: f64,
        leverage: f64,
        rules: RiskRules,
        options: ExecuteTradeOptions,
    ) -> Result<(Position, TradeExecution)> {
        let account_lock = self.book.locks.get(account_id);
        let _guard = account_lock.lock().await;

        if !options.skip_validation {
            let validator = TradeValidator::new(&self.book, &self.prices);
            let result = validator
                .validate(
                    TradeValidationInput {
                        sub_account_id: account_id,
                        symbol,
                        side,
                        quantity,
                        leverage,
                    },
                    rules,
                )
                .await;
            if !result.valid {
                return Err(anyhow!(result.errors.into_iter().next().unwrap_or(RiskError::NoPrice)));
            }
        }

        self.exchange.set_leverage(symbol, leverage).await?;

        let opposite = self
            .book
            .open_positions_for(account_id)
            .into_iter()
            .find(|p| p.symbol == symbol && p.side == side.opposite());

        if let Some(opp) = opposite {
            self.flip(account_id, symbol, side, quantity, leverage, rules, opp, options)
                .await
        } else {
            self.open_or_add(account_id, symbol, side, quantity, leverage, rules, options)
                .await
        }
    }

    async fn open_or_add(
        &self,
        account_id: &str,
        symbol: &str,
        side: Side,
        quantity: f64,
        leverage: f64,
        rules: RiskRules,
        options: ExecuteTradeOptions,
    ) -> Result<(Position, TradeExecution)> {
        let ack = self
            .exchange
            .place_order(OrderRequest {
                client_order_id: self.new_client_order_id(account_id, symbol),
                symbol: symbol.to_string(),
                side,
                quantity,
                reduce_only: false,
                fallback_price: options.fallback_price,
            })
            .await?;
        let fill_price = ack
            .avg_price
            .or(options.fallback_price)
            .ok_or(RiskError::NoFillPrice)?;

        let same_side = self
            .book
            .open_positions_for(account_id)
            .into_iter()
            .find(|p| p.symbol == symbol && p.side == side);

        let account = self
            .book
            .get_entry(account_id)
            .and_then(|e| e.account)
            .ok_or(RiskError::AccountNotFound)?;

        let (position, action) = match same_side {
            Some(mut existing) => {
                let total_qty = existing.quantity + quantity;
                let weighted_entry =
                    (existing.entry_price * existing.quantity + fill_price * quantity) / total_qty;
                existing.entry_price = weighted_entry;
                existing.quantity = total_qty;
                existing.notional = total_qty * weighted_entry;
                existing.margin = existing.notional / leverage;
                existing.leverage = leverage;
                (existing, TradeAction::AddSameSide)
            }
            None => {
                let notional = quantity * fill_price;
                let margin = notional / leverage;
                let liq = math::liq_price(
                    side,
                    fill_price,
                    leverage,
                    account.current_balance,
                    notional,
                    account.maintenance_rate,
                    rules.liquidation_threshold,
                );
                (
                    Position {
                        id: Uuid::new_v4().to_string(),
                        sub_account_id: account_id.to_string(),
                        symbol: symbol.to_string(),
                        side,
                        entry_price: fill_price,
                        quantity,
                        notional,
                        leverage,
                        margin,
                        liquidation_price: liq,
                        babysitter_excluded: false,
                        opened_at: Utc::now(),
                        closed_at: None,
                        status: PositionStatus::Open,
                        realized_pnl: None,
                        taken_over_by: None,
                        taken_over_at: None,
                    },
                    TradeAction::Open,
                )
            }
        };

        let trade = TradeExecution {
            signature: math::signature(account_id, "open", &position.id),
            sub_account_id: account_id.to_string(),
            position_id: position.id.clone(),
            action,
            quantity,
            price: fill_price,
            fee: ack.fee,
            realized_pnl: 0.0,
            ts: Utc::now(),
        };

        self.book.add_position(position.clone());
        self.store.upsert_position(&position).await?;
        self.store.persist_trade(&trade).await?;

        let _ = self.exchange.subscribe_symbol(symbol).await;
        self.broadcaster.broadcast(
            "position_opened",
            serde_json::to_value(&position).unwrap_or_default(),
        );
        self.write_fresh_snapshot(account_id, rules.liquidation_threshold).await;
        self.schedule_liq_price_recompute(account_id, rules.liquidation_threshold);

        Ok((position, trade))
    }

    async fn flip(
        &self,
        account_id: &str,
        symbol: &str,
        side: Side,
        quantity: f64,
        leverage: f64,
        rules: RiskRules,
        opposite: Position,
        options: ExecuteTradeOptions,
    ) -> Result<(Position, TradeExecution)> {
        let total_qty = opposite.quantity + quantity;
        let ack = self
            .exchange
            .place_order(OrderRequest {
                client_order_id: self.new_client_order_id(account_id, symbol),
                symbol: symbol.to_string(),
                side,
                quantity: total_qty,
                reduce_only: false,
                fallback_price: options.fallback_price,
            })
            .await?;
        let fill_price = ack
            .avg_price
            .or(options.fallback_price)
            .ok_or(RiskError::NoFillPrice)?;

        // Close leg books first, so the new position's liq price uses the
        // post-PnL balance (spec §4.F ordering rule).
        let realized_pnl =
            math::pnl(opposite.side, opposite.entry_price, fill_price, opposite.quantity) - ack.fee;

        let mut account = self
            .book
            .get_entry(account_id)
            .and_then(|e| e.account)
            .ok_or(RiskError::AccountNotFound)?;
        let balance_before = account.current_balance;
        account.current_balance += realized_pnl;

        let mut closed = opposite.clone();
        closed.status = PositionStatus::Closed;
        closed.realized_pnl = Some(realized_pnl);
        closed.closed_at = Some(Utc::now());

        let close_trade = TradeExecution {
            signature: math::signature(account_id, "flip_close", &closed.id),
            sub_account_id: account_id.to_string(),
            position_id: closed.id.clone(),
            action: TradeAction::Flip,
            quantity: opposite.quantity,
            price: fill_price,
            fee: ack.fee,
            realized_pnl,
            ts: Utc::now(),
        };
        let balance_log = BalanceLog {
            sub_account_id: account_id.to_string(),
            balance_before,
            balance_after: account.current_balance,
            delta: realized_pnl,
            reason: "flip_close".to_string(),
            trade_signature: Some(close_trade.signature.clone()),
            ts: Utc::now(),
        };

        self.book.remove_position(account_id, &closed.id);
        self.book.update_position(closed.clone());
        self.book.upsert_account(account.clone());
        self.store.upsert_position(&closed).await?;
        self.store.persist_trade(&close_trade).await?;
        self.store.persist_balance_log(&balance_log).await?;
        self.store.upsert_account(&account).await?;

        let new_notional = quantity * fill_price;
        let new_margin = new_notional / leverage;
        let liq = math::liq_price(
            side,
            fill_price,
            leverage,
            account.current_balance,
            new_notional,
            account.maintenance_rate,
            rules.liquidation_threshold,
        );
        let new_position = Position {
            id: Uuid::new_v4().to_string(),
            sub_account_id: account_id.to_string(),
            symbol: symbol.to_string(),
            side,
            entry_price: fill_price,
            quantity,
            notional: new_notional,
            leverage,
            margin: new_margin,
            liquidation_price: liq,
            babysitter_excluded: false,
            opened_at: Utc::now(),
            closed_at: None,
            status: PositionStatus::Open,
            realized_pnl: None,
            taken_over_by: None,
            taken_over_at: None,
        };
        let open_trade = TradeExecution {
            signature: math::signature(account_id, "flip_open", &new_position.id),
            sub_account_id: account_id.to_string(),
            position_id: new_position.id.clone(),
            action: TradeAction::Flip,
            quantity,
            price: fill_price,
            fee: 0.0,
            realized_pnl: 0.0,
            ts: Utc::now(),
        };

        self.book.add_position(new_position.clone());
        self.store.upsert_position(&new_position).await?;
        self.store.persist_trade(&open_trade).await?;
        let _ = self.exchange.subscribe_symbol(symbol).await;

        self.broadcaster.broadcast(
            "position_flipped",
            serde_json::to_value(&new_position).unwrap_or_default(),
        );
        self.write_fresh_snapshot(account_id, rules.liquidation_threshold).await;
        self.schedule_liq_price_recompute(account_id, rules.liquidation_threshold);

        Ok((new_position, open_trade))
    }

    /// spec §4.F `closePosition`.
    pub async fn close_position(&self, account_id: &str, position_id: &str) -> Result<CloseOutcome> {
        let account_lock = self.book.locks.get(account_id);
        let _guard = account_lock.lock().await;

        let position = self
            .book
            .get_position(account_id, position_id)
            .ok_or(RiskError::PositionNotFound)?;
        if position.status != PositionStatus::Open {
            return Err(anyhow!(RiskError::PositionClosed));
        }

        let exchange_positions = self
            .exchange
            .fetch_positions(&position.symbol)
            .await
            .unwrap_or_default();
        let desynced = !exchange_positions.iter().any(|p| p.side == position.side);

        if desynced {
            let mark = self.prices.get_price(&position.symbol).unwrap_or(position.entry_price);
            return self
                .finish_close(&position, mark, 0.0, CloseSource::VirtualOnly)
                .await;
        }

        self.mark_recently_closed(&position.symbol);
        let ack = self
            .exchange
            .place_order(OrderRequest {
                client_order_id: self.new_client_order_id(account_id, &position.symbol),
                symbol: position.symbol.clone(),
                side: position.side.opposite(),
                quantity: position.quantity,
                reduce_only: true,
                fallback_price: None,
            })
            .await;

        match ack {
            Ok(ack) => {
                let price = ack
                    .avg_price
                    .unwrap_or_else(|| self.prices.get_price(&position.symbol).unwrap_or(position.entry_price));
                self.finish_close(&position, price, ack.fee, CloseSource::Exchange).await
            }
            Err(e) if is_ghost_error(&e) => {
                warn!(symbol = %position.symbol, "ghost close pattern matched, falling back to virtual close");
                let mark = self.prices.get_price(&position.symbol).unwrap_or(position.entry_price);
                self.finish_close(&position, mark, 0.0, CloseSource::VirtualOnly).await
            }
            Err(e) => Err(e),
        }
    }

    async fn finish_close(
        &self,
        position: &Position,
        close_price: f64,
        fee: f64,
        source: CloseSource,
    ) -> Result<CloseOutcome> {
        let realized_pnl = math::pnl(position.side, position.entry_price, close_price, position.quantity) - fee;

        let mut account = self
            .book
            .get_entry(&position.sub_account_id)
            .and_then(|e| e.account)
            .ok_or(RiskError::AccountNotFound)?;
        let balance_before = account.current_balance;
        account.current_balance += realized_pnl;

        let mut closed = position.clone();
        closed.status = PositionStatus::Closed;
        closed.realized_pnl = Some(realized_pnl);
        closed.closed_at = Some(Utc::now());

        let trade = TradeExecution {
            signature: math::signature(&position.sub_account_id, "close", &position.id),
            sub_account_id: position.sub_account_id.clone(),
            position_id: position.id.clone(),
            action: TradeAction::Close,
            quantity: position.quantity,
            price: close_price,
            fee,
            realized_pnl,
            ts: Utc::now(),
        };
        let balance_log = BalanceLog {
            sub_account_id: position.sub_account_id.clone(),
            balance_before,
            balance_after: account.current_balance,
            delta: realized_pnl,
            reason: "close".to_string(),
            trade_signature: Some(trade.signature.clone()),
            ts: Utc::now(),
        };

        self.book.remove_position(&position.sub_account_id, &position.id);
        self.book.update_position(closed.clone());
        self.book.upsert_account(account.clone());
        self.store.upsert_position(&closed).await?;
        self.store.persist_trade(&trade).await?;
        self.store.persist_balance_log(&balance_log).await?;
        self.store.upsert_account(&account).await?;

        self.broadcaster
            .broadcast("position_closed", serde_json::to_value(&closed).unwrap_or_default());

        Ok(CloseOutcome {
            position: closed,
            trade,
            balance_log,
            source,
        })
    }

    /// spec §4.F `liquidatePosition`: resilient close, never fails the
    /// internal state change on an exchange-side rejection.
    pub async fn liquidate_position(&self, account_id: &str, position_id: &str) -> Result<CloseOutcome> {
        let account_lock = self.book.locks.get(account_id);
        let _guard = account_lock.lock().await;

        let position = self
            .book
            .get_position(account_id, position_id)
            .ok_or(RiskError::PositionNotFound)?;
        let mark = self.prices.get_price(&position.symbol).unwrap_or(position.entry_price);

        let ack = self
            .exchange
            .place_order(OrderRequest {
                client_order_id: self.new_client_order_id(account_id, &position.symbol),
                symbol: position.symbol.clone(),
                side: position.side.opposite(),
                quantity: position.quantity,
                reduce_only: true,
                fallback_price: Some(mark),
            })
            .await;

        let (close_price, fee) = match ack {
            Ok(ack) => (ack.avg_price.unwrap_or(mark), ack.fee),
            Err(e) => {
                warn!(error = %e, position_id, "exchange rejected liquidation order, closing virtually anyway");
                (mark, 0.0)
            }
        };

        let mut outcome = self.finish_close(&position, close_price, fee, CloseSource::Exchange).await?;
        outcome.position.status = PositionStatus::Liquidated;
        self.book.update_position(outcome.position.clone());
        self.store.upsert_position(&outcome.position).await?;
        Ok(outcome)
    }

    /// spec §4.F `partialClose`.
    pub async fn partial_close(
        &self,
        account_id: &str,
        position_id: &str,
        fraction: f64,
        action: TradeAction,
    ) -> Result<CloseOutcome> {
        let account_lock = self.book.locks.get(account_id);
        let _guard = account_lock.lock().await;

        let position = self
            .book
            .get_position(account_id, position_id)
            .ok_or(RiskError::PositionNotFound)?;
        if position.status != PositionStatus::Open {
            return Err(anyhow!(RiskError::PositionClosed));
        }
        let close_qty = position.quantity * fraction;
        let mark = self.prices.get_price(&position.symbol).unwrap_or(position.entry_price);

        let ack = self
            .exchange
            .place_order(OrderRequest {
                client_order_id: self.new_client_order_id(account_id, &position.symbol),
                symbol: position.symbol.clone(),
                side: position.side.opposite(),
                quantity: close_qty,
                reduce_only: true,
                fallback_price: Some(mark),
            })
            .await;
        let (price, fee) = match ack {
            Ok(ack) => (ack.avg_price.unwrap_or(mark), ack.fee),
            Err(_) => (mark, 0.0),
        };

        let realized_pnl = math::pnl(position.side, position.entry_price, price, close_qty) - fee;
        let remaining_qty = position.quantity - close_qty;

        let mut account = self
            .book
            .get_entry(account_id)
            .and_then(|e| e.account)
            .ok_or(RiskError::AccountNotFound)?;
        let balance_before = account.current_balance;
        account.current_balance += realized_pnl;

        let mut residual = position.clone();
        residual.quantity = remaining_qty;
        residual.notional = remaining_qty * position.entry_price;
        residual.margin = residual.notional / position.leverage;

        let trade = TradeExecution {
            signature: math::signature(account_id, "partial_close", &position.id),
            sub_account_id: account_id.to_string(),
            position_id: position.id.clone(),
            action,
            quantity: close_qty,
            price,
            fee,
            realized_pnl,
            ts: Utc::now(),
        };
        let balance_log = BalanceLog {
            sub_account_id: account_id.to_string(),
            balance_before,
            balance_after: account.current_balance,
            delta: realized_pnl,
            reason: "partial_close".to_string(),
            trade_signature: Some(trade.signature.clone()),
            ts: Utc::now(),
        };

        self.book.update_position(residual.clone());
        self.book.upsert_account(account.clone());
        self.store.upsert_position(&residual).await?;
        self.store.persist_trade(&trade).await?;
        self.store.persist_balance_log(&balance_log).await?;
        self.store.upsert_account(&account).await?;

        self.broadcaster
            .broadcast("position_partially_closed", serde_json::to_value(&residual).unwrap_or_default());

        Ok(CloseOutcome {
            position: residual,
            trade,
            balance_log,
            source: CloseSource::Exchange,
        })
    }

    /// spec §4.F `takeoverPosition`: virtual only, never touches the exchange.
    pub async fn takeover_position(
        &self,
        account_id: &str,
        position_id: &str,
        admin_user_id: &str,
    ) -> Result<CloseOutcome> {
        let account_lock = self.book.locks.get(account_id);
        let _guard = account_lock.lock().await;

        let position = self
            .book
            .get_position(account_id, position_id)
            .ok_or(RiskError::PositionNotFound)?;
        let mark = self.prices.get_price(&position.symbol).unwrap_or(position.entry_price);
        let realized_pnl = math::pnl(position.side, position.entry_price, mark, position.quantity);

        let mut account = self
            .book
            .get_entry(account_id)
            .and_then(|e| e.account)
            .ok_or(RiskError::AccountNotFound)?;
        let balance_before = account.current_balance;
        account.current_balance += realized_pnl;

        let mut taken = position.clone();
        taken.status = PositionStatus::TakenOver;
        taken.realized_pnl = Some(realized_pnl);
        taken.closed_at = Some(Utc::now());
        taken.taken_over_by = Some(admin_user_id.to_string());
        taken.taken_over_at = Some(Utc::now());

        let trade = TradeExecution {
            signature: math::signature(account_id, "takeover", &position.id),
            sub_account_id: account_id.to_string(),
            position_id: position.id.clone(),
            action: TradeAction::Takeover,
            quantity: position.quantity,
            price: mark,
            fee: 0.0,
            realized_pnl,
            ts: Utc::now(),
        };
        let balance_log = BalanceLog {
            sub_account_id: account_id.to_string(),
            balance_before,
            balance_after: account.current_balance,
            delta: realized_pnl,
            reason: "takeover".to_string(),
            trade_signature: Some(trade.signature.clone()),
            ts: Utc::now(),
        };

        self.book.remove_position(account_id, &position.id);
        self.book.update_position(taken.clone());
        self.book.upsert_account(account.clone());
        self.store.upsert_position(&taken).await?;
        self.store.persist_trade(&trade).await?;
        self.store.persist_balance_log(&balance_log).await?;
        self.store.upsert_account(&account).await?;

        self.broadcaster
            .broadcast("position_taken_over", serde_json::to_value(&taken).unwrap_or_default());

        Ok(CloseOutcome {
            position: taken,
            trade,
            balance_log,
            source: CloseSource::VirtualOnly,
        })
    }

    /// spec §4.F `reconcilePosition`: close every OPEN virtual position on
    /// `symbol` at `close_price`. Idempotent by re-reading the book inside
    /// the loop so a position closed by another path is simply skipped.
    /// Guarded by the fail-closed reconcile advisory lock (spec §5) so this
    /// process and a sidecar reconciling the same symbol never double-close.
    pub async fn reconcile_position(&self, symbol: &str, close_price: f64) -> Result<Vec<CloseOutcome>> {
        let lock_key = format!("lock:reconcile:{symbol}");
        match self.kv.try_lock(&lock_key, RECONCILE_LOCK_TTL).await {
            Ok(true) => {}
            Ok(false) => {
                info!(symbol, "reconcile lock held elsewhere, skipping this pass");
                return Ok(Vec::new());
            }
            Err(e) => {
                warn!(symbol, error = %e, "reconcile lock acquisition failed, skipping this pass (fail-closed)");
                return Ok(Vec::new());
            }
        }

        let accounts = self.book.get_accounts_for_symbol(symbol);
        let mut outcomes = Vec::new();
        for account_id in accounts {
            let account_lock = self.book.locks.get(&account_id);
            let _guard = account_lock.lock().await;

            let positions: Vec<Position> = self
                .book
                .open_positions_for(&account_id)
                .into_iter()
                .filter(|p| p.symbol == symbol)
                .collect();
            for position in positions {
                // Re-read: another path (fill handler, liquidation) may have
                // already closed it between the scan and this iteration.
                if self.book.get_position(&account_id, &position.id).map(|p| p.status) != Some(PositionStatus::Open) {
                    continue;
                }
                match self.finish_close(&position, close_price, 0.0, CloseSource::VirtualOnly).await {
                    Ok(outcome) => {
                        info!(position_id = %position.id, "reconciled position to zero");
                        outcomes.push(outcome);
                    }
                    Err(e) => warn!(position_id = %position.id, error = %e, "reconcile close failed"),
                }
            }
        }
        Ok(outcomes)
    }
}

/// Recomputes and persists every open position's dynamic liquidation price
/// for one account, holding the others' marks fixed. Best-effort: logs and
/// drops individual store write failures rather than retrying.
async fn recompute_liq_prices(
    book: &PositionBook,
    prices: &PriceService,
    store: &Arc<dyn DurableStore>,
    account_id: &str,
    threshold: f64,
) {
    let Some(entry) = book.get_entry(account_id) else { return };
    let Some(account) = entry.account else { return };
    let open: Vec<Position> = entry
        .positions
        .into_values()
        .filter(|p| p.status == PositionStatus::Open)
        .collect();
    if open.is_empty() {
        return;
    }

    let exposures: Vec<math::PositionExposure> = open
        .iter()
        .map(|p| math::exposure_of(p, prices.get_price(&p.symbol).unwrap_or(p.entry_price)))
        .collect();
    let liqs = math::dynamic_liq_prices(account.current_balance, &exposures, account.maintenance_rate, threshold);

    for (mut position, liq) in open.into_iter().zip(liqs.into_iter()) {
        if (position.liquidation_price - liq).abs() < f64::EPSILON {
            continue;
        }
        position.liquidation_price = liq;
        book.update_position(position.clone());
        if let Err(e) = store.upsert_position(&position).await {
            warn!(account_id, position_id = %position.id, error = %e, "failed to persist recomputed liq price");
        }
    }
}

fn is_ghost_error(err: &anyhow::Error) -> bool {
    let message = err.to_string();
    GHOST_ERROR_PATTERNS.iter().any(|p| message.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{InMemoryKv, InMemoryStore, PaperExchange, RecordingBroadcaster};
    use crate::models::{AccountStatus, LiquidationMode, SubAccount};

    fn make_executor() -> (TradeExecutor, Arc<PositionBook>, Arc<InMemoryStore>, Arc<PaperExchange>, Arc<RecordingBroadcaster>) {
        let book = Arc::new(PositionBook::new());
        let exchange = Arc::new(PaperExchange::new());
        let store = Arc::new(InMemoryStore::new());
        let broadcaster = Arc::new(RecordingBroadcaster::new());
        let kv = Arc::new(InMemoryKv::new());
        let prices = Arc::new(PriceService::new(kv.clone(), exchange.clone(), Duration::from_secs(10)));
        let executor = TradeExecutor::new(
            book.clone(),
            prices,
            exchange.clone(),
            store.clone(),
            kv,
            broadcaster.clone(),
            Duration::from_secs(5),
            Arc::new(OrderIndex::new(1_024)),
        );
        (executor, book, store, exchange, broadcaster)
    }

    fn seed_account(book: &PositionBook, id: &str) {
        book.upsert_account(SubAccount {
            id: id.to_string(),
            user_id: "u1".to_string(),
            name: "main".to_string(),
            current_balance: 10_000.0,
            maintenance_rate: 0.01,
            liquidation_mode: LiquidationMode::Adl30,
            status: AccountStatus::Active,
        });
    }

    #[tokio::test]
    async fn open_then_close_round_trips_balance() {
        let (executor, book, store, exchange, _broadcaster) = make_executor();
        seed_account(&book, "a1");
        exchange.set_ticker("BTC", 100.0);

        let (position, _trade) = executor
            .execute_trade(
                "a1",
                "BTC",
                Side::Long,
                1.0,
                5.0,
                RiskRules::default(),
                ExecuteTradeOptions { skip_validation: true, fallback_price: None },
            )
            .await
            .unwrap();
        assert_eq!(position.entry_price, 100.0);

        exchange.set_positions("BTC", vec![crate::collab::ExchangePosition { symbol: "BTC".to_string(), side: Side::Long, quantity: 1.0 }]);
        exchange.set_ticker("BTC", 120.0);
        let outcome = executor.close_position("a1", &position.id).await.unwrap();
        assert_eq!(outcome.trade.realized_pnl, 20.0);
        assert_eq!(store.trade_count(), 2);
        assert_eq!(store.balance_log_count(), 1);
        let account = store.get_account("a1").unwrap();
        assert_eq!(account.current_balance, 10_020.0);
    }

    /// spec §5: trade mutations on one account are serialized. Two concurrent
    /// opens on the same (account, symbol, side) must merge into a single
    /// position rather than racing into two, even though both read the book
    /// before either writes to it.
    #[tokio::test]
    async fn concurrent_same_side_opens_on_one_account_serialize_into_one_position() {
        let (executor, book, _store, exchange, _broadcaster) = make_executor();
        seed_account(&book, "a1");
        exchange.set_ticker("BTC", 100.0);

        let trade_a = executor.execute_trade(
            "a1",
            "BTC",
            Side::Long,
            1.0,
            5.0,
            RiskRules::default(),
            ExecuteTradeOptions { skip_validation: true, fallback_price: None },
        );
        let trade_b = executor.execute_trade(
            "a1",
            "BTC",
            Side::Long,
            1.0,
            5.0,
            RiskRules::default(),
            ExecuteTradeOptions { skip_validation: true, fallback_price: None },
        );
        let (first, second) = tokio::join!(trade_a, trade_b);
        first.unwrap();
        second.unwrap();

        let open = book.open_positions_for("a1");
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].quantity, 2.0);
    }

    #[tokio::test]
    async fn close_falls_back_to_virtual_when_desynced() {
        let (executor, book, _store, exchange, _broadcaster) = make_executor();
        seed_account(&book, "a1");
        exchange.set_ticker("BTC", 100.0);
        let (position, _) = executor
            .execute_trade(
                "a1",
                "BTC",
                Side::Long,
                1.0,
                5.0,
                RiskRules::default(),
                ExecuteTradeOptions { skip_validation: true, fallback_price: None },
            )
            .await
            .unwrap();

        // exchange reports no matching position -> desynced
        let outcome = executor.close_position("a1", &position.id).await.unwrap();
        assert_eq!(outcome.source, CloseSource::VirtualOnly);
    }

    #[tokio::test]
    async fn flip_books_close_pnl_before_opening_new_position() {
        let (executor, book, _store, exchange, _broadcaster) = make_executor();
        seed_account(&book, "a1");
        exchange.set_ticker("BTC", 100.0);
        let (long_pos, _) = executor
            .execute_trade(
                "a1",
                "BTC",
                Side::Long,
                2.0,
                5.0,
                RiskRules::default(),
                ExecuteTradeOptions { skip_validation: true, fallback_price: None },
            )
            .await
            .unwrap();

        exchange.set_ticker("BTC", 150.0);
        let (short_pos, _) = executor
            .execute_trade(
                "a1",
                "BTC",
                Side::Short,
                3.0,
                5.0,
                RiskRules::default(),
                ExecuteTradeOptions { skip_validation: true, fallback_price: None },
            )
            .await
            .unwrap();

        assert_ne!(short_pos.id, long_pos.id);
        assert_eq!(short_pos.side, Side::Short);
        assert_eq!(short_pos.quantity, 3.0);
        let account = book.get_entry("a1").unwrap().account.unwrap();
        assert_eq!(account.current_balance, 10_100.0); // (150-100)*2
    }

    #[tokio::test]
    async fn liquidate_marks_position_liquidated() {
        let (executor, book, _store, exchange, _broadcaster) = make_executor();
        seed_account(&book, "a1");
        exchange.set_ticker("BTC", 100.0);
        let (position, _) = executor
            .execute_trade(
                "a1",
                "BTC",
                Side::Long,
                1.0,
                5.0,
                RiskRules::default(),
                ExecuteTradeOptions { skip_validation: true, fallback_price: None },
            )
            .await
            .unwrap();

        let outcome = executor.liquidate_position("a1", &position.id).await.unwrap();
        assert_eq!(outcome.position.status, PositionStatus::Liquidated);
    }

    #[tokio::test]
    async fn reconcile_closes_every_open_position_on_the_symbol() {
        let (executor, book, _store, exchange, _broadcaster) = make_executor();
        seed_account(&book, "a1");
        exchange.set_ticker("BTC", 100.0);
        executor
            .execute_trade(
                "a1",
                "BTC",
                Side::Long,
                1.0,
                5.0,
                RiskRules::default(),
                ExecuteTradeOptions { skip_validation: true, fallback_price: None },
            )
            .await
            .unwrap();

        let outcomes = executor.reconcile_position("BTC", 0.0).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(book.open_positions_for("a1").is_empty());
    }

    #[tokio::test]
    async fn reconcile_skips_when_the_advisory_lock_is_already_held() {
        let book = Arc::new(PositionBook::new());
        let exchange = Arc::new(PaperExchange::new());
        let store = Arc::new(InMemoryStore::new());
        let broadcaster = Arc::new(RecordingBroadcaster::new());
        let kv = Arc::new(InMemoryKv::new());
        let prices = Arc::new(PriceService::new(kv.clone(), exchange.clone(), Duration::from_secs(10)));
        let executor = TradeExecutor::new(
            book.clone(),
            prices,
            exchange.clone(),
            store,
            kv.clone(),
            broadcaster,
            Duration::from_secs(5),
            Arc::new(OrderIndex::new(1_024)),
        );
        seed_account(&book, "a1");
        exchange.set_ticker("BTC", 100.0);
        executor
            .execute_trade(
                "a1",
                "BTC",
                Side::Long,
                1.0,
                5.0,
                RiskRules::default(),
                ExecuteTradeOptions { skip_validation: true, fallback_price: None },
            )
            .await
            .unwrap();

        kv.try_lock("lock:reconcile:BTC", Duration::from_secs(30)).await.unwrap();
        let outcomes = executor.reconcile_position("BTC", 0.0).await.unwrap();
        assert!(outcomes.is_empty());
        assert_eq!(book.open_positions_for("a1").len(), 1);
    }
}
