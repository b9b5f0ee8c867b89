//! Per-event-type handlers dispatched by the router (spec §4.H).

use super::order_index::OrderIndex;
use crate::book::PositionBook;
use crate::collab::{Broadcaster, DurableStore};
use crate::executor::TradeExecutor;
use crate::models::{BalanceLog, OrderStatus, PositionStatus, Side, TradeAction, TradeExecution};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct HandlerContext {
    pub book: Arc<PositionBook>,
    pub executor: Arc<TradeExecutor>,
    pub store: Arc<dyn DurableStore>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub order_index: Arc<OrderIndex>,
}

/// `order_update` with status FILLED/PARTIALLY_FILLED.
///
/// Ghost guard: a fill with no matching in-memory position, on a symbol in
/// the "recently closed" window, whose client order id did *not* originate
/// inside this engine, is almost certainly a stale ACCOUNT_UPDATE echo from
/// an order this process already reconciled — skip it.
pub async fn handle_fill(
    ctx: &HandlerContext,
    client_order_id: &str,
    symbol: &str,
    side: Side,
    fill_qty: f64,
    fill_price: f64,
) {
    let origin = ctx.order_index.lookup(client_order_id);
    let engine_originated = OrderIndex::is_engine_originated(client_order_id);

    let account_id = match origin {
        Some((account_id, _)) => account_id,
        None => {
            if !engine_originated && ctx.executor.is_recently_closed(symbol) {
                warn!(client_order_id, symbol, "ghost fill suppressed: unknown order, symbol recently closed");
                return;
            }
            // Unroutable fill with no account context and no recently-closed
            // suppression reason — nothing more we can safely do with it.
            info!(client_order_id, symbol, "fill event has no resolvable account, relaying only");
            return;
        }
    };

    let existing = ctx
        .book
        .open_positions_for(&account_id)
        .into_iter()
        .find(|p| p.symbol == symbol && p.side == side);

    if existing.is_none() && ctx.executor.is_recently_closed(symbol) && !engine_originated {
        warn!(account_id, symbol, "ghost fill suppressed for known account in recently-closed window");
        return;
    }

    let position = match existing {
        Some(mut p) => {
            let total_qty = p.quantity + fill_qty;
            p.entry_price = (p.entry_price * p.quantity + fill_price * fill_qty) / total_qty;
            p.quantity = total_qty;
            p.notional = total_qty * p.entry_price;
            p
        }
        None => crate::models::Position {
            id: uuid::Uuid::new_v4().to_string(),
            sub_account_id: account_id.clone(),
            symbol: symbol.to_string(),
            side,
            entry_price: fill_price,
            quantity: fill_qty,
            notional: fill_qty * fill_price,
            leverage: 1.0,
            margin: fill_qty * fill_price,
            liquidation_price: 0.0,
            babysitter_excluded: false,
            opened_at: Utc::now(),
            closed_at: None,
            status: PositionStatus::Open,
            realized_pnl: None,
            taken_over_by: None,
            taken_over_at: None,
        },
    };

    ctx.book.update_position(position.clone());
    // Fire-and-forget durable write: book state must be visible to the next
    // tick immediately, the store write trails behind with a bounded error log.
    let store = ctx.store.clone();
    let to_persist = position.clone();
    tokio::spawn(async move {
        if let Err(e) = store.upsert_position(&to_persist).await {
            warn!(error = %e, "failed to persist fill-derived position");
        }
    });
}

/// `order_update` with status CANCELED.
pub fn handle_cancel(ctx: &HandlerContext, internal_order_id: &str) {
    ctx.broadcaster.broadcast(
        "order_canceled",
        serde_json::json!({"internal_order_id": internal_order_id}),
    );
}

/// `order_update` with status REJECTED/EXPIRED.
pub fn handle_rejection(ctx: &HandlerContext, internal_order_id: &str, status: OrderStatus) {
    warn!(internal_order_id, ?status, "order rejected or expired");
    ctx.broadcaster.broadcast(
        "order_rejected",
        serde_json::json!({"internal_order_id": internal_order_id, "status": status}),
    );
}

/// `position_update` with status CLOSED: durable-transactional close, not
/// driven by the executor (the exchange has already settled it).
pub async fn handle_position_closed(
    ctx: &HandlerContext,
    sub_account_id: &str,
    position_id: &str,
    entry_price: f64,
    quantity: f64,
    side: Side,
) {
    let mark = entry_price;
    let realized_pnl = crate::math::pnl(side, entry_price, mark, quantity);

    let mut account = match ctx.book.get_entry(sub_account_id).and_then(|e| e.account) {
        Some(a) => a,
        None => {
            warn!(sub_account_id, "position_update CLOSED for unknown account");
            return;
        }
    };
    let balance_before = account.current_balance;
    account.current_balance += realized_pnl;

    if let Some(mut position) = ctx.book.get_position(sub_account_id, position_id) {
        position.status = PositionStatus::Closed;
        position.realized_pnl = Some(realized_pnl);
        position.closed_at = Some(Utc::now());
        ctx.book.remove_position(sub_account_id, position_id);
        ctx.book.update_position(position.clone());
        ctx.book.upsert_account(account.clone());

        let trade = TradeExecution {
            signature: crate::math::signature(sub_account_id, "event_close", position_id),
            sub_account_id: sub_account_id.to_string(),
            position_id: position_id.to_string(),
            action: TradeAction::Close,
            quantity,
            price: mark,
            fee: 0.0,
            realized_pnl,
            ts: Utc::now(),
        };
        let balance_log = BalanceLog {
            sub_account_id: sub_account_id.to_string(),
            balance_before,
            balance_after: account.current_balance,
            delta: realized_pnl,
            reason: "event_close".to_string(),
            trade_signature: Some(trade.signature.clone()),
            ts: Utc::now(),
        };

        if let Err(e) = ctx.store.upsert_position(&position).await {
            warn!(error = %e, "failed to persist event-driven close");
        }
        if let Err(e) = ctx.store.persist_trade(&trade).await {
            warn!(error = %e, "failed to persist event-driven close trade");
        }
        if let Err(e) = ctx.store.persist_balance_log(&balance_log).await {
            warn!(error = %e, "failed to persist event-driven close balance log");
        }
        if let Err(e) = ctx.store.upsert_account(&account).await {
            warn!(error = %e, "failed to persist event-driven close account balance");
        }

        ctx.broadcaster
            .broadcast("position_closed", serde_json::to_value(&position).unwrap_or_default());
    }
}

/// `trade_execution`, `risk_snapshot`, `margin_snapshot`, `positions_snapshot`,
/// and engine error events — pure relay to the broadcaster, no state change.
pub fn relay(ctx: &HandlerContext, event_type: &str, payload: serde_json::Value) {
    ctx.broadcaster.broadcast(event_type, payload);
}
