//! Dispatches validated, deduplicated engine events to their handlers
//! (spec §4.H). Grounded in the teacher's `middleware::logging` request-id
//! threading — every event carries a `request_id` the way every HTTP
//! request there carries one.

use super::handlers::{self, HandlerContext};
use crate::collections::BoundedOrderedSet;
use crate::errors::RiskError;
use crate::models::{EngineEvent, OrderStatus};
use parking_lot::Mutex;
use tracing::{debug, warn};

pub struct EventRouter {
    ctx: HandlerContext,
    seen: Mutex<BoundedOrderedSet<String>>,
}

impl EventRouter {
    pub fn new(ctx: HandlerContext, dedup_capacity: usize) -> Self {
        Self {
            ctx,
            seen: Mutex::new(BoundedOrderedSet::new(dedup_capacity)),
        }
    }

    /// Validates, dedups, and dispatches one event. Returns `Ok(())` for
    /// anything handled or intentionally skipped (dedup hit, unknown type);
    /// returns a `RiskError` only for a schema violation.
    pub async fn route(&self, event: EngineEvent) -> Result<(), RiskError> {
        validate_schema(&event)?;

        let key = event.dedup_key();
        if !self.seen.lock().insert_seen(key) {
            debug!("duplicate event skipped");
            return Ok(());
        }

        match event {
            EngineEvent::OrderUpdate { status, internal_order_id, .. } => match status {
                OrderStatus::Filled | OrderStatus::PartiallyFilled => {
                    // `order_update` carries no fill price on the wire (§6's
                    // required-field table); the paired `trade_execution`
                    // event carries `fill_price` and is what actually drives
                    // the fill handler below, so there's nothing to dispatch
                    // from this event beyond recording it as seen.
                }
                OrderStatus::Canceled => handlers::handle_cancel(&self.ctx, &internal_order_id),
                OrderStatus::Rejected | OrderStatus::Expired => {
                    handlers::handle_rejection(&self.ctx, &internal_order_id, status)
                }
                OrderStatus::New | OrderStatus::Ack | OrderStatus::Accepted => {
                    self.ctx.broadcaster.broadcast(
                        "order_acked",
                        serde_json::json!({"internal_order_id": internal_order_id, "status": status}),
                    );
                }
            },
            EngineEvent::TradeExecutionEvent {
                client_order_id,
                symbol,
                side,
                fill_qty,
                fill_price,
                ..
            } => {
                handlers::handle_fill(&self.ctx, &client_order_id, &symbol, side, fill_qty, fill_price).await;
            }
            EngineEvent::PositionUpdate {
                position_id,
                sub_account_id,
                status,
                entry_price,
                quantity,
                side,
                ..
            } => {
                if status == crate::models::PositionStatus::Closed {
                    handlers::handle_position_closed(
                        &self.ctx,
                        &sub_account_id,
                        &position_id,
                        entry_price,
                        quantity,
                        side,
                    )
                    .await;
                }
                // Non-close position_update messages don't mutate state: the
                // fill handler is authoritative for opens/adds (spec §4.H).
            }
            EngineEvent::Error { op, reason, .. } => {
                warn!(op, reason, "engine error event relayed");
                handlers::relay(&self.ctx, "engine_error", serde_json::json!({"op": op, "reason": reason}));
            }
            EngineEvent::RiskSnapshotEvent { sub_account_id, .. } => {
                handlers::relay(&self.ctx, "risk_snapshot", serde_json::json!({"sub_account_id": sub_account_id}));
            }
            EngineEvent::MarginSnapshotEvent { sub_account_id, .. } => {
                handlers::relay(&self.ctx, "margin_snapshot", serde_json::json!({"sub_account_id": sub_account_id}));
            }
            EngineEvent::PositionsSnapshotEvent { .. } => {
                handlers::relay(&self.ctx, "positions_snapshot", serde_json::json!({}));
            }
            EngineEvent::Unknown { request_id } => {
                debug!(request_id, "unknown event type passed through without dispatch");
            }
        }

        Ok(())
    }
}

/// Minimal required-field check per event type (spec §4.H "schema"). The
/// tagged enum deserialization already enforces shape; this catches the
/// handful of fields that are present-but-empty, which serde alone won't.
fn validate_schema(event: &EngineEvent) -> Result<(), RiskError> {
    match event {
        EngineEvent::PositionUpdate { position_id, sub_account_id, .. }
            if position_id.is_empty() || sub_account_id.is_empty() =>
        {
            Err(RiskError::SchemaViolation("position_update missing position_id or sub_account_id".to_string()))
        }
        EngineEvent::OrderUpdate { internal_order_id, .. } if internal_order_id.is_empty() => {
            Err(RiskError::SchemaViolation("order_update missing internal_order_id".to_string()))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::PositionBook;
    use crate::collab::{InMemoryKv, InMemoryStore, PaperExchange, RecordingBroadcaster};
    use crate::events::OrderIndex;
    use crate::executor::TradeExecutor;
    use crate::models::Side;
    use crate::price::PriceService;
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;

    async fn router() -> (EventRouter, Arc<RecordingBroadcaster>) {
        let book = Arc::new(PositionBook::new());
        let exchange = Arc::new(PaperExchange::new());
        let store = Arc::new(InMemoryStore::new());
        let broadcaster = Arc::new(RecordingBroadcaster::new());
        let order_index = Arc::new(OrderIndex::new(1_024));
        let kv = Arc::new(InMemoryKv::new());
        let prices = Arc::new(PriceService::new(kv.clone(), exchange.clone(), Duration::from_secs(10)));
        let executor = Arc::new(TradeExecutor::new(
            book.clone(),
            prices,
            exchange,
            store.clone(),
            kv,
            broadcaster.clone(),
            Duration::from_secs(5),
            order_index.clone(),
        ));
        let router = EventRouter::new(
            HandlerContext {
                book,
                executor,
                store,
                broadcaster: broadcaster.clone(),
                order_index,
            },
            4_096,
        );
        (router, broadcaster)
    }

    #[tokio::test]
    async fn duplicate_events_are_deduped() {
        let (router, broadcaster) = router().await;
        let event = EngineEvent::Error {
            request_id: "r1".to_string(),
            op: "test".to_string(),
            reason: "boom".to_string(),
        };
        router.route(event.clone()).await.unwrap();
        router.route(event).await.unwrap();
        assert_eq!(broadcaster.count("engine_error"), 1);
    }

    #[tokio::test]
    async fn unknown_event_type_passes_through() {
        let (router, _broadcaster) = router().await;
        let event = EngineEvent::Unknown { request_id: "r2".to_string() };
        assert!(router.route(event).await.is_ok());
    }

    #[tokio::test]
    async fn order_update_with_empty_internal_id_is_rejected() {
        let (router, _broadcaster) = router().await;
        let event = EngineEvent::OrderUpdate {
            request_id: "r3".to_string(),
            internal_order_id: "".to_string(),
            client_order_id: "eng-1".to_string(),
            symbol: "BTC".to_string(),
            side: Side::Long,
            status: OrderStatus::Ack,
            qty: 1.0,
            ts: Utc::now(),
        };
        let err = router.route(event).await.unwrap_err();
        assert_eq!(err.code(), "SCHEMA_VIOLATION");
    }
}
