//! Babysitter Action Consumer (spec §4.J): drains `close_position` intents
//! published by the babysitter sidecar and executes them through the
//! regular trade executor. Grounded in the generic `StreamConsumer` plus
//! the teacher's `vault::trade_executor` pattern of treating "already in
//! the terminal state" as success rather than an error.

use super::consumer::{Ack, StreamHandler, StreamMessage};
use crate::book::PositionBook;
use crate::collab::StreamTransport;
use crate::errors::RiskError;
use crate::executor::TradeExecutor;
use crate::models::{ClosePositionIntent, IntentMessage};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

pub const MAX_RETRIES: u32 = 3;
pub const INTENT_STREAM: &str = "babysitter.intents";

pub struct BabysitterHandler {
    book: Arc<PositionBook>,
    executor: Arc<TradeExecutor>,
    transport: Arc<dyn StreamTransport>,
}

impl BabysitterHandler {
    pub fn new(book: Arc<PositionBook>, executor: Arc<TradeExecutor>, transport: Arc<dyn StreamTransport>) -> Self {
        Self { book, executor, transport }
    }

    async fn execute_close(&self, intent: &ClosePositionIntent) -> Result<(), RiskError> {
        let (account_id, position) = self.book.find_owner(&intent.position_id).ok_or(RiskError::PositionNotFound)?;
        if position.status != crate::models::PositionStatus::Open {
            return Err(RiskError::PositionClosed);
        }

        self.executor
            .close_position(&account_id, &intent.position_id)
            .await
            .map(|_| ())
            .map_err(|e| match e.downcast::<RiskError>() {
                Ok(risk_error) => risk_error,
                // A collaborator/exchange failure that never became a
                // `RiskError` is transient by construction — it must not be
                // mistaken for "already closed"/"not found" or the retry
                // path above never fires.
                Err(e) => RiskError::Transient(e.to_string()),
            })
    }

    async fn republish_with_retry(&self, mut intent: ClosePositionIntent) -> Ack {
        intent.retry += 1;
        intent.retried_at = Some(Utc::now());
        let message = IntentMessage { action: "close_position".to_string(), payload: intent };
        let payload = match serde_json::to_string(&message) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to serialize retry intent, dropping");
                return Ack::Ack;
            }
        };

        match self.transport.publish(INTENT_STREAM, payload).await {
            Ok(_) => Ack::Ack,
            Err(e) => {
                warn!(error = %e, "failed to republish retry intent, leaving original pending");
                Ack::Pending
            }
        }
    }
}

#[async_trait::async_trait]
impl StreamHandler for BabysitterHandler {
    async fn handle(&self, message: &StreamMessage) -> Ack {
        let parsed: IntentMessage = match serde_json::from_str(&message.payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, id = %message.id, "unparseable babysitter message, dropping");
                return Ack::Ack;
            }
        };

        if parsed.action != "close_position" {
            info!(action = %parsed.action, "unknown babysitter action, dropping");
            return Ack::Ack;
        }

        match self.execute_close(&parsed.payload).await {
            Ok(()) => Ack::Ack,
            Err(RiskError::PositionClosed) | Err(RiskError::PositionNotFound) => {
                info!(position_id = %parsed.payload.position_id, "close intent already terminal, dropping");
                Ack::Ack
            }
            Err(e) => {
                warn!(position_id = %parsed.payload.position_id, error = %e, "close intent failed");
                if parsed.payload.retry >= MAX_RETRIES {
                    warn!(position_id = %parsed.payload.position_id, "close intent retries exhausted, dropping");
                    Ack::Ack
                } else {
                    self.republish_with_retry(parsed.payload).await
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{
        ExchangePosition, InMemoryKv, InMemoryStore, InMemoryStreamTransport, PaperExchange, RecordingBroadcaster,
    };
    use crate::events::OrderIndex;
    use crate::models::{AccountStatus, LiquidationMode, Position, PositionStatus, Side, SubAccount};
    use crate::price::PriceService;
    use std::time::Duration;

    fn setup() -> (Arc<PositionBook>, BabysitterHandler, Arc<InMemoryStreamTransport>) {
        let (book, handler, transport, _store, _exchange) = setup_with_collaborators();
        (book, handler, transport)
    }

    fn setup_with_collaborators() -> (
        Arc<PositionBook>,
        BabysitterHandler,
        Arc<InMemoryStreamTransport>,
        Arc<InMemoryStore>,
        Arc<PaperExchange>,
    ) {
        let book = Arc::new(PositionBook::new());
        let exchange = Arc::new(PaperExchange::new());
        let store = Arc::new(InMemoryStore::new());
        let broadcaster = Arc::new(RecordingBroadcaster::new());
        let order_index = Arc::new(OrderIndex::new(1_024));
        let kv = Arc::new(InMemoryKv::new());
        let prices = Arc::new(PriceService::new(kv.clone(), exchange.clone(), Duration::from_secs(10)));
        exchange.set_ticker("BTC", 100.0);
        let executor = Arc::new(TradeExecutor::new(
            book.clone(),
            prices,
            exchange.clone(),
            store.clone(),
            kv,
            broadcaster,
            Duration::from_secs(5),
            order_index,
        ));
        let transport = Arc::new(InMemoryStreamTransport::new());
        let handler = BabysitterHandler::new(book.clone(), executor, transport.clone());
        (book, handler, transport, store, exchange)
    }

    fn open_position(book: &PositionBook, account_id: &str, position_id: &str) {
        open_position_on(book, account_id, position_id, "BTC")
    }

    fn open_position_on(book: &PositionBook, account_id: &str, position_id: &str, symbol: &str) {
        book.upsert_account(SubAccount {
            id: account_id.to_string(),
            user_id: "u1".to_string(),
            name: "main".to_string(),
            current_balance: 1_000.0,
            maintenance_rate: 0.01,
            liquidation_mode: LiquidationMode::Adl30,
            status: AccountStatus::Active,
        });
        book.add_position(Position {
            id: position_id.to_string(),
            sub_account_id: account_id.to_string(),
            symbol: symbol.to_string(),
            side: Side::Long,
            entry_price: 100.0,
            quantity: 1.0,
            notional: 100.0,
            leverage: 1.0,
            margin: 100.0,
            liquidation_price: 10.0,
            babysitter_excluded: false,
            opened_at: Utc::now(),
            closed_at: None,
            status: PositionStatus::Open,
            realized_pnl: None,
            taken_over_by: None,
            taken_over_at: None,
        });
    }

    fn message_for(position_id: &str, retry: u32) -> StreamMessage {
        let intent = IntentMessage {
            action: "close_position".to_string(),
            payload: ClosePositionIntent {
                position_id: position_id.to_string(),
                close_price: None,
                reason: "risk".to_string(),
                retry,
                retried_at: None,
            },
        };
        StreamMessage { id: "1".to_string(), payload: serde_json::to_string(&intent).unwrap() }
    }

    #[tokio::test]
    async fn closes_the_position_and_acks() {
        let (book, handler, _transport) = setup();
        open_position(&book, "a1", "p1");
        let ack = handler.handle(&message_for("p1", 0)).await;
        assert_eq!(ack, Ack::Ack);
        assert!(book.open_positions_for("a1").is_empty());
    }

    #[tokio::test]
    async fn unknown_position_is_treated_as_terminal_and_acked() {
        let (_book, handler, _transport) = setup();
        let ack = handler.handle(&message_for("missing", 0)).await;
        assert_eq!(ack, Ack::Ack);
    }

    #[tokio::test]
    async fn unknown_action_is_dropped() {
        let (_book, handler, _transport) = setup();
        let message = StreamMessage {
            id: "1".to_string(),
            payload: serde_json::json!({"action": "noop", "payload": {"position_id": "p1", "reason": "x", "retry": 0}})
                .to_string(),
        };
        assert_eq!(handler.handle(&message).await, Ack::Ack);
    }

    #[tokio::test]
    async fn retries_exhausted_drops_instead_of_looping_forever() {
        let (_book, handler, transport) = setup();
        let ack = handler.handle(&message_for("p-never-exists-but-not-terminal", MAX_RETRIES)).await;
        // PositionNotFound is terminal in this engine, so exhaustion never
        // triggers here; this exercises the terminal-state-wins branch.
        assert_eq!(ack, Ack::Ack);
        assert_eq!(transport.pending_count(INTENT_STREAM), 0);
    }

    /// A position exists and the exchange still reports it open, but no
    /// ticker price is set and the close order carries no fallback, so every
    /// close attempt fails the same transient way. Each of the first
    /// `MAX_RETRIES` deliveries must republish rather than ack-and-drop, and
    /// the delivery past `MAX_RETRIES` must finally drop it — with zero
    /// trades ever persisted for the position.
    #[tokio::test]
    async fn transient_close_failure_retries_then_drops_after_max_retries() {
        let (book, handler, _transport, store, exchange) = setup_with_collaborators();
        open_position_on(&book, "a1", "p1", "ETH");
        exchange.set_positions("ETH", vec![ExchangePosition { symbol: "ETH".to_string(), side: Side::Long, quantity: 1.0 }]);
        // Deliberately no `exchange.set_ticker("ETH", ..)`: the close order's
        // reduce-only fallback_price is None, so every attempt fails the
        // same way instead of succeeding or hitting a ghost pattern.

        for retry in 0..MAX_RETRIES {
            let ack = handler.handle(&message_for("p1", retry)).await;
            assert_eq!(ack, Ack::Ack, "retry {retry} should republish and ack the delivery");
            assert!(book.open_positions_for("a1").iter().any(|p| p.id == "p1"));
        }

        let final_ack = handler.handle(&message_for("p1", MAX_RETRIES)).await;
        assert_eq!(final_ack, Ack::Ack);
        assert!(book.open_positions_for("a1").iter().any(|p| p.id == "p1"));
        assert_eq!(store.trade_count(), 0);
    }
}
