//! Liquidation Engine (spec §4.G). Evaluates one account at a time against
//! its risk rules, coalescing throttled broadcasts the way the teacher's
//! paper-execution path coalesces fill events, and dispatching into one of
//! three liquidation modes once an account crosses its threshold.

use crate::book::PositionBook;
use crate::collab::{Broadcaster, DurableStore, KvStore};
use crate::collections::BoundedOrderedSet;
use crate::errors::RiskError;
use crate::executor::TradeExecutor;
use crate::math::{self, PositionExposure};
use crate::models::{AccountStatus, LiquidationMode, RiskRules, TradeAction};
use crate::snapshot;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// One entry per account in a throttled-emission map: the key, the last
/// time it actually fired, and the most recent payload waiting to go out
/// once the cooldown lapses (spec §4.G step 4, "coalescing").
struct Throttle<T> {
    window: Duration,
    last_fired: HashMap<String, Instant>,
    pending: HashMap<String, T>,
}

impl<T: Clone> Throttle<T> {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last_fired: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Returns `Some(payload)` to emit immediately, replacing any deferred
    /// payload for `key` with `payload` otherwise.
    fn offer(&mut self, key: &str, payload: T) -> Option<T> {
        let now = Instant::now();
        let ready = self
            .last_fired
            .get(key)
            .map(|last| now.duration_since(*last) >= self.window)
            .unwrap_or(true);
        if ready {
            self.last_fired.insert(key.to_string(), now);
            self.pending.remove(key);
            Some(payload)
        } else {
            self.pending.insert(key.to_string(), payload);
            None
        }
    }
}

pub struct LiquidationConfig {
    pub pnl_update_throttle: Duration,
    pub margin_update_throttle: Duration,
    pub snapshot_write_throttle: Duration,
    pub adl_tier2_band: f64,
    pub margin_warning_band: f64,
    pub adl_close_fraction: f64,
    pub default_liquidation_threshold: f64,
}

pub struct LiquidationEngine {
    book: Arc<PositionBook>,
    prices: Arc<crate::price::PriceService>,
    executor: Arc<TradeExecutor>,
    store: Arc<dyn DurableStore>,
    kv: Arc<dyn KvStore>,
    broadcaster: Arc<dyn Broadcaster>,
    config: LiquidationConfig,

    evaluating: Mutex<BoundedOrderedSet<String>>,
    liquidating: Mutex<BoundedOrderedSet<String>>,
    pnl_throttle: Mutex<Throttle<serde_json::Value>>,
    margin_throttle: Mutex<Throttle<serde_json::Value>>,
    snapshot_throttle: Mutex<HashMap<String, Instant>>,
    rules_cache: RwLock<HashMap<String, (RiskRules, Instant)>>,
    rules_cache_ttl: Duration,
}

impl LiquidationEngine {
    pub fn new(
        book: Arc<PositionBook>,
        prices: Arc<crate::price::PriceService>,
        executor: Arc<TradeExecutor>,
        store: Arc<dyn DurableStore>,
        kv: Arc<dyn KvStore>,
        broadcaster: Arc<dyn Broadcaster>,
        config: LiquidationConfig,
        rules_cache_ttl: Duration,
    ) -> Self {
        Self {
            book,
            prices,
            executor,
            store,
            kv,
            broadcaster,
            pnl_throttle: Mutex::new(Throttle::new(config.pnl_update_throttle)),
            margin_throttle: Mutex::new(Throttle::new(config.margin_update_throttle)),
            snapshot_throttle: Mutex::new(HashMap::new()),
            rules_cache: RwLock::new(HashMap::new()),
            rules_cache_ttl,
            config,
            evaluating: Mutex::new(BoundedOrderedSet::new(10_000)),
            liquidating: Mutex::new(BoundedOrderedSet::new(10_000)),
        }
    }

    async fn rules_for(&self, account_id: &str) -> RiskRules {
        if let Some((rules, at)) = self.rules_cache.read().get(account_id) {
            if at.elapsed() < self.rules_cache_ttl {
                return *rules;
            }
        }
        let rules = self
            .store
            .load_rules(account_id)
            .await
            .ok()
            .flatten()
            .unwrap_or_default();
        self.rules_cache
            .write()
            .insert(account_id.to_string(), (rules, Instant::now()));
        rules
    }

    /// spec §4.G `evaluateAccount`.
    pub async fn evaluate_account(&self, account_id: &str) {
        {
            let mut evaluating = self.evaluating.lock();
            if !evaluating.insert_seen(account_id.to_string()) {
                return;
            }
        }
        let result = self.evaluate_account_inner(account_id).await;
        self.evaluating.lock().remove(&account_id.to_string());
        if let Err(e) = result {
            error!(account_id, error = %e, "liquidation evaluation failed");
        }
    }

    async fn evaluate_account_inner(&self, account_id: &str) -> anyhow::Result<()> {
        let entry = match self.book.get_entry(account_id) {
            Some(e) => e,
            None => return Ok(()),
        };
        let account = match entry.account {
            Some(a) => a,
            None => return Ok(()),
        };
        if entry.positions.is_empty() {
            return Ok(());
        }
        if matches!(account.status, AccountStatus::Liquidated | AccountStatus::Frozen) {
            return Ok(());
        }

        let rules = self.rules_for(account_id).await;
        let threshold = if rules.liquidation_threshold > 0.0 && rules.liquidation_threshold <= 1.0 {
            rules.liquidation_threshold
        } else {
            self.config.default_liquidation_threshold
        };

        let exposures: Vec<(String, PositionExposure)> = entry
            .positions
            .values()
            .map(|p| {
                let mark = self.prices.get_price(&p.symbol).unwrap_or(p.entry_price);
                (p.id.clone(), math::exposure_of(p, mark))
            })
            .collect();
        let exposure_values: Vec<PositionExposure> = exposures.iter().map(|(_, e)| *e).collect();

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

        self.emit_pnl_updates(account_id, &exposures);
        self.emit_margin_update(account_id, margin_ratio, equity_raw);
        self.write_snapshot_throttled(account_id, threshold).await;

        if equity_raw <= 0.0 || margin_ratio >= 1.0 {
            return self.hard_liquidate(account_id, account.liquidation_mode).await;
        }

        let t = threshold;
        match account.liquidation_mode {
            LiquidationMode::Takeover if margin_ratio >= t => {
                self.takeover_all(account_id).await
            }
            LiquidationMode::InstantClose if margin_ratio >= t => {
                self.close_all(account_id).await
            }
            LiquidationMode::Adl30 => {
                if margin_ratio >= t - self.config.margin_warning_band && margin_ratio < t {
                    self.broadcaster.broadcast(
                        "margin_warning",
                        serde_json::json!({"sub_account_id": account_id, "margin_ratio": margin_ratio}),
                    );
                    Ok(())
                } else if margin_ratio >= t && margin_ratio < t + self.config.adl_tier2_band {
                    self.adl_tier(account_id, TradeAction::AdlTier2, t).await
                } else if margin_ratio >= t + self.config.adl_tier2_band {
                    self.adl_tier_three(account_id, t).await
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    fn emit_pnl_updates(&self, account_id: &str, exposures: &[(String, PositionExposure)]) {
        for (position_id, exposure) in exposures {
            let upnl = math::pnl(exposure.side, exposure.entry, exposure.mark, exposure.quantity);
            let key = format!("{account_id}:{position_id}");
            let payload = serde_json::json!({
                "sub_account_id": account_id,
                "position_id": position_id,
                "unrealized_pnl": upnl,
                "mark": exposure.mark,
            });
            if let Some(payload) = self.pnl_throttle.lock().offer(&key, payload) {
                self.broadcaster.broadcast("pnl_update", payload);
            }
        }
    }

    fn emit_margin_update(&self, account_id: &str, margin_ratio: f64, equity_raw: f64) {
        let payload = serde_json::json!({
            "sub_account_id": account_id,
            "margin_ratio": margin_ratio,
            "equity": equity_raw,
        });
        if let Some(payload) = self.margin_throttle.lock().offer(account_id, payload) {
            self.broadcaster.broadcast("margin_update", payload);
        }
    }

    async fn write_snapshot_throttled(&self, account_id: &str, threshold: f64) {
        let ready = {
            let mut guard = self.snapshot_throttle.lock();
            let now = Instant::now();
            let ready = guard
                .get(account_id)
                .map(|last| now.duration_since(*last) >= self.config.snapshot_write_throttle)
                .unwrap_or(true);
            if ready {
                guard.insert(account_id.to_string(), now);
            }
            ready
        };
        if !ready {
            return;
        }
        if let Some(snap) = snapshot::build(&self.book, &self.prices, account_id, threshold) {
            if let Ok(serialized) = serde_json::to_string(&snap) {
                let key = format!("risk_snapshot:{account_id}");
                if let Err(e) = self.kv.set_with_ttl(&key, serialized, Duration::from_secs(60)).await {
                    warn!(account_id, error = %e, "failed to publish risk snapshot");
                }
            }
        }
    }

    async fn hard_liquidate(&self, account_id: &str, mode: LiquidationMode) -> anyhow::Result<()> {
        if mode == LiquidationMode::Takeover {
            self.takeover_all(account_id).await
        } else {
            self.close_all(account_id).await
        }
    }

    async fn adl_tier(&self, account_id: &str, action: TradeAction, threshold: f64) -> anyhow::Result<()> {
        let positions = self.book.open_positions_for(account_id);
        let notionals: Vec<f64> = positions.iter().map(|p| p.notional).collect();
        let idx = match math::largest_notional_index(&notionals) {
            Some(i) => i,
            None => return Ok(()),
        };
        let target = &positions[idx];
        if let Err(e) = self
            .executor
            .partial_close(account_id, &target.id, self.config.adl_close_fraction, action)
            .await
        {
            warn!(account_id, position_id = %target.id, error = %e, "ADL partial close failed, continuing");
        }
        let _ = threshold;
        Ok(())
    }

    async fn adl_tier_three(&self, account_id: &str, threshold: f64) -> anyhow::Result<()> {
        self.adl_tier(account_id, TradeAction::AdlTier3, threshold).await?;

        // Re-evaluate: if still above threshold, escalate to full liquidation.
        // Uses fresh (REST-backed) marks rather than the in-process cache —
        // a stale cached mark here would make the escalation decision too
        // aggressive in exactly the direction that hurts the account most.
        let entry = match self.book.get_entry(account_id) {
            Some(e) => e,
            None => return Ok(()),
        };
        let account = match entry.account {
            Some(a) => a,
            None => return Ok(()),
        };
        let symbols: Vec<String> = entry.positions.values().map(|p| p.symbol.clone()).collect();
        let fresh = self.prices.fresh_prices(&symbols).await;
        let exposures: Vec<PositionExposure> = entry
            .positions
            .values()
            .map(|p| {
                let mark = fresh.get(&p.symbol).copied().unwrap_or(p.entry_price);
                math::exposure_of(p, mark)
            })
            .collect();
        let total_upnl: f64 = exposures.iter().map(|e| math::pnl(e.side, e.entry, e.mark, e.quantity)).sum();
        let total_notional: f64 = exposures.iter().map(|e| e.notional).sum();
        let equity_raw = account.current_balance + total_upnl;
        let margin_ratio = if equity_raw <= 0.0 {
            math::INSOLVENT_MARGIN_USAGE
        } else {
            (total_notional * account.maintenance_rate) / equity_raw
        };
        if margin_ratio >= threshold || equity_raw <= 0.0 {
            self.hard_liquidate(account_id, account.liquidation_mode).await
        } else {
            Ok(())
        }
    }

    /// Full real liquidation of every open position; the engine continues on
    /// to the next position even if one close fails (spec §4.G "Failure
    /// semantics").
    async fn close_all(&self, account_id: &str) -> anyhow::Result<()> {
        {
            let mut liquidating = self.liquidating.lock();
            if !liquidating.insert_seen(account_id.to_string()) {
                return Ok(());
            }
        }
        let positions = self.book.open_positions_for(account_id);
        for position in positions {
            if let Err(e) = self.executor.liquidate_position(account_id, &position.id).await {
                error!(account_id, position_id = %position.id, error = %e, "liquidation close failed, continuing");
            }
        }
        self.book.update_account_status(account_id, AccountStatus::Liquidated);
        self.store
            .upsert_account(&self.book.get_entry(account_id).and_then(|e| e.account).ok_or(RiskError::AccountNotFound)?)
            .await?;
        self.liquidating.lock().remove(&account_id.to_string());
        info!(account_id, "account fully liquidated");
        Ok(())
    }

    async fn takeover_all(&self, account_id: &str) -> anyhow::Result<()> {
        {
            let mut liquidating = self.liquidating.lock();
            if !liquidating.insert_seen(account_id.to_string()) {
                return Ok(());
            }
        }
        let positions = self.book.open_positions_for(account_id);
        for position in positions {
            if let Err(e) = self
                .executor
                .takeover_position(account_id, &position.id, "system")
                .await
            {
                error!(account_id, position_id = %position.id, error = %e, "takeover failed, continuing");
            }
        }
        self.book.update_account_status(account_id, AccountStatus::Liquidated);
        self.store
            .upsert_account(&self.book.get_entry(account_id).and_then(|e| e.account).ok_or(RiskError::AccountNotFound)?)
            .await?;
        self.liquidating.lock().remove(&account_id.to_string());
        info!(account_id, "account fully taken over");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{InMemoryKv, InMemoryStore, PaperExchange, RecordingBroadcaster};
    use crate::executor::ExecuteTradeOptions;
    use crate::models::{AccountStatus, Side, SubAccount};
    use crate::price::PriceService;

    fn setup(mode: LiquidationMode) -> (LiquidationEngine, Arc<PositionBook>, Arc<PaperExchange>, Arc<RecordingBroadcaster>) {
        let book = Arc::new(PositionBook::new());
        let exchange = Arc::new(PaperExchange::new());
        let store = Arc::new(InMemoryStore::new());
        let kv = Arc::new(InMemoryKv::new());
        let broadcaster = Arc::new(RecordingBroadcaster::new());
        let prices = Arc::new(PriceService::new(kv.clone(), exchange.clone(), Duration::from_secs(10)));
        let executor = Arc::new(TradeExecutor::new(
            book.clone(),
            prices.clone(),
            exchange.clone(),
            store.clone(),
            kv.clone(),
            broadcaster.clone(),
            Duration::from_secs(5),
            Arc::new(crate::events::OrderIndex::new(1_024)),
        ));
        book.upsert_account(SubAccount {
            id: "a1".to_string(),
            user_id: "u1".to_string(),
            name: "main".to_string(),
            current_balance: 100.0,
            maintenance_rate: 0.01,
            liquidation_mode: mode,
            status: AccountStatus::Active,
        });
        let config = LiquidationConfig {
            pnl_update_throttle: Duration::from_millis(0),
            margin_update_throttle: Duration::from_millis(0),
            snapshot_write_throttle: Duration::from_millis(0),
            adl_tier2_band: 0.05,
            margin_warning_band: 0.10,
            adl_close_fraction: 0.3,
            default_liquidation_threshold: 0.90,
        };
        let engine = LiquidationEngine::new(
            book.clone(),
            prices,
            executor,
            store,
            kv,
            broadcaster.clone(),
            config,
            Duration::from_secs(60),
        );
        (engine, book, exchange, broadcaster)
    }

    #[tokio::test]
    async fn deep_underwater_account_is_fully_liquidated() {
        let (engine, book, exchange) = {
            let (e, b, ex, _bc) = setup(LiquidationMode::InstantClose);
            (e, b, ex)
        };
        exchange.set_ticker("BTC", 100.0);
        engine
            .executor
            .execute_trade(
                "a1",
                "BTC",
                Side::Long,
                10.0,
                5.0,
                RiskRules::default(),
                ExecuteTradeOptions { skip_validation: true, fallback_price: None },
            )
            .await
            .unwrap();
        exchange.set_ticker("BTC", 1.0); // catastrophic drop, account wiped out
        engine.prices.set_price("BTC", 1.0).await.unwrap();

        engine.evaluate_account("a1").await;

        let account = book.get_entry("a1").unwrap().account.unwrap();
        assert_eq!(account.status, AccountStatus::Liquidated);
    }

    #[tokio::test]
    async fn takeover_mode_marks_positions_taken_over_not_closed_on_exchange() {
        let (engine, book, exchange, _broadcaster) = setup(LiquidationMode::Takeover);
        exchange.set_ticker("BTC", 100.0);
        engine
            .executor
            .execute_trade(
                "a1",
                "BTC",
                Side::Long,
                10.0,
                5.0,
                RiskRules::default(),
                ExecuteTradeOptions { skip_validation: true, fallback_price: None },
            )
            .await
            .unwrap();
        exchange.set_ticker("BTC", 1.0);
        engine.prices.set_price("BTC", 1.0).await.unwrap();

        engine.evaluate_account("a1").await;
        let account = book.get_entry("a1").unwrap().account.unwrap();
        assert_eq!(account.status, AccountStatus::Liquidated);
    }

    #[tokio::test]
    async fn healthy_account_is_left_alone() {
        let (engine, book, exchange, _broadcaster) = setup(LiquidationMode::Adl30);
        exchange.set_ticker("BTC", 100.0);
        engine
            .executor
            .execute_trade(
                "a1",
                "BTC",
                Side::Long,
                1.0,
                2.0,
                RiskRules::default(),
                ExecuteTradeOptions { skip_validation: true, fallback_price: None },
            )
            .await
            .unwrap();
        engine.evaluate_account("a1").await;
        let account = book.get_entry("a1").unwrap().account.unwrap();
        assert_eq!(account.status, AccountStatus::Active);
    }

    #[tokio::test]
    async fn reentrant_evaluation_is_skipped() {
        let (engine, ..) = setup(LiquidationMode::Adl30);
        {
            let mut evaluating = engine.evaluating.lock();
            evaluating.insert_seen("a1".to_string());
        }
        // Evaluation should return immediately without touching the book.
        engine.evaluate_account("a1").await;
    }
}
