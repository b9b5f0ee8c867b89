//! Risk Facade (spec §4.K): owns startup, the price-tick hot path, and the
//! two background timers (safety sweep, book sync). Grounded in the
//! teacher's top-level service loop shape — a struct holding the wired
//! collaborators plus `tokio::spawn`ed periodic tasks, with a shutdown
//! handle that cancels them cooperatively.

use crate::book::PositionBook;
use crate::collab::{Collaborators, DurableStore, ExchangeClient};
use crate::config::RiskConfig;
use crate::liquidation::LiquidationEngine;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-account "last evaluated" timestamps backing the tick hot path's
/// debounce (spec §4.K, `RiskConfig::evaluation_debounce`).
struct TickDebounce {
    last_evaluated: Mutex<HashMap<String, Instant>>,
    window: Duration,
}

impl TickDebounce {
    fn new(window: Duration) -> Self {
        Self { last_evaluated: Mutex::new(HashMap::new()), window }
    }

    /// Returns `true` if the account should be evaluated now, recording the
    /// attempt immediately so concurrent ticks on the same account don't
    /// both pass.
    fn should_evaluate(&self, account_id: &str) -> bool {
        let mut map = self.last_evaluated.lock();
        let now = Instant::now();
        let due = map.get(account_id).map(|last| now.duration_since(*last) >= self.window).unwrap_or(true);
        if due {
            map.insert(account_id.to_string(), now);
        }
        due
    }
}

/// Tracks the wall-clock time of the last tick per symbol, used by the
/// safety sweep to reconnect stale feeds.
struct TickClock {
    last_tick: Mutex<HashMap<String, Instant>>,
}

impl TickClock {
    fn new() -> Self {
        Self { last_tick: Mutex::new(HashMap::new()) }
    }

    fn record(&self, symbol: &str) {
        self.last_tick.lock().insert(symbol.to_string(), Instant::now());
    }

    fn stale_symbols(&self, threshold: Duration) -> Vec<String> {
        self.last_tick
            .lock()
            .iter()
            .filter(|(_, at)| at.elapsed() > threshold)
            .map(|(symbol, _)| symbol.clone())
            .collect()
    }
}

pub struct RiskFacade {
    book: Arc<PositionBook>,
    liquidation: Arc<LiquidationEngine>,
    collab: Collaborators,
    prices: Arc<crate::price::PriceService>,
    config: RiskConfig,
    debounce: Arc<TickDebounce>,
    tick_clock: Arc<TickClock>,
    dirty: Arc<AtomicBool>,
    book_version: Arc<AtomicU64>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RiskFacade {
    pub fn new(
        book: Arc<PositionBook>,
        liquidation: Arc<LiquidationEngine>,
        collab: Collaborators,
        prices: Arc<crate::price::PriceService>,
        config: RiskConfig,
    ) -> Self {
        Self {
            book,
            liquidation,
            collab,
            prices,
            debounce: Arc::new(TickDebounce::new(config.evaluation_debounce)),
            tick_clock: Arc::new(TickClock::new()),
            dirty: Arc::new(AtomicBool::new(false)),
            book_version: Arc::new(AtomicU64::new(0)),
            tasks: Mutex::new(Vec::new()),
            config,
        }
    }

    /// Marks the book dirty so the next book-sync tick actually reconciles
    /// instead of early-returning. Call after any external mutation outside
    /// the normal trade/fill/liquidation paths (e.g. a manual admin action).
    pub fn mark_dirty(&self) {
        self.book_version.fetch_add(1, Ordering::SeqCst);
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// spec §4.K startup: loads OPEN positions and accounts into the book,
    /// preloads rules, subscribes the exchange to the traded symbol union,
    /// and starts the two background timers.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let rows = self.collab.store.load_open_positions().await?;
        self.book.load(rows.clone());

        let symbols: std::collections::HashSet<String> = rows.iter().map(|(p, _)| p.symbol.clone()).collect();
        for symbol in &symbols {
            if let Err(e) = self.collab.exchange.subscribe_symbol(symbol).await {
                warn!(symbol, error = %e, "failed to subscribe symbol at startup");
            }
            self.tick_clock.record(symbol);
        }

        info!(accounts = self.book.account_ids().len(), symbols = symbols.len(), "risk facade started");

        self.spawn_safety_sweep();
        self.spawn_book_sync();
        Ok(())
    }

    /// spec §4.K tick hot path. Call on every incoming price update.
    pub async fn on_price_tick(&self, symbol: &str, mark: f64) {
        if let Err(e) = self.prices.set_price(symbol, mark).await {
            warn!(symbol, error = %e, "failed to mirror tick into kv cache");
        }
        self.tick_clock.record(symbol);

        let accounts = self.book.get_accounts_for_symbol(symbol);
        for account_id in accounts {
            if !self.debounce.should_evaluate(&account_id) {
                continue;
            }
            self.liquidation.evaluate_account(&account_id).await;
        }
    }

    fn spawn_safety_sweep(self: &Arc<Self>) {
        let facade = self.clone();
        let period = self.config.safety_sweep_interval;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                facade.run_safety_sweep().await;
            }
        });
        self.tasks.lock().push(handle);
    }

    async fn run_safety_sweep(&self) {
        debug!("safety sweep starting");
        for account_id in self.book.account_ids() {
            self.liquidation.evaluate_account(&account_id).await;
        }

        for symbol in self.tick_clock.stale_symbols(self.config.tick_reconnect_after) {
            warn!(symbol, "tick feed stale, reconnecting exchange");
            if let Err(e) = self.collab.exchange.reconnect().await {
                warn!(symbol, error = %e, "exchange reconnect failed during safety sweep");
            }
        }
    }

    fn spawn_book_sync(self: &Arc<Self>) {
        let facade = self.clone();
        let period = self.config.book_sync_interval;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                facade.run_book_sync().await;
            }
        });
        self.tasks.lock().push(handle);
    }

    /// spec §4.K book sync: a dirty-flag-gated reconcile against the store.
    /// Removes positions present in the book but not the store, adds
    /// positions present in the store but missing from the book, and
    /// refreshes cached balances from the store's account rows.
    async fn run_book_sync(&self) {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return;
        }

        let rows = match self.collab.store.load_open_positions().await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "book sync failed to load store state");
                self.dirty.store(true, Ordering::SeqCst);
                return;
            }
        };

        let store_position_ids: std::collections::HashSet<String> = rows.iter().map(|(p, _)| p.id.clone()).collect();

        for (account_id, entry) in self.book.entries() {
            for position_id in entry.positions.keys() {
                if !store_position_ids.contains(position_id) {
                    info!(account_id, position_id, "book sync removing orphan position");
                    self.book.remove_position(&account_id, position_id);
                }
            }
        }

        for (position, account) in &rows {
            if self.book.get_position(&account.id, &position.id).is_none() {
                info!(account_id = %account.id, position_id = %position.id, "book sync adding missing position");
                self.book.upsert_account(account.clone());
                self.book.add_position(position.clone());
            }
            self.book.update_balance(&account.id, account.current_balance);
        }

        for account_id in self.book.account_ids() {
            if self.book.open_positions_for(&account_id).is_empty() {
                debug!(account_id, "book sync: account has no open positions, leaving entry (balance still tracked)");
            }
        }
    }

    /// Cooperative shutdown: aborts the background timers. Safe to call
    /// more than once.
    pub fn shutdown(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for RiskFacade {
    fn drop(&mut self) {
        self.shutdown();
    }
}
