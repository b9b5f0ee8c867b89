//! External collaborator traits (spec §6). The HTTP/WS surface, the ORM
//! store, and the exchange wire protocol all live outside this crate; this
//! module defines the boundary each one implements, plus an in-memory
//! "paper" double for each — the same role the teacher's
//! `PaperExecutionAdapter` plays for `ExecutionAdapter`.

use crate::models::{BalanceLog, Command, Position, RiskRules, Side, SubAccount, TradeExecution};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub reduce_only: bool,
    /// §4.F "fastAck": accept an ACK without an avg price and let the
    /// caller fall back to this price.
    pub fallback_price: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
    pub avg_price: Option<f64>,
    pub filled_qty: f64,
    pub fee: f64,
}

#[derive(Debug, Clone)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
}

/// Everything the core needs from the real exchange integration: order
/// placement, leverage, subscriptions, and the authoritative position view
/// used by the desync guard (spec §4.F step 2).
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn set_leverage(&self, symbol: &str, leverage: f64) -> Result<()>;
    async fn place_order(&self, req: OrderRequest) -> Result<OrderAck>;
    async fn subscribe_symbol(&self, symbol: &str) -> Result<()>;
    async fn reconnect(&self) -> Result<()>;
    async fn fetch_positions(&self, symbol: &str) -> Result<Vec<ExchangePosition>>;
    /// REST ticker fallback used by the price service when both caches are stale.
    async fn fetch_ticker(&self, symbol: &str) -> Result<f64>;
}

/// The durable, ORM-backed store. Writes here are the eventual authority
/// across restarts (spec §3 "Ownership"); the in-memory book is authoritative
/// for the live process.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn persist_trade(&self, trade: &TradeExecution) -> Result<()>;
    async fn persist_balance_log(&self, log: &BalanceLog) -> Result<()>;
    async fn upsert_position(&self, position: &Position) -> Result<()>;
    async fn upsert_account(&self, account: &SubAccount) -> Result<()>;
    async fn load_open_positions(&self) -> Result<Vec<(Position, SubAccount)>>;
    async fn load_rules(&self, account_id: &str) -> Result<Option<RiskRules>>;
    async fn has_trade_signature(&self, signature: &str) -> Result<bool>;
}

/// Shared KV store used for snapshot publication, the price fallback cache,
/// and the fail-closed reconcile lock (spec §6).
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    /// `SETNX`-style advisory lock acquisition; `true` iff the lock was
    /// acquired. Fail-closed: callers must treat an error as "not acquired".
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool>;
}

/// Push-only fan-out to the client-facing WS layer (spec §6).
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, event_type: &str, payload: serde_json::Value);
}

/// Outbound command log to the order-execution engine (spec §6).
#[async_trait]
pub trait CommandLog: Send + Sync {
    async fn publish(&self, command: Command) -> Result<()>;
}

/// One entry off a durable log stream (spec §4.I).
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub payload: String,
}

/// The durable log transport the Stream Consumer Framework runs over:
/// consumer groups, auto-claim of idle messages, and ack. Distinct from
/// `CommandLog` (outbound only, no groups) and `DurableStore` (relational
/// state, not a log).
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()>;
    async fn claim_idle(&self, stream: &str, group: &str, consumer: &str, idle: Duration, count: usize) -> Result<Vec<StreamEntry>>;
    async fn read_new(&self, stream: &str, group: &str, consumer: &str, count: usize, block: Duration) -> Result<Vec<StreamEntry>>;
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()>;
    async fn publish(&self, stream: &str, payload: String) -> Result<String>;
}

// ---------------------------------------------------------------------
// In-memory doubles — paper-trading-shaped, not mocks. Grounded in the
// teacher's `PaperExecutionAdapter`: deterministic behavior a test can
// assert on, not a framework-generated stub.
// ---------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct PaperExchange {
    inner: Mutex<PaperExchangeState>,
}

#[derive(Debug, Default)]
struct PaperExchangeState {
    positions: HashMap<String, Vec<ExchangePosition>>,
    tickers: HashMap<String, f64>,
    subscribed: Vec<String>,
    next_order_id: u64,
}

impl PaperExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ticker(&self, symbol: &str, price: f64) {
        self.inner.lock().tickers.insert(symbol.to_string(), price);
    }

    /// Seed the exchange's authoritative view for a symbol, used by desync tests.
    pub fn set_positions(&self, symbol: &str, positions: Vec<ExchangePosition>) {
        self.inner
            .lock()
            .positions
            .insert(symbol.to_string(), positions);
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn set_leverage(&self, _symbol: &str, _leverage: f64) -> Result<()> {
        Ok(())
    }

    async fn place_order(&self, req: OrderRequest) -> Result<OrderAck> {
        let mut state = self.inner.lock();
        state.next_order_id += 1;
        let order_id = format!("paper-{}", state.next_order_id);
        let price = state
            .tickers
            .get(&req.symbol)
            .copied()
            .or(req.fallback_price)
            .ok_or_else(|| anyhow::anyhow!("no price available for {}", req.symbol))?;
        Ok(OrderAck {
            order_id,
            avg_price: Some(price),
            filled_qty: req.quantity,
            fee: 0.0,
        })
    }

    async fn subscribe_symbol(&self, symbol: &str) -> Result<()> {
        let mut state = self.inner.lock();
        if !state.subscribed.contains(&symbol.to_string()) {
            state.subscribed.push(symbol.to_string());
        }
        Ok(())
    }

    async fn reconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn fetch_positions(&self, symbol: &str) -> Result<Vec<ExchangePosition>> {
        Ok(self
            .inner
            .lock()
            .positions
            .get(symbol)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<f64> {
        self.inner
            .lock()
            .tickers
            .get(symbol)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("no ticker for {}", symbol))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: Mutex<InMemoryStoreState>,
}

#[derive(Debug, Default)]
struct InMemoryStoreState {
    trades: Vec<TradeExecution>,
    trade_signatures: std::collections::HashSet<String>,
    balance_logs: Vec<BalanceLog>,
    positions: HashMap<String, Position>,
    accounts: HashMap<String, SubAccount>,
    rules: HashMap<String, RiskRules>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_account(&self, account: SubAccount) {
        self.inner
            .lock()
            .accounts
            .insert(account.id.clone(), account);
    }

    pub fn seed_rules(&self, account_id: &str, rules: RiskRules) {
        self.inner.lock().rules.insert(account_id.to_string(), rules);
    }

    pub fn seed_position(&self, position: Position) {
        self.inner
            .lock()
            .positions
            .insert(position.id.clone(), position);
    }

    pub fn trade_count(&self) -> usize {
        self.inner.lock().trades.len()
    }

    pub fn balance_log_count(&self) -> usize {
        self.inner.lock().balance_logs.len()
    }

    pub fn get_account(&self, account_id: &str) -> Option<SubAccount> {
        self.inner.lock().accounts.get(account_id).cloned()
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn persist_trade(&self, trade: &TradeExecution) -> Result<()> {
        let mut state = self.inner.lock();
        if !state.trade_signatures.insert(trade.signature.clone()) {
            return Ok(()); // idempotent re-ingest, spec invariant 5
        }
        state.trades.push(trade.clone());
        Ok(())
    }

    async fn persist_balance_log(&self, log: &BalanceLog) -> Result<()> {
        self.inner.lock().balance_logs.push(log.clone());
        Ok(())
    }

    async fn upsert_position(&self, position: &Position) -> Result<()> {
        let mut state = self.inner.lock();
        state.positions.insert(position.id.clone(), position.clone());
        Ok(())
    }

    async fn upsert_account(&self, account: &SubAccount) -> Result<()> {
        let mut state = self.inner.lock();
        if let Some(existing) = state.accounts.get_mut(&account.id) {
            *existing = account.clone();
        } else {
            state.accounts.insert(account.id.clone(), account.clone());
        }
        Ok(())
    }

    async fn load_open_positions(&self) -> Result<Vec<(Position, SubAccount)>> {
        let state = self.inner.lock();
        Ok(state
            .positions
            .values()
            .filter(|p| p.status == crate::models::PositionStatus::Open)
            .filter_map(|p| {
                state
                    .accounts
                    .get(&p.sub_account_id)
                    .map(|a| (p.clone(), a.clone()))
            })
            .collect())
    }

    async fn load_rules(&self, account_id: &str) -> Result<Option<RiskRules>> {
        Ok(self.inner.lock().rules.get(account_id).copied())
    }

    async fn has_trade_signature(&self, signature: &str) -> Result<bool> {
        Ok(self.inner.lock().trade_signatures.contains(signature))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryKv {
    inner: Mutex<HashMap<String, (String, Instant, Duration)>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.inner
            .lock()
            .insert(key.to_string(), (value, Instant::now(), ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let guard = self.inner.lock();
        Ok(guard.get(key).and_then(|(value, set_at, ttl)| {
            if set_at.elapsed() < *ttl {
                Some(value.clone())
            } else {
                None
            }
        }))
    }

    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut guard = self.inner.lock();
        if let Some((_, set_at, lock_ttl)) = guard.get(key) {
            if set_at.elapsed() < *lock_ttl {
                return Ok(false);
            }
        }
        guard.insert(key.to_string(), (String::from("locked"), Instant::now(), ttl));
        Ok(true)
    }
}

#[derive(Debug, Default)]
pub struct RecordingBroadcaster {
    events: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, serde_json::Value)> {
        self.events.lock().clone()
    }

    pub fn count(&self, event_type: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|(t, _)| t == event_type)
            .count()
    }
}

impl Broadcaster for RecordingBroadcaster {
    fn broadcast(&self, event_type: &str, payload: serde_json::Value) {
        self.events.lock().push((event_type.to_string(), payload));
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCommandLog {
    published: Mutex<Vec<Command>>,
}

impl InMemoryCommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<Command> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl CommandLog for InMemoryCommandLog {
    async fn publish(&self, command: Command) -> Result<()> {
        self.published.lock().push(command);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<StreamEntry>,
    pending: HashMap<String, StreamEntry>,
    delivered_at: HashMap<String, Instant>,
    next_id: u64,
}

/// In-process stand-in for a consumer-group-capable durable log (Redis
/// Streams in the teacher's deployment target). One `group` per consumer
/// group name; every stream name gets its own independent state.
#[derive(Debug, Default)]
pub struct InMemoryStreamTransport {
    streams: Mutex<HashMap<String, StreamState>>,
}

impl InMemoryStreamTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self, stream: &str) -> usize {
        self.streams
            .lock()
            .get(stream)
            .map(|s| s.pending.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl StreamTransport for InMemoryStreamTransport {
    async fn ensure_group(&self, stream: &str, _group: &str) -> Result<()> {
        self.streams.lock().entry(stream.to_string()).or_default();
        Ok(())
    }

    async fn claim_idle(&self, stream: &str, _group: &str, _consumer: &str, idle: Duration, count: usize) -> Result<Vec<StreamEntry>> {
        let mut streams = self.streams.lock();
        let state = streams.entry(stream.to_string()).or_default();
        let expired: Vec<String> = state
            .delivered_at
            .iter()
            .filter(|(_, at)| at.elapsed() >= idle)
            .map(|(id, _)| id.clone())
            .take(count)
            .collect();
        let mut claimed = Vec::new();
        for id in expired {
            if let Some(entry) = state.pending.get(&id).cloned() {
                state.delivered_at.insert(id.clone(), Instant::now());
                claimed.push(entry);
            }
        }
        Ok(claimed)
    }

    async fn read_new(&self, stream: &str, _group: &str, _consumer: &str, count: usize, _block: Duration) -> Result<Vec<StreamEntry>> {
        let mut streams = self.streams.lock();
        let state = streams.entry(stream.to_string()).or_default();
        let fresh: Vec<StreamEntry> = state
            .entries
            .iter()
            .filter(|e| !state.pending.contains_key(&e.id))
            .take(count)
            .cloned()
            .collect();
        for entry in &fresh {
            state.pending.insert(entry.id.clone(), entry.clone());
            state.delivered_at.insert(entry.id.clone(), Instant::now());
        }
        Ok(fresh)
    }

    async fn ack(&self, stream: &str, _group: &str, id: &str) -> Result<()> {
        let mut streams = self.streams.lock();
        if let Some(state) = streams.get_mut(stream) {
            state.pending.remove(id);
            state.delivered_at.remove(id);
        }
        Ok(())
    }

    async fn publish(&self, stream: &str, payload: String) -> Result<String> {
        let mut streams = self.streams.lock();
        let state = streams.entry(stream.to_string()).or_default();
        state.next_id += 1;
        let id = format!("{}-{}", stream, state.next_id);
        state.entries.push(StreamEntry { id: id.clone(), payload });
        Ok(id)
    }
}

/// Bundle of collaborators the facade/executor/liquidation engine need —
/// mirrors the teacher's `AppState`, constructed once at startup and passed
/// down explicitly rather than reached for via a global.
pub struct Collaborators {
    pub exchange: Arc<dyn ExchangeClient>,
    pub store: Arc<dyn DurableStore>,
    pub kv: Arc<dyn KvStore>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub commands: Arc<dyn CommandLog>,
    pub streams: Arc<dyn StreamTransport>,
}
