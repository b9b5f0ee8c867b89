//! Core data model (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type AccountId = String;
pub type PositionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closed,
    Liquidated,
    TakenOver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    Active,
    Frozen,
    Liquidated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiquidationMode {
    Adl30,
    InstantClose,
    Takeover,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub sub_account_id: AccountId,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub notional: f64,
    pub leverage: f64,
    pub margin: f64,
    pub liquidation_price: f64,
    pub babysitter_excluded: bool,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub status: PositionStatus,
    pub realized_pnl: Option<f64>,
    pub taken_over_by: Option<String>,
    pub taken_over_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn key(&self) -> (AccountId, String, Side) {
        (self.sub_account_id.clone(), self.symbol.clone(), self.side)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAccount {
    pub id: AccountId,
    pub user_id: String,
    pub name: String,
    pub current_balance: f64,
    pub maintenance_rate: f64,
    pub liquidation_mode: LiquidationMode,
    pub status: AccountStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskRules {
    pub max_leverage: f64,
    pub max_notional_per_trade: f64,
    pub max_total_exposure: f64,
    pub liquidation_threshold: f64,
}

impl Default for RiskRules {
    fn default() -> Self {
        Self {
            max_leverage: 20.0,
            max_notional_per_trade: 1_000_000.0,
            max_total_exposure: 5_000_000.0,
            liquidation_threshold: 0.90,
        }
    }
}

/// Per-position view inside a `RiskSnapshot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionMark {
    pub position_id: PositionId,
    pub symbol: String,
    pub side: Side,
    pub mark: f64,
    pub unrealized_pnl: f64,
    pub liquidation_price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub sub_account_id: AccountId,
    pub balance: f64,
    pub equity: f64,
    pub equity_raw: f64,
    pub unrealized_pnl: f64,
    pub margin_used: f64,
    pub available_margin: f64,
    pub total_exposure: f64,
    pub maintenance_margin: f64,
    pub margin_ratio: f64,
    pub account_liq_price: f64,
    pub positions: Vec<PositionMark>,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeAction {
    Open,
    AddSameSide,
    Flip,
    Close,
    PartialClose,
    Liquidate,
    AdlTier2,
    AdlTier3,
    Takeover,
    Reconcile,
}

/// Append-only trade execution record; `signature` is the idempotency key
/// (spec §3: SHA-256 of `subAccountId|action|positionId|ts|nonce`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeExecution {
    pub signature: String,
    pub sub_account_id: AccountId,
    pub position_id: PositionId,
    pub action: TradeAction,
    pub quantity: f64,
    pub price: f64,
    pub fee: f64,
    pub realized_pnl: f64,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceLog {
    pub sub_account_id: AccountId,
    pub balance_before: f64,
    pub balance_after: f64,
    pub delta: f64,
    pub reason: String,
    pub trade_signature: Option<String>,
    pub ts: DateTime<Utc>,
}

/// Engine event ingested from the durable log (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    OrderUpdate {
        request_id: String,
        internal_order_id: String,
        client_order_id: String,
        symbol: String,
        side: Side,
        status: OrderStatus,
        qty: f64,
        ts: DateTime<Utc>,
    },
    TradeExecutionEvent {
        request_id: String,
        trade_id: String,
        internal_order_id: String,
        client_order_id: String,
        symbol: String,
        side: Side,
        fill_qty: f64,
        fill_price: f64,
        ts: DateTime<Utc>,
    },
    PositionUpdate {
        request_id: String,
        position_id: PositionId,
        sub_account_id: AccountId,
        symbol: String,
        side: Side,
        entry_price: f64,
        quantity: f64,
        status: PositionStatus,
    },
    Error {
        request_id: String,
        op: String,
        reason: String,
    },
    RiskSnapshotEvent {
        request_id: String,
        sub_account_id: AccountId,
    },
    MarginSnapshotEvent {
        request_id: String,
        sub_account_id: AccountId,
    },
    PositionsSnapshotEvent {
        request_id: String,
    },
    Unknown {
        request_id: String,
    },
}

impl EngineEvent {
    /// Stable id used for dedup (spec §4.A/§4.H). In production this is the
    /// durable log's stream entry id; tests and the in-memory double key off
    /// `request_id` plus a type discriminant so replays collide correctly.
    pub fn dedup_key(&self) -> String {
        match self {
            EngineEvent::OrderUpdate { request_id, .. } => format!("order:{request_id}"),
            EngineEvent::TradeExecutionEvent {
                request_id,
                internal_order_id,
                client_order_id,
                ..
            } => format!("trade:{request_id}:{internal_order_id}:{client_order_id}"),
            EngineEvent::PositionUpdate {
                request_id,
                position_id,
                ..
            } => format!("position:{request_id}:{position_id}"),
            EngineEvent::Error { request_id, .. } => format!("error:{request_id}"),
            EngineEvent::RiskSnapshotEvent { request_id, .. } => format!("risk:{request_id}"),
            EngineEvent::MarginSnapshotEvent { request_id, .. } => format!("margin:{request_id}"),
            EngineEvent::PositionsSnapshotEvent { request_id } => format!("positions:{request_id}"),
            EngineEvent::Unknown { request_id } => format!("unknown:{request_id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    Ack,
    Accepted,
    Filled,
    PartiallyFilled,
    Canceled,
    Rejected,
    Expired,
}

/// Command emitted to the execution engine (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub op: String,
    pub payload: serde_json::Value,
}

/// Babysitter intent stream message (spec §4.J / §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentMessage {
    pub action: String,
    pub payload: ClosePositionIntent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosePositionIntent {
    pub position_id: PositionId,
    pub close_price: Option<f64>,
    pub reason: String,
    #[serde(default)]
    pub retry: u32,
    pub retried_at: Option<DateTime<Utc>>,
}

/// Outcome of a close-style operation — used by the executor and surfaced to
/// the babysitter consumer and tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseOutcome {
    pub position: Position,
    pub trade: TradeExecution,
    pub balance_log: BalanceLog,
    pub source: CloseSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseSource {
    Exchange,
    VirtualOnly,
}
