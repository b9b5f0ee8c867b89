//! Position Book (spec §4.D): the in-process authoritative view of every
//! sub-account's open positions, plus a symbol -> accounts reverse index so
//! the tick hot path (§4.K) doesn't scan the whole book on every price
//! update. Grounded in the teacher's `UserAccountsManager`
//! (`vault/user_accounts.rs`), which keeps the same kind of primary map plus
//! secondary index guarded by a single lock.

use crate::models::{AccountStatus, Position, PositionId, PositionStatus, SubAccount};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// One sub-account's book row: its account record and its open positions,
/// keyed by position id.
#[derive(Debug, Clone, Default)]
pub struct BookEntry {
    pub account: Option<SubAccount>,
    pub positions: HashMap<PositionId, Position>,
}

impl BookEntry {
    pub fn total_notional(&self) -> f64 {
        self.positions.values().map(|p| p.notional).sum()
    }
}

/// Registry of per-account async mutexes (spec §5): every mutating operation
/// on an account acquires its lock first, so two trades or a trade and a
/// liquidation on the same account never interleave. Lazily created and
/// never removed — accounts are few enough relative to process lifetime that
/// this never needs to shrink.
#[derive(Default)]
pub struct PerAccountLocks {
    locks: RwLock<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl PerAccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, account_id: &str) -> Arc<AsyncMutex<()>> {
        if let Some(lock) = self.locks.read().get(account_id) {
            return lock.clone();
        }
        let mut guard = self.locks.write();
        guard
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

/// The position book itself. Reads and writes go through `RwLock`s rather
/// than the per-account async lock — that lock serializes *trade logic*
/// across awaits, while these guard the in-memory data structure itself for
/// the short, synchronous critical sections that touch it.
pub struct PositionBook {
    entries: RwLock<HashMap<String, BookEntry>>,
    symbol_index: RwLock<HashMap<String, HashSet<String>>>,
    pub locks: PerAccountLocks,
}

impl PositionBook {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            symbol_index: RwLock::new(HashMap::new()),
            locks: PerAccountLocks::new(),
        }
    }

    /// Bulk load at startup (spec §4.K step 1) from the durable store.
    pub fn load(&self, rows: Vec<(Position, SubAccount)>) {
        let mut entries = self.entries.write();
        let mut index = self.symbol_index.write();
        for (position, account) in rows {
            let entry = entries.entry(account.id.clone()).or_default();
            entry.account = Some(account.clone());
            index
                .entry(position.symbol.clone())
                .or_default()
                .insert(account.id.clone());
            entry.positions.insert(position.id.clone(), position);
        }
    }

    pub fn upsert_account(&self, account: SubAccount) {
        let account_id = account.id.clone();
        self.entries.write().entry(account_id).or_default().account = Some(account);
    }

    pub fn add_position(&self, position: Position) {
        let account_id = position.sub_account_id.clone();
        let symbol = position.symbol.clone();
        self.entries
            .write()
            .entry(account_id.clone())
            .or_default()
            .positions
            .insert(position.id.clone(), position);
        self.symbol_index
            .write()
            .entry(symbol)
            .or_default()
            .insert(account_id);
    }

    pub fn update_position(&self, position: Position) {
        self.add_position(position);
    }

    /// Removes a position from the book; drops the account from a symbol's
    /// reverse index once it has no more positions in that symbol.
    pub fn remove_position(&self, account_id: &str, position_id: &str) -> Option<Position> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(account_id)?;
        let removed = entry.positions.remove(position_id)?;

        let still_holds_symbol = entry
            .positions
            .values()
            .any(|p| p.symbol == removed.symbol);
        if !still_holds_symbol {
            if let Some(accounts) = self.symbol_index.write().get_mut(&removed.symbol) {
                accounts.remove(account_id);
            }
        }
        Some(removed)
    }

    pub fn update_balance(&self, account_id: &str, new_balance: f64) {
        if let Some(entry) = self.entries.write().get_mut(account_id) {
            if let Some(account) = entry.account.as_mut() {
                account.current_balance = new_balance;
            }
        }
    }

    pub fn update_account_status(&self, account_id: &str, status: AccountStatus) {
        if let Some(entry) = self.entries.write().get_mut(account_id) {
            if let Some(account) = entry.account.as_mut() {
                account.status = status;
            }
        }
    }

    pub fn get_position(&self, account_id: &str, position_id: &str) -> Option<Position> {
        self.entries
            .read()
            .get(account_id)?
            .positions
            .get(position_id)
            .cloned()
    }

    pub fn get_entry(&self, account_id: &str) -> Option<BookEntry> {
        self.entries.read().get(account_id).cloned()
    }

    /// Finds which account owns `position_id`. Used by consumers (e.g. the
    /// babysitter) that only carry a position id, not its owning account.
    pub fn find_owner(&self, position_id: &str) -> Option<(String, Position)> {
        self.entries.read().iter().find_map(|(account_id, entry)| {
            entry
                .positions
                .get(position_id)
                .map(|p| (account_id.clone(), p.clone()))
        })
    }

    /// Spec §4.D: accounts holding at least one open position in `symbol`,
    /// used by the tick hot path to fan a price update out to the right
    /// accounts only.
    pub fn get_accounts_for_symbol(&self, symbol: &str) -> Vec<String> {
        self.symbol_index
            .read()
            .get(symbol)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn entries(&self) -> Vec<(String, BookEntry)> {
        self.entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn account_ids(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn open_positions_for(&self, account_id: &str) -> Vec<Position> {
        self.entries
            .read()
            .get(account_id)
            .map(|e| {
                e.positions
                    .values()
                    .filter(|p| p.status == PositionStatus::Open)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for PositionBook {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LiquidationMode, Side};
    use chrono::Utc;

    fn account(id: &str) -> SubAccount {
        SubAccount {
            id: id.to_string(),
            user_id: "u1".to_string(),
            name: "main".to_string(),
            current_balance: 1_000.0,
            maintenance_rate: 0.01,
            liquidation_mode: LiquidationMode::Adl30,
            status: AccountStatus::Active,
        }
    }

    fn position(id: &str, account_id: &str, symbol: &str) -> Position {
        Position {
            id: id.to_string(),
            sub_account_id: account_id.to_string(),
            symbol: symbol.to_string(),
            side: Side::Long,
            entry_price: 100.0,
            quantity: 1.0,
            notional: 100.0,
            leverage: 1.0,
            margin: 100.0,
            liquidation_price: 0.0,
            babysitter_excluded: false,
            opened_at: Utc::now(),
            closed_at: None,
            status: PositionStatus::Open,
            realized_pnl: None,
            taken_over_by: None,
            taken_over_at: None,
        }
    }

    #[test]
    fn symbol_index_tracks_and_untracks_accounts() {
        let book = PositionBook::new();
        book.upsert_account(account("a1"));
        book.add_position(position("p1", "a1", "BTC"));
        assert_eq!(book.get_accounts_for_symbol("BTC"), vec!["a1".to_string()]);

        book.remove_position("a1", "p1");
        assert!(book.get_accounts_for_symbol("BTC").is_empty());
    }

    #[test]
    fn symbol_index_survives_other_position_in_same_symbol() {
        let book = PositionBook::new();
        book.upsert_account(account("a1"));
        book.add_position(position("p1", "a1", "BTC"));
        book.add_position(position("p2", "a1", "BTC"));
        book.remove_position("a1", "p1");
        assert_eq!(book.get_accounts_for_symbol("BTC"), vec!["a1".to_string()]);
    }

    #[tokio::test]
    async fn per_account_locks_are_stable_across_calls() {
        let locks = PerAccountLocks::new();
        let a = locks.get("acct");
        let b = locks.get("acct");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
