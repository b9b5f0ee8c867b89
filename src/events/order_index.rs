//! Maps a client order id back to the account and symbol that placed it.
//! The durable event log's `order_update`/`trade_execution` events don't
//! carry `sub_account_id` directly (spec §4.H); the Trade Executor records
//! every order it places here, and the fill handler consults it to resolve
//! which account a fill belongs to and whether the order originated inside
//! this engine at all.

use crate::collections::BoundedOrderedMap;
use parking_lot::Mutex;

pub const ENGINE_ORDER_PREFIX: &str = "eng-";

pub struct OrderIndex {
    entries: Mutex<BoundedOrderedMap<String, (String, String)>>,
}

impl OrderIndex {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(BoundedOrderedMap::new(capacity)),
        }
    }

    pub fn record(&self, client_order_id: &str, account_id: &str, symbol: &str) {
        self.entries.lock().set(
            client_order_id.to_string(),
            (account_id.to_string(), symbol.to_string()),
        );
    }

    pub fn lookup(&self, client_order_id: &str) -> Option<(String, String)> {
        self.entries.lock().get(&client_order_id.to_string()).cloned()
    }

    pub fn is_engine_originated(client_order_id: &str) -> bool {
        client_order_id.starts_with(ENGINE_ORDER_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_account_and_symbol() {
        let index = OrderIndex::new(8);
        index.record("eng-1", "a1", "BTC");
        let (account, symbol) = index.lookup("eng-1").unwrap();
        assert_eq!(account, "a1");
        assert_eq!(symbol, "BTC");
    }

    #[test]
    fn recognizes_engine_prefix() {
        assert!(OrderIndex::is_engine_originated("eng-abc"));
        assert!(!OrderIndex::is_engine_originated("external-abc"));
    }
}
