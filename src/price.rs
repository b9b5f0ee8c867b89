//! Price Service (spec §4.C): an in-process cache backed by the KV store,
//! with a REST fallback through the exchange collaborator when both are
//! stale. Grounded in the teacher's layered-cache approach in
//! `vault/execution.rs` (in-memory first, collaborator second).

use crate::collab::{ExchangeClient, KvStore};
use crate::errors::RiskError;
use anyhow::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
struct CachedPrice {
    price: f64,
    set_at: Instant,
}

/// Tracks the last tick price per symbol and serves reads with a staleness
/// guard; falls through to the shared KV cache and finally the exchange's
/// REST ticker when the in-process cache is empty or too old.
pub struct PriceService {
    local: RwLock<HashMap<String, CachedPrice>>,
    kv: Arc<dyn KvStore>,
    exchange: Arc<dyn ExchangeClient>,
    staleness: Duration,
}

impl PriceService {
    pub fn new(kv: Arc<dyn KvStore>, exchange: Arc<dyn ExchangeClient>, staleness: Duration) -> Self {
        Self {
            local: RwLock::new(HashMap::new()),
            kv,
            exchange,
            staleness,
        }
    }

    /// Tick ingestion path (spec §4.C `setPrice`). Also mirrors into the KV
    /// cache so other processes see the same price.
    pub async fn set_price(&self, symbol: &str, price: f64) -> Result<()> {
        self.local.write().insert(
            symbol.to_string(),
            CachedPrice {
                price,
                set_at: Instant::now(),
            },
        );
        self.kv
            .set_with_ttl(&kv_key(symbol), price.to_string(), self.staleness * 6)
            .await?;
        Ok(())
    }

    /// Non-blocking read of whatever is cached in-process, regardless of age.
    pub fn get_price(&self, symbol: &str) -> Option<f64> {
        self.local.read().get(symbol).map(|c| c.price)
    }

    /// Spec §4.C `freshPrice`: in-process price if within the staleness
    /// window, else the KV cache, else a REST fallback.
    pub async fn fresh_price(&self, symbol: &str) -> Result<f64, RiskError> {
        if let Some(cached) = self.local.read().get(symbol).copied() {
            if cached.set_at.elapsed() < self.staleness {
                return Ok(cached.price);
            }
        }

        if let Ok(Some(raw)) = self.kv.get(&kv_key(symbol)).await {
            if let Ok(price) = raw.parse::<f64>() {
                debug!(symbol, "price served from KV fallback");
                self.local.write().insert(
                    symbol.to_string(),
                    CachedPrice {
                        price,
                        set_at: Instant::now(),
                    },
                );
                return Ok(price);
            }
        }

        match self.exchange.fetch_ticker(symbol).await {
            Ok(price) => {
                warn!(symbol, "price served from REST fallback, local and KV both stale");
                self.local.write().insert(
                    symbol.to_string(),
                    CachedPrice {
                        price,
                        set_at: Instant::now(),
                    },
                );
                Ok(price)
            }
            Err(_) => Err(RiskError::NoPrice),
        }
    }

    /// Spec §4.C `freshPrices`: batch form of `fresh_price` over distinct
    /// symbols, used before a multi-position risk snapshot.
    pub async fn fresh_prices(&self, symbols: &[String]) -> HashMap<String, f64> {
        let mut out = HashMap::with_capacity(symbols.len());
        for symbol in symbols {
            if out.contains_key(symbol) {
                continue;
            }
            if let Ok(price) = self.fresh_price(symbol).await {
                out.insert(symbol.clone(), price);
            }
        }
        out
    }
}

fn kv_key(symbol: &str) -> String {
    format!("price:{symbol}")
}
