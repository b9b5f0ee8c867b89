//! Risk engine core service binary.
//!
//! Wires the in-memory collaborator doubles (paper exchange, in-memory
//! store/KV/stream transport) to the position book, executor, liquidation
//! engine, event router, and babysitter consumer, then serves a minimal
//! health endpoint. The production HTTP/WS surface, the real exchange
//! adapter, and the ORM-backed store are external collaborators (spec
//! Non-goals) — swapping the paper doubles here for real ones is the only
//! change a deployment needs.

use anyhow::Result;
use axum::{routing::get, Json, Router};
use clap::Parser;
use risk_engine_core::book::PositionBook;
use risk_engine_core::collab::{
    Collaborators, InMemoryCommandLog, InMemoryKv, InMemoryStore, InMemoryStreamTransport, PaperExchange,
    RecordingBroadcaster,
};
use risk_engine_core::config::RiskConfig;
use risk_engine_core::events::handlers::HandlerContext;
use risk_engine_core::events::{EventRouter, OrderIndex};
use risk_engine_core::executor::TradeExecutor;
use risk_engine_core::facade::RiskFacade;
use risk_engine_core::liquidation::{LiquidationConfig, LiquidationEngine};
use risk_engine_core::price::PriceService;
use risk_engine_core::streams::babysitter::{BabysitterHandler, INTENT_STREAM};
use risk_engine_core::streams::consumer::{StreamConsumer, StreamConsumerConfig};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "risk-engine")]
struct Cli {
    /// Address the health endpoint binds to.
    #[arg(long, env = "RISK_ENGINE_BIND", default_value = "0.0.0.0:8090")]
    bind: String,
}

#[derive(Clone)]
struct HealthState {
    book: Arc<PositionBook>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = RiskConfig::from_env();

    let book = Arc::new(PositionBook::new());
    let exchange = Arc::new(PaperExchange::new());
    let store = Arc::new(InMemoryStore::new());
    let kv = Arc::new(InMemoryKv::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let commands = Arc::new(InMemoryCommandLog::new());
    let streams = Arc::new(InMemoryStreamTransport::new());
    let order_index = Arc::new(OrderIndex::new(config.dedup_capacity));
    let prices = Arc::new(PriceService::new(kv.clone(), exchange.clone(), config.price_staleness));

    let collab = Collaborators {
        exchange: exchange.clone(),
        store: store.clone(),
        kv: kv.clone(),
        broadcaster: broadcaster.clone(),
        commands,
        streams: streams.clone(),
    };

    let executor = Arc::new(TradeExecutor::new(
        book.clone(),
        prices.clone(),
        exchange.clone(),
        store.clone(),
        kv.clone(),
        broadcaster.clone(),
        config.recently_closed_window,
        order_index.clone(),
    ));

    let liquidation_config = LiquidationConfig {
        pnl_update_throttle: config.pnl_update_throttle,
        margin_update_throttle: config.margin_update_throttle,
        snapshot_write_throttle: config.snapshot_write_throttle,
        adl_tier2_band: config.adl_tier2_band,
        margin_warning_band: config.margin_warning_band,
        adl_close_fraction: config.adl_close_fraction,
        default_liquidation_threshold: config.default_liquidation_threshold,
    };
    let liquidation = Arc::new(LiquidationEngine::new(
        book.clone(),
        prices.clone(),
        executor.clone(),
        store.clone(),
        kv.clone(),
        broadcaster.clone(),
        liquidation_config,
        config.rules_cache_ttl,
    ));

    let _router = EventRouter::new(
        HandlerContext {
            book: book.clone(),
            executor: executor.clone(),
            store: store.clone(),
            broadcaster: broadcaster.clone(),
            order_index: order_index.clone(),
        },
        config.dedup_capacity,
    );

    let babysitter_handler = Arc::new(BabysitterHandler::new(book.clone(), executor.clone(), streams.clone()));
    let babysitter = Arc::new(StreamConsumer::new(
        streams.clone(),
        babysitter_handler,
        StreamConsumerConfig {
            stream: INTENT_STREAM.to_string(),
            group: "risk-engine".to_string(),
            consumer_name: format!("risk-engine-{}", std::process::id()),
            claim_idle: config.claim_idle,
            read_count: 32,
            block: std::time::Duration::from_millis(500),
        },
    ));
    tokio::spawn({
        let babysitter = babysitter.clone();
        async move { babysitter.run().await }
    });

    let facade = Arc::new(RiskFacade::new(book.clone(), liquidation, collab, prices, config));
    facade.start().await?;

    let health_state = HealthState { book: book.clone() };
    let app = Router::new()
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(health_state);

    let listener = tokio::net::TcpListener::bind(&cli.bind).await?;
    info!(addr = %cli.bind, "risk engine core listening");
    axum::serve(listener, app).await?;

    babysitter.stop();
    facade.shutdown();
    Ok(())
}

async fn healthz(axum::extract::State(state): axum::extract::State<HealthState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "accounts_tracked": state.book.account_ids().len(),
    }))
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "risk_engine_core=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
