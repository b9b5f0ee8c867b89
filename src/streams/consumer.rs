//! Generic stream consumer over a durable log with consumer groups (spec
//! §4.I). Grounded in the teacher's worker-loop shape in `main.rs`
//! (periodic tick, cooperative shutdown flag) generalized to stream reads
//! instead of a timer.

use crate::collab::{StreamEntry, StreamTransport};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Ack,
    Pending,
}

/// What a stream consumer hands each message to. Implementors decide
/// whether to ack, leave it pending (auto-claimed later), or republish with
/// a bumped retry count — the consumer loop itself doesn't know the
/// message's domain shape.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle(&self, message: &StreamMessage) -> Ack;
}

#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub id: String,
    pub payload: String,
}

impl From<StreamEntry> for StreamMessage {
    fn from(e: StreamEntry) -> Self {
        Self { id: e.id, payload: e.payload }
    }
}

pub struct StreamConsumerConfig {
    pub stream: String,
    pub group: String,
    pub consumer_name: String,
    pub claim_idle: Duration,
    pub read_count: usize,
    pub block: Duration,
}

/// Runs `handler` over `config.stream` until `stop()` is called. Cooperative
/// cancellation: `running` is checked at the top of every loop iteration.
pub struct StreamConsumer {
    transport: Arc<dyn StreamTransport>,
    handler: Arc<dyn StreamHandler>,
    config: StreamConsumerConfig,
    running: Arc<AtomicBool>,
}

impl StreamConsumer {
    pub fn new(transport: Arc<dyn StreamTransport>, handler: Arc<dyn StreamHandler>, config: StreamConsumerConfig) -> Self {
        Self {
            transport,
            handler,
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Runs the main loop once started; returns when `stop()` is called.
    /// Auto-claim is attempted first each iteration, then a fresh read.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        if let Err(e) = self.transport.ensure_group(&self.config.stream, &self.config.group).await {
            error!(stream = %self.config.stream, error = %e, "failed to ensure consumer group, aborting loop");
            return;
        }

        while self.running.load(Ordering::SeqCst) {
            let claimed = self
                .transport
                .claim_idle(
                    &self.config.stream,
                    &self.config.group,
                    &self.config.consumer_name,
                    self.config.claim_idle,
                    self.config.read_count,
                )
                .await
                .unwrap_or_default();

            let fresh = self
                .transport
                .read_new(
                    &self.config.stream,
                    &self.config.group,
                    &self.config.consumer_name,
                    self.config.read_count,
                    self.config.block,
                )
                .await
                .unwrap_or_default();

            for entry in claimed.into_iter().chain(fresh) {
                self.process_one(entry.into()).await;
            }
        }
    }

    async fn process_one(&self, message: StreamMessage) {
        match self.handler.handle(&message).await {
            Ack::Ack => {
                if let Err(e) = self.transport.ack(&self.config.stream, &self.config.group, &message.id).await {
                    warn!(id = %message.id, error = %e, "ack failed, message remains pending");
                }
            }
            Ack::Pending => {
                // Left unacked; the next claim_idle pass will pick it up.
            }
        }
    }
}
