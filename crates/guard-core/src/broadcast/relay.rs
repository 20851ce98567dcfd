//! At-least-once delivery of `mode_changed` events to the execution engine.
//!
//! Each mode change gets its own delivery task that calls the
//! [`ExecutionSink`] until it acknowledges or the delivery TTL runs out. The
//! kill switch commits locally first; this relay is how the halt reaches the
//! engine. Deliveries for one user may overlap, so the engine applies an event
//! only if its `seq` is newer than the last one it applied.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::events::StatusEvent;
use crate::collaborators::ExecutionSink;
use crate::config::ExecutionConfig;

#[derive(Debug, Default)]
pub struct RelayStats {
    pub delivered: AtomicU64,
    pub attempts: AtomicU64,
    pub abandoned: AtomicU64,
}

pub struct ExecutionRelay {
    sink: Arc<dyn ExecutionSink>,
    delivery_ttl: Duration,
    retry_interval: Duration,
    stats: Arc<RelayStats>,
}

impl ExecutionRelay {
    pub fn new(sink: Arc<dyn ExecutionSink>, config: &ExecutionConfig) -> Self {
        Self {
            sink,
            delivery_ttl: config.delivery_ttl,
            retry_interval: config.retry_interval,
            stats: Arc::new(RelayStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.stats)
    }

    /// Forward mode changes from `rx` until it closes. Other event types are ignored.
    ///
    /// The returned handle completes once `rx` is closed and every in-flight
    /// delivery has finished.
    pub fn spawn(self, mut rx: mpsc::Receiver<StatusEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut in_flight: Vec<JoinHandle<()>> = Vec::new();
            while let Some(event) = rx.recv().await {
                if event.mode_change().is_none() {
                    continue;
                }
                in_flight.retain(|h| !h.is_finished());
                in_flight.push(self.spawn_delivery(event));
            }
            for handle in in_flight {
                let _ = handle.await;
            }
            info!(
                delivered = self.stats.delivered.load(Ordering::Relaxed),
                abandoned = self.stats.abandoned.load(Ordering::Relaxed),
                "Execution relay stopped"
            );
        })
    }

    fn spawn_delivery(&self, event: StatusEvent) -> JoinHandle<()> {
        let sink = Arc::clone(&self.sink);
        let stats = Arc::clone(&self.stats);
        let ttl = self.delivery_ttl;
        let retry_interval = self.retry_interval;

        tokio::spawn(async move {
            let started = Instant::now();
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                stats.attempts.fetch_add(1, Ordering::Relaxed);
                match sink.deliver(&event).await {
                    Ok(()) => {
                        stats.delivered.fetch_add(1, Ordering::Relaxed);
                        debug!(user_id = %event.user_id, seq = event.seq, attempt, "Mode change delivered");
                        return;
                    }
                    Err(e) => {
                        if started.elapsed() + retry_interval > ttl {
                            stats.abandoned.fetch_add(1, Ordering::Relaxed);
                            error!(
                                user_id = %event.user_id,
                                seq = event.seq,
                                kill = event.is_kill(),
                                attempts = attempt,
                                error = %e,
                                "Mode change delivery abandoned after TTL"
                            );
                            return;
                        }
                        warn!(user_id = %event.user_id, seq = event.seq, attempt, error = %e, "Mode change delivery failed, retrying");
                        tokio::time::sleep(retry_interval).await;
                    }
                }
            }
        })
    }
}
