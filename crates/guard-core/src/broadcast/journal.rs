//! Durable audit trail of committed status events.
//!
//! A broadcaster tap feeds [`JournalWriter`], which batches events and appends
//! them to an [`EventJournal`]. Failed appends are retried with backoff while
//! new events keep queuing in the tap; the guard never waits on the journal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use guard_common::{ClickHouseClient, ClickHouseError};

use super::events::StatusEvent;
use crate::collaborators::{EventJournal, ProviderError};
use crate::retry::RetryPolicy;

/// Journal backed by the `status_events` ClickHouse table.
#[derive(Clone)]
pub struct ClickHouseJournal {
    client: ClickHouseClient,
}

impl ClickHouseJournal {
    pub fn new(client: ClickHouseClient) -> Self {
        Self { client }
    }

    /// Check connectivity and create the table if needed.
    pub async fn prepare(&self) -> Result<(), ClickHouseError> {
        self.client.ping().await?;
        self.client.create_tables().await
    }
}

#[async_trait]
impl EventJournal for ClickHouseJournal {
    async fn append(&self, events: &[StatusEvent]) -> Result<(), ProviderError> {
        let rows: Vec<_> = events.iter().map(StatusEvent::to_row).collect();
        self.client
            .insert_status_events(&rows)
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct JournalWriterConfig {
    pub batch_size: usize,
    pub flush_period: Duration,
    /// Backoff between failed appends; attempts are unbounded.
    pub backoff: RetryPolicy,
}

impl Default for JournalWriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            flush_period: Duration::from_secs(2),
            backoff: RetryPolicy {
                max_attempts: u32::MAX,
                base_delay: Duration::from_millis(250),
                max_delay: Duration::from_secs(30),
            },
        }
    }
}

#[derive(Debug, Default)]
pub struct JournalStats {
    pub events_written: AtomicU64,
    pub batches_written: AtomicU64,
    pub append_failures: AtomicU64,
}

/// Batches tap events into the journal.
pub struct JournalWriter {
    journal: Arc<dyn EventJournal>,
    config: JournalWriterConfig,
    stats: Arc<JournalStats>,
}

impl JournalWriter {
    pub fn new(journal: Arc<dyn EventJournal>, config: JournalWriterConfig) -> Self {
        Self {
            journal,
            config,
            stats: Arc::new(JournalStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<JournalStats> {
        Arc::clone(&self.stats)
    }

    /// Consume `rx` until it closes, flushing what is left before exiting.
    pub fn spawn(self, mut rx: mpsc::Receiver<StatusEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let batch_size = self.config.batch_size.max(1);
            let mut buffer: Vec<StatusEvent> = Vec::with_capacity(batch_size);
            let mut ticker = interval(self.config.flush_period);

            info!(batch_size, flush_period_ms = self.config.flush_period.as_millis() as u64, "Journal writer started");

            loop {
                tokio::select! {
                    maybe_event = rx.recv() => {
                        match maybe_event {
                            Some(event) => {
                                buffer.push(event);
                                if buffer.len() >= batch_size {
                                    self.flush(&mut buffer).await;
                                }
                            }
                            None => {
                                self.flush(&mut buffer).await;
                                break;
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        if !buffer.is_empty() {
                            self.flush(&mut buffer).await;
                        }
                    }
                }
            }

            info!(
                events = self.stats.events_written.load(Ordering::Relaxed),
                "Journal writer stopped"
            );
        })
    }

    /// Append `buffer`, retrying until it is accepted or rejected outright.
    async fn flush(&self, buffer: &mut Vec<StatusEvent>) {
        if buffer.is_empty() {
            return;
        }
        let mut attempt = 0u32;
        loop {
            match self.journal.append(buffer).await {
                Ok(()) => {
                    self.stats
                        .events_written
                        .fetch_add(buffer.len() as u64, Ordering::Relaxed);
                    self.stats.batches_written.fetch_add(1, Ordering::Relaxed);
                    debug!(events = buffer.len(), "Journal batch written");
                    buffer.clear();
                    return;
                }
                Err(ProviderError::Rejected(reason)) => {
                    self.stats.append_failures.fetch_add(1, Ordering::Relaxed);
                    error!(events = buffer.len(), reason = %reason, "Journal rejected batch, dropping it");
                    buffer.clear();
                    return;
                }
                Err(e) => {
                    self.stats.append_failures.fetch_add(1, Ordering::Relaxed);
                    attempt = attempt.saturating_add(1);
                    if attempt >= self.config.backoff.max_attempts {
                        error!(events = buffer.len(), error = %e, "Journal append abandoned");
                        buffer.clear();
                        return;
                    }
                    let delay = self.config.backoff.delay_for(attempt);
                    warn!(events = buffer.len(), attempt, error = %e, delay_ms = delay.as_millis() as u64, "Journal append failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
