//! Fan-in worker pool draining reports from several stores.
//!
//! # Architecture
//!
//! Every configured store ("remote") gets its own task that owns a
//! [`ReportConsumer`] for that store. Remote tasks only do I/O: they fetch
//! the next entry, hand it to the central loop over a shared channel of
//! capacity 1, and wait for the verdict on a one-shot reply channel. The
//! central loop owns the [`ReportProcessor`] and runs it on one entry at a
//! time, so processing is serial across all remotes while fetching is not.
//!
//! On a verdict, the remote task:
//!
//! - acks the entry on success (or if the central loop went away)
//! - on failure, reads the delivery count and either quarantines the entry
//!   or sleeps for the backoff, after which the pending-list replay brings
//!   the same entry back
//!
//! An entry that cannot be decoded never reaches the central loop but goes
//! through the same count-then-quarantine path, so it cannot wedge its store.
//!
//! Every wait races the shared [`CancellationToken`]; [`FanInPool::run`]
//! returns once all tasks have stopped.
//!
//! # Module Structure
//!
//! - [`policy`]: retry limit and backoff
//! - [`metrics`]: per-remote Prometheus metrics
//! - [`processor`]: the processing callback

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use crate::config::Config;
use crate::queue::{DEFAULT_READ_BLOCK, QueueError, ReportConsumer};
use crate::store::{RedisStore, StoreError, StreamEntry, StreamStore};
use crate::types::{AckToken, QueueEntry};

pub mod metrics;
pub mod policy;
pub mod processor;

pub use metrics::{MetricsError, PoolMetrics};
pub use policy::RetryPolicy;
pub use processor::{JsonLinesProcessor, ReportProcessor};

/// Errors that prevent the pool from starting.
#[derive(Debug, Error)]
pub enum PoolError {
    /// `run` was called with no remotes added.
    #[error("no stores to consume from")]
    NoRemotes,

    /// Could not connect to a store.
    #[error("failed to connect to store '{address}': {source}")]
    Connect {
        address: String,
        #[source]
        source: StoreError,
    },

    /// Could not join the consumer group on a store.
    #[error("failed to set up consumer on '{address}': {source}")]
    Setup {
        address: String,
        #[source]
        source: QueueError,
    },
}

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Timing settings for the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub retry: RetryPolicy,

    /// Upper bound on one blocking read for new entries.
    pub read_block: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            retry: RetryPolicy::DEFAULT,
            read_block: DEFAULT_READ_BLOCK,
        }
    }
}

impl From<&Config> for PoolConfig {
    fn from(config: &Config) -> Self {
        PoolConfig {
            retry: config.retry_policy(),
            read_block: config.read_block(),
        }
    }
}

/// One entry travelling from a remote task to the central loop.
#[derive(Debug)]
struct WorkItem {
    remote: Arc<str>,
    entry: QueueEntry,
    reply: oneshot::Sender<std::result::Result<(), String>>,
}

struct Remote<S> {
    label: Arc<str>,
    consumer: ReportConsumer<S>,
}

/// Drains reports from a set of stores through a single processor.
pub struct FanInPool<S> {
    config: PoolConfig,
    metrics: PoolMetrics,
    remotes: Vec<Remote<S>>,
}

impl<S> std::fmt::Debug for FanInPool<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let labels: Vec<&str> = self.remotes.iter().map(|r| &*r.label).collect();
        f.debug_struct("FanInPool")
            .field("config", &self.config)
            .field("remotes", &labels)
            .finish_non_exhaustive()
    }
}

impl FanInPool<RedisStore> {
    /// Connects to every store in `addresses`, each with its own connection,
    /// and joins the consumer group `group` on each.
    ///
    /// Stores are labelled by their address in logs and metrics.
    pub async fn connect(
        addresses: &[String],
        group: &str,
        config: PoolConfig,
        metrics: PoolMetrics,
    ) -> Result<Self> {
        let mut pool = FanInPool::new(config, metrics);
        for address in addresses {
            let store = RedisStore::connect(address)
                .await
                .map_err(|source| PoolError::Connect {
                    address: address.clone(),
                    source,
                })?;
            let consumer = ReportConsumer::new(store, group)
                .await
                .map_err(|source| PoolError::Setup {
                    address: address.clone(),
                    source,
                })?;
            pool.add_remote(address.clone(), consumer);
        }
        Ok(pool)
    }
}

impl<S: StreamStore> FanInPool<S> {
    /// Creates a pool with no remotes.
    pub fn new(config: PoolConfig, metrics: PoolMetrics) -> Self {
        FanInPool {
            config,
            metrics,
            remotes: Vec::new(),
        }
    }

    /// Adds a store to drain. `label` names it in logs and metrics.
    ///
    /// The consumer's own read timeout is replaced by the pool's.
    pub fn add_remote(&mut self, label: impl Into<String>, consumer: ReportConsumer<S>) {
        self.remotes.push(Remote {
            label: Arc::from(label.into()),
            consumer: consumer.with_read_block(self.config.read_block),
        });
    }

    /// Number of remotes added so far.
    pub fn remote_count(&self) -> usize {
        self.remotes.len()
    }

    /// Runs until `shutdown` is cancelled.
    ///
    /// The report being processed when shutdown is requested is processed to
    /// completion; its verdict may not be acted on, in which case it will be
    /// delivered again on the next run.
    #[instrument(skip_all, fields(remotes = self.remotes.len()))]
    pub async fn run<P: ReportProcessor>(
        self,
        mut processor: P,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let FanInPool {
            config,
            metrics,
            remotes,
        } = self;
        if remotes.is_empty() {
            return Err(PoolError::NoRemotes);
        }

        let (tx, mut rx) = mpsc::channel::<WorkItem>(1);
        let handles: Vec<JoinHandle<()>> = remotes
            .into_iter()
            .map(|remote| {
                let span = info_span!("remote", remote = %remote.label);
                let task = RemoteTask {
                    label: remote.label,
                    consumer: remote.consumer,
                    config,
                    metrics: metrics.clone(),
                    tx: tx.clone(),
                    shutdown: shutdown.clone(),
                };
                tokio::spawn(task.run().instrument(span))
            })
            .collect();
        drop(tx);

        info!(remotes = handles.len(), "Worker pool started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping worker pool");
                    break;
                }

                item = rx.recv() => {
                    let Some(item) = item else {
                        info!("All remote tasks stopped");
                        break;
                    };
                    process_one(&metrics, &mut processor, item).await;
                }
            }
        }

        drop(rx);
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Remote task panicked");
            }
        }

        info!("Worker pool stopped");
        Ok(())
    }
}

/// Runs the processor on one item and sends back the verdict.
async fn process_one<P: ReportProcessor>(metrics: &PoolMetrics, processor: &mut P, item: WorkItem) {
    let WorkItem {
        remote,
        entry,
        reply,
    } = item;

    let started = Instant::now();
    let result = processor.process(&entry).await;
    let elapsed = started.elapsed();

    metrics.record_processed(&remote, result.is_ok(), elapsed);

    let verdict = match result {
        Ok(()) => {
            debug!(remote = %remote, report_id = %entry.id, ?elapsed, "Report processed");
            Ok(())
        }
        Err(e) => {
            warn!(
                remote = %remote,
                report_id = %entry.id,
                error = %e,
                "Failed to process report"
            );
            Err(e.to_string())
        }
    };

    // The remote task may have been cancelled meanwhile.
    let _ = reply.send(verdict);
}

/// An entry whose delivery failed.
#[derive(Clone, Copy)]
enum Failed<'a> {
    /// The processor rejected it.
    Rejected(&'a QueueEntry),
    /// It could not be decoded.
    Malformed(&'a StreamEntry, &'a str),
}

impl<'a> Failed<'a> {
    fn token(&self) -> &'a AckToken {
        match *self {
            Failed::Rejected(entry) => &entry.ack_token,
            Failed::Malformed(raw, _) => &raw.id,
        }
    }
}

/// Fetch loop for one store.
struct RemoteTask<S> {
    label: Arc<str>,
    consumer: ReportConsumer<S>,
    config: PoolConfig,
    metrics: PoolMetrics,
    tx: mpsc::Sender<WorkItem>,
    shutdown: CancellationToken,
}

impl<S: StreamStore> RemoteTask<S> {
    async fn run(self) {
        debug!("Remote task started");
        while self.step().await {}
        debug!("Remote task stopped");
    }

    /// Handles one entry. Returns `false` once the task should stop.
    async fn step(&self) -> bool {
        let fetched = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return false,
            r = self.consumer.try_next_report(self.config.read_block) => r,
        };

        let entry = match fetched {
            Ok(Some(entry)) => entry,
            Ok(None) => return true,
            Err(QueueError::Decode {
                raw: Some(raw),
                reason,
                ..
            }) => {
                warn!(ack_token = %raw.id, %reason, "Failed to decode report");
                self.metrics.record_fetch_error(&self.label);
                return self.handle_failure(Failed::Malformed(&*raw, &reason)).await;
            }
            Err(e) => {
                error!(error = %e, "Failed to fetch next report");
                self.metrics.record_fetch_error(&self.label);
                return self.backoff().await;
            }
        };

        let token = entry.ack_token.clone();
        let (reply_tx, reply_rx) = oneshot::channel();
        let item = WorkItem {
            remote: Arc::clone(&self.label),
            entry: entry.clone(),
            reply: reply_tx,
        };

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return false,
            sent = self.tx.send(item) => {
                if sent.is_err() {
                    return false;
                }
            }
        }

        let verdict = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return false,
            // A dropped sender counts as success.
            v = reply_rx => v.unwrap_or(Ok(())),
        };

        match verdict {
            Ok(()) => {
                self.ack(&token).await;
                true
            }
            Err(_) => self.handle_failure(Failed::Rejected(&entry)).await,
        }
    }

    async fn ack(&self, token: &AckToken) {
        if let Err(e) = self.consumer.ack(token).await {
            // The entry stays pending and is delivered again.
            error!(ack_token = %token, error = %e, "Failed to ack report");
        }
    }

    async fn handle_failure(&self, failed: Failed<'_>) -> bool {
        let token = failed.token();
        let attempts = match self.consumer.attempt_count(token).await {
            Ok(n) => n,
            Err(e) => {
                error!(ack_token = %token, error = %e, "Failed to read attempt count");
                return self.backoff().await;
            }
        };

        if !self.config.retry.should_quarantine(attempts) {
            debug!(ack_token = %token, attempts, "Will retry report");
            return self.backoff().await;
        }

        let quarantined = match failed {
            Failed::Rejected(entry) => self.consumer.quarantine(entry).await,
            Failed::Malformed(raw, reason) => self.consumer.quarantine_malformed(raw, reason).await,
        };
        match quarantined {
            Ok(()) => {
                warn!(ack_token = %token, attempts, "Report quarantined after repeated failures");
                self.metrics.record_quarantined(&self.label);
                true
            }
            Err(e) => {
                error!(ack_token = %token, error = %e, "Failed to quarantine report");
                self.backoff().await
            }
        }
    }

    /// Sleeps for the retry backoff. Returns `false` if cancelled.
    async fn backoff(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.config.retry.backoff) => true,
        }
    }
}
