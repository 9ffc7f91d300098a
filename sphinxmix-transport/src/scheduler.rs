//! # Mix Scheduler
//!
//! Decides when unwrapped packets leave the node. Reordering and delaying
//! packets is what breaks the timing link between a node's inputs and
//! outputs.
//!
//! Two strategies:
//! - [`ThresholdScheduler`]: collect packets until a threshold, then shuffle
//!   and release the whole batch after one random delay.
//! - [`ContinuousTimeScheduler`]: delay every packet independently.
//!
//! Every scheduled release is a timer task tracked by the scheduler, so
//! shutdown can cancel releases that have not fired yet. A cancelled release
//! never forwards anything.

use std::mem;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::future::join_all;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::packet::MixPacket;
use crate::sphinx::MessageTag;
use crate::{MixError, NodeId, Result};

/// Default threshold batch size.
pub const DEFAULT_THRESHOLD: usize = 100;

/// Default upper bound on a release delay.
pub const DEFAULT_MAX_DELAY_MS: u64 = 600_000;

/// Something a node sends onwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Re-encrypted packet for the next mix.
    Mix {
        /// Next mix.
        destination: NodeId,
        /// Packet to forward.
        packet: MixPacket,
    },
    /// Reply for a client.
    Client {
        /// Receiving client.
        client_id: NodeId,
        /// Reply block tag.
        message_tag: MessageTag,
        /// Reply payload.
        payload: Vec<u8>,
    },
}

/// Performs the actual sending of released items.
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    /// Send one item.
    async fn dispatch(&self, outbound: Outbound) -> Result<()>;
}

/// Mixing strategy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MixStrategy {
    /// Batch until `threshold`, then release after one uniform delay.
    Threshold {
        /// Batch size that triggers a release.
        threshold: usize,
        /// Upper bound of the release delay in milliseconds.
        max_delay_ms: u64,
    },
    /// Delay every packet independently.
    ContinuousTime {
        /// Upper bound of each delay in milliseconds.
        max_delay_ms: u64,
    },
}

impl Default for MixStrategy {
    fn default() -> Self {
        Self::Threshold {
            threshold: DEFAULT_THRESHOLD,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl MixStrategy {
    /// Reject unusable settings.
    pub fn validate(&self) -> Result<()> {
        if let Self::Threshold { threshold: 0, .. } = self {
            return Err(MixError::ConfigError("threshold must be at least 1".into()));
        }
        Ok(())
    }

    /// Build the scheduler for this strategy.
    pub fn build(&self, dispatcher: Arc<dyn Dispatch>) -> Result<Box<dyn MixScheduler>> {
        self.validate()?;
        Ok(match *self {
            Self::Threshold {
                threshold,
                max_delay_ms,
            } => Box::new(ThresholdScheduler::new(
                threshold,
                Duration::from_millis(max_delay_ms),
                dispatcher,
            )),
            Self::ContinuousTime { max_delay_ms } => Box::new(ContinuousTimeScheduler::new(
                Duration::from_millis(max_delay_ms),
                dispatcher,
            )),
        })
    }
}

/// Scheduler counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Items waiting for a batch to fill.
    pub buffered: usize,
    /// Items in releases that have not fired.
    pub scheduled: usize,
    /// Releases scheduled so far.
    pub releases: u64,
    /// Items handed to the dispatcher.
    pub released: u64,
    /// Items dropped by cancellation.
    pub cancelled: u64,
}

/// A mixing strategy.
#[async_trait]
pub trait MixScheduler: Send + Sync {
    /// Accept one item.
    fn submit(&self, outbound: Outbound);

    /// Items accepted but not yet released.
    fn pending(&self) -> usize;

    /// Current counters.
    fn stats(&self) -> SchedulerStats;

    /// Wait until every scheduled release has fired. Items still waiting for
    /// a batch to fill stay buffered.
    async fn drain(&self);

    /// Cancel every release that has not fired. Idempotent.
    async fn shutdown(&self);
}

fn uniform_delay(max_delay: Duration) -> Duration {
    let max_ms = u64::try_from(max_delay.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Tracks delayed releases and their cancellation.
struct Releases {
    dispatcher: Arc<dyn Dispatch>,
    tasks: TaskTracker,
    cancel: CancellationToken,
    counters: Arc<ReleaseCounters>,
}

#[derive(Default)]
struct ReleaseCounters {
    scheduled: AtomicUsize,
    releases: AtomicU64,
    released: AtomicU64,
    cancelled: AtomicU64,
}

impl Releases {
    fn new(dispatcher: Arc<dyn Dispatch>) -> Self {
        Self {
            dispatcher,
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
            counters: Arc::new(ReleaseCounters::default()),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn discard(&self, size: usize) {
        if size > 0 {
            self.counters.cancelled.fetch_add(size as u64, Ordering::SeqCst);
            debug!(size, "items dropped after shutdown");
        }
    }

    fn schedule(&self, delay: Duration, batch: Vec<Outbound>) {
        let size = batch.len();
        if self.is_cancelled() {
            self.discard(size);
            return;
        }

        self.counters.scheduled.fetch_add(size, Ordering::SeqCst);
        self.counters.releases.fetch_add(1, Ordering::SeqCst);

        let cancel = self.cancel.clone();
        let dispatcher = self.dispatcher.clone();
        let counters = self.counters.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    counters.scheduled.fetch_sub(size, Ordering::SeqCst);
                    counters.cancelled.fetch_add(size as u64, Ordering::SeqCst);
                    debug!(size, "release cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    counters.scheduled.fetch_sub(size, Ordering::SeqCst);
                    let results = join_all(batch.into_iter().map(|item| dispatcher.dispatch(item))).await;
                    for result in results {
                        match result {
                            Ok(()) => {
                                counters.released.fetch_add(1, Ordering::SeqCst);
                            }
                            Err(e) => warn!("Dispatch failed: {}", e),
                        }
                    }
                }
            }
        });
    }

    fn scheduled(&self) -> usize {
        self.counters.scheduled.load(Ordering::SeqCst)
    }

    fn stats(&self, buffered: usize) -> SchedulerStats {
        SchedulerStats {
            buffered,
            scheduled: self.scheduled(),
            releases: self.counters.releases.load(Ordering::SeqCst),
            released: self.counters.released.load(Ordering::SeqCst),
            cancelled: self.counters.cancelled.load(Ordering::SeqCst),
        }
    }

    async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

/// Threshold batching.
pub struct ThresholdScheduler {
    threshold: usize,
    max_delay: Duration,
    batch: Mutex<Vec<Outbound>>,
    releases: Releases,
}

impl ThresholdScheduler {
    /// Release batches of `threshold` items after a delay in `[0, max_delay]`.
    pub fn new(threshold: usize, max_delay: Duration, dispatcher: Arc<dyn Dispatch>) -> Self {
        Self {
            threshold: threshold.max(1),
            max_delay,
            batch: Mutex::new(Vec::with_capacity(threshold)),
            releases: Releases::new(dispatcher),
        }
    }

    fn buffered(&self) -> usize {
        self.batch.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl MixScheduler for ThresholdScheduler {
    fn submit(&self, outbound: Outbound) {
        let detached = {
            let mut batch = self.batch.lock().unwrap_or_else(PoisonError::into_inner);
            // Checked under the lock: shutdown cancels before it empties the
            // batch, so nothing can land in a batch that was already dropped.
            if self.releases.is_cancelled() {
                drop(batch);
                self.releases.discard(1);
                return;
            }
            batch.push(outbound);
            if batch.len() >= self.threshold {
                Some(mem::replace(&mut *batch, Vec::with_capacity(self.threshold)))
            } else {
                None
            }
        };

        if let Some(mut batch) = detached {
            batch.shuffle(&mut rand::thread_rng());
            let delay = uniform_delay(self.max_delay);
            info!(size = batch.len(), delay_ms = delay.as_millis() as u64, "batch released");
            self.releases.schedule(delay, batch);
        }
    }

    fn pending(&self) -> usize {
        self.buffered() + self.releases.scheduled()
    }

    fn stats(&self) -> SchedulerStats {
        self.releases.stats(self.buffered())
    }

    async fn drain(&self) {
        self.releases.drain().await;
    }

    async fn shutdown(&self) {
        self.releases.shutdown().await;
        let dropped = mem::take(&mut *self.batch.lock().unwrap_or_else(PoisonError::into_inner));
        self.releases.discard(dropped.len());
    }
}

/// Independent per-item delays.
pub struct ContinuousTimeScheduler {
    max_delay: Duration,
    releases: Releases,
}

impl ContinuousTimeScheduler {
    /// Release each item after its own delay in `[0, max_delay]`.
    pub fn new(max_delay: Duration, dispatcher: Arc<dyn Dispatch>) -> Self {
        Self {
            max_delay,
            releases: Releases::new(dispatcher),
        }
    }
}

#[async_trait]
impl MixScheduler for ContinuousTimeScheduler {
    fn submit(&self, outbound: Outbound) {
        let delay = uniform_delay(self.max_delay);
        debug!(delay_ms = delay.as_millis() as u64, "packet delayed");
        self.releases.schedule(delay, vec![outbound]);
    }

    fn pending(&self) -> usize {
        self.releases.scheduled()
    }

    fn stats(&self) -> SchedulerStats {
        self.releases.stats(0)
    }

    async fn drain(&self) {
        self.releases.drain().await;
    }

    async fn shutdown(&self) {
        self.releases.shutdown().await;
    }
}
