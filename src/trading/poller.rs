//! Activity poller: fetches the target's new activity and coalesces it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::ActivityFeed;
use crate::models::ActivityEvent;

/// Liveness counters shared between the poller and whoever reports on it.
#[derive(Debug)]
pub struct PollerHealth {
    running: AtomicBool,
    last_poll: RwLock<Instant>,
    timeouts: AtomicU64,
    events: AtomicU64,
    ordering_violations: AtomicU64,
}

/// Point-in-time view of [`PollerHealth`].
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSnapshot {
    pub running: bool,
    pub seconds_since_last_poll: f64,
    pub timeouts: u64,
    pub events: u64,
    pub ordering_violations: u64,
}

impl Default for PollerHealth {
    fn default() -> Self {
        Self {
            running: AtomicBool::new(false),
            last_poll: RwLock::new(Instant::now()),
            timeouts: AtomicU64::new(0),
            events: AtomicU64::new(0),
            ordering_violations: AtomicU64::new(0),
        }
    }
}

impl PollerHealth {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn snapshot(&self) -> HealthSnapshot {
        self.read(false).await
    }

    /// Snapshot for a heartbeat line. Resets the timeout counter.
    pub async fn heartbeat(&self) -> HealthSnapshot {
        self.read(true).await
    }

    async fn read(&self, reset_timeouts: bool) -> HealthSnapshot {
        let last_poll = *self.last_poll.read().await;
        let timeouts = if reset_timeouts {
            self.timeouts.swap(0, Ordering::SeqCst)
        } else {
            self.timeouts.load(Ordering::SeqCst)
        };
        HealthSnapshot {
            running: self.is_running(),
            seconds_since_last_poll: last_poll.elapsed().as_secs_f64(),
            timeouts,
            events: self.events.load(Ordering::SeqCst),
            ordering_violations: self.ordering_violations.load(Ordering::SeqCst),
        }
    }

    fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    async fn mark_polled(&self) {
        *self.last_poll.write().await = Instant::now();
    }
}

/// Result of scanning one newest-first page against the high-water mark.
#[derive(Debug, Clone, PartialEq)]
pub struct PageScan {
    /// New non-reward events, oldest first
    pub fresh: Vec<ActivityEvent>,
    /// New high-water mark
    pub newest: i64,
    /// New events found after the walk had already stopped
    pub ordering_violations: u64,
}

/// Walk a newest-first page and keep what is newer than `since`.
///
/// The walk stops at the first event at or before `since`. Anything newer
/// found past that point is counted but not retained.
pub fn scan_page(page: &[ActivityEvent], since: i64) -> PageScan {
    let newest = page
        .iter()
        .map(|e| e.observed_at)
        .fold(since, i64::max);

    let stop = page
        .iter()
        .position(|e| e.observed_at <= since)
        .unwrap_or(page.len());

    let mut fresh: Vec<ActivityEvent> = page[..stop]
        .iter()
        .filter(|e| !e.is_reward())
        .cloned()
        .collect();
    fresh.reverse();

    let ordering_violations = page[stop..]
        .iter()
        .filter(|e| e.observed_at > since)
        .count() as u64;

    PageScan {
        fresh,
        newest,
        ordering_violations,
    }
}

/// Coalesce runs of adjacent events that share a merge key.
pub fn merge_adjacent(events: Vec<ActivityEvent>) -> Vec<ActivityEvent> {
    events
        .into_iter()
        .fold(Vec::new(), |mut merged: Vec<ActivityEvent>, event| {
            if let Some(last) = merged.last_mut() {
                if last.merge_key() == event.merge_key() {
                    if last.absorb(&event) {
                        return merged;
                    }
                    warn!(
                        kind = %event.tag(),
                        market = %event.market_id,
                        "Merged size overflowed, keeping events apart"
                    );
                }
            }
            merged.push(event);
            merged
        })
}

/// Polls the activity feed for one target address.
pub struct ActivityPoller {
    target: String,
    feed: Arc<dyn ActivityFeed>,
    page_size: u32,
    poll_interval: Duration,
    last_fetch_time: i64,
    health: Arc<PollerHealth>,
}

impl ActivityPoller {
    pub fn new(
        target: impl Into<String>,
        feed: Arc<dyn ActivityFeed>,
        page_size: u32,
        poll_interval: Duration,
    ) -> Self {
        Self {
            target: target.into(),
            feed,
            page_size,
            poll_interval,
            last_fetch_time: Utc::now().timestamp(),
            health: Arc::new(PollerHealth::default()),
        }
    }

    /// Start from an explicit high-water mark instead of now.
    #[cfg(test)]
    pub fn with_last_fetch_time(mut self, timestamp: i64) -> Self {
        self.last_fetch_time = timestamp;
        self
    }

    pub fn health(&self) -> Arc<PollerHealth> {
        self.health.clone()
    }

    #[cfg(test)]
    pub fn last_fetch_time(&self) -> i64 {
        self.last_fetch_time
    }

    /// One fetch cycle. Feed errors produce an empty batch and leave the
    /// high-water mark untouched.
    pub async fn poll_once(&mut self) -> Vec<ActivityEvent> {
        let page = match self.feed.recent_activity(&self.target, self.page_size).await {
            Ok(page) => page,
            Err(e) if e.is_timeout() => {
                self.health.timeouts.fetch_add(1, Ordering::SeqCst);
                warn!(address = %self.target, "Activity fetch timed out");
                return Vec::new();
            }
            Err(e) => {
                error!(address = %self.target, error = %e, "Activity fetch failed");
                return Vec::new();
            }
        };
        self.health.mark_polled().await;
        debug!(count = page.len(), "Fetched activities");

        let scan = scan_page(&page, self.last_fetch_time);
        if scan.ordering_violations > 0 {
            self.health
                .ordering_violations
                .fetch_add(scan.ordering_violations, Ordering::SeqCst);
            warn!(
                skipped = scan.ordering_violations,
                since = self.last_fetch_time,
                "Activity page out of order, newer events were not processed"
            );
        }
        self.last_fetch_time = scan.newest;

        let found = scan.fresh.len();
        let merged = merge_adjacent(scan.fresh);
        if merged.len() < found {
            info!(found, merged = merged.len(), "New activities merged");
        } else if found > 0 {
            debug!(found, "New activities");
        }
        merged
    }

    /// Poll until `shutdown` fires, publishing merged events in order.
    pub async fn run(mut self, tx: mpsc::Sender<ActivityEvent>, mut shutdown: watch::Receiver<bool>) {
        self.health.set_running(true);
        info!(address = %self.target, interval = ?self.poll_interval, "Starting activity poller");

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'outer: loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            for event in self.poll_once().await {
                info!(
                    kind = %event.tag(),
                    market = %event.label,
                    size = %event.share_size,
                    price = %event.price,
                    usdc = %event.cash_size,
                    "New activity"
                );
                tokio::select! {
                    sent = tx.send(event) => {
                        if sent.is_err() {
                            warn!("Event channel closed, stopping poller");
                            break 'outer;
                        }
                        self.health.events.fetch_add(1, Ordering::SeqCst);
                    }
                    _ = shutdown.changed() => break 'outer,
                }
            }
        }

        self.health.set_running(false);
        info!(address = %self.target, "Activity poller stopped");
    }
}

/// Log a heartbeat from `health` every `period` until `shutdown` fires.
pub fn spawn_heartbeat(
    health: Arc<PollerHealth>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            let beat = health.heartbeat().await;
            info!(
                running = beat.running,
                last_poll_secs = beat.seconds_since_last_poll,
                timeouts = beat.timeouts,
                activities = beat.events,
                out_of_order = beat.ordering_violations,
                "Poller heartbeat"
            );
        }
    })
}
