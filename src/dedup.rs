use crate::types::{DedupKey, EventRecord};
use fxhash::FxHashMap;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Suppresses near-duplicate events within a time window.
///
/// A duplicate is a handled event, not an error: callers that see `true`
/// from [`check`](Self::check) must skip the enqueue, count the event as
/// deduplicated, and still report success to the producer.
#[derive(Debug)]
pub struct Deduplicator {
    window: Duration,
    seen: Mutex<FxHashMap<DedupKey, Instant>>,
}

impl Deduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(FxHashMap::default()),
        }
    }

    /// Returns true when a live entry with the event's dedup key exists
    /// within the window; otherwise records the key and returns false.
    pub fn check(&self, event: &EventRecord) -> bool {
        let key = DedupKey::of(event);
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap();
        match seen.get(&key) {
            Some(at) if now.duration_since(*at) < self.window => true,
            _ => {
                seen.insert(key, now);
                false
            }
        }
    }

    /// Removes entries older than the window; returns how many were evicted.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap();
        let before = seen.len();
        seen.retain(|_, at| now.duration_since(*at) < self.window);
        before - seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Background sweep keeping the window map bounded. Exits when the
    /// shutdown token is cancelled.
    pub(crate) fn spawn_sweeper(
        self: &Arc<Self>,
        handle: &tokio::runtime::Handle,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let dedup = Arc::clone(self);
        let period = dedup.window.max(Duration::from_millis(1));
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = dedup.sweep();
                        if evicted > 0 {
                            debug!(evicted, "Expired dedup window entries");
                        }
                    }
                }
            }
        })
    }
}
