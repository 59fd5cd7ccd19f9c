use crate::types::{Kind, Priority, PRIORITY_LEVELS};
use fxhash::FxHashMap;
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::{Duration, SystemTime},
};

/// Number of batch-duration samples retained for the moving average.
pub const DURATION_WINDOW: usize = 100;

/// Cumulative pipeline counters, updated lock-free on the hot path.
#[derive(Debug, Default)]
pub struct StatsRecorder {
    received: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    deduplicated: AtomicU64,
    by_priority: [AtomicU64; PRIORITY_LEVELS],
    by_kind: Mutex<FxHashMap<Kind, u64>>,
    durations: Mutex<VecDeque<Duration>>,
    last_processed_at: Mutex<Option<SystemTime>>,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_received(&self, kind: Kind, priority: Priority) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.by_priority[priority.index()].fetch_add(1, Ordering::Relaxed);
        let mut by_kind = self.by_kind.lock().unwrap();
        *by_kind.entry(kind).or_insert(0) += 1;
    }

    pub(crate) fn add_processed(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.processed.fetch_add(n as u64, Ordering::Relaxed);
        *self.last_processed_at.lock().unwrap() = Some(SystemTime::now());
    }

    pub(crate) fn add_failed(&self, n: usize) {
        self.failed.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_retried(&self, n: usize) {
        self.retried.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_dropped(&self, n: usize) {
        self.dropped.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_deduplicated(&self) {
        self.deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_batch_duration(&self, duration: Duration) {
        let mut durations = self.durations.lock().unwrap();
        if durations.len() == DURATION_WINDOW {
            durations.pop_front();
        }
        durations.push_back(duration);
    }

    /// Read-only snapshot. `current_queue_size` is supplied by the caller so
    /// it reflects queued + pending-retry at the instant of the read.
    pub fn snapshot(&self, current_queue_size: usize) -> StatsSnapshot {
        let by_priority = Priority::ALL
            .iter()
            .map(|p| (*p, self.by_priority[p.index()].load(Ordering::Relaxed)))
            .collect();
        let by_kind = self
            .by_kind
            .lock()
            .unwrap()
            .iter()
            .map(|(kind, count)| (kind.to_string(), *count))
            .collect();
        let recent_batch_durations: Vec<Duration> =
            self.durations.lock().unwrap().iter().copied().collect();
        let average_batch_duration = match recent_batch_durations.len() {
            0 => None,
            n => Some(recent_batch_durations.iter().sum::<Duration>() / n as u32),
        };

        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            by_priority,
            by_kind,
            current_queue_size,
            recent_batch_durations,
            average_batch_duration,
            last_processed_at: *self.last_processed_at.lock().unwrap(),
        }
    }
}

/// Point-in-time view of the pipeline counters.
#[derive(Clone, PartialEq, Debug)]
pub struct StatsSnapshot {
    pub received: u64,
    pub processed: u64,
    pub failed: u64,
    pub retried: u64,
    pub dropped: u64,
    pub deduplicated: u64,
    pub by_priority: BTreeMap<Priority, u64>,
    pub by_kind: BTreeMap<String, u64>,
    /// Queued events plus retry-ledger entries at snapshot time.
    pub current_queue_size: usize,
    /// Most recent batch-processing durations, oldest first.
    pub recent_batch_durations: Vec<Duration>,
    pub average_batch_duration: Option<Duration>,
    pub last_processed_at: Option<SystemTime>,
}
