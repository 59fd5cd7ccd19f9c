use crate::{
    notify::{DropReason, Notice, NoticeBus},
    sink::Sink,
    stats::StatsRecorder,
    types::{DedupKey, EventRecord},
};
use fxhash::FxHashMap;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A failed event awaiting resubmission.
#[derive(Clone, Debug)]
pub struct RetryEntry {
    pub event: EventRecord,
    pub attempts: u32,
    pub next_retry_at: Instant,
}

/// Tracks failed events and resubmits them on a fixed-delay schedule until
/// they succeed or exhaust their attempt budget.
#[derive(Debug)]
pub struct RetryLedger {
    max_attempts: u32,
    delay: Duration,
    entries: Mutex<FxHashMap<DedupKey, RetryEntry>>,
    // Scan and in-flight resubmission are mutually exclusive
    scanning: AtomicBool,
}

struct ScanGuard<'a>(&'a AtomicBool);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RetryLedger {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            entries: Mutex::new(FxHashMap::default()),
            scanning: AtomicBool::new(false),
        }
    }

    /// Record a delivery failure. An existing entry for the event's dedup
    /// key accumulates attempts; a new entry starts at one.
    pub fn record(&self, event: EventRecord) {
        self.record_with_attempts(event, 1);
    }

    fn record_with_attempts(&self, event: EventRecord, floor: u32) {
        let key = DedupKey::of(&event);
        let next_retry_at = Instant::now() + self.delay;
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&key) {
            Some(entry) => {
                entry.attempts = (entry.attempts + 1).max(floor);
                entry.next_retry_at = next_retry_at;
            }
            None => {
                entries.insert(
                    key,
                    RetryEntry {
                        event,
                        attempts: floor,
                        next_retry_at,
                    },
                );
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every due entry, split into resubmission candidates and
    /// attempt-exhausted drops.
    fn collect_due(&self, now: Instant) -> (Vec<RetryEntry>, Vec<RetryEntry>) {
        let mut entries = self.entries.lock().unwrap();
        let due_keys: Vec<DedupKey> = entries
            .iter()
            .filter(|(_, entry)| entry.next_retry_at <= now)
            .map(|(key, _)| key.clone())
            .collect();

        let mut resubmit = Vec::new();
        let mut expired = Vec::new();
        for key in due_keys {
            if let Some(entry) = entries.remove(&key) {
                if entry.attempts < self.max_attempts {
                    resubmit.push(entry);
                } else {
                    expired.push(entry);
                }
            }
        }
        (resubmit, expired)
    }

    /// One retry cycle: drop exhausted entries, resubmit the rest as a
    /// single batch, and re-record anything that failed again. Returns
    /// `(resubmitted, dropped)`; a cycle overlapping an in-flight one is a
    /// no-op.
    pub async fn tick(
        &self,
        sink: &Arc<dyn Sink>,
        stats: &StatsRecorder,
        bus: &NoticeBus,
    ) -> (usize, usize) {
        if self.scanning.swap(true, Ordering::Acquire) {
            return (0, 0);
        }
        let _guard = ScanGuard(&self.scanning);

        let (resubmit, expired) = self.collect_due(Instant::now());

        let dropped = expired.len();
        for entry in expired {
            warn!(
                kind = %entry.event.kind,
                priority = %entry.event.priority,
                attempts = entry.attempts,
                "Dropping event after exhausting retries"
            );
            stats.add_dropped(1);
            bus.emit(Notice::Dropped {
                kind: entry.event.kind,
                priority: entry.event.priority,
                reason: DropReason::RetriesExhausted,
            });
        }

        if resubmit.is_empty() {
            return (0, dropped);
        }

        let attempts_by_key: FxHashMap<DedupKey, u32> = resubmit
            .iter()
            .map(|entry| (DedupKey::of(&entry.event), entry.attempts))
            .collect();
        let batch: Vec<EventRecord> = resubmit.into_iter().map(|entry| entry.event).collect();
        let resubmitted = batch.len();
        stats.add_retried(resubmitted);
        debug!(events = resubmitted, "Resubmitting failed events");

        let outcome = sink.process(batch).await;
        stats.add_processed(outcome.processed.len());
        stats.add_failed(outcome.failed.len());
        for event in outcome.failed {
            // Attempts accumulate across cycles even though the entry was
            // removed for the duration of the submission
            let prior = attempts_by_key
                .get(&DedupKey::of(&event))
                .copied()
                .unwrap_or(0);
            self.record_with_attempts(event, prior + 1);
        }

        (resubmitted, dropped)
    }

    /// Background retry loop on a fixed interval. Exits when the shutdown
    /// token is cancelled.
    pub(crate) fn spawn_ticker(
        self: &Arc<Self>,
        handle: &tokio::runtime::Handle,
        sink: Arc<dyn Sink>,
        stats: Arc<StatsRecorder>,
        bus: Arc<NoticeBus>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let ledger = Arc::clone(self);
        let period = ledger.delay.max(Duration::from_millis(1));
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        ledger.tick(&sink, &stats, &bus).await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sink::MemorySink;
    use crate::types::{Details, Priority};
    use internment::Intern;
    use pretty_assertions::assert_eq;

    fn event(kind: &str, seq: u64) -> EventRecord {
        let mut details = Details::new();
        details.insert("seq".to_owned(), seq.into());
        EventRecord::new(kind, "test", details).with_priority(Priority::Medium)
    }

    fn deps() -> (Arc<dyn Sink>, Arc<MemorySink>, StatsRecorder, NoticeBus) {
        let memory = Arc::new(MemorySink::new());
        let sink: Arc<dyn Sink> = memory.clone();
        (sink, memory, StatsRecorder::new(), NoticeBus::default())
    }

    #[test]
    fn record_accumulates_attempts_per_key() {
        let ledger = RetryLedger::new(3, Duration::from_secs(60));
        ledger.record(event("a", 0));
        ledger.record(event("a", 0));
        ledger.record(event("b", 1));

        assert_eq!(ledger.len(), 2);
        let entries = ledger.entries.lock().unwrap();
        let attempts: Vec<u32> = entries.values().map(|e| e.attempts).collect();
        assert_eq!(attempts.iter().sum::<u32>(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn due_entries_are_resubmitted_as_one_batch() {
        let (sink, memory, stats, bus) = deps();
        let ledger = RetryLedger::new(3, Duration::from_secs(60));
        ledger.record(event("a", 0));
        ledger.record(event("b", 1));

        // Nothing due yet
        assert_eq!(ledger.tick(&sink, &stats, &bus).await, (0, 0));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(ledger.tick(&sink, &stats, &bus).await, (2, 0));
        assert!(ledger.is_empty());
        assert_eq!(memory.accepted_len(), 2);
        assert_eq!(stats.snapshot(0).retried, 2);
        assert_eq!(stats.snapshot(0).processed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failures_exhaust_and_drop() {
        let (sink, memory, stats, bus) = deps();
        let ledger = RetryLedger::new(2, Duration::from_secs(60));
        memory.fail_kind(Intern::new("a".to_owned()));

        ledger.record(event("a", 0));

        // First cycle: attempts 1 -> resubmitted, fails again -> attempts 2
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(ledger.tick(&sink, &stats, &bus).await, (1, 0));
        assert_eq!(ledger.len(), 1);

        // Second cycle: attempts 2 >= max -> dropped
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(ledger.tick(&sink, &stats, &bus).await, (0, 1));
        assert!(ledger.is_empty());
        assert_eq!(stats.snapshot(0).dropped, 1);
        assert_eq!(memory.accepted_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn success_on_retry_terminates_the_entry() {
        let (sink, memory, stats, bus) = deps();
        let ledger = RetryLedger::new(3, Duration::from_secs(60));
        memory.fail_kind(Intern::new("a".to_owned()));
        ledger.record(event("a", 0));

        tokio::time::advance(Duration::from_secs(61)).await;
        ledger.tick(&sink, &stats, &bus).await;
        assert_eq!(ledger.len(), 1);

        memory.heal_kind(Intern::new("a".to_owned()));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(ledger.tick(&sink, &stats, &bus).await, (1, 0));
        assert!(ledger.is_empty());
        assert_eq!(memory.accepted_len(), 1);
        assert_eq!(stats.snapshot(0).dropped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_task_drives_cycles() {
        let (sink, memory, stats, bus) = deps();
        let ledger = Arc::new(RetryLedger::new(3, Duration::from_secs(60)));
        ledger.record(event("a", 0));

        let shutdown = CancellationToken::new();
        let task = ledger.spawn_ticker(
            &tokio::runtime::Handle::current(),
            sink,
            Arc::new(stats),
            Arc::new(bus),
            shutdown.clone(),
        );

        tokio::time::advance(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        assert!(ledger.is_empty());
        assert_eq!(memory.accepted_len(), 1);

        shutdown.cancel();
        task.await.unwrap();
    }
}
