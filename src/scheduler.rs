use crate::{
    config::{BatchPolicy, PipelineConfig},
    notify::{Notice, NoticeBus},
    queue::PriorityQueueSet,
    retry::RetryLedger,
    sink::Sink,
    stats::StatsRecorder,
    types::{EventRecord, Priority, PRIORITY_LEVELS},
};
use fxhash::FxHashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use tokio::time::Instant;
use tracing::debug;

/// Cancellable handle for an armed per-priority wait timer.
#[derive(Debug)]
struct TimerHandle {
    task: tokio::task::JoinHandle<()>,
}

/// Clears a flush-in-flight flag even if the owning future is dropped.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// An extracted batch plus the in-flight claim for its priority.
///
/// Extraction is synchronous; awaiting the sink happens in
/// [`FlushScheduler::complete`], so a caller can empty a queue on its own
/// thread and hand the I/O to the runtime.
pub(crate) struct FlushJob {
    priority: Priority,
    batch: Vec<EventRecord>,
    _guard: InFlightGuard,
}

/// Drives per-priority timers and size triggers, pulling batches off the
/// queue set and submitting them to the sink.
///
/// Timer state machine per priority: idle -> armed -> fired -> idle. An
/// armed timer is a spawned sleep; cancellation aborts the sleep before the
/// flush is handed off, so a cancelled timer never extracts a batch.
pub struct FlushScheduler {
    queues: Arc<PriorityQueueSet>,
    sink: Arc<dyn Sink>,
    retry: Arc<RetryLedger>,
    stats: Arc<StatsRecorder>,
    bus: Arc<NoticeBus>,
    policies: [BatchPolicy; PRIORITY_LEVELS],
    enable_auto_flush: bool,
    timers: Mutex<FxHashMap<Priority, TimerHandle>>,
    in_flight: [Arc<AtomicBool>; PRIORITY_LEVELS],
    all_in_flight: Arc<AtomicBool>,
    handle: tokio::runtime::Handle,
    closed: AtomicBool,
}

impl std::fmt::Debug for FlushScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushScheduler")
            .field("queued", &self.queues.total_queued())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl FlushScheduler {
    pub fn new(
        config: &PipelineConfig,
        queues: Arc<PriorityQueueSet>,
        sink: Arc<dyn Sink>,
        retry: Arc<RetryLedger>,
        stats: Arc<StatsRecorder>,
        bus: Arc<NoticeBus>,
        handle: tokio::runtime::Handle,
    ) -> Self {
        Self {
            queues,
            sink,
            retry,
            stats,
            bus,
            policies: config.policies(),
            enable_auto_flush: config.enable_auto_flush,
            timers: Mutex::new(FxHashMap::default()),
            in_flight: std::array::from_fn(|_| Arc::new(AtomicBool::new(false))),
            all_in_flight: Arc::new(AtomicBool::new(false)),
            handle,
            closed: AtomicBool::new(false),
        }
    }

    /// Arm the wait timer for a priority. No-op when one is already armed,
    /// the queue is empty, auto-flush is disabled, or the scheduler is
    /// closed. A zero wait flushes immediately instead of arming.
    pub fn start_timer(self: &Arc<Self>, priority: Priority) {
        if self.closed.load(Ordering::Acquire) || !self.enable_auto_flush {
            return;
        }
        if self.queues.len(priority) == 0 {
            return;
        }
        let wait = self.policies[priority.index()].max_wait();
        if wait.is_zero() {
            self.spawn_flush(priority);
            return;
        }

        let mut timers = self.timers.lock().unwrap();
        if timers.contains_key(&priority) {
            return;
        }
        let sched = Arc::clone(self);
        let task = self.handle.spawn(async move {
            tokio::time::sleep(wait).await;
            sched.timers.lock().unwrap().remove(&priority);
            sched.spawn_flush(priority);
        });
        timers.insert(priority, TimerHandle { task });
        debug!(%priority, wait_ms = wait.as_millis() as u64, "Armed flush timer");
    }

    /// Abort an armed timer, if any.
    pub fn cancel_timer(&self, priority: Priority) {
        if let Some(timer) = self.timers.lock().unwrap().remove(&priority) {
            timer.task.abort();
        }
    }

    pub fn timer_armed(&self, priority: Priority) -> bool {
        self.timers.lock().unwrap().contains_key(&priority)
    }

    /// Hand a flush for this priority to the runtime without awaiting it.
    pub(crate) fn spawn_flush(self: &Arc<Self>, priority: Priority) {
        let sched = Arc::clone(self);
        self.handle.spawn(async move {
            sched.process_queue(priority).await;
        });
    }

    /// Hand an already-extracted batch to the runtime without awaiting it.
    pub(crate) fn spawn_complete(self: &Arc<Self>, job: FlushJob) {
        let sched = Arc::clone(self);
        self.handle.spawn(async move {
            sched.complete(job).await;
        });
    }

    /// Synchronously extract a batch and claim the priority's in-flight
    /// flag. Returns `None` when a flush is already in flight or the queue
    /// is empty.
    pub(crate) fn begin_flush(&self, priority: Priority) -> Option<FlushJob> {
        self.cancel_timer(priority);
        let flag = &self.in_flight[priority.index()];
        if flag.swap(true, Ordering::Acquire) {
            return None;
        }
        let guard = InFlightGuard(Arc::clone(flag));

        let batch = self
            .queues
            .take_batch(priority, self.policies[priority.index()].max_batch_size);
        if batch.is_empty() {
            return None; // guard drop releases the claim
        }
        Some(FlushJob {
            priority,
            batch,
            _guard: guard,
        })
    }

    /// Submit an extracted batch and settle the results. Returns
    /// `(processed, failed)` counts for the batch.
    pub(crate) async fn complete(self: Arc<Self>, job: FlushJob) -> (usize, usize) {
        let FlushJob {
            priority,
            batch,
            _guard,
        } = job;
        let size = batch.len();
        let started = Instant::now();
        let outcome = self.sink.process(batch).await;
        let elapsed = started.elapsed();

        let processed = outcome.processed.len();
        let failed = outcome.failed.len();
        self.stats.record_batch_duration(elapsed);
        self.stats.add_processed(processed);
        self.stats.add_failed(failed);
        debug!(
            %priority,
            batch = size,
            processed,
            failed,
            elapsed_ms = elapsed.as_millis() as u64,
            "Flushed batch"
        );
        for event in outcome.failed {
            self.retry.record(event);
        }
        self.bus.emit(Notice::Flushed {
            priority,
            processed,
            failed,
        });

        // Release the claim before deciding on a follow-up flush
        drop(_guard);
        if self.queues.len(priority) > 0 {
            self.start_timer(priority);
        }
        (processed, failed)
    }

    /// Flush one batch for a priority: cancel its timer, extract, submit.
    /// `(0, 0)` when the queue is empty or a flush is already in flight.
    pub async fn process_queue(self: &Arc<Self>, priority: Priority) -> (usize, usize) {
        match self.begin_flush(priority) {
            Some(job) => Arc::clone(self).complete(job).await,
            None => (0, 0),
        }
    }

    /// Drain every queue in strict priority order. Idempotent under
    /// concurrency: an overlapping call returns `(0, 0)`.
    pub async fn flush_all(self: &Arc<Self>) -> (usize, usize) {
        if self.all_in_flight.swap(true, Ordering::Acquire) {
            return (0, 0);
        }
        let _guard = InFlightGuard(Arc::clone(&self.all_in_flight));

        for priority in Priority::ALL {
            self.cancel_timer(priority);
        }

        let mut processed = 0;
        let mut failed = 0;
        for priority in Priority::ALL {
            while self.queues.len(priority) > 0 {
                let (p, f) = self.process_queue(priority).await;
                if p + f == 0 {
                    // Another flush owns this queue; it will finish the drain
                    break;
                }
                processed += p;
                failed += f;
            }
        }
        (processed, failed)
    }

    /// Stop arming timers and cancel any that are armed. Queued events stay
    /// queued for a final `flush_all`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for priority in Priority::ALL {
            self.cancel_timer(priority);
        }
    }
}
