use crate::{
    config::{BatchPolicy, PipelineConfig},
    dedup::Deduplicator,
    notify::{DropReason, Notice, NoticeBus},
    stats::StatsRecorder,
    types::{EventRecord, Priority, PRIORITY_LEVELS},
};
use itertools::Itertools;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::SystemTime,
};
use tracing::{debug, warn};

/// Follow-up the caller owes the flush scheduler after an admission.
///
/// The queue set never invokes the scheduler itself; returning the decision
/// keeps admission free of locks held across scheduler work.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FlushTrigger {
    /// Extract and submit a batch for this priority now.
    Now,
    /// Arm the priority's wait timer if none is armed.
    Timer,
}

/// Result of a single admission attempt.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct AdmitOutcome {
    /// False only for a backpressure rejection (a terminal drop).
    /// Deduplicated events are admitted-but-not-enqueued.
    pub admitted: bool,
    pub trigger: Option<(Priority, FlushTrigger)>,
}

impl AdmitOutcome {
    fn rejected() -> Self {
        Self {
            admitted: false,
            trigger: None,
        }
    }

    fn handled() -> Self {
        Self {
            admitted: true,
            trigger: None,
        }
    }
}

/// Aggregate result of a bulk admission.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct BatchAdmission {
    pub admitted: usize,
    /// At most one trigger per priority; `Now` wins over `Timer`.
    pub triggers: Vec<(Priority, FlushTrigger)>,
}

/// Five independently-thresholded FIFO queues with admission control.
#[derive(Debug)]
pub struct PriorityQueueSet {
    queues: Mutex<[VecDeque<EventRecord>; PRIORITY_LEVELS]>,
    total_queued: AtomicUsize,
    policies: [BatchPolicy; PRIORITY_LEVELS],
    enable_auto_flush: bool,
    enable_backpressure: bool,
    max_queue_size: usize,
    process_high_priority_immediately: bool,
    dedup: Option<Arc<Deduplicator>>,
    stats: Arc<StatsRecorder>,
    bus: Arc<NoticeBus>,
}

impl PriorityQueueSet {
    pub fn new(
        config: &PipelineConfig,
        dedup: Option<Arc<Deduplicator>>,
        stats: Arc<StatsRecorder>,
        bus: Arc<NoticeBus>,
    ) -> Self {
        Self {
            queues: Mutex::new(std::array::from_fn(|_| VecDeque::new())),
            total_queued: AtomicUsize::new(0),
            policies: config.policies(),
            enable_auto_flush: config.enable_auto_flush,
            enable_backpressure: config.enable_backpressure,
            max_queue_size: config.max_queue_size,
            process_high_priority_immediately: config.process_high_priority_immediately,
            dedup,
            stats,
            bus,
        }
    }

    /// Admit a single event.
    pub fn add(&self, mut event: EventRecord) -> AdmitOutcome {
        let priority = event.priority;
        self.stats.record_received(event.kind, priority);

        // Above the global ceiling only CRITICAL events get through
        if self.enable_backpressure
            && priority != Priority::Critical
            && self.total_queued.load(Ordering::Acquire) >= self.max_queue_size
        {
            self.stats.add_dropped(1);
            warn!(
                kind = %event.kind,
                %priority,
                max_queue_size = self.max_queue_size,
                "Event rejected by backpressure"
            );
            self.bus.emit(Notice::Dropped {
                kind: event.kind,
                priority,
                reason: DropReason::Backpressure,
            });
            return AdmitOutcome::rejected();
        }

        if event.timestamp.is_none() {
            event.timestamp = Some(SystemTime::now());
        }

        if let Some(dedup) = self.dedup.as_deref() {
            if dedup.check(&event) {
                self.stats.add_deduplicated();
                debug!(kind = %event.kind, %priority, "Coalesced duplicate event");
                self.bus.emit(Notice::Deduplicated {
                    kind: event.kind,
                    priority,
                });
                return AdmitOutcome::handled();
            }
        }

        let kind = event.kind;
        let queue_len = {
            let mut queues = self.queues.lock().unwrap();
            let queue = &mut queues[priority.index()];
            queue.push_back(event);
            self.total_queued.fetch_add(1, Ordering::Release);
            queue.len()
        };
        self.bus.emit(Notice::Added { kind, priority });

        AdmitOutcome {
            admitted: true,
            trigger: self.trigger_for(priority, queue_len),
        }
    }

    /// Admit a batch of pre-built records.
    pub fn add_batch(&self, events: Vec<EventRecord>) -> BatchAdmission {
        let mut admitted = 0;
        let mut triggers = Vec::new();
        for event in events {
            let outcome = self.add(event);
            if outcome.admitted {
                admitted += 1;
            }
            if let Some(trigger) = outcome.trigger {
                triggers.push(trigger);
            }
        }

        // Collapse to the strongest follow-up per priority
        let triggers = triggers
            .into_iter()
            .sorted_by_key(|(priority, trigger)| (*priority, *trigger != FlushTrigger::Now))
            .unique_by(|(priority, _)| *priority)
            .collect();

        BatchAdmission { admitted, triggers }
    }

    fn trigger_for(&self, priority: Priority, queue_len: usize) -> Option<(Priority, FlushTrigger)> {
        if !self.enable_auto_flush {
            return None;
        }
        let immediate = self.process_high_priority_immediately && priority <= Priority::High;
        if immediate || queue_len >= self.policies[priority.index()].max_batch_size {
            Some((priority, FlushTrigger::Now))
        } else {
            Some((priority, FlushTrigger::Timer))
        }
    }

    /// Remove and return up to `max` events from the front of a queue.
    ///
    /// Extraction completes and releases the lock before any sink call, so
    /// producers are never blocked behind slow I/O.
    pub fn take_batch(&self, priority: Priority, max: usize) -> Vec<EventRecord> {
        let mut queues = self.queues.lock().unwrap();
        let queue = &mut queues[priority.index()];
        let count = queue.len().min(max);
        let batch: Vec<EventRecord> = queue.drain(..count).collect();
        self.total_queued.fetch_sub(batch.len(), Ordering::Release);
        batch
    }

    pub fn len(&self, priority: Priority) -> usize {
        self.queues.lock().unwrap()[priority.index()].len()
    }

    pub fn total_queued(&self) -> usize {
        self.total_queued.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.total_queued() == 0
    }
}
