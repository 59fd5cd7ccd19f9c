use crate::{
    config::PipelineConfig,
    dedup::Deduplicator,
    error::Error,
    notify::{Notice, NoticeBus},
    queue::{FlushTrigger, PriorityQueueSet},
    retry::RetryLedger,
    scheduler::FlushScheduler,
    sink::Sink,
    stats::{StatsRecorder, StatsSnapshot},
    types::{Details, EventRecord, LogOptions, Priority, RequestContext},
};
use internment::Intern;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::SystemTime,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// What a producer gets back from `log`: the constructed record and the
/// admission verdict. Rejection is never an error; `admitted` is the only
/// failure signal producers see.
#[derive(Clone, PartialEq, Debug)]
pub struct LogOutcome {
    pub event: EventRecord,
    pub admitted: bool,
}

/// Facade over the dispatch pipeline.
///
/// Construct one instance at startup, hand clones of the `Arc` to
/// producers, and call [`shutdown`](Self::shutdown) on termination so
/// buffered events are not lost. `log` is synchronous and never blocks on
/// I/O: sink submissions run on the runtime captured at construction.
#[derive(Debug)]
pub struct Dispatcher {
    config: PipelineConfig,
    queues: Arc<PriorityQueueSet>,
    scheduler: Arc<FlushScheduler>,
    retry: Arc<RetryLedger>,
    stats: Arc<StatsRecorder>,
    bus: Arc<NoticeBus>,
    shutdown_token: CancellationToken,
    closed: AtomicBool,
}

impl Dispatcher {
    /// Wire the pipeline against a sink. Must be called within a tokio
    /// runtime; the runtime handle is captured for background work.
    pub fn new(config: PipelineConfig, sink: Arc<dyn Sink>) -> Result<Self, Error> {
        config.validate()?;
        let handle =
            tokio::runtime::Handle::try_current().map_err(|_| Error::RuntimeUnavailable)?;

        let stats = Arc::new(StatsRecorder::new());
        let bus = Arc::new(NoticeBus::default());
        let shutdown_token = CancellationToken::new();

        let dedup = config
            .enable_deduplication
            .then(|| Arc::new(Deduplicator::new(config.deduplication_window())));
        if let Some(dedup) = dedup.as_ref() {
            dedup.spawn_sweeper(&handle, shutdown_token.clone());
        }

        let queues = Arc::new(PriorityQueueSet::new(
            &config,
            dedup,
            Arc::clone(&stats),
            Arc::clone(&bus),
        ));
        let retry = Arc::new(RetryLedger::new(
            config.max_retry_attempts,
            config.retry_delay(),
        ));
        retry.spawn_ticker(
            &handle,
            Arc::clone(&sink),
            Arc::clone(&stats),
            Arc::clone(&bus),
            shutdown_token.clone(),
        );

        let scheduler = Arc::new(FlushScheduler::new(
            &config,
            Arc::clone(&queues),
            sink,
            Arc::clone(&retry),
            Arc::clone(&stats),
            Arc::clone(&bus),
            handle,
        ));

        Ok(Self {
            config,
            queues,
            scheduler,
            retry,
            stats,
            bus,
            shutdown_token,
            closed: AtomicBool::new(false),
        })
    }

    /// Ingest one event. Returns immediately with a local echo of the
    /// record; any triggered flush runs on the runtime.
    pub fn log<K: AsRef<str>, S: AsRef<str>>(
        &self,
        kind: K,
        source: S,
        details: Details,
        opts: LogOptions,
    ) -> LogOutcome {
        let kind = kind.as_ref();
        let priority = opts
            .priority
            .unwrap_or_else(|| self.config.default_priority_for(kind));
        let event = EventRecord {
            id: Uuid::new_v4(),
            kind: Intern::new(kind.to_owned()),
            priority,
            source: Intern::new(source.as_ref().to_owned()),
            timestamp: Some(SystemTime::now()),
            details,
            correlation_id: opts.correlation_id,
            session_id: opts.session_id,
            persisted_id: None,
            processed: false,
        };

        if self.closed.load(Ordering::Acquire) {
            debug!(kind, "Event ignored, dispatcher is shut down");
            return LogOutcome {
                event,
                admitted: false,
            };
        }

        let outcome = self.queues.add(event.clone());
        if let Some(trigger) = outcome.trigger {
            self.apply_trigger(trigger);
        }
        LogOutcome {
            event,
            admitted: outcome.admitted,
        }
    }

    /// Ingest one event, merging actor id / origin address / path / method
    /// from the request context into the details first.
    pub fn log_from_context<K: AsRef<str>, S: AsRef<str>>(
        &self,
        kind: K,
        source: S,
        ctx: &RequestContext,
        mut details: Details,
        opts: LogOptions,
    ) -> LogOutcome {
        ctx.merge_into(&mut details);
        self.log(kind, source, details, opts)
    }

    /// Ingest a batch of pre-built records; returns how many were admitted.
    pub fn log_many(&self, events: Vec<EventRecord>) -> usize {
        if self.closed.load(Ordering::Acquire) {
            debug!(events = events.len(), "Batch ignored, dispatcher is shut down");
            return 0;
        }
        let admission = self.queues.add_batch(events);
        for trigger in admission.triggers {
            self.apply_trigger(trigger);
        }
        admission.admitted
    }

    fn apply_trigger(&self, (priority, trigger): (Priority, FlushTrigger)) {
        match trigger {
            FlushTrigger::Now => {
                // Extract synchronously so the queue is already empty when
                // the producer call returns; only the sink I/O is deferred
                if let Some(job) = self.scheduler.begin_flush(priority) {
                    self.scheduler.spawn_complete(job);
                }
            }
            FlushTrigger::Timer => self.scheduler.start_timer(priority),
        }
    }

    /// Drain every queue now. Returns aggregate `(processed, failed)`
    /// counts; a call overlapping another flush returns `(0, 0)`.
    pub async fn flush(&self) -> (usize, usize) {
        self.scheduler.flush_all().await
    }

    /// Read-only counters snapshot. `current_queue_size` covers queued
    /// events plus pending retries at the instant of the call.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats
            .snapshot(self.queues.total_queued() + self.retry.len())
    }

    /// Subscribe to pipeline notices.
    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.bus.subscribe()
    }

    /// Stop background work and drain remaining events with one final
    /// flush. Idempotent; later calls return `(0, 0)`.
    pub async fn shutdown(&self) -> (usize, usize) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return (0, 0);
        }
        debug!("Shutting down event dispatcher");
        self.shutdown_token.cancel();
        self.scheduler.close();

        match tokio::time::timeout(
            self.config.shutdown_timeout(),
            self.scheduler.flush_all(),
        )
        .await
        {
            Ok(counts) => counts,
            Err(_) => {
                warn!(
                    timeout_ms = self.config.shutdown_timeout_ms,
                    "Final drain timed out, remaining events were not flushed"
                );
                (0, 0)
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Stops the sweeper and retry ticker if shutdown was never called
        self.shutdown_token.cancel();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sink::MemorySink;
    use pretty_assertions::assert_eq;

    fn details(user: &str) -> Details {
        let mut details = Details::new();
        details.insert("user".to_owned(), user.into());
        details
    }

    #[tokio::test(start_paused = true)]
    async fn log_applies_configured_default_priorities() {
        let mut config = PipelineConfig {
            enable_auto_flush: false,
            ..Default::default()
        };
        config
            .default_priorities
            .insert("payment.declined".to_owned(), Priority::Critical);
        let dispatcher =
            Dispatcher::new(config, Arc::new(MemorySink::new()) as Arc<dyn Sink>).unwrap();

        let declined = dispatcher.log("payment.declined", "api", Details::new(), LogOptions::default());
        assert_eq!(declined.event.priority, Priority::Critical);

        let unknown = dispatcher.log("page.view", "web", Details::new(), LogOptions::default());
        assert_eq!(unknown.event.priority, Priority::Info);

        let overridden = dispatcher.log(
            "page.view",
            "web",
            details("u-1"),
            LogOptions {
                priority: Some(Priority::High),
                ..Default::default()
            },
        );
        assert_eq!(overridden.event.priority, Priority::High);
        dispatcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn context_fields_are_merged_into_details() {
        let config = PipelineConfig {
            enable_auto_flush: false,
            ..Default::default()
        };
        let dispatcher =
            Dispatcher::new(config, Arc::new(MemorySink::new()) as Arc<dyn Sink>).unwrap();

        let ctx = RequestContext {
            actor_id: Some("u-9".to_owned()),
            origin_addr: Some("10.0.0.9".to_owned()),
            path: Some("/login".to_owned()),
            method: Some("POST".to_owned()),
        };
        let outcome =
            dispatcher.log_from_context("auth.login", "web", &ctx, Details::new(), LogOptions::default());

        assert_eq!(
            outcome.event.details.get("actor-id"),
            Some(&"u-9".into())
        );
        assert_eq!(
            outcome.event.details.get("origin-addr"),
            Some(&"10.0.0.9".into())
        );
        dispatcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_idempotent_and_rejects_late_events() {
        let memory = Arc::new(MemorySink::new());
        let config = PipelineConfig {
            enable_auto_flush: false,
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(config, memory.clone() as Arc<dyn Sink>).unwrap();

        dispatcher.log("page.view", "web", details("u-1"), LogOptions::default());
        assert_eq!(dispatcher.shutdown().await, (1, 0));
        assert_eq!(memory.accepted_len(), 1);
        assert_eq!(dispatcher.shutdown().await, (0, 0));

        let late = dispatcher.log("page.view", "web", details("u-2"), LogOptions::default());
        assert!(!late.admitted);
        assert_eq!(dispatcher.stats().current_queue_size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn log_many_admits_and_triggers() {
        let memory = Arc::new(MemorySink::new());
        let config = PipelineConfig {
            enable_deduplication: false,
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(config, memory.clone() as Arc<dyn Sink>).unwrap();

        let events = (0..3)
            .map(|seq| {
                let mut d = Details::new();
                d.insert("seq".to_owned(), (seq as u64).into());
                EventRecord::new("alert", "probe", d).with_priority(Priority::High)
            })
            .collect();
        assert_eq!(dispatcher.log_many(events), 3);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(memory.accepted_len(), 3);
        dispatcher.shutdown().await;
    }
}
