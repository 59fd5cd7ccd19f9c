use crate::types::{Kind, Priority};
use derive_more::Display;
use tokio::sync::broadcast;
use tracing::debug;

/// Why an event was permanently discarded.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum DropReason {
    #[display("backpressure")]
    Backpressure,
    #[display("max_retries")]
    RetriesExhausted,
}

/// Pipeline lifecycle notices published to subscribers.
#[derive(Clone, Debug)]
pub enum Notice {
    /// An event was admitted and enqueued.
    Added { kind: Kind, priority: Priority },
    /// An event reached a terminal drop.
    Dropped {
        kind: Kind,
        priority: Priority,
        reason: DropReason,
    },
    /// An event was coalesced with a live duplicate and not enqueued.
    Deduplicated { kind: Kind, priority: Priority },
    /// A batch came back from the sink.
    Flushed {
        priority: Priority,
        processed: usize,
        failed: usize,
    },
}

/// Broadcast fan-out for [`Notice`] values.
///
/// Emission never blocks and never fails: with no subscribers the notice is
/// discarded, and a lagging subscriber observes `RecvError::Lagged` rather
/// than slowing producers down.
#[derive(Debug)]
pub struct NoticeBus {
    tx: broadcast::Sender<Notice>,
}

impl NoticeBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, notice: Notice) {
        if let Err(err) = self.tx.send(notice) {
            debug!("No notice subscribers ({err})");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for NoticeBus {
    fn default() -> Self {
        Self::new(256)
    }
}
