use crate::types::{EventRecord, Kind};
use async_trait::async_trait;
use fxhash::FxHashSet;
use itertools::Itertools;
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Outcome of one sink submission: every input event lands in exactly one
/// of the two lists.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct SinkOutcome {
    /// Durably accepted, annotated with the store-assigned id.
    pub processed: Vec<EventRecord>,
    /// Not accepted; the pipeline routes these into the retry ledger.
    pub failed: Vec<EventRecord>,
}

impl SinkOutcome {
    pub fn all_processed(processed: Vec<EventRecord>) -> Self {
        Self {
            processed,
            failed: Vec::new(),
        }
    }

    pub fn all_failed(failed: Vec<EventRecord>) -> Self {
        Self {
            processed: Vec::new(),
            failed,
        }
    }
}

/// Pluggable durable destination for event batches.
///
/// Implementations must not panic past this boundary: any internal error
/// converts the affected events (or the whole batch) into `failed` entries
/// of the returned outcome. Delivery is at-least-once end-to-end, so
/// implementations should tolerate redelivered records.
#[async_trait]
pub trait Sink: Send + Sync + 'static {
    async fn process(&self, batch: Vec<EventRecord>) -> SinkOutcome;
}

fn annotate(event: &mut EventRecord) {
    event.persisted_id = Some(Uuid::new_v4());
    event.processed = true;
}

/// In-memory sink used by tests and demos.
///
/// Failures are scriptable: whole calls can be failed with
/// [`fail_next`](Self::fail_next), and individual kinds with
/// [`fail_kind`](Self::fail_kind), so partial-failure and retry paths are
/// exercisable without a real store.
#[derive(Debug, Default)]
pub struct MemorySink {
    accepted: Mutex<Vec<EventRecord>>,
    failing_kinds: Mutex<FxHashSet<Kind>>,
    fail_calls: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `calls` submissions entirely.
    pub fn fail_next(&self, calls: usize) {
        self.fail_calls.store(calls, Ordering::SeqCst);
    }

    /// Fail every event of this kind until [`heal_kind`](Self::heal_kind).
    pub fn fail_kind(&self, kind: Kind) {
        self.failing_kinds.lock().unwrap().insert(kind);
    }

    pub fn heal_kind(&self, kind: Kind) {
        self.failing_kinds.lock().unwrap().remove(&kind);
    }

    pub fn accepted(&self) -> Vec<EventRecord> {
        self.accepted.lock().unwrap().clone()
    }

    pub fn accepted_len(&self) -> usize {
        self.accepted.lock().unwrap().len()
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn process(&self, batch: Vec<EventRecord>) -> SinkOutcome {
        if self.fail_calls.load(Ordering::SeqCst) > 0 {
            self.fail_calls.fetch_sub(1, Ordering::SeqCst);
            return SinkOutcome::all_failed(batch);
        }

        let failing = self.failing_kinds.lock().unwrap().clone();
        let mut outcome = SinkOutcome::default();
        for mut event in batch {
            if failing.contains(&event.kind) {
                outcome.failed.push(event);
            } else {
                annotate(&mut event);
                self.accepted.lock().unwrap().push(event.clone());
                outcome.processed.push(event);
            }
        }
        outcome
    }
}

/// Durable append-only journal sink backed by a JSON-lines file.
///
/// A batch is attempted as one bulk append first; if that write fails the
/// sink degrades to appending events one at a time within the same call, so
/// a single poisoned record cannot fail the whole batch. A bulk append that
/// errors midway may leave records on disk that are also retried later;
/// consumers of the journal must tolerate at-least-once duplicates.
#[derive(Debug)]
pub struct JournalSink {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl JournalSink {
    pub async fn create<P: AsRef<Path>>(path: P) -> Result<Self, crate::error::Error> {
        let path = path.as_ref().to_owned();
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode(event: &EventRecord) -> Option<String> {
        match serde_json::to_string(event) {
            Ok(line) => Some(line),
            Err(err) => {
                warn!(kind = %event.kind, "Failed to encode event record ({err})");
                None
            }
        }
    }
}

async fn append(file: &mut tokio::fs::File, buf: &[u8]) -> std::io::Result<()> {
    file.write_all(buf).await?;
    file.flush().await
}

#[async_trait]
impl Sink for JournalSink {
    async fn process(&self, batch: Vec<EventRecord>) -> SinkOutcome {
        let mut annotated = batch;
        for event in annotated.iter_mut() {
            annotate(event);
        }

        let mut file = self.file.lock().await;

        // Bulk append first
        let lines = annotated.iter().filter_map(Self::encode).collect_vec();
        if lines.len() == annotated.len() {
            let buf = lines.iter().map(|l| format!("{l}\n")).join("");
            match append(&mut file, buf.as_bytes()).await {
                Ok(()) => {
                    debug!(events = annotated.len(), "Appended batch to journal");
                    return SinkOutcome::all_processed(annotated);
                }
                Err(err) => {
                    warn!(
                        events = annotated.len(),
                        "Bulk journal append failed ({err}), degrading to per-record appends"
                    );
                }
            }
        }

        // Per-record fallback: one bad record fails alone
        let mut outcome = SinkOutcome::default();
        for mut event in annotated {
            let appended = match Self::encode(&event) {
                Some(line) => match append(&mut file, format!("{line}\n").as_bytes()).await {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(kind = %event.kind, "Journal append failed ({err})");
                        false
                    }
                },
                None => false,
            };
            if appended {
                outcome.processed.push(event);
            } else {
                event.persisted_id = None;
                event.processed = false;
                outcome.failed.push(event);
            }
        }
        outcome
    }
}
