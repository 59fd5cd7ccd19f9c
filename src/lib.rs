#![doc = include_str!("../README.md")]

pub use crate::config::*;
pub use crate::dispatcher::{Dispatcher, LogOutcome};
pub use crate::error::Error;
pub use crate::notify::{DropReason, Notice, NoticeBus};
pub use crate::sink::{JournalSink, MemorySink, Sink, SinkOutcome};
pub use crate::stats::{StatsSnapshot, DURATION_WINDOW};
pub use crate::types::*;

pub mod config;
pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod notify;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod sink;
pub mod stats;
pub mod types;
