use clap::Parser;
use event_relay::{
    Details, Dispatcher, Error, JournalSink, LogOptions, MemorySink, Notice, PipelineConfig,
    Priority, Sink,
};
use std::{path::PathBuf, sync::Arc};
use tracing::info;

/// Burst-ingestion demo: floods the pipeline with a mix of priorities and
/// prints the resulting stats snapshot.
#[derive(Debug, clap::Parser)]
struct Opts {
    /// Number of events to log
    #[arg(long, default_value_t = 5_000)]
    events: u64,

    /// Append accepted events to this JSON-lines journal instead of the
    /// in-memory sink
    #[arg(long)]
    journal: Option<PathBuf>,
}

const KINDS: &[(&str, Priority)] = &[
    ("page.view", Priority::Info),
    ("auth.login", Priority::Medium),
    ("media.upload", Priority::Low),
    ("payment.declined", Priority::High),
    ("service.panic", Priority::Critical),
];

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();

    let opts = Opts::parse();

    let sink: Arc<dyn Sink> = match &opts.journal {
        Some(path) => Arc::new(JournalSink::create(path).await?),
        None => Arc::new(MemorySink::new()),
    };
    let dispatcher = Arc::new(Dispatcher::new(PipelineConfig::default(), sink)?);

    let mut notices = dispatcher.subscribe();
    let watcher = tokio::spawn(async move {
        let mut dropped = 0_u64;
        while let Ok(notice) = notices.recv().await {
            if let Notice::Dropped { kind, reason, .. } = notice {
                dropped += 1;
                info!(%kind, %reason, dropped, "Event dropped");
            }
        }
        dropped
    });

    for seq in 0..opts.events {
        let (kind, priority) = KINDS[(seq % KINDS.len() as u64) as usize];
        let mut details = Details::new();
        details.insert("seq".to_owned(), seq.into());
        dispatcher.log(
            kind,
            "burst-demo",
            details,
            LogOptions {
                priority: Some(priority),
                ..Default::default()
            },
        );
    }

    let (processed, failed) = dispatcher.shutdown().await;
    info!(processed, failed, "Final drain complete");

    let stats = dispatcher.stats();
    println!("{stats:#?}");

    drop(dispatcher);
    watcher.abort();
    Ok(())
}
