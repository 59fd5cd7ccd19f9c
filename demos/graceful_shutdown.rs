use clap::Parser;
use event_relay::{Details, Dispatcher, Error, JournalSink, LogOptions, PipelineConfig, Sink};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::info;

/// Runs a background producer for a while, then shuts the pipeline down and
/// reports how many buffered events the final drain persisted.
#[derive(Debug, clap::Parser)]
struct Opts {
    /// JSON-lines journal the events are persisted to
    #[arg(long, default_value = "events.jsonl")]
    journal: PathBuf,

    /// How long to produce before shutting down (seconds)
    #[arg(long, default_value_t = 2)]
    run_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();

    let opts = Opts::parse();

    let sink: Arc<dyn Sink> = Arc::new(JournalSink::create(&opts.journal).await?);
    let dispatcher = Arc::new(Dispatcher::new(PipelineConfig::default(), sink)?);

    let producer = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            let mut seq = 0_u64;
            loop {
                let mut details = Details::new();
                details.insert("seq".to_owned(), seq.into());
                dispatcher.log("sensor.reading", "probe-1", details, LogOptions::default());
                seq += 1;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    };

    tokio::time::sleep(Duration::from_secs(opts.run_secs)).await;
    producer.abort();

    let queued = dispatcher.stats().current_queue_size;
    info!(queued, "Stopping producer, draining the pipeline");

    let (processed, failed) = dispatcher.shutdown().await;
    info!(
        processed,
        failed,
        journal = %opts.journal.display(),
        "Shutdown complete"
    );
    Ok(())
}
