use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use bookpipe::{
    cmd,
    notify::{LogRing, LogRingLayer},
    prelude::*,
    ui::Ui,
};

/// Distributed OCR pipeline for books of scanned page images.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - BOOKPIPE_BACKEND: "cloud" or "local".
  - BOOKPIPE_BUCKET / BOOKPIPE_QUEUE_PREFIX: cloud backend names.
  - BOOKPIPE_LOCAL_ROOT: root directory of the local backend.

  Standard AWS environment variables and credential files are used
  for the cloud backend.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Run a worker, draining the configured queues until stopped.
    Worker(cmd::worker::WorkerOpts),
    /// Upload a directory of page images as a new book and enqueue it.
    Upload(cmd::upload::UploadOpts),
    /// Download a finished book's artifacts.
    Results(cmd::results::ResultsOpts),
    /// Show queue depths and per-book progress.
    Status(cmd::status::StatusOpts),
    /// Append a raw message to a queue.
    Enqueue(cmd::queue::EnqueueOpts),
    /// Receive and delete every message on a queue.
    Drain(cmd::queue::DrainOpts),
    /// Delete every object a book owns.
    Rm(cmd::rm::RmOpts),
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();
    let logs = LogRing::new();

    // Initialize tracing. Recent lines also land in the ring buffer
    // that failure notifications quote from.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(ui.stderr_writer())
        .with_filter(env_filter);
    let ring_layer =
        LogRingLayer::new(logs.clone()).with_filter(EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(ring_layer)
        .init();

    real_main(ui, logs).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui, logs: Arc<LogRing>) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    let opts = Opts::parse();
    debug!("parsed options: {:?}", opts);

    match &opts.subcmd {
        Cmd::Worker(opts) => cmd::worker::cmd_worker(opts, logs).await,
        Cmd::Upload(opts) => cmd::upload::cmd_upload(ui, opts).await,
        Cmd::Results(opts) => cmd::results::cmd_results(ui, opts).await,
        Cmd::Status(opts) => cmd::status::cmd_status(ui, opts).await,
        Cmd::Enqueue(opts) => cmd::queue::cmd_enqueue(opts).await,
        Cmd::Drain(opts) => cmd::queue::cmd_drain(opts).await,
        Cmd::Rm(opts) => cmd::rm::cmd_rm(ui, opts).await,
    }
}
