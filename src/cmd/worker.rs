//! The `worker` subcommand: the long-lived queue-draining process.

use std::time::Duration;

use clap::Args;
use tokio_util::sync::CancellationToken;

use crate::{
    backend::{Backend, QueueKind},
    config::{Settings, parse_stage},
    notify::{LogRing, LogSink},
    prelude::*,
    worker::{IdleHook, KeepRunning, ShutdownWhenIdle, Worker},
};

/// Command line arguments for the `worker` subcommand.
#[derive(Debug, Args)]
pub struct WorkerOpts {
    #[clap(flatten)]
    pub backend_opts: super::BackendOpts,

    /// Message visibility lease, in seconds. The heartbeat renews at
    /// half this cadence.
    #[clap(long, default_value = "120", env = "BOOKPIPE_LEASE_SECONDS")]
    pub lease_seconds: u64,

    /// Pause between checks of an empty queue, in seconds.
    #[clap(long, default_value = "180", env = "BOOKPIPE_POLL_INTERVAL")]
    pub poll_interval: u64,

    /// Quiet period before the worker reports itself idle, in seconds.
    #[clap(long, default_value = "300", env = "BOOKPIPE_IDLE_SHUTDOWN")]
    pub idle_shutdown: u64,

    /// Binarisation thresholds for the preprocess stage.
    #[clap(
        long,
        value_delimiter = ',',
        default_value = "0.1,0.2,0.4,0.5",
        env = "BOOKPIPE_THRESHOLDS"
    )]
    pub thresholds: Vec<f64>,

    /// Default OCR training (language/model) when a message carries
    /// none.
    #[clap(short = 't', long, default_value = "eng", env = "BOOKPIPE_TRAINING")]
    pub training: String,

    /// Stages this worker runs.
    #[clap(
        long,
        value_delimiter = ',',
        value_parser = parse_stage,
        default_value = "pre,wipe,page_ocr,analyse",
        env = "BOOKPIPE_STAGES"
    )]
    pub stages: Vec<QueueKind>,

    /// OCR executable.
    #[clap(long, default_value = "tesseract", env = "BOOKPIPE_OCR_COMMAND")]
    pub ocr_command: String,

    /// Exit once the queues have been quiet for the idle period, instead
    /// of polling forever. Meant for ephemeral cloud workers.
    #[clap(long, env = "BOOKPIPE_EXIT_WHEN_IDLE")]
    pub exit_when_idle: bool,
}

impl WorkerOpts {
    fn settings(&self) -> Settings {
        Settings {
            lease: Duration::from_secs(self.lease_seconds),
            poll_interval: Duration::from_secs(self.poll_interval),
            idle_shutdown: Duration::from_secs(self.idle_shutdown),
            thresholds: self.thresholds.clone(),
            default_training: self.training.clone(),
            enabled: self.stages.clone(),
            ocr_command: self.ocr_command.clone(),
        }
    }
}

/// The `worker` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_worker(opts: &WorkerOpts, logs: Arc<LogRing>) -> Result<()> {
    let backend = opts.backend_opts.connect().await?;
    let settings = Arc::new(opts.settings());
    info!(
        "worker starting: stages {:?}, lease {:?}, bucket {}",
        settings.enabled,
        settings.lease,
        backend.bucket()
    );
    for &queue in &settings.enabled {
        debug!("queue {queue}: {}", backend.queue_id(queue));
    }

    let idle_hook: Box<dyn IdleHook> = if opts.exit_when_idle {
        Box::new(ShutdownWhenIdle)
    } else {
        Box::new(KeepRunning)
    };
    let worker = Worker::new(backend, settings, Arc::new(LogSink), logs, idle_hook);

    // Ctrl-C cancels the whole pipeline cooperatively; an in-flight
    // message is simply left to be redelivered elsewhere.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; shutting down");
            signal_cancel.cancel();
        }
    });

    worker.run(cancel).await
}
