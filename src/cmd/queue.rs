//! The `enqueue` and `drain` subcommands: operational escape hatches
//! for poking queues directly.

use std::time::Duration;

use clap::Args;

use crate::{backend::{Backend as _, QueueKind}, prelude::*};

/// Command line arguments for the `enqueue` subcommand.
#[derive(Debug, Args)]
pub struct EnqueueOpts {
    /// Target queue.
    pub queue: QueueKind,

    /// Message body (see the queue message grammar).
    pub body: String,

    #[clap(flatten)]
    pub backend_opts: super::BackendOpts,
}

/// The `enqueue` subcommand.
pub async fn cmd_enqueue(opts: &EnqueueOpts) -> Result<()> {
    let backend = opts.backend_opts.connect().await?;
    backend
        .enqueue(opts.queue, &opts.body)
        .await?;
    info!("enqueued {:?} on {}", opts.body, opts.queue);
    Ok(())
}

/// Command line arguments for the `drain` subcommand.
#[derive(Debug, Args)]
pub struct DrainOpts {
    /// Queue to empty out.
    pub queue: QueueKind,

    #[clap(flatten)]
    pub backend_opts: super::BackendOpts,
}

/// The `drain` subcommand. Receives and deletes messages until the
/// queue stays empty for one long-poll window.
pub async fn cmd_drain(opts: &DrainOpts) -> Result<()> {
    let backend = opts.backend_opts.connect().await?;
    let lease = Duration::from_secs(30);
    let mut drained = 0usize;
    while let Some(msg) = backend
        .check(opts.queue, lease)
        .await?
    {
        println!("{}", msg.body);
        backend
            .delete(opts.queue, &msg.handle)
            .await?;
        drained += 1;
    }
    info!("drained {drained} messages from {}", opts.queue);
    Ok(())
}
