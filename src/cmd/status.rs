//! The `status` subcommand: queue depths and per-book progress.

use std::collections::BTreeMap;

use clap::Args;
use serde::Serialize;

use crate::{backend::{Backend as _, QueueKind}, prelude::*, ui::Ui};

/// Command line arguments for the `status` subcommand.
#[derive(Debug, Args)]
pub struct StatusOpts {
    #[clap(flatten)]
    pub backend_opts: super::BackendOpts,

    /// Emit machine-readable JSON instead of a table.
    #[clap(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct QueueStatus {
    queue: String,
    available: usize,
    in_flight: usize,
}

#[derive(Debug, Serialize)]
struct BookStatus {
    book: String,
    objects: usize,
    done: bool,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    queues: Vec<QueueStatus>,
    books: Vec<BookStatus>,
}

/// The `status` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_status(ui: Ui, opts: &StatusOpts) -> Result<()> {
    let backend = opts.backend_opts.connect().await?;

    let mut queues = Vec::new();
    for queue in QueueKind::ALL {
        let stats = backend.stats(queue).await?;
        queues.push(QueueStatus {
            queue: queue.name().to_owned(),
            available: stats.available,
            in_flight: stats.in_flight,
        });
    }

    let spinner = ui.spinner("Listing books");
    let keys = backend.list("").await?;
    spinner.finish_and_clear();

    // Group keys by their book prefix; the graph is the completion
    // marker.
    let mut grouped: BTreeMap<String, (usize, bool)> = BTreeMap::new();
    for entry in keys {
        let Some((book, rest)) = entry.key.split_once('/') else {
            continue;
        };
        let record = grouped.entry(book.to_owned()).or_insert((0, false));
        record.0 += 1;
        if rest == "graph.png" {
            record.1 = true;
        }
    }
    let books = grouped
        .into_iter()
        .map(|(book, (objects, done))| BookStatus {
            book,
            objects,
            done,
        })
        .collect();

    let report = StatusReport { queues, books };
    if opts.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report)
                .context("failed to serialize status report")?
        );
        return Ok(());
    }

    println!("queues:");
    for q in &report.queues {
        println!(
            "  {:<12} {:>5} available {:>5} in flight",
            q.queue, q.available, q.in_flight
        );
    }
    println!("books:");
    for b in &report.books {
        let state = if b.done { "done" } else { "in progress" };
        println!("  {:<24} {:>5} objects  {state}", b.book, b.objects);
    }
    Ok(())
}
