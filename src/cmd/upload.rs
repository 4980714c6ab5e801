//! The `upload` subcommand: put a book's page images into the object
//! store and enqueue it for processing.

use clap::Args;

use crate::{backend::{Backend as _, QueueKind}, naming, prelude::*, ui::Ui};

/// Command line arguments for the `upload` subcommand.
#[derive(Debug, Args)]
pub struct UploadOpts {
    /// Directory of page images (`.jpg` / `.png`).
    pub dir: PathBuf,

    /// Book name (used as the object-store prefix).
    pub book: String,

    #[clap(flatten)]
    pub backend_opts: super::BackendOpts,

    /// Enqueue on the wipe-only queue (pages are already binarised)
    /// instead of preprocess.
    #[clap(long)]
    pub wipe: bool,

    /// OCR training to request, appended to the queue message.
    #[clap(short = 't', long)]
    pub training: Option<String>,

    /// Upload even if the book already has objects in the store.
    #[clap(long)]
    pub force: bool,
}

/// The `upload` subcommand.
#[instrument(level = "debug", skip_all, fields(book = %opts.book))]
pub async fn cmd_upload(ui: Ui, opts: &UploadOpts) -> Result<()> {
    let backend = opts.backend_opts.connect().await?;

    let existing = backend
        .list(&format!("{}/", opts.book))
        .await?;
    if !existing.is_empty() && !opts.force {
        return Err(anyhow!(
            "book {} already has {} objects; use --force to upload anyway",
            opts.book,
            existing.len()
        ));
    }

    let mut pages: Vec<PathBuf> = std::fs::read_dir(&opts.dir)
        .with_context(|| format!("failed to read {:?}", opts.dir))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(naming::is_page_image)
        })
        .collect();
    pages.sort();
    if pages.is_empty() {
        return Err(anyhow!("no page images found in {:?}", opts.dir));
    }

    let pb = ui.bar("Uploading pages", pages.len() as u64);
    for page in &pages {
        let name = page
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("page {page:?} has no usable file name"))?;
        backend
            .put(&format!("{}/{name}", opts.book), page)
            .await?;
        pb.inc(1);
    }
    pb.finish_with_message("Uploaded pages");

    let queue = if opts.wipe {
        QueueKind::Wipeonly
    } else {
        QueueKind::Preprocess
    };
    let body = match &opts.training {
        Some(training) => format!("{} {training}", opts.book),
        None => opts.book.clone(),
    };
    backend
        .enqueue(queue, &body)
        .await?;
    info!("enqueued {} on {queue}", opts.book);
    Ok(())
}
