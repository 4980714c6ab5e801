//! The `rm` subcommand: delete every object a book owns.
//!
//! The pipeline itself never deletes book data; this is the operator's
//! cleanup tool for abandoned or re-uploaded books.

use clap::Args;

use crate::{backend::Backend as _, prelude::*, ui::Ui};

/// Command line arguments for the `rm` subcommand.
#[derive(Debug, Args)]
pub struct RmOpts {
    /// Book name.
    pub book: String,

    #[clap(flatten)]
    pub backend_opts: super::BackendOpts,
}

/// The `rm` subcommand.
#[instrument(level = "debug", skip_all, fields(book = %opts.book))]
pub async fn cmd_rm(ui: Ui, opts: &RmOpts) -> Result<()> {
    let backend = opts.backend_opts.connect().await?;
    let keys: Vec<String> = backend
        .list(&format!("{}/", opts.book))
        .await?
        .into_iter()
        .map(|entry| entry.key)
        .collect();
    if keys.is_empty() {
        return Err(anyhow!("no such book {}", opts.book));
    }

    let spinner = ui.spinner(&format!("Deleting {} objects", keys.len()));
    backend.delete_objects(&keys).await?;
    spinner.finish_and_clear();
    info!("deleted {} objects of {}", keys.len(), opts.book);
    Ok(())
}
