//! The `results` subcommand: fetch a finished book's artifacts.

use clap::Args;

use crate::{backend::Backend as _, prelude::*, ui::Ui};

/// Command line arguments for the `results` subcommand.
#[derive(Debug, Args)]
pub struct ResultsOpts {
    /// Book name.
    pub book: String,

    /// Destination directory.
    pub dir: PathBuf,

    #[clap(flatten)]
    pub backend_opts: super::BackendOpts,

    /// Also fetch the hOCR files named in the best manifest.
    #[clap(long)]
    pub hocr: bool,
}

/// The `results` subcommand.
#[instrument(level = "debug", skip_all, fields(book = %opts.book))]
pub async fn cmd_results(ui: Ui, opts: &ResultsOpts) -> Result<()> {
    let backend = opts.backend_opts.connect().await?;
    std::fs::create_dir_all(&opts.dir)
        .with_context(|| format!("failed to create {:?}", opts.dir))?;

    let keys: Vec<String> = backend
        .list(&format!("{}/", opts.book))
        .await?
        .into_iter()
        .map(|entry| entry.key)
        .collect();
    if keys.is_empty() {
        return Err(anyhow!("no such book {}", opts.book));
    }

    let mut wanted: Vec<String> = [
        "best".to_owned(),
        "conf".to_owned(),
        "graph.png".to_owned(),
        format!("{}.binarised.pdf", opts.book),
        format!("{}.colour.pdf", opts.book),
    ]
    .into_iter()
    .map(|name| format!("{}/{name}", opts.book))
    .filter(|key| keys.contains(key))
    .collect();
    if wanted.is_empty() {
        return Err(anyhow!(
            "book {} has no artifacts yet; is analyse done?",
            opts.book
        ));
    }

    if opts.hocr {
        let best_key = format!("{}/best", opts.book);
        if keys.contains(&best_key) {
            let best_local = opts.dir.join("best");
            backend
                .get(&best_key, &best_local)
                .await?;
            let manifest = std::fs::read_to_string(&best_local)
                .context("failed to read best manifest")?;
            for name in manifest.lines().filter(|l| !l.is_empty()) {
                let key = format!("{}/{name}", opts.book);
                if keys.contains(&key) {
                    wanted.push(key);
                }
            }
        }
    }

    let pb = ui.bar("Fetching artifacts", wanted.len() as u64);
    for key in &wanted {
        let name = crate::naming::file_name(key);
        backend
            .get(key, &opts.dir.join(name))
            .await?;
        pb.inc(1);
    }
    pb.finish_with_message("Fetched artifacts");
    Ok(())
}
