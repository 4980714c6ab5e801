//! Preprocess and wipe stages.

use tokio::sync::mpsc;

use super::{Stage, StageContext, recv_item, send_item};
use crate::{naming, preproc, prelude::*};

/// Binarise each source page at several thresholds, one output per
/// threshold. OCR later runs on every variant and analyse keeps the best.
pub struct PreprocessStage {
    pub thresholds: Vec<f64>,
}

#[async_trait]
impl Stage for PreprocessStage {
    fn name(&self) -> &'static str {
        "preprocess"
    }

    fn wants(&self, key: &str) -> bool {
        naming::is_page_image(key)
    }

    #[instrument(level = "debug", skip_all, fields(book = %ctx.book))]
    async fn process(
        &self,
        ctx: &StageContext,
        mut input: mpsc::Receiver<PathBuf>,
        output: mpsc::Sender<PathBuf>,
    ) -> Result<()> {
        while let Some(path) = recv_item(&ctx.cancel, &mut input).await {
            debug!("binarising {path:?}");
            let thresholds = self.thresholds.clone();
            let worker_path = path.clone();
            // Binarisation is pure CPU; keep it off the async executor.
            let outputs = tokio::task::spawn_blocking(move || {
                preproc::binarise_multi(&worker_path, &thresholds)
            })
            .await
            .context("binarise task panicked")?
            .with_context(|| format!("failed to binarise {path:?}"))?;
            for out in outputs {
                if !send_item(&ctx.cancel, &output, out).await {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

/// Clean the margins of already-binarised pages. Output threshold code is
/// `0.0`, marking "wiped, not re-binarised".
pub struct WipeStage;

#[async_trait]
impl Stage for WipeStage {
    fn name(&self) -> &'static str {
        "wipe"
    }

    fn wants(&self, key: &str) -> bool {
        naming::is_page_image(key)
    }

    #[instrument(level = "debug", skip_all, fields(book = %ctx.book))]
    async fn process(
        &self,
        ctx: &StageContext,
        mut input: mpsc::Receiver<PathBuf>,
        output: mpsc::Sender<PathBuf>,
    ) -> Result<()> {
        while let Some(path) = recv_item(&ctx.cancel, &mut input).await {
            debug!("wiping {path:?}");
            let stem = path
                .file_stem()
                .ok_or_else(|| anyhow!("page path {path:?} has no file stem"))?
                .to_string_lossy()
                .into_owned();
            let out = path
                .parent()
                .unwrap_or(Path::new(""))
                .join(naming::binarised_name(&stem, 0.0));
            let worker_in = path.clone();
            let worker_out = out.clone();
            tokio::task::spawn_blocking(move || preproc::wipe(&worker_in, &worker_out))
                .await
                .context("wipe task panicked")?
                .with_context(|| format!("failed to wipe {path:?}"))?;
            if !send_item(&ctx.cancel, &output, out).await {
                return Ok(());
            }
        }
        Ok(())
    }
}
