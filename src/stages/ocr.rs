//! OCR stage, wrapping the `tesseract` CLI tool.

use tokio::{process::Command, sync::mpsc};

use super::{Stage, StageContext, recv_item, send_item};
use crate::prelude::*;

/// Run the OCR subprocess over each binarised page, producing a sibling
/// `.hocr` file.
pub struct OcrStage {
    /// The OCR executable; `tesseract` unless overridden.
    pub command: String,
}

#[async_trait]
impl Stage for OcrStage {
    fn name(&self) -> &'static str {
        "ocr"
    }

    fn wants(&self, key: &str) -> bool {
        crate::naming::is_binarised(key)
    }

    #[instrument(level = "debug", skip_all, fields(book = %ctx.book, training = %ctx.training))]
    async fn process(
        &self,
        ctx: &StageContext,
        mut input: mpsc::Receiver<PathBuf>,
        output: mpsc::Sender<PathBuf>,
    ) -> Result<()> {
        while let Some(path) = recv_item(&ctx.cancel, &mut input).await {
            debug!("running OCR on {path:?}");
            let out = self.ocr_page(ctx, &path).await?;
            if !send_item(&ctx.cancel, &output, out).await {
                return Ok(());
            }
        }
        Ok(())
    }
}

impl OcrStage {
    /// OCR one page image. The tool is invoked as
    /// `<command> <input> <output_stem> -l <training> hocr` and writes
    /// `<output_stem>.hocr`.
    async fn ocr_page(&self, ctx: &StageContext, path: &Path) -> Result<PathBuf> {
        let stem = path.with_extension("");
        let out = path.with_extension("hocr");

        let result = Command::new(&self.command)
            .arg(path)
            .arg(&stem)
            .arg("-l")
            .arg(&ctx.training)
            .arg("hocr")
            .output()
            .await
            .with_context(|| format!("failed to run {:?}", self.command))?;

        // Non-zero exit is a deterministic page failure; keep everything
        // needed to triage it without re-running.
        if !result.status.success() {
            return Err(anyhow!(
                "{} failed on {} (training {}, {}):\nstdout: {}\nstderr: {}",
                self.command,
                path.display(),
                ctx.training,
                result.status,
                String::from_utf8_lossy(&result.stdout).trim(),
                String::from_utf8_lossy(&result.stderr).trim(),
            ));
        }
        if !out.exists() {
            return Err(anyhow!(
                "{} exited successfully but wrote no {}",
                self.command,
                out.display()
            ));
        }
        Ok(out)
    }
}
