//! Analyse stage: fan-in of a book's OCR results.
//!
//! Inputs are every `.hocr` file of one book. From those we keep, per
//! logical page, the binarisation variant that OCRed best, then produce
//! the book-level artifacts:
//!
//! 1. `conf`: every hOCR path with its average word confidence;
//! 2. `best`: the chosen hOCR filename per page, sorted;
//! 3. `<book>.binarised.pdf` and `<book>.colour.pdf`: searchable PDFs
//!    built from the chosen pages;
//! 4. `graph.png`: the per-page confidence graph, and also the book's
//!    completion marker, so it is always emitted last.

use tokio::sync::mpsc;

use super::{Stage, StageContext, recv_item, send_item};
use crate::{backend::Backend as _, graph, hocr, naming, pdf::PdfComposer, prelude::*};

pub struct AnalyseStage;

#[async_trait]
impl Stage for AnalyseStage {
    fn name(&self) -> &'static str {
        "analyse"
    }

    fn wants(&self, key: &str) -> bool {
        naming::is_hocr(key)
    }

    #[instrument(level = "debug", skip_all, fields(book = %ctx.book))]
    async fn process(
        &self,
        ctx: &StageContext,
        mut input: mpsc::Receiver<PathBuf>,
        output: mpsc::Sender<PathBuf>,
    ) -> Result<()> {
        // The aggregation needs every hOCR before it can pick winners.
        let mut hocrs = Vec::new();
        while let Some(path) = recv_item(&ctx.cancel, &mut input).await {
            hocrs.push(path);
        }
        if ctx.cancel.is_cancelled() {
            return Ok(());
        }

        // Average confidence per file, skipping files with no words at
        // all (blank pages binarise to nothing; that is not an error).
        let mut confs = Vec::new();
        for path in &hocrs {
            match hocr::avg_conf(path) {
                Ok(conf) => {
                    let name = file_name_of(path)?;
                    confs.push((name, conf));
                }
                Err(err) if hocr::is_no_words(&err) => {
                    debug!("skipping wordless hOCR {path:?}");
                }
                Err(err) => return Err(err),
            }
        }
        // Listing order is backend-dependent; sort so reruns are
        // byte-identical.
        confs.sort_by(|a, b| a.0.cmp(&b.0));
        let chosen = best_per_page(&confs);

        let conf_path = ctx.work_dir.join("conf");
        let mut conf_data = String::new();
        for (name, conf) in &confs {
            conf_data.push_str(&format!("{}/{name}\t{conf:.2}\n", ctx.book));
        }
        tokio::fs::write(&conf_path, conf_data)
            .await
            .with_context(|| format!("failed to write {conf_path:?}"))?;
        if !send_item(&ctx.cancel, &output, conf_path).await {
            return Ok(());
        }

        let best_path = ctx.work_dir.join("best");
        let mut best_data = String::new();
        for (name, _) in &chosen {
            best_data.push_str(name);
            best_data.push('\n');
        }
        tokio::fs::write(&best_path, best_data)
            .await
            .with_context(|| format!("failed to write {best_path:?}"))?;
        if !send_item(&ctx.cancel, &output, best_path).await {
            return Ok(());
        }

        // Fetch the page images backing each chosen hOCR: the binarised
        // variant itself, and the colour original (jpg, falling back to
        // png). Existence comes from one listing rather than probing.
        let keys: Vec<String> = ctx
            .backend
            .list(&format!("{}/", ctx.book))
            .await?
            .into_iter()
            .map(|entry| entry.key)
            .collect();
        let mut pages = Vec::new();
        for (name, _) in &chosen {
            let hocr_local = hocrs
                .iter()
                .find(|p| p.file_name().and_then(|n| n.to_str()) == Some(name.as_str()))
                .cloned()
                .ok_or_else(|| anyhow!("chosen hOCR {name} has no local file"))?;

            let png_name = name
                .strip_suffix(".hocr")
                .map(|stem| format!("{stem}.png"))
                .ok_or_else(|| anyhow!("chosen file {name} is not an hOCR"))?;
            let bin_local = ctx.work_dir.join(&png_name);
            if !fetch(ctx, &format!("{}/{png_name}", ctx.book), &bin_local).await? {
                return Ok(());
            }

            let stem = naming::page_stem(name).to_owned();
            let colour_name = [format!("{stem}.jpg"), format!("{stem}.png")]
                .into_iter()
                .find(|n| keys.iter().any(|k| k == &format!("{}/{n}", ctx.book)))
                // Books born binarised have no colour original; reuse
                // the binarised page rather than failing the book.
                .unwrap_or(png_name);
            let colour_local = ctx.work_dir.join(&colour_name);
            if !colour_local.exists()
                && !fetch(ctx, &format!("{}/{colour_name}", ctx.book), &colour_local)
                    .await?
            {
                return Ok(());
            }

            pages.push((bin_local, colour_local, hocr_local));
        }

        let binarised_pdf = ctx.work_dir.join(format!("{}.binarised.pdf", ctx.book));
        let colour_pdf = ctx.work_dir.join(format!("{}.colour.pdf", ctx.book));
        {
            let book = ctx.book.clone();
            let pages = pages.clone();
            let binarised_pdf = binarised_pdf.clone();
            let colour_pdf = colour_pdf.clone();
            tokio::task::spawn_blocking(move || -> Result<()> {
                let mut binarised = PdfComposer::new(&book);
                let mut colour = PdfComposer::new(&book);
                for (bin, col, hocr) in &pages {
                    binarised.add_page(bin, hocr, false)?;
                    colour.add_page(col, hocr, true)?;
                }
                binarised.save(&binarised_pdf)?;
                colour.save(&colour_pdf)?;
                Ok(())
            })
            .await
            .context("PDF build task panicked")?
            .with_context(|| format!("failed to build PDFs for {}", ctx.book))?;
        }
        if !send_item(&ctx.cancel, &output, binarised_pdf).await {
            return Ok(());
        }
        if !send_item(&ctx.cancel, &output, colour_pdf).await {
            return Ok(());
        }

        // The graph doubles as the completion marker, so it goes last.
        // Fewer than two usable pages renders no graph, and the book
        // simply never gains a marker.
        let graph_path = ctx.work_dir.join("graph.png");
        let rendered = {
            let chosen = chosen.clone();
            let book = ctx.book.clone();
            let graph_path = graph_path.clone();
            tokio::task::spawn_blocking(move || {
                graph::render(&chosen, &book, &graph_path)
            })
            .await
            .context("graph task panicked")?
            .with_context(|| format!("failed to render graph for {}", ctx.book))?
        };
        if rendered {
            send_item(&ctx.cancel, &output, graph_path).await;
        }
        Ok(())
    }
}

/// Pick the highest-confidence variant per logical page. Ties keep the
/// first entry seen, which is deterministic because callers pass a
/// name-sorted list. Returned in page order.
fn best_per_page(confs: &[(String, f64)]) -> Vec<(String, f64)> {
    let mut best: Vec<(String, f64)> = Vec::new();
    for (name, conf) in confs {
        let page = naming::page_stem(name);
        match best
            .iter_mut()
            .find(|(existing, _)| naming::page_stem(existing) == page)
        {
            Some(entry) if *conf > entry.1 => *entry = (name.clone(), *conf),
            Some(_) => {}
            None => best.push((name.clone(), *conf)),
        }
    }
    best.sort_by(|a, b| a.0.cmp(&b.0));
    best
}

fn file_name_of(path: &Path) -> Result<String> {
    Ok(path
        .file_name()
        .ok_or_else(|| anyhow!("path {path:?} has no file name"))?
        .to_string_lossy()
        .into_owned())
}

/// Cancellable object download. `Ok(false)` means we were cancelled and
/// the stage should wind down quietly.
async fn fetch(ctx: &StageContext, key: &str, local: &Path) -> Result<bool> {
    tokio::select! {
        _ = ctx.cancel.cancelled() => Ok(false),
        result = ctx.backend.get(key, local) => {
            result?;
            Ok(true)
        }
    }
}
