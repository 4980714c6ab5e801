//! hOCR reader.
//!
//! Tesseract's hOCR output is XHTML with word spans like:
//!
//! ```text
//! <span class='ocrx_word' id='word_1_3'
//!       title='bbox 393 206 600 252; x_wconf 95'>pipeline</span>
//! ```
//!
//! We only need two things from it: per-word confidences (`x_wconf`) and
//! word bounding boxes for the searchable-PDF text layer, so we read it
//! with regular expressions rather than a full XML parser.

use std::{fs::read_to_string, sync::LazyLock};

use regex::Regex;

use crate::prelude::*;

static WCONF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"x_wconf\s+(\d+)").expect("confidence pattern must parse")
});

static WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?s)<span[^>]*class=['"]ocrx_word['"][^>]*title=['"][^'"]*bbox (\d+) (\d+) (\d+) (\d+)[^'"]*['"][^>]*>(.*?)</span>"#,
    )
    .expect("word pattern must parse")
});

static PAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"class=['"]ocr_page['"][^>]*title=['"][^'"]*bbox 0 0 (\d+) (\d+)"#)
        .expect("page pattern must parse")
});

static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*>").expect("tag pattern must parse"));

/// The error `avg_conf` reports for an hOCR file without any words.
/// Callers skip such files rather than failing the whole book.
#[derive(Debug, thiserror::Error)]
#[error("no words found in {path}")]
pub struct NoWords {
    pub path: PathBuf,
}

/// Does this error chain mean "no words in the file"?
pub fn is_no_words(err: &anyhow::Error) -> bool {
    err.downcast_ref::<NoWords>().is_some()
}

/// A recognised word with its page-pixel bounding box.
#[derive(Clone, Debug, PartialEq)]
pub struct Word {
    pub text: String,
    /// `(x0, y0, x1, y1)` in page pixels, origin top-left.
    pub bbox: (u32, u32, u32, u32),
}

/// Average word confidence of an hOCR file, in `[0, 100]`.
pub fn avg_conf(path: &Path) -> Result<f64> {
    let content = read_to_string(path)
        .with_context(|| format!("failed to read hOCR file {path:?}"))?;
    avg_conf_str(&content).map_err(|_| {
        NoWords {
            path: path.to_owned(),
        }
        .into()
    })
}

fn avg_conf_str(content: &str) -> std::result::Result<f64, ()> {
    let mut total = 0u64;
    let mut count = 0u64;
    for captures in WCONF.captures_iter(content) {
        let conf: u64 = captures[1].parse().map_err(|_| ())?;
        total += conf;
        count += 1;
    }
    if count == 0 {
        return Err(());
    }
    Ok(total as f64 / count as f64)
}

/// Every word in an hOCR file, with bounding boxes, in document order.
/// Empty words (whitespace only once tags are stripped) are dropped.
pub fn words_with_boxes(path: &Path) -> Result<Vec<Word>> {
    let content = read_to_string(path)
        .with_context(|| format!("failed to read hOCR file {path:?}"))?;
    let mut words = Vec::new();
    for captures in WORD.captures_iter(&content) {
        let bbox = (
            captures[1].parse().context("bad bbox")?,
            captures[2].parse().context("bad bbox")?,
            captures[3].parse().context("bad bbox")?,
            captures[4].parse().context("bad bbox")?,
        );
        let text = decode_entities(&TAG.replace_all(&captures[5], ""));
        let text = text.trim();
        if !text.is_empty() {
            words.push(Word {
                text: text.to_owned(),
                bbox,
            });
        }
    }
    Ok(words)
}

/// The page's `(width, height)` in pixels, from the `ocr_page` bbox.
pub fn page_dimensions(content: &str) -> Option<(u32, u32)> {
    let captures = PAGE.captures(content)?;
    Some((captures[1].parse().ok()?, captures[2].parse().ok()?))
}

/// Decode the handful of entities tesseract actually emits.
fn decode_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}
