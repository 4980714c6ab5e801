//! Object-key and filename conventions.
//!
//! Everything the pipeline knows about a page it reads off the key:
//!
//! * source pages are `<book>/<stem>.jpg` or `.png`, stem embedding a
//!   4-digit sequence number;
//! * binarised variants append `_bin<k>` where `<k>` is the threshold to
//!   one decimal place (`0001_bin0.2.png`; wipe emits `0.0`);
//! * OCR output replaces `.png` with `.hocr` on the same stem.
//!
//! Deterministic naming is what makes re-runs harmless: any worker can
//! rewrite any key and produce the same bytes at the same place.

use std::sync::LazyLock;

use regex::Regex;

static BINARISED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"_bin\d\.\d\.png$").expect("binarised pattern must parse")
});

static PAGE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)[_.]").expect("page pattern must parse"));

/// Is this key a source page image (not yet binarised)?
pub fn is_page_image(key: &str) -> bool {
    (key.ends_with(".jpg") || key.ends_with(".png")) && !is_binarised(key)
}

/// Is this key a binarised page variant?
pub fn is_binarised(key: &str) -> bool {
    BINARISED.is_match(key)
}

/// Is this key an hOCR artifact?
pub fn is_hocr(key: &str) -> bool {
    key.ends_with(".hocr")
}

/// The `.hocr` key paired with a binarised `.png` key.
pub fn hocr_sibling(key: &str) -> String {
    match key.strip_suffix(".png") {
        Some(stem) => format!("{stem}.hocr"),
        None => format!("{key}.hocr"),
    }
}

/// The filename part of a key (everything after the last `/`).
pub fn file_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// The logical page a variant belongs to: the filename stem with any
/// `_bin…` suffix and the extension removed.
pub fn page_stem(key: &str) -> &str {
    let name = file_name(key);
    let name = name.split_once("_bin").map(|(stem, _)| stem).unwrap_or(name);
    name.split_once('.').map(|(stem, _)| stem).unwrap_or(name)
}

/// The `_bin<k>` threshold code of a variant, e.g. `0.2`.
pub fn variant_code(key: &str) -> Option<&str> {
    let name = file_name(key);
    let (_, rest) = name.split_once("_bin")?;
    let code = rest.strip_suffix(".png").or_else(|| rest.strip_suffix(".hocr"))?;
    Some(code)
}

/// The page number embedded in a filename: the prefix up to the first
/// `_` or `.`, if it parses as a number.
pub fn page_number(key: &str) -> Option<u32> {
    let captures = PAGE_NUMBER.captures(file_name(key))?;
    captures[1].parse().ok()
}

/// The filename of a binarised variant of `stem` at threshold `k`.
pub fn binarised_name(stem: &str, k: f64) -> String {
    format!("{stem}_bin{k:.1}.png")
}

/// Is the book's OCR fan-out complete?
///
/// True iff at least one key is a binarised page and every binarised page
/// has its `.hocr` sibling. Every worker that finishes a page evaluates
/// this over a fresh listing; the first to observe completion enqueues
/// analyse, and duplicate enqueues are harmless because analyse is
/// idempotent.
pub fn ocr_complete<S: AsRef<str>>(keys: &[S]) -> bool {
    let mut saw_binarised = false;
    for key in keys {
        let key = key.as_ref();
        if !is_binarised(key) {
            continue;
        }
        saw_binarised = true;
        let sibling = hocr_sibling(key);
        if !keys.iter().any(|k| k.as_ref() == sibling) {
            return false;
        }
    }
    saw_binarised
}
