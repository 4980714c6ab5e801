//! Distributed OCR pipeline for books of scanned page images.
//!
//! Symmetric workers compete for work on four queues (preprocess,
//! wipe-only, page-OCR, analyse) backed by an object store holding
//! per-book files. A book message fans out into per-page OCR messages
//! and fans back in once every page variant has its hOCR, at which point
//! the analyse stage picks the best variant per page and assembles the
//! book-level artifacts: `best`, `conf`, two searchable PDFs and a
//! confidence graph.
//!
//! The same core runs against SQS + S3 or a purely local directory; see
//! [`backend`]. The binary in `main.rs` wires the subcommands together.

pub mod backend;
pub mod cmd;
pub mod config;
pub mod graph;
pub mod hocr;
pub mod naming;
pub mod notify;
pub mod pdf;
pub mod preproc;
pub mod stages;
pub mod ui;
pub mod worker;

pub mod prelude;
