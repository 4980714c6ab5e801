//! Worker configuration.
//!
//! Everything here is parsed once at startup and passed into the worker as
//! an immutable [`Settings`] value. Nothing reconfigures at runtime.

use std::time::Duration;

use crate::{backend::QueueKind, prelude::*};

/// Which backend a command talks to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum BackendKind {
    /// SQS queues and an S3 bucket.
    Cloud,
    /// Queue files and an object directory under a local root.
    Local,
}

/// Immutable process-wide settings.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Visibility lease requested when receiving a message. The heartbeat
    /// renews at half this cadence.
    pub lease: Duration,

    /// Pause before re-checking a queue that came up empty.
    pub poll_interval: Duration,

    /// Quiet period after which the dispatcher reports the idle
    /// transition.
    pub idle_shutdown: Duration,

    /// Binarisation thresholds used by the preprocess stage.
    pub thresholds: Vec<f64>,

    /// OCR training (language/model) used when a message carries none.
    pub default_training: String,

    /// Queues this worker drains, in polling order.
    pub enabled: Vec<QueueKind>,

    /// The OCR executable. Overridable mostly for tests.
    pub ocr_command: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            lease: Duration::from_secs(120),
            poll_interval: Duration::from_secs(180),
            idle_shutdown: Duration::from_secs(300),
            thresholds: vec![0.1, 0.2, 0.4, 0.5],
            default_training: "eng".to_owned(),
            enabled: QueueKind::ALL.to_vec(),
            ocr_command: "tesseract".to_owned(),
        }
    }
}

/// Parse a list like `pre,wipe,page_ocr,analyse` into queue kinds. Short
/// aliases match the stage names operators use.
pub fn parse_stage(s: &str) -> Result<QueueKind> {
    match s {
        "pre" | "preprocess" => Ok(QueueKind::Preprocess),
        "wipe" | "wipeonly" => Ok(QueueKind::Wipeonly),
        "page_ocr" | "ocr" => Ok(QueueKind::PageOcr),
        "analyse" | "analyze" => Ok(QueueKind::Analyse),
        _ => Err(anyhow!(
            "unknown stage {s:?} (expected pre, wipe, page_ocr or analyse)"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_aliases() {
        assert_eq!(parse_stage("pre").unwrap(), QueueKind::Preprocess);
        assert_eq!(parse_stage("wipeonly").unwrap(), QueueKind::Wipeonly);
        assert_eq!(parse_stage("ocr").unwrap(), QueueKind::PageOcr);
        assert_eq!(parse_stage("analyse").unwrap(), QueueKind::Analyse);
        assert!(parse_stage("bogus").is_err());
    }
}
