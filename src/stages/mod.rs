//! Pipeline stages.
//!
//! Every stage has the same channel shape: it reads input files from a
//! receiver, writes output files to a sender, and returns an error to
//! fail the whole pipeline. Dropping the sender is the end-of-output
//! signal. That uniformity is what lets one runner host all four stages.

pub mod analyse;
pub mod ocr;
pub mod preprocess;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    backend::{Backend, QueueKind},
    config::Settings,
    prelude::*,
};

/// Everything a stage can see while processing one message.
pub struct StageContext {
    pub backend: Arc<dyn Backend>,
    pub settings: Arc<Settings>,

    /// The book this message belongs to.
    pub book: String,

    /// OCR training to use, already defaulted from settings.
    pub training: String,

    /// Private scratch directory for this runner invocation.
    pub work_dir: PathBuf,

    /// Cooperative cancellation, checked between iterations and around
    /// every channel operation.
    pub cancel: CancellationToken,
}

/// A transformer hosted by the pipeline runner.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Whole-book form: does this stage consume the given object key?
    fn wants(&self, key: &str) -> bool;

    /// Pump inputs to outputs until the input channel closes.
    ///
    /// Implementations return early with `Ok(())` when cancelled or when
    /// the output side is gone; they return `Err` only for real stage
    /// failures.
    async fn process(
        &self,
        ctx: &StageContext,
        input: mpsc::Receiver<PathBuf>,
        output: mpsc::Sender<PathBuf>,
    ) -> Result<()>;
}

/// Whether a queue's messages name a whole book or a single page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Form {
    WholeBook,
    SinglePage,
}

/// How the runner drives one queue: which stage runs, which form the
/// messages take, and where successful work flows next.
pub struct StagePlan {
    pub queue: QueueKind,
    pub form: Form,
    /// Queue to forward to on success. For the page-OCR plan this is the
    /// analyse queue, guarded by the all-pages-OCRed check.
    pub next: Option<QueueKind>,
    pub stage: Arc<dyn Stage>,
}

/// The standard plan for each queue.
pub fn plan_for(queue: QueueKind, settings: &Arc<Settings>) -> StagePlan {
    match queue {
        QueueKind::Preprocess => StagePlan {
            queue,
            form: Form::WholeBook,
            next: Some(QueueKind::PageOcr),
            stage: Arc::new(preprocess::PreprocessStage {
                thresholds: settings.thresholds.clone(),
            }),
        },
        QueueKind::Wipeonly => StagePlan {
            queue,
            form: Form::WholeBook,
            next: Some(QueueKind::PageOcr),
            stage: Arc::new(preprocess::WipeStage),
        },
        QueueKind::PageOcr => StagePlan {
            queue,
            form: Form::SinglePage,
            next: Some(QueueKind::Analyse),
            stage: Arc::new(ocr::OcrStage {
                command: settings.ocr_command.clone(),
            }),
        },
        QueueKind::Analyse => StagePlan {
            queue,
            form: Form::WholeBook,
            next: None,
            stage: Arc::new(analyse::AnalyseStage),
        },
    }
}

/// Receive the next item, or `None` on end-of-input or cancellation.
pub(crate) async fn recv_item<T>(
    cancel: &CancellationToken,
    rx: &mut mpsc::Receiver<T>,
) -> Option<T> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        item = rx.recv() => item,
    }
}

/// Send an item downstream. Returns `false` when cancelled or when the
/// receiver is gone; the sender should stop quietly in either case.
pub(crate) async fn send_item<T>(
    cancel: &CancellationToken,
    tx: &mpsc::Sender<T>,
    item: T,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}
