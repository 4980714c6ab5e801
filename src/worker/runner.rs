//! The pipeline runner.
//!
//! One message, four tasks:
//!
//! ```text
//!   download ──▶ stage ──▶ upload ──▶ done
//!                                      │
//!   heartbeat ◀── ticker ──────────────┘
//!         └─ may swap in a fresh handle via the mailbox
//!   errors ◀── any task on failure
//! ```
//!
//! The connecting channels have capacity 1, so a slow stage backpressures
//! the downloader instead of buffering a whole book in memory. The first
//! of {error, cancellation, upload-complete} wins; the others are
//! unblocked by cancelling the shared token, which every channel
//! operation and backend call selects against.
//!
//! On success the next queue is fed *before* the source message is
//! deleted: dying between the two duplicates work, which is safe, rather
//! than losing it, which is not.

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use super::heartbeat;
use crate::{
    backend::{Backend, BackendError, QueueKind, QueueMessage},
    config::Settings,
    naming,
    notify::{self, LogRing, NotificationSink},
    prelude::*,
    stages::{Form, StageContext, StagePlan, recv_item, send_item},
    worker::Order,
};

/// What became of one message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Work done, outputs uploaded, next stage fed, message deleted.
    Completed,
    /// Transient trouble; the message was left in flight and will be
    /// redelivered once its lease runs out.
    Abandoned,
    /// Deterministic failure; the message was deleted and the
    /// notification hook fired, because a retry would fail identically.
    Rejected,
    /// The worker is shutting down.
    Cancelled,
}

/// Which task an error came from. Stage errors are input-bound and
/// deterministic (unless they carry a backend error); everything else is
/// infrastructure and retryable.
#[derive(Clone, Copy, Debug)]
enum TaskKind {
    Download,
    Stage,
    Upload,
    Heartbeat,
}

struct TaskError {
    kind: TaskKind,
    error: anyhow::Error,
}

pub struct Runner {
    backend: Arc<dyn Backend>,
    settings: Arc<Settings>,
    sink: Arc<dyn NotificationSink>,
    logs: Arc<LogRing>,
}

impl Runner {
    pub fn new(
        backend: Arc<dyn Backend>,
        settings: Arc<Settings>,
        sink: Arc<dyn NotificationSink>,
        logs: Arc<LogRing>,
    ) -> Runner {
        Runner {
            backend,
            settings,
            sink,
            logs,
        }
    }

    /// Process one leased message to completion.
    #[instrument(level = "info", skip_all, fields(queue = %plan.queue, body = %msg.body))]
    pub async fn process(
        &self,
        plan: &StagePlan,
        msg: QueueMessage,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let order = match Order::parse(&msg.body, plan.form) {
            Ok(order) => order,
            Err(error) => return self.reject(plan.queue, &msg.handle, &msg.body, error).await,
        };
        let training = order
            .training
            .clone()
            .unwrap_or_else(|| self.settings.default_training.clone());

        // Work out which keys flow through the pipeline.
        let keys = match plan.form {
            Form::SinglePage => {
                vec![order.page.clone().expect("single-page order carries a page")]
            }
            Form::WholeBook => {
                let listed = match self.backend.list(&format!("{}/", order.book)).await {
                    Ok(listed) => listed,
                    Err(err) => {
                        warn!("could not list book {}: {err:#}", order.book);
                        return Ok(Outcome::Abandoned);
                    }
                };
                let mut keys: Vec<String> = listed
                    .into_iter()
                    .map(|entry| entry.key)
                    .filter(|key| plan.stage.wants(key))
                    .collect();
                keys.sort();
                if keys.is_empty() {
                    // A book with nothing for this stage will never grow
                    // anything by being retried.
                    let error =
                        anyhow!("book {} has no input for {}", order.book, plan.stage.name());
                    return self.reject(plan.queue, &msg.handle, &msg.body, error).await;
                }
                keys
            }
        };

        // Private scratch space, removed on every exit path by RAII.
        let work_dir = tempfile::Builder::new()
            .prefix(&format!("bookpipe-{}-", order.book))
            .tempdir()
            .context("failed to create work directory")?;

        let pipeline = cancel.child_token();
        let (msg_tx, msg_rx) = watch::channel(msg.clone());
        let (err_tx, mut err_rx) = mpsc::channel::<TaskError>(4);
        let (stage_tx, stage_rx) = mpsc::channel::<PathBuf>(1);
        let (upload_tx, upload_rx) = mpsc::channel::<PathBuf>(1);

        let ctx = StageContext {
            backend: self.backend.clone(),
            settings: self.settings.clone(),
            book: order.book.clone(),
            training,
            work_dir: work_dir.path().to_owned(),
            cancel: pipeline.clone(),
        };

        let download = self.spawn_download(keys, &ctx, stage_tx, err_tx.clone());
        let stage = self.spawn_stage(plan, ctx, stage_rx, upload_tx, err_tx.clone());
        let mut upload = self.spawn_upload(
            order.book.clone(),
            upload_rx,
            pipeline.clone(),
            err_tx.clone(),
        );
        let hb = self.spawn_heartbeat(plan.queue, msg_tx, pipeline.clone(), err_tx);

        enum First {
            Cancelled,
            Failed(TaskError),
            Uploaded(Vec<String>),
        }
        let first = tokio::select! {
            _ = cancel.cancelled() => First::Cancelled,
            Some(task_err) = err_rx.recv() => First::Failed(task_err),
            uploaded = &mut upload => {
                First::Uploaded(uploaded.context("upload task panicked")?)
            }
        };

        match first {
            First::Cancelled => {
                pipeline.cancel();
                join_quietly(download, stage, Some(upload), hb).await;
                Ok(Outcome::Cancelled)
            }
            First::Failed(task_err) => {
                pipeline.cancel();
                join_quietly(download, stage, Some(upload), hb).await;
                self.settle_failure(plan.queue, &msg.body, &msg_rx, task_err).await
            }
            First::Uploaded(uploaded) => {
                // Upload finishing means the stage closed its output, but
                // the stage may still have failed after its last send.
                download.await.context("download task panicked")?;
                stage.await.context("stage task panicked")?;
                if let Ok(task_err) = err_rx.try_recv() {
                    pipeline.cancel();
                    join_quietly_hb(hb).await;
                    return self
                        .settle_failure(plan.queue, &msg.body, &msg_rx, task_err)
                        .await;
                }
                let outcome = self.settle_success(plan, &order, &uploaded, &msg_rx).await;
                // The ticker stops on every exit path before we return.
                pipeline.cancel();
                join_quietly_hb(hb).await;
                outcome
            }
        }
    }

    fn spawn_download(
        &self,
        keys: Vec<String>,
        ctx: &StageContext,
        stage_tx: mpsc::Sender<PathBuf>,
        err_tx: mpsc::Sender<TaskError>,
    ) -> JoinHandle<()> {
        let backend = self.backend.clone();
        let cancel = ctx.cancel.clone();
        let dir = ctx.work_dir.clone();
        tokio::spawn(async move {
            for key in keys {
                if cancel.is_cancelled() {
                    return;
                }
                let local = dir.join(naming::file_name(&key));
                let fetched = tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = backend.get(&key, &local) => result,
                };
                if let Err(err) = fetched {
                    let error = anyhow::Error::new(err)
                        .context(format!("failed to download {key}"));
                    let _ = err_tx
                        .send(TaskError {
                            kind: TaskKind::Download,
                            error,
                        })
                        .await;
                    return;
                }
                if !send_item(&cancel, &stage_tx, local).await {
                    return;
                }
            }
        })
    }

    fn spawn_stage(
        &self,
        plan: &StagePlan,
        ctx: StageContext,
        stage_rx: mpsc::Receiver<PathBuf>,
        upload_tx: mpsc::Sender<PathBuf>,
        err_tx: mpsc::Sender<TaskError>,
    ) -> JoinHandle<()> {
        let stage = plan.stage.clone();
        tokio::spawn(async move {
            if let Err(error) = stage.process(&ctx, stage_rx, upload_tx).await {
                let _ = err_tx
                    .send(TaskError {
                        kind: TaskKind::Stage,
                        error,
                    })
                    .await;
            }
        })
    }

    fn spawn_upload(
        &self,
        book: String,
        mut upload_rx: mpsc::Receiver<PathBuf>,
        cancel: CancellationToken,
        err_tx: mpsc::Sender<TaskError>,
    ) -> JoinHandle<Vec<String>> {
        let backend = self.backend.clone();
        tokio::spawn(async move {
            let mut uploaded = Vec::new();
            while let Some(path) = recv_item(&cancel, &mut upload_rx).await {
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    let _ = err_tx
                        .send(TaskError {
                            kind: TaskKind::Upload,
                            error: anyhow!("output path {path:?} has no file name"),
                        })
                        .await;
                    return uploaded;
                };
                let key = format!("{book}/{name}");
                let put = tokio::select! {
                    _ = cancel.cancelled() => return uploaded,
                    result = backend.put(&key, &path) => result,
                };
                match put {
                    Ok(()) => uploaded.push(key),
                    Err(err) => {
                        let error = anyhow::Error::new(err)
                            .context(format!("failed to upload {key}"));
                        let _ = err_tx
                            .send(TaskError {
                                kind: TaskKind::Upload,
                                error,
                            })
                            .await;
                        return uploaded;
                    }
                }
            }
            uploaded
        })
    }

    fn spawn_heartbeat(
        &self,
        queue: QueueKind,
        msg_tx: watch::Sender<QueueMessage>,
        cancel: CancellationToken,
        err_tx: mpsc::Sender<TaskError>,
    ) -> JoinHandle<()> {
        let backend = self.backend.clone();
        let lease = self.settings.lease;
        tokio::spawn(async move {
            if let Err(error) = heartbeat::run(backend, queue, lease, msg_tx, cancel).await
            {
                let _ = err_tx
                    .send(TaskError {
                        kind: TaskKind::Heartbeat,
                        error,
                    })
                    .await;
            }
        })
    }

    /// Success: feed the next queue, then delete the source message with
    /// the freshest handle.
    async fn settle_success(
        &self,
        plan: &StagePlan,
        order: &Order,
        uploaded: &[String],
        msg_rx: &watch::Receiver<QueueMessage>,
    ) -> Result<Outcome> {
        match plan.form {
            Form::SinglePage => {
                // Fan-in: only the worker that completes the last page
                // forwards the book to analyse.
                let listed = match self.backend.list(&format!("{}/", order.book)).await {
                    Ok(listed) => listed,
                    Err(err) => {
                        warn!("could not list book {}: {err:#}", order.book);
                        return Ok(Outcome::Abandoned);
                    }
                };
                let keys: Vec<String> =
                    listed.into_iter().map(|entry| entry.key).collect();
                if naming::ocr_complete(&keys) {
                    if let Some(next) = plan.next {
                        info!("book {} fully OCRed; enqueuing {next}", order.book);
                        if let Err(err) =
                            self.backend.enqueue(next, &order.forward_body()).await
                        {
                            warn!("failed to enqueue {next}: {err:#}");
                            return Ok(Outcome::Abandoned);
                        }
                    }
                }
            }
            Form::WholeBook => {
                if let Some(next) = plan.next {
                    if next == QueueKind::PageOcr {
                        // Fan-out: one page-OCR message per binarised
                        // output.
                        for key in uploaded.iter().filter(|k| naming::is_binarised(k)) {
                            if let Err(err) =
                                self.backend.enqueue(next, &order.page_body(key)).await
                            {
                                warn!("failed to enqueue {next}: {err:#}");
                                return Ok(Outcome::Abandoned);
                            }
                        }
                    } else if let Err(err) =
                        self.backend.enqueue(next, &order.forward_body()).await
                    {
                        warn!("failed to enqueue {next}: {err:#}");
                        return Ok(Outcome::Abandoned);
                    }
                }
            }
        }

        let handle = msg_rx.borrow().handle.clone();
        if let Err(err) = self.backend.delete(plan.queue, &handle).await {
            // The work is done and the next stage fed; if the delete got
            // lost the message will be redelivered and reprocessed,
            // which idempotent uploads make harmless.
            warn!("failed to delete message on {}: {err:#}", plan.queue);
            return Ok(Outcome::Abandoned);
        }
        Ok(Outcome::Completed)
    }

    /// A task failed: decide between retry-by-redelivery and permanent
    /// rejection.
    async fn settle_failure(
        &self,
        queue: QueueKind,
        body: &str,
        msg_rx: &watch::Receiver<QueueMessage>,
        task_err: TaskError,
    ) -> Result<Outcome> {
        let TaskError { kind, error } = task_err;
        let deterministic = matches!(kind, TaskKind::Stage)
            && error.downcast_ref::<BackendError>().is_none();
        if deterministic {
            let handle = msg_rx.borrow().handle.clone();
            self.reject(queue, &handle, body, error).await
        } else {
            warn!("abandoning message on {queue} after {kind:?} failure: {error:#}");
            Ok(Outcome::Abandoned)
        }
    }

    /// Delete a message whose processing will never succeed, and tell
    /// somebody.
    async fn reject(
        &self,
        queue: QueueKind,
        handle: &str,
        body: &str,
        error: anyhow::Error,
    ) -> Result<Outcome> {
        error!("rejecting message {body:?} on {queue}: {error:#}");
        if let Err(err) = self.backend.delete(queue, handle).await {
            warn!("failed to delete rejected message: {err:#}");
        }
        let summary = notify::format_failure(queue, body, &error, &self.logs.recent());
        if let Err(err) = self.sink.notify(&summary).await {
            warn!("notification sink failed: {err:#}");
        }
        Ok(Outcome::Rejected)
    }
}

async fn join_quietly(
    download: JoinHandle<()>,
    stage: JoinHandle<()>,
    upload: Option<JoinHandle<Vec<String>>>,
    hb: JoinHandle<()>,
) {
    let _ = futures::join!(download, stage, hb);
    if let Some(upload) = upload {
        let _ = upload.await;
    }
}

async fn join_quietly_hb(hb: JoinHandle<()>) {
    let _ = hb.await;
}
