//! Storage and queue backends.
//!
//! The whole pipeline is polymorphic over [`Backend`]: a capability set
//! covering message queues with visibility leases, an object store with
//! prefix listing, and accessors naming the queues and bucket a worker
//! should talk to. We ship two implementations: [`cloud::CloudBackend`]
//! (SQS + S3) for production fleets, and [`local::LocalBackend`] (plain
//! files in a directory) so the entire worker can run on a laptop and in
//! unit tests.

pub mod cloud;
pub mod local;
#[cfg(test)]
pub(crate) mod mock;

use std::{fmt, time::Duration, time::SystemTime};

use crate::prelude::*;

/// How long `check` may wait for a message before returning empty. This
/// is the SQS long-poll ceiling; the local backend answers immediately,
/// which callers must treat the same as a full window expiring.
pub const LONG_POLL: Duration = Duration::from_secs(20);

/// Errors surfaced by a [`Backend`].
///
/// Most failures are opaque to callers (the runner gives up and lets the
/// visibility timeout redeliver the message), but lease expiry needs its
/// own kind: the heartbeat recovers from it by re-acquiring a fresh handle
/// for the same logical message.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The message's accumulated in-flight time exceeded the backend's
    /// maximum, and its lease can no longer be renewed with this handle.
    #[error("message lease expired")]
    LeaseExpired,

    /// Everything else. Callers treat these as transient and rely on
    /// queue redelivery rather than retrying in place.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// `Result` specialised to [`BackendError`].
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// The named queues a worker may drain, in pipeline order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueKind {
    /// Whole books awaiting binarisation into page variants.
    Preprocess,
    /// Whole books whose pages are already binarised and only need wiping.
    Wipeonly,
    /// Individual pages awaiting OCR.
    PageOcr,
    /// Whole books with all pages OCRed, awaiting aggregation.
    Analyse,
}

impl QueueKind {
    /// All queues, in the order the dispatcher polls them.
    pub const ALL: [QueueKind; 4] = [
        QueueKind::Preprocess,
        QueueKind::Wipeonly,
        QueueKind::PageOcr,
        QueueKind::Analyse,
    ];

    /// The queue's stable name, used for configuration and local files.
    pub fn name(self) -> &'static str {
        match self {
            QueueKind::Preprocess => "preprocess",
            QueueKind::Wipeonly => "wipeonly",
            QueueKind::PageOcr => "page_ocr",
            QueueKind::Analyse => "analyse",
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for QueueKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        QueueKind::ALL
            .into_iter()
            .find(|q| q.name() == s)
            .ok_or_else(|| anyhow!("unknown queue {s:?}"))
    }
}

/// A message leased from a queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueMessage {
    /// Stable identity of the message, preserved across redeliveries.
    pub id: String,

    /// Opaque lease token. A fresh one is issued on every receive, and the
    /// current one is required to extend or delete the message.
    pub handle: String,

    /// Plain UTF-8 payload. See the message grammar in the worker module.
    pub body: String,
}

/// Counts reported by [`Backend::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages waiting to be received.
    pub available: usize,
    /// Messages currently leased by some worker.
    pub in_flight: usize,
}

/// One key in the object store, as returned by [`Backend::list`].
#[derive(Clone, Debug)]
pub struct ObjectEntry {
    /// Full key, e.g. `mybook/0003_bin0.2.png`.
    pub key: String,
    /// Last-modified time, when the backend tracks one.
    pub modified: Option<SystemTime>,
}

/// The capability set the pipeline runs against.
///
/// Contracts the implementations uphold:
///
/// * `check` returns at most one message, in-flight for exactly `lease`;
///   an empty long-poll window is `Ok(None)`, not an error.
/// * `extend` fails with [`BackendError::LeaseExpired`] once the message
///   has exceeded the backend's maximum in-flight time; before surfacing
///   that kind the implementation attempts to drop the remaining lease to
///   zero so the message reappears promptly.
/// * `enqueue` is at-least-once; consumers must tolerate duplicates.
/// * `delete` is idempotent; unknown or expired handles are not an error.
/// * `list` may page internally; result order is unspecified.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// The opaque identifier (queue URL, file path) of a named queue.
    fn queue_id(&self, queue: QueueKind) -> &str;

    /// The name of the work-in-progress bucket.
    fn bucket(&self) -> &str;

    /// Long-poll `queue` for up to [`LONG_POLL`], leasing any message
    /// received for `lease`.
    async fn check(
        &self,
        queue: QueueKind,
        lease: Duration,
    ) -> BackendResult<Option<QueueMessage>>;

    /// Renew the lease on an in-flight message for another `lease`.
    async fn extend(
        &self,
        queue: QueueKind,
        handle: &str,
        lease: Duration,
    ) -> BackendResult<()>;

    /// Append a message to `queue`.
    async fn enqueue(&self, queue: QueueKind, body: &str) -> BackendResult<()>;

    /// Delete an in-flight message.
    async fn delete(&self, queue: QueueKind, handle: &str) -> BackendResult<()>;

    /// Approximate (available, in-flight) counts for `queue`.
    async fn stats(&self, queue: QueueKind) -> BackendResult<QueueStats>;

    /// Upload a local file to `key`.
    async fn put(&self, key: &str, local: &Path) -> BackendResult<()>;

    /// Download `key` to a local file.
    async fn get(&self, key: &str, local: &Path) -> BackendResult<()>;

    /// List every key under `prefix`.
    async fn list(&self, prefix: &str) -> BackendResult<Vec<ObjectEntry>>;

    /// Delete a batch of keys. Missing keys are not an error.
    async fn delete_objects(&self, keys: &[String]) -> BackendResult<()>;
}
