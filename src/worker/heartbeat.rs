//! Lease heartbeat.
//!
//! While a runner chews on a message, this task keeps the message
//! invisible to other workers by renewing its lease at half-lease
//! cadence. Backends cap the total in-flight time (SQS: 12 hours), and
//! when that cap is hit the only way to keep ownership is to catch the
//! message again as it becomes visible and carry on under the new
//! handle. The runner reads the freshest handle from the shared one-slot
//! mailbox when it finally deletes the message.
//!
//! Heartbeat failures are never swallowed: a silently dead heartbeat
//! means another worker picks the message up and the same book is
//! processed twice. Errors returned here surface on the runner's error
//! channel and tear the whole pipeline down.

use std::time::Duration;

use tokio::{
    sync::watch,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    backend::{Backend, BackendError, QueueKind, QueueMessage},
    prelude::*,
};

/// Renew the lease until cancelled. `current` starts out holding the
/// original message and receives the replacement whenever the handle is
/// swapped.
pub async fn run(
    backend: Arc<dyn Backend>,
    queue: QueueKind,
    lease: Duration,
    current: watch::Sender<QueueMessage>,
    cancel: CancellationToken,
) -> Result<()> {
    let id = current.borrow().id.clone();
    let mut handle = current.borrow().handle.clone();

    let mut ticker = time::interval(lease / 2);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // An interval's first tick completes immediately; the message was
    // just leased, so skip it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        match backend.extend(queue, &handle, lease).await {
            Ok(()) => trace!("extended lease on {queue} message {id}"),
            Err(BackendError::LeaseExpired) => {
                info!("lease on {queue} message {id} hit its ceiling; reacquiring");
                match reacquire(backend.as_ref(), queue, &id, lease, &cancel).await? {
                    Some(msg) => {
                        handle = msg.handle.clone();
                        // The runner may already be gone; then nobody
                        // needs the new handle and the send can fail.
                        let _ = current.send(msg);
                    }
                    None => return Ok(()),
                }
            }
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("failed to extend lease on {queue}")));
            }
        }
    }
}

/// Poll `queue` for up to one lease, looking for the message with our
/// id. `Ok(None)` means we were cancelled while polling.
async fn reacquire(
    backend: &dyn Backend,
    queue: QueueKind,
    id: &str,
    lease: Duration,
    cancel: &CancellationToken,
) -> Result<Option<QueueMessage>> {
    let deadline = Instant::now() + lease;
    while Instant::now() < deadline {
        let checked = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            result = backend.check(queue, lease) => result,
        };
        let checked = checked
            .map_err(anyhow::Error::new)
            .with_context(|| format!("failed to re-poll {queue} for message {id}"))?;
        match checked {
            Some(msg) if msg.id == id => {
                info!("reacquired message {id} under a fresh handle");
                return Ok(Some(msg));
            }
            Some(other) => {
                // Not ours. We cannot requeue it without owning it, so
                // leave the lease to lapse and the queue to redeliver.
                debug!("ignoring unrelated message {} while reacquiring", other.id);
            }
            None => {}
        }
    }
    Err(anyhow!(
        "could not reacquire message {id} on {queue} after lease expiry"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBackend, MockExtend};

    const LEASE: Duration = Duration::from_millis(100);

    #[tokio::test]
    async fn renews_until_cancelled() {
        let backend = MockBackend::new();
        backend.seed_queue(QueueKind::Preprocess, "m1", "book1");
        let msg = backend
            .check(QueueKind::Preprocess, LEASE)
            .await
            .unwrap()
            .unwrap();

        let (tx, rx) = watch::channel(msg);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            backend.clone() as Arc<dyn Backend>,
            QueueKind::Preprocess,
            LEASE,
            tx,
            cancel.clone(),
        ));

        tokio::time::sleep(LEASE * 2).await;
        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(backend.extend_calls() >= 2);
        // No swap happened.
        assert_eq!(rx.borrow().handle, "handle-1");

        // The ticker really stopped: no extends after the task is gone.
        let calls = backend.extend_calls();
        tokio::time::sleep(LEASE * 2).await;
        assert_eq!(backend.extend_calls(), calls);
    }

    #[tokio::test]
    async fn swaps_handle_after_lease_expiry() {
        let backend = MockBackend::new();
        backend.seed_queue(QueueKind::PageOcr, "m1", "book1/0001_bin0.2.png");
        let msg = backend
            .check(QueueKind::PageOcr, LEASE)
            .await
            .unwrap()
            .unwrap();
        let original_handle = msg.handle.clone();

        // First renewal hits the in-flight ceiling; the mock makes the
        // message visible again, as the real backend would.
        backend.script_extend(MockExtend::LeaseExpired);

        let (tx, rx) = watch::channel(msg);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            backend.clone() as Arc<dyn Backend>,
            QueueKind::PageOcr,
            LEASE,
            tx,
            cancel.clone(),
        ));

        tokio::time::sleep(LEASE * 2).await;
        let swapped = rx.borrow().clone();
        assert_eq!(swapped.id, "m1");
        assert_ne!(swapped.handle, original_handle);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unreacquirable_message_is_fatal() {
        let backend = MockBackend::new();
        backend.seed_queue(QueueKind::Analyse, "m1", "book1");
        let msg = backend
            .check(QueueKind::Analyse, LEASE)
            .await
            .unwrap()
            .unwrap();

        // Lease expires but nothing ever comes back on the queue.
        backend.script_extend(MockExtend::LeaseExpiredSilently);

        let (tx, _rx) = watch::channel(msg);
        let cancel = CancellationToken::new();
        let result = run(
            backend.clone() as Arc<dyn Backend>,
            QueueKind::Analyse,
            LEASE,
            tx,
            cancel,
        )
        .await;
        let err = result.unwrap_err().to_string();
        assert!(err.contains("could not reacquire"), "got: {err}");
    }

    #[tokio::test]
    async fn other_extend_errors_are_fatal() {
        let backend = MockBackend::new();
        backend.seed_queue(QueueKind::Preprocess, "m1", "book1");
        let msg = backend
            .check(QueueKind::Preprocess, LEASE)
            .await
            .unwrap()
            .unwrap();
        backend.script_extend(MockExtend::Fail);

        let (tx, _rx) = watch::channel(msg);
        let result = run(
            backend.clone() as Arc<dyn Backend>,
            QueueKind::Preprocess,
            LEASE,
            tx,
            CancellationToken::new(),
        )
        .await;
        assert!(result.is_err());
    }
}
