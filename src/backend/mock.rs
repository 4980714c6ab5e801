//! Scripted in-memory backend for unit tests.
//!
//! Behaves like a tiny SQS + S3: messages get fresh handles on every
//! receive, leases are assumed held until deleted, and the object store
//! is a map. Tests can script `extend` results to drive the heartbeat
//! through its recovery paths, make downloads fail, and inspect an
//! ordered event log of enqueues, deletes and uploads.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

use super::{
    Backend, BackendError, BackendResult, ObjectEntry, QueueKind, QueueMessage,
    QueueStats,
};
use crate::prelude::*;

/// Scripted outcome of one `extend` call.
pub enum MockExtend {
    Ok,
    /// Lease ceiling hit; the message becomes visible again, as the real
    /// backend's drop-to-zero attempt would make it.
    LeaseExpired,
    /// Lease ceiling hit, but the message never reappears (e.g. another
    /// worker snatched and finished it).
    LeaseExpiredSilently,
    /// Some other backend failure.
    Fail,
}

#[derive(Default)]
struct State {
    queues: HashMap<QueueKind, VecDeque<(String, String)>>,
    in_flight: HashMap<String, (QueueKind, String, String)>,
    objects: BTreeMap<String, Vec<u8>>,
    extend_script: VecDeque<MockExtend>,
    extend_calls: usize,
    get_failures: usize,
    handle_seq: usize,
    events: Vec<String>,
}

#[derive(Default)]
pub struct MockBackend {
    state: Mutex<State>,
}

impl MockBackend {
    pub fn new() -> Arc<MockBackend> {
        Arc::new(MockBackend::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("mock backend poisoned")
    }

    pub fn seed_queue(&self, queue: QueueKind, id: &str, body: &str) {
        self.lock()
            .queues
            .entry(queue)
            .or_default()
            .push_back((id.to_owned(), body.to_owned()));
    }

    pub fn seed_object(&self, key: &str, data: &[u8]) {
        self.lock().objects.insert(key.to_owned(), data.to_vec());
    }

    pub fn script_extend(&self, outcome: MockExtend) {
        self.lock().extend_script.push_back(outcome);
    }

    /// Make the next `count` downloads fail.
    pub fn fail_next_gets(&self, count: usize) {
        self.lock().get_failures = count;
    }

    pub fn extend_calls(&self) -> usize {
        self.lock().extend_calls
    }

    /// Ordered log of enqueues, deletes and uploads.
    pub fn events(&self) -> Vec<String> {
        self.lock().events.clone()
    }

    pub fn object_keys(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().objects.get(key).cloned()
    }

    pub fn queue_len(&self, queue: QueueKind) -> usize {
        self.lock().queues.get(&queue).map_or(0, |q| q.len())
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn queue_id(&self, queue: QueueKind) -> &str {
        queue.name()
    }

    fn bucket(&self) -> &str {
        "mock-bucket"
    }

    async fn check(
        &self,
        queue: QueueKind,
        _lease: Duration,
    ) -> BackendResult<Option<QueueMessage>> {
        let popped = {
            let mut state = self.lock();
            let popped = state.queues.entry(queue).or_default().pop_front();
            if let Some((id, body)) = popped {
                state.handle_seq += 1;
                let handle = format!("handle-{}", state.handle_seq);
                state
                    .in_flight
                    .insert(handle.clone(), (queue, id.clone(), body.clone()));
                Some(QueueMessage { id, handle, body })
            } else {
                None
            }
        };
        if popped.is_none() {
            // Stand-in for the long-poll wait; keeps re-poll loops from
            // spinning.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(popped)
    }

    async fn extend(
        &self,
        queue: QueueKind,
        handle: &str,
        _lease: Duration,
    ) -> BackendResult<()> {
        let mut state = self.lock();
        state.extend_calls += 1;
        state.events.push(format!("extend:{queue}:{handle}"));
        match state.extend_script.pop_front() {
            None | Some(MockExtend::Ok) => Ok(()),
            Some(MockExtend::LeaseExpired) => {
                if let Some((queue, id, body)) = state.in_flight.remove(handle) {
                    state.queues.entry(queue).or_default().push_front((id, body));
                }
                Err(BackendError::LeaseExpired)
            }
            Some(MockExtend::LeaseExpiredSilently) => {
                state.in_flight.remove(handle);
                Err(BackendError::LeaseExpired)
            }
            Some(MockExtend::Fail) => Err(anyhow!("scripted extend failure").into()),
        }
    }

    async fn enqueue(&self, queue: QueueKind, body: &str) -> BackendResult<()> {
        let mut state = self.lock();
        state
            .queues
            .entry(queue)
            .or_default()
            .push_back((body.to_owned(), body.to_owned()));
        state.events.push(format!("enqueue:{queue}:{body}"));
        Ok(())
    }

    async fn delete(&self, queue: QueueKind, handle: &str) -> BackendResult<()> {
        let mut state = self.lock();
        state.in_flight.remove(handle);
        state.events.push(format!("delete:{queue}:{handle}"));
        Ok(())
    }

    async fn stats(&self, queue: QueueKind) -> BackendResult<QueueStats> {
        let state = self.lock();
        Ok(QueueStats {
            available: state.queues.get(&queue).map_or(0, |q| q.len()),
            in_flight: state
                .in_flight
                .values()
                .filter(|(q, _, _)| *q == queue)
                .count(),
        })
    }

    async fn put(&self, key: &str, local: &Path) -> BackendResult<()> {
        let data = std::fs::read(local)
            .with_context(|| format!("failed to read {local:?}"))?;
        let mut state = self.lock();
        state.objects.insert(key.to_owned(), data);
        state.events.push(format!("put:{key}"));
        Ok(())
    }

    async fn get(&self, key: &str, local: &Path) -> BackendResult<()> {
        let data = {
            let mut state = self.lock();
            if state.get_failures > 0 {
                state.get_failures -= 1;
                return Err(anyhow!("scripted download failure for {key}").into());
            }
            state
                .objects
                .get(key)
                .cloned()
                .ok_or_else(|| anyhow!("no such object {key}"))?
        };
        std::fs::write(local, data)
            .with_context(|| format!("failed to write {local:?}"))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> BackendResult<Vec<ObjectEntry>> {
        Ok(self
            .lock()
            .objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .map(|k| ObjectEntry {
                key: k.clone(),
                modified: None,
            })
            .collect())
    }

    async fn delete_objects(&self, keys: &[String]) -> BackendResult<()> {
        let mut state = self.lock();
        for key in keys {
            state.objects.remove(key);
        }
        Ok(())
    }
}
