//! Filesystem backend.
//!
//! Queues are line-oriented append files under `<root>/queues/`, and the
//! object store is a plain directory tree under `<root>/objects/`. A
//! leased message moves to a `<queue>.leased` sidecar together with an
//! expiry stamp; the next `check` after the stamp passes moves it back,
//! which gives the local backend real redelivery-after-death semantics
//! instead of pretending leases don't exist. The message body doubles as
//! both id and handle.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::{fs, sync::Mutex};

use super::{
    Backend, BackendResult, ObjectEntry, QueueKind, QueueMessage, QueueStats,
};
use crate::prelude::*;

/// Backend rooted in a local directory.
pub struct LocalBackend {
    queue_dir: PathBuf,
    object_dir: PathBuf,
    queue_ids: [String; 4],
    bucket: String,

    /// Guards every queue-file read-modify-write. The dispatcher and the
    /// heartbeat can touch the same queue file concurrently, and partial
    /// line rewrites would corrupt it.
    lock: Mutex<()>,
}

impl LocalBackend {
    /// Create a backend rooted at `root`, creating the layout if needed.
    pub async fn new(root: &Path) -> Result<LocalBackend> {
        let queue_dir = root.join("queues");
        let object_dir = root.join("objects");
        fs::create_dir_all(&queue_dir)
            .await
            .with_context(|| format!("failed to create {queue_dir:?}"))?;
        fs::create_dir_all(&object_dir)
            .await
            .with_context(|| format!("failed to create {object_dir:?}"))?;
        let queue_ids = QueueKind::ALL
            .map(|q| queue_dir.join(q.name()).to_string_lossy().into_owned());
        Ok(LocalBackend {
            bucket: object_dir.to_string_lossy().into_owned(),
            queue_dir,
            object_dir,
            queue_ids,
            lock: Mutex::new(()),
        })
    }

    fn queue_file(&self, queue: QueueKind) -> PathBuf {
        self.queue_dir.join(queue.name())
    }

    fn leased_file(&self, queue: QueueKind) -> PathBuf {
        self.queue_dir.join(format!("{}.leased", queue.name()))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let mut path = self.object_dir.clone();
        for part in key.split('/') {
            path.push(part);
        }
        path
    }

    /// Move any leased message whose expiry has passed back onto the
    /// queue. Callers hold `self.lock`.
    async fn requeue_expired(&self, queue: QueueKind) -> Result<()> {
        let leased = read_lines(&self.leased_file(queue)).await?;
        if leased.is_empty() {
            return Ok(());
        }
        let now = unix_millis(SystemTime::now());
        let mut live = Vec::new();
        let mut expired = Vec::new();
        for line in leased {
            match parse_lease(&line) {
                Some((expiry, body)) if expiry <= now => {
                    expired.push(body.to_owned())
                }
                Some(_) => live.push(line),
                None => warn!("dropping malformed lease line {line:?}"),
            }
        }
        if !expired.is_empty() {
            debug!("requeuing {} expired messages on {queue}", expired.len());
            let mut lines = expired;
            lines.extend(read_lines(&self.queue_file(queue)).await?);
            write_lines(&self.queue_file(queue), &lines).await?;
            write_lines(&self.leased_file(queue), &live).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn queue_id(&self, queue: QueueKind) -> &str {
        &self.queue_ids[queue as usize]
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn check(
        &self,
        queue: QueueKind,
        lease: Duration,
    ) -> BackendResult<Option<QueueMessage>> {
        let _guard = self.lock.lock().await;
        self.requeue_expired(queue).await?;

        let mut lines = read_lines(&self.queue_file(queue)).await?;
        if lines.is_empty() {
            return Ok(None);
        }
        let body = lines.remove(0);
        write_lines(&self.queue_file(queue), &lines).await?;

        let expiry = unix_millis(SystemTime::now() + lease);
        let mut leased = read_lines(&self.leased_file(queue)).await?;
        leased.push(format!("{expiry}\t{body}"));
        write_lines(&self.leased_file(queue), &leased).await?;

        Ok(Some(QueueMessage {
            id: body.clone(),
            handle: body.clone(),
            body,
        }))
    }

    async fn extend(
        &self,
        queue: QueueKind,
        handle: &str,
        lease: Duration,
    ) -> BackendResult<()> {
        let _guard = self.lock.lock().await;
        let mut leased = read_lines(&self.leased_file(queue)).await?;
        let expiry = unix_millis(SystemTime::now() + lease);
        for line in &mut leased {
            if parse_lease(line).map(|(_, body)| body) == Some(handle) {
                *line = format!("{expiry}\t{handle}");
                write_lines(&self.leased_file(queue), &leased).await?;
                return Ok(());
            }
        }
        // Renewing a lease we no longer hold is a no-op locally; files
        // never hit a maximum in-flight time.
        Ok(())
    }

    async fn enqueue(&self, queue: QueueKind, body: &str) -> BackendResult<()> {
        let _guard = self.lock.lock().await;
        let mut lines = read_lines(&self.queue_file(queue)).await?;
        lines.push(body.to_owned());
        write_lines(&self.queue_file(queue), &lines).await?;
        Ok(())
    }

    async fn delete(&self, queue: QueueKind, handle: &str) -> BackendResult<()> {
        let _guard = self.lock.lock().await;
        let mut leased = read_lines(&self.leased_file(queue)).await?;
        if let Some(pos) = leased
            .iter()
            .position(|l| parse_lease(l).map(|(_, body)| body) == Some(handle))
        {
            leased.remove(pos);
            write_lines(&self.leased_file(queue), &leased).await?;
            return Ok(());
        }
        // The lease may have expired and the message moved back to the
        // queue; deleting by body keeps `delete` idempotent either way.
        let mut lines = read_lines(&self.queue_file(queue)).await?;
        if let Some(pos) = lines.iter().position(|l| l == handle) {
            lines.remove(pos);
            write_lines(&self.queue_file(queue), &lines).await?;
        }
        Ok(())
    }

    async fn stats(&self, queue: QueueKind) -> BackendResult<QueueStats> {
        let _guard = self.lock.lock().await;
        let available = read_lines(&self.queue_file(queue)).await?.len();
        let now = unix_millis(SystemTime::now());
        let in_flight = read_lines(&self.leased_file(queue))
            .await?
            .iter()
            .filter(|l| matches!(parse_lease(l), Some((expiry, _)) if expiry > now))
            .count();
        Ok(QueueStats {
            available,
            in_flight,
        })
    }

    async fn put(&self, key: &str, local: &Path) -> BackendResult<()> {
        let dest = self.object_path(key);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {parent:?}"))?;
        }
        fs::copy(local, &dest)
            .await
            .with_context(|| format!("failed to store {local:?} as {key:?}"))?;
        Ok(())
    }

    async fn get(&self, key: &str, local: &Path) -> BackendResult<()> {
        let src = self.object_path(key);
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {parent:?}"))?;
        }
        fs::copy(&src, local)
            .await
            .with_context(|| format!("failed to fetch {key:?} to {local:?}"))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> BackendResult<Vec<ObjectEntry>> {
        let mut entries = Vec::new();
        let mut pending = vec![self.object_dir.clone()];
        while let Some(dir) = pending.pop() {
            let mut read_dir = match fs::read_dir(&dir).await {
                Ok(read_dir) => read_dir,
                // The store starts empty; a missing root is just "no keys".
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(anyhow::Error::from(err)
                        .context(format!("failed to list {dir:?}"))
                        .into());
                }
            };
            while let Some(entry) = read_dir
                .next_entry()
                .await
                .with_context(|| format!("failed to list {dir:?}"))?
            {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }
                let key = path
                    .strip_prefix(&self.object_dir)
                    .expect("listed path must live under the object root")
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    let modified =
                        entry.metadata().await.ok().and_then(|m| m.modified().ok());
                    entries.push(ObjectEntry { key, modified });
                }
            }
        }
        Ok(entries)
    }

    async fn delete_objects(&self, keys: &[String]) -> BackendResult<()> {
        for key in keys {
            match fs::remove_file(self.object_path(key)).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(anyhow::Error::from(err)
                        .context(format!("failed to delete {key:?}"))
                        .into());
                }
            }
        }
        Ok(())
    }
}

/// Read a line file, treating a missing file as empty.
async fn read_lines(path: &Path) -> Result<Vec<String>> {
    match fs::read_to_string(path).await {
        Ok(data) => Ok(data.lines().map(str::to_owned).collect()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => {
            Err(anyhow::Error::from(err).context(format!("failed to read {path:?}")))
        }
    }
}

/// Rewrite a line file in place.
async fn write_lines(path: &Path, lines: &[String]) -> Result<()> {
    let mut data = lines.join("\n");
    if !data.is_empty() {
        data.push('\n');
    }
    fs::write(path, data)
        .await
        .with_context(|| format!("failed to write {path:?}"))
}

fn parse_lease(line: &str) -> Option<(u128, &str)> {
    let (expiry, body) = line.split_once('\t')?;
    Some((expiry.parse().ok()?, body))
}

fn unix_millis(time: SystemTime) -> u128 {
    time.duration_since(UNIX_EPOCH)
        .expect("system clock before 1970")
        .as_millis()
}
