//! SQS + S3 backend.
//!
//! Queues are SQS queues (receipt handles are the lease tokens, visibility
//! timeouts are the leases) and the object store is one S3 bucket. Queue
//! URLs are resolved once at connect time so the hot paths never repeat
//! the lookup.

use std::time::{Duration, SystemTime};

use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_sqs::error::ProvideErrorMetadata;
use aws_sdk_sqs::types::QueueAttributeName;

use super::{
    Backend, BackendError, BackendResult, LONG_POLL, ObjectEntry, QueueKind,
    QueueMessage, QueueStats,
};
use crate::prelude::*;

/// S3 limits `DeleteObjects` to this many keys per request.
const DELETE_BATCH: usize = 1000;

/// Backend talking to SQS and S3.
pub struct CloudBackend {
    sqs: aws_sdk_sqs::Client,
    s3: aws_sdk_s3::Client,
    bucket: String,
    queue_urls: [String; 4],
}

impl CloudBackend {
    /// Connect using the standard AWS credential chain. Queue names are
    /// `<prefix><queue>` (e.g. `bookpipe-page_ocr`) and must already
    /// exist, as must `bucket`.
    pub async fn connect(bucket: &str, queue_prefix: &str) -> Result<CloudBackend> {
        // Standard AWS conventions: env vars, config files, instance roles.
        let config =
            aws_config::load_defaults(aws_config::BehaviorVersion::v2025_01_17()).await;
        let sqs = aws_sdk_sqs::Client::new(&config);
        let s3 = aws_sdk_s3::Client::new(&config);

        let mut queue_urls: [String; 4] = Default::default();
        for queue in QueueKind::ALL {
            let name = format!("{queue_prefix}{queue}");
            let out = sqs
                .get_queue_url()
                .queue_name(&name)
                .send()
                .await
                .with_context(|| format!("failed to resolve queue {name:?}"))?;
            queue_urls[queue as usize] = out
                .queue_url()
                .ok_or_else(|| anyhow!("queue {name:?} has no URL"))?
                .to_owned();
        }

        Ok(CloudBackend {
            sqs,
            s3,
            bucket: bucket.to_owned(),
            queue_urls,
        })
    }

    fn url(&self, queue: QueueKind) -> &str {
        &self.queue_urls[queue as usize]
    }
}

#[async_trait]
impl Backend for CloudBackend {
    fn queue_id(&self, queue: QueueKind) -> &str {
        self.url(queue)
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn check(
        &self,
        queue: QueueKind,
        lease: Duration,
    ) -> BackendResult<Option<QueueMessage>> {
        let out = self
            .sqs
            .receive_message()
            .queue_url(self.url(queue))
            .max_number_of_messages(1)
            .wait_time_seconds(LONG_POLL.as_secs() as i32)
            .visibility_timeout(lease.as_secs() as i32)
            .send()
            .await
            .map_err(|err| service_error(err, "receive_message", queue))?;

        let Some(msg) = out.messages.unwrap_or_default().into_iter().next() else {
            return Ok(None);
        };
        match (msg.message_id, msg.receipt_handle, msg.body) {
            (Some(id), Some(handle), Some(body)) => {
                Ok(Some(QueueMessage { id, handle, body }))
            }
            _ => Err(anyhow!("received incomplete message from {queue}").into()),
        }
    }

    async fn extend(
        &self,
        queue: QueueKind,
        handle: &str,
        lease: Duration,
    ) -> BackendResult<()> {
        let result = self
            .sqs
            .change_message_visibility()
            .queue_url(self.url(queue))
            .receipt_handle(handle)
            .visibility_timeout(lease.as_secs() as i32)
            .send()
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_lease_expired(&err) => {
                // Best effort: make the message visible again right away
                // rather than waiting out whatever remains of the lease.
                let _ = self
                    .sqs
                    .change_message_visibility()
                    .queue_url(self.url(queue))
                    .receipt_handle(handle)
                    .visibility_timeout(0)
                    .send()
                    .await;
                Err(BackendError::LeaseExpired)
            }
            Err(err) => Err(service_error(err, "change_message_visibility", queue)),
        }
    }

    async fn enqueue(&self, queue: QueueKind, body: &str) -> BackendResult<()> {
        self.sqs
            .send_message()
            .queue_url(self.url(queue))
            .message_body(body)
            .send()
            .await
            .map_err(|err| service_error(err, "send_message", queue))?;
        Ok(())
    }

    async fn delete(&self, queue: QueueKind, handle: &str) -> BackendResult<()> {
        let result = self
            .sqs
            .delete_message()
            .queue_url(self.url(queue))
            .receipt_handle(handle)
            .send()
            .await;
        match result {
            Ok(_) => Ok(()),
            // Expired or unknown handles are not an error surface: the
            // message either was already deleted or will be redelivered.
            Err(err) if is_bad_handle(&err) => {
                debug!("ignoring delete with stale handle on {queue}");
                Ok(())
            }
            Err(err) => Err(service_error(err, "delete_message", queue)),
        }
    }

    async fn stats(&self, queue: QueueKind) -> BackendResult<QueueStats> {
        let out = self
            .sqs
            .get_queue_attributes()
            .queue_url(self.url(queue))
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            .send()
            .await
            .map_err(|err| service_error(err, "get_queue_attributes", queue))?;
        let attrs = out.attributes.unwrap_or_default();
        let count = |name: &QueueAttributeName| {
            attrs
                .get(name)
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0)
        };
        Ok(QueueStats {
            available: count(&QueueAttributeName::ApproximateNumberOfMessages),
            in_flight: count(&QueueAttributeName::ApproximateNumberOfMessagesNotVisible),
        })
    }

    async fn put(&self, key: &str, local: &Path) -> BackendResult<()> {
        let body = ByteStream::from_path(local)
            .await
            .with_context(|| format!("failed to open {local:?} for upload"))?;
        self.s3
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|err| {
                BackendError::Other(
                    anyhow::Error::new(err).context(format!("failed to upload {key:?}")),
                )
            })?;
        Ok(())
    }

    async fn get(&self, key: &str, local: &Path) -> BackendResult<()> {
        let out = self
            .s3
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                BackendError::Other(
                    anyhow::Error::new(err).context(format!("failed to fetch {key:?}")),
                )
            })?;
        let mut body = out.body.into_async_read();
        let mut file = tokio::fs::File::create(local)
            .await
            .with_context(|| format!("failed to create {local:?}"))?;
        tokio::io::copy(&mut body, &mut file)
            .await
            .with_context(|| format!("failed to write {key:?} to {local:?}"))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> BackendResult<Vec<ObjectEntry>> {
        let mut entries = Vec::new();
        let mut pages = self
            .s3
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|err| {
                BackendError::Other(
                    anyhow::Error::new(err)
                        .context(format!("failed to list prefix {prefix:?}")),
                )
            })?;
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                entries.push(ObjectEntry {
                    key: key.to_owned(),
                    modified: object
                        .last_modified()
                        .and_then(|t| SystemTime::try_from(*t).ok()),
                });
            }
        }
        Ok(entries)
    }

    async fn delete_objects(&self, keys: &[String]) -> BackendResult<()> {
        for batch in keys.chunks(DELETE_BATCH) {
            let identifiers = batch
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("failed to build delete request")?;
            let delete = Delete::builder()
                .set_objects(Some(identifiers))
                .build()
                .context("failed to build delete request")?;
            self.s3
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|err| {
                    BackendError::Other(
                        anyhow::Error::new(err).context("failed to delete objects"),
                    )
                })?;
        }
        Ok(())
    }
}

/// Wrap an SQS failure with enough context to triage it.
fn service_error<E>(err: E, operation: &str, queue: QueueKind) -> BackendError
where
    E: std::error::Error + Send + Sync + 'static,
{
    BackendError::Other(
        anyhow::Error::new(err).context(format!("sqs {operation} failed on {queue}")),
    )
}

/// Does this error mean the message exceeded its maximum in-flight time?
///
/// SQS reports the condition as `MessageNotInflight`, or as
/// `InvalidParameterValue` once the total visibility would pass the 12 h
/// ceiling.
fn is_lease_expired<E, R>(err: &aws_sdk_sqs::error::SdkError<E, R>) -> bool
where
    E: ProvideErrorMetadata,
{
    matches!(
        err.code(),
        Some("MessageNotInflight") | Some("InvalidParameterValue")
    )
}

/// Does this error mean the receipt handle is stale or unknown?
fn is_bad_handle<E, R>(err: &aws_sdk_sqs::error::SdkError<E, R>) -> bool
where
    E: ProvideErrorMetadata,
{
    matches!(
        err.code(),
        Some("ReceiptHandleIsInvalid") | Some("InvalidParameterValue")
    )
}
