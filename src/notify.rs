//! Failure notifications.
//!
//! When a stage fails deterministically (bad page image, OCR subprocess
//! crash), retrying is pointless: the message is deleted and somebody
//! should hear about it. The summary handed to the sink bundles the
//! failing message, the error chain, and the most recent log lines so a
//! failure can be triaged without shelling into the worker host.

use std::{collections::VecDeque, sync::Mutex};

use tracing::field::{Field, Visit};
use tracing_subscriber::layer::Context;

use crate::{backend::QueueKind, prelude::*};

/// How many recent log lines we keep for failure summaries.
const RING_CAPACITY: usize = 100;

/// Receives formatted failure summaries. The default implementation just
/// logs; deployments plug in whatever alerting they have (the reference
/// deployment mailed them out).
#[async_trait]
pub trait NotificationSink: Send + Sync + 'static {
    async fn notify(&self, summary: &str) -> Result<()>;
}

/// Sink that reports failures through the normal log stream.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, summary: &str) -> Result<()> {
        error!("stage failure:\n{summary}");
        Ok(())
    }
}

/// Build the summary handed to a [`NotificationSink`].
pub fn format_failure(
    queue: QueueKind,
    body: &str,
    error: &anyhow::Error,
    recent_logs: &[String],
) -> String {
    let mut summary = format!(
        "Processing failed permanently on queue {queue}.\n\
         Message: {body}\n\
         Error: {error:#}\n"
    );
    if !recent_logs.is_empty() {
        summary.push_str("\nRecent log lines:\n");
        for line in recent_logs {
            summary.push_str(line);
            summary.push('\n');
        }
    }
    summary
}

/// A bounded ring of recent log lines.
///
/// The mutex only guards pushes and snapshots of a small deque; no core
/// coordination happens through it.
#[derive(Default)]
pub struct LogRing {
    lines: Mutex<VecDeque<String>>,
}

impl LogRing {
    pub fn new() -> Arc<LogRing> {
        Arc::new(LogRing::default())
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().expect("log ring poisoned");
        if lines.len() == RING_CAPACITY {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn recent(&self) -> Vec<String> {
        self.lines
            .lock()
            .expect("log ring poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

/// `tracing` layer feeding the ring.
pub struct LogRingLayer {
    ring: Arc<LogRing>,
}

impl LogRingLayer {
    pub fn new(ring: Arc<LogRing>) -> LogRingLayer {
        LogRingLayer { ring }
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for LogRingLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut message = MessageVisitor::default();
        event.record(&mut message);
        self.ring.push(format!(
            "{} {}: {}",
            event.metadata().level(),
            event.metadata().target(),
            message.0
        ));
    }
}

#[derive(Default)]
struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Sink that records every summary, for assertions.
    #[derive(Default)]
    pub struct RecordingSink {
        pub summaries: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn notify(&self, summary: &str) -> Result<()> {
            self.summaries
                .lock()
                .expect("recording sink poisoned")
                .push(summary.to_owned());
            Ok(())
        }
    }
}
