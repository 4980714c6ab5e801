//! The worker: dispatcher, runner and heartbeat.
//!
//! A worker is a symmetric peer: it polls the queues it is configured
//! for, round-robin with a pause, and hands any message it wins to the
//! pipeline runner. There is no coordinator; workers only meet each
//! other through queue visibility semantics.

pub mod heartbeat;
pub mod runner;

use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    backend::{Backend, QueueKind},
    config::Settings,
    notify::{LogRing, NotificationSink},
    prelude::*,
    stages::{Form, StagePlan, plan_for},
};

pub use runner::{Outcome, Runner};

/// A parsed queue message body.
///
/// Grammar (plain UTF-8 text):
///
/// * whole-book queues: `<bookname>` or `<bookname> <training>`
/// * page-OCR queue: `<bookname>/<pagefile>` or
///   `<bookname>/<pagefile> <training>`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Order {
    pub book: String,
    /// Full page key (`<bookname>/<pagefile>`) for single-page work.
    pub page: Option<String>,
    pub training: Option<String>,
}

impl Order {
    pub fn parse(body: &str, form: Form) -> Result<Order> {
        let mut parts = body.split(' ').filter(|p| !p.is_empty());
        let target = parts
            .next()
            .ok_or_else(|| anyhow!("empty message body"))?;
        let training = parts.next().map(str::to_owned);
        if parts.next().is_some() {
            return Err(anyhow!("malformed message body {body:?}"));
        }
        match form {
            Form::SinglePage => {
                let (book, page) = target
                    .split_once('/')
                    .ok_or_else(|| anyhow!("page message {body:?} names no page"))?;
                if book.is_empty() || page.is_empty() || page.contains('/') {
                    return Err(anyhow!("malformed page message {body:?}"));
                }
                Ok(Order {
                    book: book.to_owned(),
                    page: Some(target.to_owned()),
                    training,
                })
            }
            Form::WholeBook => {
                if target.contains('/') {
                    return Err(anyhow!("book message {body:?} contains a path"));
                }
                Ok(Order {
                    book: target.to_owned(),
                    page: None,
                    training,
                })
            }
        }
    }

    /// Body that forwards this book to another whole-book queue,
    /// carrying the training along.
    pub fn forward_body(&self) -> String {
        match &self.training {
            Some(training) => format!("{} {training}", self.book),
            None => self.book.clone(),
        }
    }

    /// Body that enqueues one produced page key for OCR.
    pub fn page_body(&self, key: &str) -> String {
        match &self.training {
            Some(training) => format!("{key} {training}"),
            None => key.to_owned(),
        }
    }
}

/// What to do when the worker has seen nothing but empty queues for the
/// configured quiet period.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdleAction {
    Continue,
    Shutdown,
}

/// Observes the idle transition. Ephemeral cloud workers shut their host
/// down here; the default just logs and keeps polling.
pub trait IdleHook: Send + Sync + 'static {
    fn on_idle(&self) -> IdleAction;
}

/// Default hook: stay up.
pub struct KeepRunning;

impl IdleHook for KeepRunning {
    fn on_idle(&self) -> IdleAction {
        IdleAction::Continue
    }
}

/// Hook for ephemeral workers: once the queues go quiet, stop polling
/// and let the process (and typically its host) exit.
pub struct ShutdownWhenIdle;

impl IdleHook for ShutdownWhenIdle {
    fn on_idle(&self) -> IdleAction {
        IdleAction::Shutdown
    }
}

/// The top-level polling loop.
pub struct Worker {
    backend: Arc<dyn Backend>,
    settings: Arc<Settings>,
    runner: Runner,
    plans: Vec<StagePlan>,
    idle_hook: Box<dyn IdleHook>,
}

impl Worker {
    pub fn new(
        backend: Arc<dyn Backend>,
        settings: Arc<Settings>,
        sink: Arc<dyn NotificationSink>,
        logs: Arc<LogRing>,
        idle_hook: Box<dyn IdleHook>,
    ) -> Worker {
        let plans = settings
            .enabled
            .iter()
            .map(|&queue| plan_for(queue, &settings))
            .collect();
        let runner = Runner::new(backend.clone(), settings.clone(), sink, logs);
        Worker {
            backend,
            settings,
            runner,
            plans,
            idle_hook,
        }
    }

    /// Same, with explicit plans. Lets tests substitute stages.
    #[cfg(test)]
    pub(crate) fn with_plans(
        backend: Arc<dyn Backend>,
        settings: Arc<Settings>,
        sink: Arc<dyn NotificationSink>,
        logs: Arc<LogRing>,
        idle_hook: Box<dyn IdleHook>,
        plans: Vec<StagePlan>,
    ) -> Worker {
        let runner = Runner::new(backend.clone(), settings.clone(), sink, logs);
        Worker {
            backend,
            settings,
            runner,
            plans,
            idle_hook,
        }
    }

    /// Poll until cancelled or the idle hook asks for shutdown.
    #[instrument(level = "info", skip_all)]
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        if self.plans.is_empty() {
            return Err(anyhow!("no stages enabled"));
        }
        let now = Instant::now();
        let mut next_check: Vec<Instant> = self.plans.iter().map(|_| now).collect();
        let mut idle_at = now + self.settings.idle_shutdown;

        loop {
            // Earliest queue timer, or the idle timer if it is sooner.
            let (idx, check_at) = next_check
                .iter()
                .copied()
                .enumerate()
                .min_by_key(|&(_, at)| at)
                .expect("at least one plan");
            let wake = check_at.min(idle_at);
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = time::sleep_until(wake) => {}
            }

            if Instant::now() >= idle_at {
                info!(
                    "no work for {:?}; worker is idle",
                    self.settings.idle_shutdown
                );
                match self.idle_hook.on_idle() {
                    IdleAction::Shutdown => return Ok(()),
                    IdleAction::Continue => {
                        idle_at = Instant::now() + self.settings.idle_shutdown;
                        continue;
                    }
                }
            }
            if Instant::now() < check_at {
                continue;
            }

            let plan = &self.plans[idx];
            let checked = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = self.backend.check(plan.queue, self.settings.lease) => result,
            };
            match checked {
                Ok(Some(msg)) => {
                    idle_at = Instant::now() + self.settings.idle_shutdown;
                    match self.runner.process(plan, msg, &cancel).await {
                        Ok(outcome) => {
                            debug!("message on {} finished: {outcome:?}", plan.queue)
                        }
                        Err(err) => {
                            warn!("runner failed on {}: {err:#}", plan.queue)
                        }
                    }
                    idle_at = Instant::now() + self.settings.idle_shutdown;
                    // Work is flowing; check the same queue again right
                    // away.
                    next_check[idx] = Instant::now();
                }
                Ok(None) => {
                    next_check[idx] = Instant::now() + self.settings.poll_interval;
                }
                Err(err) => {
                    warn!("failed to check {}: {err:#}", plan.queue);
                    next_check[idx] = Instant::now() + self.settings.poll_interval;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_book_bodies() {
        let order = Order::parse("mybook", Form::WholeBook).unwrap();
        assert_eq!(order.book, "mybook");
        assert_eq!(order.page, None);
        assert_eq!(order.training, None);

        let order = Order::parse("mybook frak", Form::WholeBook).unwrap();
        assert_eq!(order.training.as_deref(), Some("frak"));
        assert_eq!(order.forward_body(), "mybook frak");

        assert!(Order::parse("", Form::WholeBook).is_err());
        assert!(Order::parse("my/book", Form::WholeBook).is_err());
        assert!(Order::parse("a b c", Form::WholeBook).is_err());
    }

    #[test]
    fn parses_page_bodies() {
        let order =
            Order::parse("mybook/0001_bin0.2.png", Form::SinglePage).unwrap();
        assert_eq!(order.book, "mybook");
        assert_eq!(order.page.as_deref(), Some("mybook/0001_bin0.2.png"));

        let order =
            Order::parse("mybook/0001_bin0.2.png frak", Form::SinglePage).unwrap();
        assert_eq!(order.training.as_deref(), Some("frak"));
        assert_eq!(
            order.page_body("mybook/0002_bin0.1.png"),
            "mybook/0002_bin0.1.png frak"
        );

        assert!(Order::parse("mybook", Form::SinglePage).is_err());
        assert!(Order::parse("my/book/page.png", Form::SinglePage).is_err());
    }

    mod dispatcher {
        use super::*;
        use crate::backend::mock::MockBackend;
        use crate::notify::testing::RecordingSink;
        use crate::stages::{Stage, StageContext};
        use std::sync::Mutex;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::time::Duration;
        use tokio::sync::mpsc;

        /// Stage that records which files it saw and passes them through.
        struct PassThrough {
            seen: Arc<Mutex<Vec<String>>>,
        }

        #[async_trait]
        impl Stage for PassThrough {
            fn name(&self) -> &'static str {
                "passthrough"
            }

            fn wants(&self, key: &str) -> bool {
                key.ends_with(".png")
            }

            async fn process(
                &self,
                ctx: &StageContext,
                mut input: mpsc::Receiver<PathBuf>,
                output: mpsc::Sender<PathBuf>,
            ) -> Result<()> {
                while let Some(path) =
                    crate::stages::recv_item(&ctx.cancel, &mut input).await
                {
                    self.seen
                        .lock()
                        .unwrap()
                        .push(path.file_name().unwrap().to_string_lossy().into_owned());
                    if !crate::stages::send_item(&ctx.cancel, &output, path).await {
                        return Ok(());
                    }
                }
                Ok(())
            }
        }

        struct CountingIdleHook {
            fired: Arc<AtomicUsize>,
        }

        impl IdleHook for CountingIdleHook {
            fn on_idle(&self) -> IdleAction {
                self.fired.fetch_add(1, Ordering::SeqCst);
                IdleAction::Shutdown
            }
        }

        fn test_settings() -> Arc<Settings> {
            Arc::new(Settings {
                lease: Duration::from_millis(200),
                poll_interval: Duration::from_millis(20),
                idle_shutdown: Duration::from_millis(150),
                enabled: vec![QueueKind::Analyse],
                ..Settings::default()
            })
        }

        #[tokio::test]
        async fn processes_then_reports_idle_and_shuts_down() {
            let backend = MockBackend::new();
            backend.seed_object("book1/0001.png", b"page");
            backend.seed_queue(QueueKind::Analyse, "m1", "book1");

            let seen = Arc::new(Mutex::new(Vec::new()));
            let fired = Arc::new(AtomicUsize::new(0));
            let plans = vec![StagePlan {
                queue: QueueKind::Analyse,
                form: Form::WholeBook,
                next: None,
                stage: Arc::new(PassThrough { seen: seen.clone() }),
            }];
            let worker = Worker::with_plans(
                backend.clone(),
                test_settings(),
                Arc::new(RecordingSink::default()),
                LogRing::new(),
                Box::new(CountingIdleHook {
                    fired: fired.clone(),
                }),
                plans,
            );

            worker.run(CancellationToken::new()).await.unwrap();

            // The message was processed, then the quiet period elapsed
            // and the hook fired exactly once before shutdown.
            assert_eq!(seen.lock().unwrap().as_slice(), ["0001.png"]);
            assert_eq!(fired.load(Ordering::SeqCst), 1);
            let events = backend.events();
            assert!(events.iter().any(|e| e.starts_with("delete:analyse")));
        }

        #[tokio::test]
        async fn cancellation_stops_the_loop() {
            let backend = MockBackend::new();
            let worker = Worker::with_plans(
                backend.clone(),
                Arc::new(Settings {
                    idle_shutdown: Duration::from_secs(60),
                    poll_interval: Duration::from_millis(10),
                    enabled: vec![QueueKind::Preprocess],
                    ..Settings::default()
                }),
                Arc::new(RecordingSink::default()),
                LogRing::new(),
                Box::new(KeepRunning),
                vec![plan_for(QueueKind::Preprocess, &Arc::new(Settings::default()))],
            );
            let cancel = CancellationToken::new();
            let handle = {
                let cancel = cancel.clone();
                tokio::spawn(async move { worker.run(cancel).await })
            };
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
            handle.await.unwrap().unwrap();
        }
    }
}
