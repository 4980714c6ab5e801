//! Terminal UI for the operational subcommands: progress bars, and a
//! stderr writer that keeps log lines from mangling them.

use std::{io, sync::Arc, time::Duration};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Shared UI state. Cheap to clone.
#[derive(Clone)]
pub struct Ui {
    multi_progress: Arc<MultiProgress>,
}

impl Ui {
    pub fn init() -> Ui {
        Ui {
            multi_progress: Arc::new(MultiProgress::new()),
        }
    }

    /// A UI that draws nothing, for tests and non-TTY runs.
    pub fn hidden() -> Ui {
        Ui {
            multi_progress: Arc::new(MultiProgress::with_draw_target(
                ProgressDrawTarget::hidden(),
            )),
        }
    }

    /// A bar over a known number of steps.
    pub fn bar(&self, msg: &str, len: u64) -> ProgressBar {
        let style = ProgressStyle::default_bar()
            .template("{msg:24} {pos:>4}/{len:4} {wide_bar:.cyan/blue} {eta_precise}")
            .expect("bad progress bar template");
        let pb = self
            .multi_progress
            .add(ProgressBar::new(len).with_style(style));
        pb.set_message(msg.to_owned());
        pb
    }

    /// A spinner for work of unknown length.
    pub fn spinner(&self, msg: &str) -> ProgressBar {
        let style = ProgressStyle::default_spinner()
            .template("{spinner} {msg}")
            .expect("bad spinner template");
        let sp = self
            .multi_progress
            .add(ProgressBar::new_spinner().with_style(style));
        sp.set_message(msg.to_owned());
        sp.enable_steady_tick(Duration::from_millis(250));
        sp
    }

    /// A writer for `tracing` output that suspends the progress bars
    /// around each write.
    pub fn stderr_writer(&self) -> UiStderrWriter {
        UiStderrWriter { ui: self.clone() }
    }
}

#[derive(Clone)]
pub struct UiStderrWriter {
    ui: Ui,
}

impl io::Write for UiStderrWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ui.multi_progress.suspend(|| io::stderr().write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ui.multi_progress.suspend(|| io::stderr().flush())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for UiStderrWriter {
    type Writer = UiStderrWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
