//! Progress reporting.
//!
//! The engine only talks to [`ProgressSurface`] and [`ProgressObserver`];
//! rendering lives behind them. Both are shared across tasks, so every
//! implementation must be thread-safe.
use std::sync::Arc;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

/// Receives progress for a single file.
pub trait ProgressObserver: Send + Sync {
    /// Advances the file by `delta` bytes.
    fn inc(&self, delta: u64);
    /// Shows a short status line, e.g. a retry notice.
    fn message(&self, msg: String);
    /// Marks the file complete.
    fn finish(&self);
}

/// Shared surface on which one bar per file is created.
pub trait ProgressSurface: Send + Sync {
    fn add_bar(&self, total: u64, label: &str) -> Arc<dyn ProgressObserver>;
}

/// Terminal bars backed by `indicatif`.
pub struct ConsoleObserver {
    pub pb: ProgressBar,
}

impl ProgressObserver for ConsoleObserver {
    fn inc(&self, delta: u64) {
        self.pb.inc(delta);
    }

    fn message(&self, msg: String) {
        self.pb.set_message(msg);
    }

    fn finish(&self) {
        self.pb.finish_with_message("done");
    }
}

/// One `indicatif` bar per file on a shared [`MultiProgress`].
#[derive(Clone)]
pub struct ConsoleProgress {
    multi: MultiProgress,
    style: ProgressStyle,
}

impl ConsoleProgress {
    pub fn new() -> Self {
        let style = ProgressStyle::with_template(
            "{prefix:30!} {bar:40.cyan/blue} {bytes}/{total_bytes} ({eta}) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");
        Self {
            multi: MultiProgress::new(),
            style,
        }
    }
}

impl Default for ConsoleProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSurface for ConsoleProgress {
    fn add_bar(&self, total: u64, label: &str) -> Arc<dyn ProgressObserver> {
        let pb = self.multi.add(ProgressBar::new(total));
        pb.set_style(self.style.clone());
        pb.set_prefix(label.to_string());
        Arc::new(ConsoleObserver { pb })
    }
}

/// Renders nothing. Used for `--quiet` and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct HiddenProgress;

impl ProgressSurface for HiddenProgress {
    fn add_bar(&self, total: u64, _label: &str) -> Arc<dyn ProgressObserver> {
        let pb = ProgressBar::hidden();
        pb.set_length(total);
        Arc::new(ConsoleObserver { pb })
    }
}

/// Counts bytes without rendering, so tests can inspect what was reported.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct CountingObserver {
    bytes: AtomicU64,
    finished: AtomicBool,
}

#[cfg(test)]
impl CountingObserver {
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
impl ProgressObserver for CountingObserver {
    fn inc(&self, delta: u64) {
        self.bytes.fetch_add(delta, Ordering::SeqCst);
    }

    fn message(&self, _msg: String) {}

    fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }
}
