use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// One progress notification. An operation emits zero or more of these and
/// then returns exactly one terminal result.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub position: Option<usize>,
    pub total: Option<usize>,
}

impl ProgressEvent {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            position: None,
            total: None,
        }
    }

    pub fn step(message: impl Into<String>, position: usize, total: usize) -> Self {
        Self {
            message: message.into(),
            position: Some(position),
            total: Some(total),
        }
    }
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Sink that discards all progress events.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn event(&self, _event: ProgressEvent) {}
}

/// Cooperative cancellation token. Checked at per-form and per-record
/// boundaries; once observed, the operation unwinds cleanly and returns
/// whatever it has accumulated.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
