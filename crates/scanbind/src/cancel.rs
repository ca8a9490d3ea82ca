//! Cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared stop flag threaded into every unit of work of a job run.
///
/// Polled at page and item boundaries only; in-flight remote calls always
/// run to completion.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Outcome of work that may be stopped cooperatively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interruptible<T> {
    Finished(T),
    Stopped,
}

impl<T> Interruptible<T> {
    pub fn is_stopped(&self) -> bool {
        matches!(self, Interruptible::Stopped)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Interruptible<U> {
        match self {
            Interruptible::Finished(value) => Interruptible::Finished(f(value)),
            Interruptible::Stopped => Interruptible::Stopped,
        }
    }
}
