//! Stage state machine shared by the benchmark engine and the wire
//! protocol: `not_started -> prepare -> benchmark -> cleanup -> done`.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Prepare,
    Benchmark,
    Cleanup,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Prepare, Stage::Benchmark, Stage::Cleanup];
}

/// A one-shot latch: `wait()` resolves exactly once, the moment `close()` is
/// called. Closing twice is a bug — callers guard against it with
/// `start_requested` (see `StageSignal`) rather than relying on the latch
/// itself to swallow repeats.
#[derive(Clone)]
pub struct Latch {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl Latch {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    /// Close the latch, releasing every waiter. Panics if called twice —
    /// callers must guard with their own idempotency flag.
    pub fn close(&self) {
        assert!(!*self.rx.borrow(), "latch closed twice");
        let _ = self.tx.send(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        // The sender is held by the same StageSignal as this receiver, so
        // it cannot be dropped while a waiter still holds a clone.
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-stage signalling pair plus the idempotency flag that makes
/// `start_stage` safe to retry: a second `start_stage(S, T)` for the same
/// stage is a no-op that returns current status rather than re-scheduling
/// or re-closing the latch.
#[derive(Clone)]
pub struct StageSignal {
    pub start: Latch,
    pub done: Latch,
    start_requested: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl StageSignal {
    pub fn new() -> Self {
        Self {
            start: Latch::new(),
            done: Latch::new(),
            start_requested: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// Returns `true` the first time it's called (the caller should go on
    /// to schedule the latch close); `false` on every subsequent call.
    pub fn mark_start_requested(&self) -> bool {
        !self
            .start_requested
            .swap(true, std::sync::atomic::Ordering::SeqCst)
    }

    pub fn is_start_requested(&self) -> bool {
        self.start_requested.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn started(&self) -> bool {
        self.start.is_closed()
    }

    pub fn finished(&self) -> bool {
        self.done.is_closed()
    }
}

impl Default for StageSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn latch_wait_resolves_after_close() {
        let latch = Latch::new();
        let l2 = latch.clone();
        let handle = tokio::spawn(async move {
            l2.wait().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        latch.close();
        handle.await.unwrap();
    }

    #[tokio::test]
    #[should_panic(expected = "latch closed twice")]
    async fn latch_close_twice_panics() {
        let latch = Latch::new();
        latch.close();
        latch.close();
    }

    #[test]
    fn start_requested_idempotent() {
        let sig = StageSignal::new();
        assert!(sig.mark_start_requested());
        assert!(!sig.mark_start_requested());
        assert!(!sig.mark_start_requested());
    }
}
