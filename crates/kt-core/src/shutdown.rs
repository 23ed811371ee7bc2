use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

// ---------------------------------------------------------------------------
// ShutdownSignal: fire-once cancellation
// ---------------------------------------------------------------------------

/// One-shot cancellation signal shared by clones.
///
/// Used for process shutdown, for the termination of a terminal session and
/// for the end of a leadership term. `trigger()` fires the signal at most
/// once no matter how many callers race on it; `triggered()` resolves for
/// every waiter, including ones that start waiting after the fact.
///
/// ```ignore
/// let signal = ShutdownSignal::new();
///
/// tokio::select! {
///     biased;
///     _ = signal.triggered() => { /* stop */ }
///     item = work.recv() => { /* handle */ }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    fired: Arc<AtomicBool>,
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            fired: Arc::new(AtomicBool::new(false)),
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Check if the signal has fired (non-blocking).
    pub fn is_triggered(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Fire the signal. Returns `true` only for the call that actually fired it.
    pub fn trigger(&self) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.tx.send_replace(true);
            true
        } else {
            false
        }
    }

    /// Resolve once the signal has fired.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any clone of `self`, so this cannot
        // observe a closed channel while we hold `&self`.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
