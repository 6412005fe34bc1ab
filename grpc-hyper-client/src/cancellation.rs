//! External cancellation signal for calls.

use tokio::sync::watch;

/// The owning side of a cancellation signal.
///
/// ```
/// use grpc_hyper_client::CancellationSource;
///
/// let source = CancellationSource::new();
/// let signal = source.signal();
/// assert!(!signal.is_cancelled());
/// source.cancel();
/// assert!(signal.is_cancelled());
/// ```
#[derive(Debug, Clone)]
pub struct CancellationSource {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl CancellationSource {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        CancellationSource {
            tx: std::sync::Arc::new(tx),
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// A signal that observes this source.
    pub fn signal(&self) -> CancellationSignal {
        CancellationSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        CancellationSource::new()
    }
}

/// The observing side of a cancellation signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    rx: watch::Receiver<bool>,
}

impl CancellationSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation is requested. If the source is dropped
    /// without cancelling, the future never resolves.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
