use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Self-renewing presence keepalive task.
///
/// Fires the keepalive once per interval until canceled. A failed keepalive
/// is logged and the schedule continues: the remote streaming session times
/// out at roughly twice the interval, so one missed beat is survivable.
pub(crate) struct Heartbeat {
    cancelled: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Heartbeat {
    pub fn start<F, Fut>(interval: Duration, keepalive: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), crate::error::Error>> + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        let flag = Arc::clone(&cancelled);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(interval) => {
                        // Re-checked after the timer fires, not only at
                        // schedule time: a cancel racing an in-flight timer
                        // must not produce a keepalive or a reschedule.
                        if flag.load(Ordering::SeqCst) {
                            break;
                        }
                        if let Err(e) = keepalive().await {
                            warn!("keepalive failed: {e}");
                        }
                    }
                }
            }
            debug!("heartbeat stopped");
        });

        Self {
            cancelled,
            shutdown_tx,
        }
    }

    /// Stop the schedule. Idempotent, and safe to call concurrently with a
    /// firing timer.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.cancel();
    }
}
