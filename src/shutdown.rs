//! Shared stop signal for background tasks
//!
//! Background loops hold a `watch::Receiver<bool>` from
//! [`Shutdown::subscribe`] and leave their `tokio::select!` once it flips to
//! `true`. [`Shutdown::join_all`] then waits for the registered handles.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

pub(crate) struct Shutdown {
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Shutdown {
    pub(crate) fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            stop_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Returns `true` the first time only
    pub(crate) fn signal(&self) -> bool {
        !self.stop_tx.send_replace(true)
    }

    pub(crate) fn add_task(&self, handle: JoinHandle<()>) {
        if self.is_stopped() {
            handle.abort();
            return;
        }
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Wait for every registered task, aborting stragglers after `grace`
    pub(crate) async fn join_all(&self, grace: Duration) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for mut handle in handles {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                debug!("Aborting background task that ignored shutdown");
                handle.abort();
            }
        }
    }
}

/// Wait until `rx` reports a stop
pub(crate) async fn stopped(rx: &mut watch::Receiver<bool>) {
    // A dropped sender means the owner is gone, which is a stop as well.
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Sleep for `delay` unless `rx` reports a stop first
///
/// Returns `false` when the wait ended because of the stop.
pub(crate) async fn pause(rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = stopped(rx) => false,
    }
}
