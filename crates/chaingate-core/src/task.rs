//! Handles for background loops started by gateway components.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Stop signal receiver handed to every background loop.
pub type StopSignal = watch::Receiver<bool>;

/// Owns the stop signal and join handles of one component's background tasks.
///
/// `shutdown` flips the signal and waits for the loops to return, so an
/// iteration that is already running finishes instead of being aborted.
pub struct TaskHandle {
    name: &'static str,
    stop_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl TaskHandle {
    pub fn new(name: &'static str) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            name,
            stop_tx,
            joins: Vec::new(),
        }
    }

    /// A fresh receiver for a loop about to be spawned.
    pub fn signal(&self) -> StopSignal {
        self.stop_tx.subscribe()
    }

    pub fn push(&mut self, join: JoinHandle<()>) {
        self.joins.push(join);
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Signal every loop to stop and wait for them to exit.
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        for join in self.joins {
            if let Err(e) = join.await {
                tracing::warn!(component = self.name, error = %e, "background task ended abnormally");
            }
        }
        tracing::debug!(component = self.name, "background tasks stopped");
    }
}

/// Sleep for `period` unless the stop signal fires first.
///
/// Returns `false` when the loop should exit.
pub async fn sleep_or_stop(stop: &mut StopSignal, period: Duration) -> bool {
    if *stop.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(period) => {}
        changed = stop.changed() => {
            if changed.is_err() {
                return false;
            }
        }
    }
    !*stop.borrow()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_stops_loop() {
        let mut handle = TaskHandle::new("test");
        let mut stop = handle.signal();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        handle.push(tokio::spawn(async move {
            while sleep_or_stop(&mut stop, Duration::from_millis(5)).await {
                let _ = tx.send(());
            }
        }));
        rx.recv().await.unwrap();
        handle.shutdown().await;
        // Drain whatever was sent; the sender is dropped once the loop exits.
        while rx.recv().await.is_some() {}
    }

    #[tokio::test]
    async fn sleep_or_stop_returns_false_when_already_stopped() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        assert!(!sleep_or_stop(&mut rx, Duration::from_secs(60)).await);
    }
}
