//! Debounced edge-triggered signalling between workers and the flush
//! caller.
//!
//! Many workers call [`Notifier::notify`]; one consumer awaits
//! [`NotifyReceiver::recv`]. Signals within the debounce window coalesce
//! into a single delivery, and a signal raised while one is already
//! pending is dropped. The consumer re-checks the shared state on every
//! wake, so dropped signals are harmless.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::sleep;

#[derive(Clone)]
pub(crate) struct Notifier {
    tx: mpsc::Sender<()>,
}

impl Notifier {
    /// Raises the signal. Never blocks; a pending signal absorbs the call.
    pub fn notify(&self) {
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            // Receiver stopped; nothing is waiting anymore.
            Err(TrySendError::Closed(())) => {}
        }
    }
}

pub(crate) struct NotifyReceiver {
    rx: mpsc::Receiver<()>,
    debounce: Duration,
}

impl NotifyReceiver {
    /// Waits for the next coalesced signal. Returns `None` once every
    /// notifier handle has been dropped.
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await?;
        sleep(self.debounce).await;
        while self.rx.try_recv().is_ok() {}
        Some(())
    }
}

/// Single-slot signal channel with the given debounce window.
pub(crate) fn notify_channel(debounce: Duration) -> (Notifier, NotifyReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (Notifier { tx }, NotifyReceiver { rx, debounce })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test(start_paused = true)]
    async fn test_notifications_coalesce() {
        let (notifier, mut receiver) = notify_channel(Duration::from_millis(50));
        for _ in 0..5 {
            notifier.notify();
        }

        assert!(receiver.recv().await.is_some());

        // All five signals collapsed into the one delivery above.
        let next = timeout(Duration::from_millis(200), receiver.recv()).await;
        assert!(next.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_after_wake_is_delivered() {
        let (notifier, mut receiver) = notify_channel(Duration::from_millis(50));
        notifier.notify();
        assert!(receiver.recv().await.is_some());

        notifier.notify();
        assert!(receiver.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_ends_when_notifiers_drop() {
        let (notifier, mut receiver) = notify_channel(Duration::from_millis(50));
        drop(notifier);
        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_notify_after_receiver_drop_is_quiet() {
        let (notifier, receiver) = notify_channel(Duration::from_millis(50));
        drop(receiver);
        notifier.notify();
    }
}
