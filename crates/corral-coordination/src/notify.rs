//! Delivery of events to callbacks or channel subscriptions.

use std::sync::Arc;

use tokio::sync::mpsc;

/// Callback invoked with each event.
pub type Callback<E> = Arc<dyn Fn(E) + Send + Sync>;

/// Where a component sends its events.
pub(crate) enum Notifier<E> {
    /// Invoke a callback.
    Callback(Callback<E>),
    /// Send into a bounded channel, waiting for space.
    Channel(mpsc::Sender<E>),
}

impl<E> Clone for Notifier<E> {
    fn clone(&self) -> Self {
        match self {
            Notifier::Callback(callback) => Notifier::Callback(callback.clone()),
            Notifier::Channel(tx) => Notifier::Channel(tx.clone()),
        }
    }
}

impl<E: Send + 'static> Notifier<E> {
    /// Deliver one event. Returns false once a channel subscriber has gone away.
    pub(crate) async fn notify(&self, event: E) -> bool {
        match self {
            Notifier::Callback(callback) => {
                callback(event);
                true
            }
            Notifier::Channel(tx) => tx.send(event).await.is_ok(),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        match self {
            Notifier::Callback(_) => false,
            Notifier::Channel(tx) => tx.is_closed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[tokio::test]
    async fn callback_receives_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let notifier: Notifier<u32> = Notifier::Callback(Arc::new(move |event| sink.lock().push(event)));

        assert!(notifier.notify(1).await);
        assert!(notifier.clone().notify(2).await);
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn channel_reports_dropped_receiver() {
        let (tx, rx) = mpsc::channel(1);
        let notifier: Notifier<u32> = Notifier::Channel(tx);
        drop(rx);

        assert!(notifier.is_closed());
        assert!(!notifier.notify(1).await);
    }
}
