use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Cancellation handles of running queries, keyed by query id.
#[derive(Default)]
pub(crate) struct CancelRegistry {
    senders: Mutex<HashMap<Uuid, oneshot::Sender<()>>>,
}

impl CancelRegistry {
    pub(crate) fn register(&self, id: Uuid) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.senders.lock().insert(id, tx);
        rx
    }

    pub(crate) fn remove(&self, id: &Uuid) {
        self.senders.lock().remove(id);
    }

    /// Signals the query; false when it is unknown or already finished.
    pub(crate) fn cancel(&self, id: &Uuid) -> bool {
        match self.senders.lock().remove(id) {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}
