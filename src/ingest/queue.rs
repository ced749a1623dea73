//! The bounded queue in front of the coordinator.

use galleryd_common::{Error, Result};
use tokio::sync::{mpsc, oneshot};

use super::{IngestEvent, IngestOutcome};

pub(crate) struct Envelope {
    pub event: IngestEvent,
    pub reply: oneshot::Sender<IngestOutcome>,
}

/// Producer handle. Cloned into the watcher and the event receiver.
#[derive(Clone)]
pub struct IngestQueue {
    tx: mpsc::Sender<Envelope>,
}

/// Consumer side, owned by the coordinator task.
pub struct IngestReceiver {
    pub(crate) rx: mpsc::Receiver<Envelope>,
}

/// Resolves to the coordinator's outcome for one submitted event.
pub struct Ticket {
    rx: oneshot::Receiver<IngestOutcome>,
}

impl Ticket {
    pub async fn outcome(self) -> Result<IngestOutcome> {
        self.rx
            .await
            .map_err(|_| Error::internal("ingest coordinator stopped before replying"))
    }
}

pub fn channel(capacity: usize) -> (IngestQueue, IngestReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (IngestQueue { tx }, IngestReceiver { rx })
}

impl IngestQueue {
    fn envelope(event: IngestEvent) -> (Envelope, Ticket) {
        let (reply, rx) = oneshot::channel();
        (Envelope { event, reply }, Ticket { rx })
    }

    /// Enqueue, waiting for capacity.
    pub async fn submit(&self, event: IngestEvent) -> Result<Ticket> {
        let (envelope, ticket) = Self::envelope(event);
        self.tx
            .send(envelope)
            .await
            .map_err(|_| Error::internal("ingest coordinator stopped"))?;
        Ok(ticket)
    }

    /// Enqueue without waiting. A full queue is [`Error::QueueSaturated`].
    pub fn try_submit(&self, event: IngestEvent) -> Result<Ticket> {
        let (envelope, ticket) = Self::envelope(event);
        self.tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::QueueSaturated,
            mpsc::error::TrySendError::Closed(_) => Error::internal("ingest coordinator stopped"),
        })?;
        Ok(ticket)
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }
}
