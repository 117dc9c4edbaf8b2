//! Bounded per-subscriber channels with drop-on-full delivery.

use std::collections::BTreeMap;

use tokio::sync::mpsc;

use super::SessionEvent;

pub type SubscriberId = u64;

/// A live view of one session. Dropping it or calling
/// [`Session::unsubscribe`](super::Session::unsubscribe) ends delivery.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<SessionEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event, or `None` once the subscription has been closed.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }
}

/// Outcome of one fan-out pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Delivery {
    pub delivered: usize,
    pub dropped: usize,
    pub closed: Vec<SubscriberId>,
}

/// Registered senders. Mutated under the session state lock; sends happen
/// on a snapshot outside it.
#[derive(Debug)]
pub(crate) struct SubscriberSet {
    next_id: SubscriberId,
    buffer: usize,
    senders: BTreeMap<SubscriberId, mpsc::Sender<SessionEvent>>,
}

impl SubscriberSet {
    pub fn new(buffer: usize) -> Self {
        Self {
            next_id: 1,
            buffer: buffer.max(1),
            senders: BTreeMap::new(),
        }
    }

    pub fn subscribe(&mut self) -> Subscription {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = mpsc::channel(self.buffer);
        self.senders.insert(id, tx);
        Subscription { id, rx }
    }

    /// Remove and close a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        self.senders.remove(&id).is_some()
    }

    pub fn remove_all(&mut self, ids: &[SubscriberId]) {
        for id in ids {
            self.senders.remove(id);
        }
    }

    pub fn close_all(&mut self) {
        self.senders.clear();
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn snapshot(&self) -> Vec<(SubscriberId, mpsc::Sender<SessionEvent>)> {
        self.senders
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect()
    }
}

/// Non-blocking send to every sender. A full buffer skips that subscriber
/// for this event only.
pub(crate) fn fan_out(
    targets: &[(SubscriberId, mpsc::Sender<SessionEvent>)],
    event: &SessionEvent,
) -> Delivery {
    let mut delivery = Delivery::default();
    for (id, tx) in targets {
        match tx.try_send(event.clone()) {
            Ok(()) => delivery.delivered += 1,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(subscriber = id, kind = event.kind(), "Subscriber buffer full, event dropped");
                delivery.dropped += 1;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => delivery.closed.push(*id),
        }
    }
    delivery
}
