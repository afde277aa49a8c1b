//! Subscriber registrations for session events.
//!
//! Every subscription owns a bounded `mpsc` receiver. The controller keeps
//! the matching sender; dropping a [`Subscription`] is enough to detach, the
//! controller prunes the closed sender on its next delivery.

use std::fmt::{Display, Formatter};

use tokio::sync::mpsc;

use crate::models::output::{EventFilter, SessionEvent};
use crate::models::session::SessionHandle;

/// Identifier of one subscription, unique per engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl Display for SubscriptionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Controller-side half of a subscription.
#[derive(Debug)]
pub(crate) struct Subscriber {
    pub(crate) id: SubscriptionId,
    pub(crate) filter: EventFilter,
    pub(crate) tx: mpsc::Sender<SessionEvent>,
}

/// Caller-side half of a subscription.
///
/// Events arrive in emission order. After [`SessionEvent::Finished`] only
/// warnings may follow, then the stream ends.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    handle: SessionHandle,
    rx: mpsc::Receiver<SessionEvent>,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        handle: SessionHandle,
        rx: mpsc::Receiver<SessionEvent>,
    ) -> Self {
        Self { id, handle, rx }
    }

    /// Subscription identifier, for [`unsubscribe`](crate::orchestrator::SessionManager::unsubscribe).
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Session this subscription observes.
    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    /// Receive the next event; `None` once the session is done and all
    /// events were drained.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Receive an already-queued event without waiting.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }

    /// Stop receiving. Queued events are discarded.
    pub fn unsubscribe(mut self) {
        self.rx.close();
    }
}
