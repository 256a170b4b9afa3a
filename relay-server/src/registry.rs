//! Per-connection subscription slots.

use std::collections::HashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A subscription slot. A connection holds at most one live subscription
/// per slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Rooms,
    Users,
    Messages,
}

impl Slot {
    pub const ALL: [Slot; 3] = [Slot::Rooms, Slot::Users, Slot::Messages];

    pub fn as_str(&self) -> &'static str {
        match self {
            Slot::Rooms => "rooms",
            Slot::Users => "users",
            Slot::Messages => "messages",
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Subscription {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Subscription {
    async fn cancel(self, slot: Slot) {
        self.token.cancel();
        join(slot, self.task).await;
    }
}

async fn join(slot: Slot, task: JoinHandle<()>) {
    if let Err(e) = task.await {
        if e.is_panic() {
            tracing::error!("Subscription task for {} panicked", slot);
        }
    }
}

/// Slot table for one connection.
///
/// Cancelling a subscription cancels its token and then waits for its task
/// to finish, so the task's resources are released when `start`, `stop` or
/// `close` returns.
#[derive(Default)]
pub struct SubscriptionRegistry {
    slots: HashMap<Slot, Subscription>,
    closed: bool,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the subscription in `slot` with the task built by `factory`.
    ///
    /// Any previous occupant is fully cancelled before `factory` runs. If
    /// `factory` fails the slot stays empty. After `close`, the new task is
    /// cancelled immediately instead of being installed.
    pub async fn start<F, E>(&mut self, slot: Slot, factory: F) -> Result<(), E>
    where
        F: FnOnce(CancellationToken) -> Result<JoinHandle<()>, E>,
    {
        self.stop(slot).await;

        let token = CancellationToken::new();
        let task = factory(token.clone())?;
        let subscription = Subscription { token, task };

        if self.closed {
            tracing::debug!("Registry closed, cancelling new {} subscription", slot);
            subscription.cancel(slot).await;
            return Ok(());
        }

        self.slots.insert(slot, subscription);
        Ok(())
    }

    /// Cancels the subscription in `slot`. Returns false if it was empty.
    pub async fn stop(&mut self, slot: Slot) -> bool {
        match self.slots.remove(&slot) {
            Some(subscription) => {
                subscription.cancel(slot).await;
                true
            }
            None => false,
        }
    }

    /// Cancels every subscription and refuses new ones. Returns the slots
    /// that were active.
    pub async fn close(&mut self) -> Vec<Slot> {
        self.closed = true;

        let drained: Vec<(Slot, Subscription)> = self.slots.drain().collect();
        for (_, subscription) in &drained {
            subscription.token.cancel();
        }

        let mut slots = Vec::with_capacity(drained.len());
        for (slot, subscription) in drained {
            join(slot, subscription.task).await;
            slots.push(slot);
        }
        slots
    }

    pub fn is_active(&self, slot: Slot) -> bool {
        self.slots.contains_key(&slot)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
