//! Change feed forwarding.
//!
//! A forwarder owns one store cursor, classifies each change and pushes the
//! resulting event into its connection's outbound queue until cancelled.

use crate::connection::OutboundQueue;
use crate::metrics::Metrics;
use crate::registry::Slot;
use crate::tables;
use relay_protocol::names::event_name;
use relay_protocol::Envelope;
use relay_store::{Change, ChangesOptions, OrderBy, Query, Store, StoreError};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Kind of change observed on a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Edit,
    Remove,
}

impl ChangeKind {
    /// Classifies a change and returns the value its event carries: the new
    /// value for `Add` and `Edit`, the old value for `Remove`. A change with
    /// neither side is not a change.
    pub fn classify(change: Change) -> Option<(ChangeKind, Value)> {
        match (change.old, change.new) {
            (None, Some(new)) => Some((ChangeKind::Add, new)),
            (Some(_), Some(new)) => Some((ChangeKind::Edit, new)),
            (Some(old), None) => Some((ChangeKind::Remove, old)),
            (None, None) => None,
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            ChangeKind::Add => "add",
            ChangeKind::Edit => "edit",
            ChangeKind::Remove => "remove",
        }
    }
}

/// A subscribable topic: which table feeds which slot, and which change
/// kinds reach the client.
#[derive(Debug, Clone, Copy)]
pub struct Topic {
    pub slot: Slot,
    pub entity: &'static str,
    pub table: &'static str,
    pub kinds: &'static [ChangeKind],
}

pub const ROOMS: Topic = Topic {
    slot: Slot::Rooms,
    entity: "room",
    table: tables::ROOM,
    kinds: &[ChangeKind::Add],
};

pub const USERS: Topic = Topic {
    slot: Slot::Users,
    entity: "user",
    table: tables::USER,
    kinds: &[ChangeKind::Add, ChangeKind::Edit, ChangeKind::Remove],
};

pub const MESSAGES: Topic = Topic {
    slot: Slot::Messages,
    entity: "message",
    table: tables::MESSAGE,
    kinds: &[ChangeKind::Add],
};

impl Topic {
    pub fn forwards(&self, kind: ChangeKind) -> bool {
        self.kinds.contains(&kind)
    }

    /// Builds the outbound event for a change, if this topic forwards it.
    pub fn event_for(&self, change: Change) -> Option<Envelope> {
        let (kind, value) = ChangeKind::classify(change)?;
        if !self.forwards(kind) {
            return None;
        }
        Some(Envelope::new(event_name(self.entity, kind.verb()), value))
    }

    /// Query over the whole table.
    pub fn query(&self) -> Query {
        Query::table(self.table)
    }
}

/// Query for one room's messages, newest first.
pub fn room_messages(room_id: &str) -> Query {
    MESSAGES
        .query()
        .filter_eq("roomId", room_id)
        .order_by(OrderBy::desc("createdAt"))
}

/// Opens a cursor for `query` and spawns the task forwarding its changes.
///
/// The cursor is opened before this returns, so a store failure is reported
/// to the caller and no task is spawned. Current records are delivered first
/// as adds.
pub fn spawn_forwarder(
    topic: Topic,
    query: Query,
    store: &Store,
    outbound: OutboundQueue,
    metrics: Option<Arc<Metrics>>,
    token: CancellationToken,
) -> Result<JoinHandle<()>, StoreError> {
    let mut cursor = store.changes(query, ChangesOptions::include_initial())?;
    tracing::debug!("Forwarding {} changes via cursor {}", topic.slot, cursor.id());

    Ok(tokio::spawn(async move {
        loop {
            let change = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                change = cursor.next() => change,
            };
            let Some(change) = change else {
                tracing::debug!("Cursor {} ended", cursor.id());
                break;
            };
            let Some(event) = topic.event_for(change) else {
                continue;
            };

            let name = event.name().to_string();
            let delivered = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                delivered = outbound.send(event) => delivered,
            };
            if !delivered {
                break;
            }

            if let Some(ref metrics) = metrics {
                metrics.events_forwarded_total.with_label_values(&[name.as_str()]).inc();
            }
        }

        cursor.close();
        tracing::debug!("Stopped forwarding {} changes", topic.slot);
    }))
}
