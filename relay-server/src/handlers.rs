//! Command handlers.

use crate::connection::Connection;
use crate::error::ServerError;
use crate::feed;
use crate::registry::Slot;
use crate::router::CommandRouter;
use crate::tables;
use chrono::Utc;
use futures_util::future::BoxFuture;
use relay_protocol::names;
use relay_protocol::{ChatMessage, MessageDraft, Room, User};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

/// Registers every relay command.
pub fn register_all(router: &mut CommandRouter) {
    router.register(names::ROOM_ADD, room_add);
    router.register(names::ROOM_SUBSCRIBE, room_subscribe);
    router.register(names::ROOM_UNSUBSCRIBE, room_unsubscribe);
    router.register(names::USER_EDIT, user_edit);
    router.register(names::USER_SUBSCRIBE, user_subscribe);
    router.register(names::USER_UNSUBSCRIBE, user_unsubscribe);
    router.register(names::MESSAGE_ADD, message_add);
    router.register(names::MESSAGE_SUBSCRIBE, message_subscribe);
    router.register(names::MESSAGE_UNSUBSCRIBE, message_unsubscribe);
}

fn decode_payload<T: DeserializeOwned>(command: &str, data: Value) -> Result<T, ServerError> {
    serde_json::from_value(data).map_err(|e| ServerError::InvalidPayload {
        command: command.to_string(),
        reason: e.to_string(),
    })
}

fn room_add(conn: &Connection, data: Value) -> BoxFuture<'_, ()> {
    Box::pin(async move {
        let room: Room = match decode_payload(names::ROOM_ADD, data) {
            Ok(room) => room,
            Err(e) => return conn.report_error(e).await,
        };

        let record = Room::named(room.name);
        conn.spawn_write(names::ROOM_ADD, move |store| {
            store.insert_as(tables::ROOM, &record).map(|_| ())
        });
    })
}

fn room_subscribe(conn: &Connection, _data: Value) -> BoxFuture<'_, ()> {
    Box::pin(conn.subscribe(feed::ROOMS, feed::ROOMS.query()))
}

fn room_unsubscribe(conn: &Connection, _data: Value) -> BoxFuture<'_, ()> {
    Box::pin(conn.unsubscribe(Slot::Rooms))
}

fn user_edit(conn: &Connection, data: Value) -> BoxFuture<'_, ()> {
    Box::pin(async move {
        let user: User = match decode_payload(names::USER_EDIT, data) {
            Ok(user) => user,
            Err(e) => return conn.report_error(e).await,
        };

        conn.set_name(user.name.clone());
        let id = conn.id().to_string();
        conn.spawn_write(names::USER_EDIT, move |store| {
            store
                .update(tables::USER, &id, json!({ "name": user.name }))
                .map(|_| ())
        });
    })
}

fn user_subscribe(conn: &Connection, _data: Value) -> BoxFuture<'_, ()> {
    Box::pin(conn.subscribe(feed::USERS, feed::USERS.query()))
}

fn user_unsubscribe(conn: &Connection, _data: Value) -> BoxFuture<'_, ()> {
    Box::pin(conn.unsubscribe(Slot::Users))
}

fn message_add(conn: &Connection, data: Value) -> BoxFuture<'_, ()> {
    Box::pin(async move {
        let draft: MessageDraft = match decode_payload(names::MESSAGE_ADD, data) {
            Ok(draft) => draft,
            Err(e) => return conn.report_error(e).await,
        };

        let Some(message) = ChatMessage::from_draft(draft, conn.name(), Utc::now()) else {
            tracing::debug!("Discarding blank message from {}", conn.id());
            return;
        };

        conn.spawn_write(names::MESSAGE_ADD, move |store| {
            store.insert_as(tables::MESSAGE, &message).map(|_| ())
        });
    })
}

fn message_subscribe(conn: &Connection, data: Value) -> BoxFuture<'_, ()> {
    Box::pin(async move {
        let Some(room_id) = data.get("roomId").and_then(Value::as_str) else {
            tracing::debug!("Ignoring message subscribe without a roomId");
            return;
        };

        conn.subscribe(feed::MESSAGES, feed::room_messages(room_id))
            .await;
    })
}

fn message_unsubscribe(conn: &Connection, _data: Value) -> BoxFuture<'_, ()> {
    Box::pin(conn.unsubscribe(Slot::Messages))
}
