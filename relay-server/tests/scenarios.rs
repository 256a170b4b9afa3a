//! End-to-end scenarios over real WebSocket connections.

use relay_client::{Client, ClientError};
use relay_server::handlers;
use relay_server::tables;
use relay_server::{CommandRouter, Server, ServerConfig};
use relay_store::{Query, Store};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

const QUIET: Duration = Duration::from_millis(200);

struct TestServer {
    server: Arc<Server>,
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(ServerConfig::default()).await
    }

    async fn start_with(config: ServerConfig) -> Self {
        let store = Arc::new(Store::in_memory("test", tables::ALL));
        let mut router = CommandRouter::new();
        handlers::register_all(&mut router);
        let server = Arc::new(Server::new(config, store, Arc::new(router)));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = {
            let server = server.clone();
            tokio::spawn(async move {
                server.serve(listener).await.unwrap();
            })
        };

        Self {
            server,
            addr,
            handle,
        }
    }

    async fn client(&self) -> Client {
        Client::connect_to(format!("ws://{}", self.addr))
            .await
            .unwrap()
    }

    fn store(&self) -> &Arc<Store> {
        self.server.store()
    }

    /// Polls until `check` holds or a second passes.
    async fn eventually(&self, check: impl Fn(&Store) -> bool) {
        for _ in 0..100 {
            if check(self.store()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn stop(self) {
        self.server.shutdown();
        self.handle.await.unwrap();
    }
}

#[tokio::test]
async fn room_subscribe_delivers_existing_then_new_rooms() {
    let server = TestServer::start().await;
    server
        .store()
        .insert(tables::ROOM, json!({"id": "r1", "name": "general"}))
        .unwrap();
    server
        .store()
        .insert(tables::ROOM, json!({"id": "r2", "name": "random"}))
        .unwrap();

    let watcher = server.client().await;
    watcher.subscribe_rooms().await.unwrap();

    let first = watcher.recv_named("room add").await.unwrap();
    let second = watcher.recv_named("room add").await.unwrap();
    assert_eq!(first.data()["name"], "general");
    assert_eq!(second.data()["name"], "random");

    let other = server.client().await;
    other.add_room("rust").await.unwrap();

    let third = watcher.recv_named("room add").await.unwrap();
    assert_eq!(third.data()["name"], "rust");
    assert!(third.data()["id"].is_string());

    assert!(watcher.recv_within(QUIET).await.unwrap().is_none());
    server.stop().await;
}

#[tokio::test]
async fn message_subscribe_switches_rooms() {
    let server = TestServer::start().await;
    server
        .store()
        .insert(
            tables::MESSAGE,
            json!({
                "id": "m0",
                "roomId": "R2",
                "body": "already here",
                "author": "ada",
                "createdAt": "2024-01-01T00:00:00.000Z"
            }),
        )
        .unwrap();
    let client = server.client().await;

    client.subscribe_messages("R1").await.unwrap();
    client.subscribe_messages("R2").await.unwrap();
    // R2's existing message arrives once its feed has replaced R1's
    let existing = client.recv_named("message add").await.unwrap();
    assert_eq!(existing.data()["id"], "m0");

    let writer = server.client().await;
    writer.add_message("R1", "to R1").await.unwrap();
    writer.add_message("R2", "to R2").await.unwrap();

    let event = client.recv_named("message add").await.unwrap();
    assert_eq!(event.data()["roomId"], "R2");
    assert_eq!(event.data()["body"], "to R2");

    assert!(client.recv_within(QUIET).await.unwrap().is_none());
    server.stop().await;
}

#[tokio::test]
async fn unknown_command_is_ignored() {
    let server = TestServer::start().await;
    let client = server.client().await;

    client.send("room destroy", json!({"id": "r1"})).await.unwrap();
    assert!(client.recv_within(QUIET).await.unwrap().is_none());

    client.subscribe_rooms().await.unwrap();
    client.add_room("still alive").await.unwrap();
    let event = client.recv_named("room add").await.unwrap();
    assert_eq!(event.data()["name"], "still alive");

    server.stop().await;
}

#[tokio::test]
async fn user_lifecycle_is_visible_to_subscribers() {
    let server = TestServer::start().await;
    let watcher = server.client().await;
    watcher.subscribe_users().await.unwrap();

    // Our own record arrives as part of the initial set
    let own = watcher.recv_named("user add").await.unwrap();
    assert_eq!(own.data()["name"], "anonymous");

    let other = server.client().await;
    let added = watcher.recv_named("user add").await.unwrap();
    let other_id = added.data()["id"].as_str().unwrap().to_string();

    other.edit_user("ada").await.unwrap();
    let edited = watcher.recv_named("user edit").await.unwrap();
    assert_eq!(edited.data()["id"], other_id.as_str());
    assert_eq!(edited.data()["name"], "ada");

    other.close().await.unwrap();
    let removed = watcher.recv_named("user remove").await.unwrap();
    assert_eq!(removed.data()["id"], other_id.as_str());

    server.stop().await;
}

#[tokio::test]
async fn message_add_trims_and_stamps_author() {
    let server = TestServer::start().await;
    let client = server.client().await;
    client.edit_user("ada").await.unwrap();
    client.subscribe_messages("R1").await.unwrap();

    client.add_message("R1", "   ").await.unwrap();
    client
        .send(
            "message add",
            json!({"roomId": "R1", "body": " hi ", "author": "mallory"}),
        )
        .await
        .unwrap();

    let event = client.recv_named("message add").await.unwrap();
    assert_eq!(event.data()["body"], "hi");
    assert_eq!(event.data()["author"], "ada");
    assert!(event.data()["createdAt"].is_string());

    assert!(client.recv_within(QUIET).await.unwrap().is_none());
    let stored = server
        .store()
        .list(&Query::table(tables::MESSAGE))
        .unwrap();
    assert_eq!(stored.len(), 1);

    server.stop().await;
}

#[tokio::test]
async fn bad_payload_reports_error_and_keeps_connection() {
    let server = TestServer::start().await;
    let client = server.client().await;

    client.send("room add", json!("not an object")).await.unwrap();
    let event = client.recv_named("error").await.unwrap();
    assert!(event.error_message().unwrap().contains("room add"));

    client.subscribe_rooms().await.unwrap();
    client.add_room("after error").await.unwrap();
    let event = client.recv_named("room add").await.unwrap();
    assert_eq!(event.data()["name"], "after error");

    server.stop().await;
}

#[tokio::test]
async fn malformed_message_closes_connection_and_cleans_up() {
    let server = TestServer::start().await;
    let client = server.client().await;
    client.subscribe_rooms().await.unwrap();
    server
        .eventually(|store| {
            store.count(tables::USER).unwrap() == 1 && store.watcher_count(tables::ROOM) == 1
        })
        .await;

    client.connection().send_raw("{not json").await.unwrap();

    server
        .eventually(|store| {
            store.count(tables::USER).unwrap() == 0 && store.watcher_count(tables::ROOM) == 0
        })
        .await;
    assert!(matches!(
        client.recv_timeout(Duration::from_secs(2)).await,
        Err(ClientError::ConnectionClosed)
    ));

    server.stop().await;
}

#[tokio::test]
async fn disconnect_removes_user_and_cursors() {
    let server = TestServer::start().await;
    let client = server.client().await;
    client.subscribe_rooms().await.unwrap();
    client.subscribe_users().await.unwrap();
    client.subscribe_messages("R1").await.unwrap();
    server
        .eventually(|store| {
            store.watcher_count(tables::ROOM) == 1
                && store.watcher_count(tables::USER) == 1
                && store.watcher_count(tables::MESSAGE) == 1
        })
        .await;

    client.close().await.unwrap();

    server
        .eventually(|store| {
            store.count(tables::USER).unwrap() == 0
                && store.watcher_count(tables::ROOM) == 0
                && store.watcher_count(tables::USER) == 0
                && store.watcher_count(tables::MESSAGE) == 0
        })
        .await;
    server.stop().await;
}

#[tokio::test]
async fn shutdown_tears_down_live_connections() {
    let server = TestServer::start().await;
    let client = server.client().await;
    client.subscribe_rooms().await.unwrap();
    server
        .eventually(|store| store.watcher_count(tables::ROOM) == 1)
        .await;

    let store = server.store().clone();
    server.stop().await;

    assert_eq!(store.count(tables::USER).unwrap(), 0);
    assert_eq!(store.watcher_count(tables::ROOM), 0);
}

#[tokio::test]
async fn connection_limit_refuses_extra_clients() {
    let server = TestServer::start_with(ServerConfig::default().with_max_connections(1)).await;
    let _first = server.client().await;
    server
        .eventually(|store| store.count(tables::USER).unwrap() == 1)
        .await;

    let second = Client::connect_to(format!("ws://{}", server.addr)).await;
    assert!(second.is_err());
    assert_eq!(
        server
            .server
            .stats()
            .rejected
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );

    server.stop().await;
}
