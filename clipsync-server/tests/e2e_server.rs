use std::{sync::Arc, time::Duration};

use clipsync_client::{SubscriptionState, SyncClient, SyncOptions, WsService};
use clipsync_core::{
    ChangeEvent, ClipboardItem, Operation, Request, Response, WireMessage, decode_frame,
    encode_frame,
};
use clipsync_server::{AppState, serve};
use futures::{SinkExt, StreamExt};
use tokio::{net::TcpListener, sync::oneshot, time::timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const WAIT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn create_is_answered_and_broadcast_to_subscribers() {
    let (address, shutdown_tx) = start_server().await;

    let mut subscriber = connect(&address).await;
    assert_eq!(
        request(&mut subscriber, Request::Subscribe).await,
        Some(Response::Subscribed)
    );

    let mut writer = connect(&address).await;
    let reply = request(
        &mut writer,
        Request::Create {
            contents: vec!["hello".to_owned()],
            device_id: "dev-a".to_owned(),
        },
    )
    .await;
    assert_eq!(
        reply,
        Some(Response::Created {
            ids: vec!["1".to_owned()]
        })
    );

    let event = recv_event(&mut subscriber, WAIT).await.expect("create event");
    assert_eq!(
        event,
        ChangeEvent::new(
            Operation::Create,
            vec![ClipboardItem::new("1", "hello", "dev-a")]
        )
    );

    let reply = request(&mut writer, Request::FetchAll).await;
    assert_eq!(
        reply,
        Some(Response::Items {
            items: vec![ClipboardItem::new("1", "hello", "dev-a")]
        })
    );

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn update_of_unknown_id_reports_failure_without_event() {
    let (address, shutdown_tx) = start_server().await;

    let mut subscriber = connect(&address).await;
    request(&mut subscriber, Request::Subscribe).await;

    let mut writer = connect(&address).await;
    let reply = request(
        &mut writer,
        Request::Update {
            id: "404".to_owned(),
            new_content: "nothing".to_owned(),
            device_id: "dev-a".to_owned(),
        },
    )
    .await;
    assert_eq!(reply, Some(Response::Updated { success: false }));
    assert!(
        recv_event(&mut subscriber, Duration::from_millis(300))
            .await
            .is_none()
    );

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn delete_broadcasts_removed_items_tagged_with_deleter() {
    let (address, shutdown_tx) = start_server().await;

    let mut writer = connect(&address).await;
    request(
        &mut writer,
        Request::Create {
            contents: vec!["a".to_owned(), "b".to_owned()],
            device_id: "dev-a".to_owned(),
        },
    )
    .await;

    let mut subscriber = connect(&address).await;
    request(&mut subscriber, Request::Subscribe).await;

    let reply = request(
        &mut writer,
        Request::Delete {
            ids: vec!["2".to_owned()],
            device_id: "dev-b".to_owned(),
        },
    )
    .await;
    assert_eq!(reply, Some(Response::Deleted { success: true }));

    let event = recv_event(&mut subscriber, WAIT).await.expect("delete event");
    assert_eq!(event.operation, Operation::Delete);
    assert_eq!(event.items, [ClipboardItem::new("2", "b", "dev-b")]);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn malformed_frame_is_ignored() {
    let (address, shutdown_tx) = start_server().await;

    let mut socket = connect(&address).await;
    socket
        .send(Message::Binary(vec![0xFF, 0x00, 0xAB, 0xCD].into()))
        .await
        .expect("send malformed frame");

    assert_eq!(
        request(&mut socket, Request::FetchAll).await,
        Some(Response::Items { items: Vec::new() })
    );

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn empty_create_is_rejected() {
    let (address, shutdown_tx) = start_server().await;

    let mut socket = connect(&address).await;
    let reply = request(
        &mut socket,
        Request::Create {
            contents: Vec::new(),
            device_id: "dev-a".to_owned(),
        },
    )
    .await;
    assert!(matches!(reply, Some(Response::Error { .. })));

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn two_clients_converge_and_only_remote_changes_notify() {
    let (address, shutdown_tx) = start_server().await;

    let mut laptop = start_client(&address, "laptop");
    let mut phone = start_client(&address, "phone");
    let mut laptop_notes = laptop.take_notifications().expect("notifications");
    let mut phone_notes = phone.take_notifications().expect("notifications");
    wait_active(&laptop).await;
    wait_active(&phone).await;

    let ids = laptop.create_item("copied on laptop").await.expect("create");
    assert_eq!(ids, ["1"]);

    let on_phone = wait_items(&phone, |items| items.len() == 1).await;
    assert_eq!(on_phone, [ClipboardItem::new("1", "copied on laptop", "laptop")]);
    wait_items(&laptop, |items| items.len() == 1).await;

    let change = timeout(WAIT, phone_notes.recv())
        .await
        .expect("phone notified in time")
        .expect("channel open");
    assert_eq!(change.title, "New clipboard added");
    assert_eq!(change.message, "copied on laptop");

    phone.update_item("1", "edited on phone").await.expect("update");
    let on_laptop = wait_items(&laptop, |items| {
        items.first().is_some_and(|item| item.content == "edited on phone")
    })
    .await;
    assert_eq!(on_laptop[0].origin_device_id, "phone");

    // The laptop's own create never produced a notification, so the first
    // one it sees is the phone's update.
    let change = timeout(WAIT, laptop_notes.recv())
        .await
        .expect("laptop notified in time")
        .expect("channel open");
    assert_eq!(change.title, "New clipboard updated");

    laptop.delete_item("1").await.expect("delete");
    assert!(laptop.items().is_empty());
    wait_items(&phone, |items| items.is_empty()).await;

    laptop.shutdown().await.expect("laptop shutdown");
    phone.shutdown().await.expect("phone shutdown");
    let _ = shutdown_tx.send(());
}

async fn start_server() -> (String, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral server socket");
    let address = listener.local_addr().expect("server local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(serve(listener, AppState::new(), async move {
        let _ = shutdown_rx.await;
    }));

    (format!("ws://{}/ws", address), shutdown_tx)
}

fn start_client(address: &str, device_id: &str) -> SyncClient {
    let options = SyncOptions {
        reconnect: clipsync_client::ReconnectPolicy::immediate(),
        ..SyncOptions::default()
    };
    SyncClient::initialize(Arc::new(WsService::new(address)), device_id, options)
}

async fn wait_active(client: &SyncClient) {
    let mut state = client.watch_state();
    timeout(WAIT, state.wait_for(|state| *state == SubscriptionState::Active))
        .await
        .expect("subscription active in time")
        .expect("supervisor alive");
}

async fn wait_items<F>(client: &SyncClient, predicate: F) -> Vec<ClipboardItem>
where
    F: Fn(&[ClipboardItem]) -> bool,
{
    let mut items = client.watch_items();
    let snapshot = timeout(WAIT, items.wait_for(|items| predicate(items)))
        .await
        .expect("items converged in time")
        .expect("supervisor alive")
        .clone();
    snapshot
}

async fn connect(address: &str) -> WsStream {
    let (ws_stream, _) = connect_async(address).await.expect("connect websocket");
    ws_stream
}

async fn request(socket: &mut WsStream, request: Request) -> Option<Response> {
    let frame = encode_frame(&WireMessage::Request(request)).expect("encode request");
    socket
        .send(Message::Binary(frame.into()))
        .await
        .expect("send request");
    loop {
        match recv_next_wire_message(socket, WAIT).await? {
            WireMessage::Response(response) => return Some(response),
            _ => continue,
        }
    }
}

async fn recv_event(socket: &mut WsStream, wait: Duration) -> Option<ChangeEvent> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.checked_duration_since(tokio::time::Instant::now())?;
        match recv_next_wire_message(socket, remaining).await? {
            WireMessage::Event(event) => return Some(event),
            _ => continue,
        }
    }
}

async fn recv_next_wire_message(socket: &mut WsStream, wait: Duration) -> Option<WireMessage> {
    loop {
        let next = timeout(wait, socket.next()).await.ok()?;
        match next?.ok()? {
            Message::Binary(bytes) => return decode_frame(&bytes).ok(),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}
