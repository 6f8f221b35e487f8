use std::{collections::HashSet, sync::Arc, time::Duration, time::Instant};

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade, ws::Message},
    response::IntoResponse,
    routing::get,
};
use clipsync_core::{
    ChangeEvent, ClipboardItem, DeviceId, ItemId, MAX_FRAME_BYTES, Operation, Request, Response,
    WireMessage, decode_frame, encode_frame,
};
use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpListener,
    sync::{RwLock, broadcast, mpsc},
};
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct ClipboardStore {
    /// Newest first.
    items: Vec<ClipboardItem>,
    next_id: u64,
}

impl ClipboardStore {
    fn create(&mut self, contents: Vec<String>, device_id: &DeviceId) -> Vec<ClipboardItem> {
        let created = contents
            .into_iter()
            .map(|content| {
                self.next_id += 1;
                ClipboardItem::new(self.next_id.to_string(), content, device_id.clone())
            })
            .collect::<Vec<_>>();
        self.items.splice(0..0, created.iter().cloned());
        created
    }

    fn update(
        &mut self,
        id: &str,
        new_content: String,
        device_id: &DeviceId,
    ) -> Option<ClipboardItem> {
        let item = self.items.iter_mut().find(|item| item.id == id)?;
        item.content = new_content;
        item.origin_device_id = device_id.clone();
        Some(item.clone())
    }

    /// Removes every present id. The flag is true only if all distinct ids existed.
    fn delete(&mut self, ids: &[ItemId], device_id: &DeviceId) -> (Vec<ClipboardItem>, bool) {
        let wanted = ids.iter().map(String::as_str).collect::<HashSet<_>>();
        let mut removed = Vec::new();
        self.items.retain(|item| {
            if wanted.contains(item.id.as_str()) {
                removed.push(ClipboardItem::new(
                    item.id.clone(),
                    item.content.clone(),
                    device_id.clone(),
                ));
                false
            } else {
                true
            }
        });
        let all_found = removed.len() == wanted.len();
        (removed, all_found)
    }
}

#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<RwLock<ClipboardStore>>,
    events: broadcast::Sender<ChangeEvent>,
}

impl AppState {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(ClipboardStore::default())),
            events,
        }
    }

    pub async fn items(&self) -> Vec<ClipboardItem> {
        self.inner.read().await.items.clone()
    }

    /// Applies one request to the store and broadcasts the resulting change.
    ///
    /// `Subscribe` is connection-level and is answered by the socket handler.
    pub async fn apply(&self, request: Request) -> Response {
        if let Err(err) = request.validate() {
            return Response::Error {
                message: err.to_string(),
            };
        }

        match request {
            Request::FetchAll => Response::Items {
                items: self.items().await,
            },
            Request::Subscribe => Response::Subscribed,
            Request::Create {
                contents,
                device_id,
            } => {
                let mut store = self.inner.write().await;
                let created = store.create(contents, &device_id);
                let ids = created.iter().map(|item| item.id.clone()).collect();
                self.publish(ChangeEvent::new(Operation::Create, created));
                Response::Created { ids }
            }
            Request::Update {
                id,
                new_content,
                device_id,
            } => {
                let mut store = self.inner.write().await;
                match store.update(&id, new_content, &device_id) {
                    Some(updated) => {
                        self.publish(ChangeEvent::new(Operation::Update, vec![updated]));
                        Response::Updated { success: true }
                    }
                    None => Response::Updated { success: false },
                }
            }
            Request::Delete { ids, device_id } => {
                let mut store = self.inner.write().await;
                let (removed, all_found) = store.delete(&ids, &device_id);
                if !removed.is_empty() {
                    self.publish(ChangeEvent::new(Operation::Delete, removed));
                }
                Response::Deleted { success: all_found }
            }
        }
    }

    // Called with the store write lock held so event order matches store order.
    fn publish(&self, event: ChangeEvent) {
        debug!(operation = %event.operation, items = event.items.len(), "publishing change");
        let _ = self.events.send(event);
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_second: f64) -> Self {
        Self {
            capacity,
            refill_per_second,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn consume(&mut self, amount: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.refill_per_second).min(self.capacity);
        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

/// Serves until `shutdown` resolves, then drains open connections.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<(), String>
where
    F: Future<Output = ()> + Send + 'static,
{
    match listener.local_addr() {
        Ok(address) => info!(%address, "accepting clipboard sync connections"),
        Err(err) => warn!("listener address unavailable: {}", err),
    }
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|err| err.to_string())
}

async fn healthz_handler() -> impl IntoResponse {
    Json(serde_json::json!({"ok": true}))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_frame_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| async move {
            if let Err(err) = handle_socket(state, socket).await {
                warn!("socket session ended with error: {}", err);
            }
        })
}

async fn handle_socket(
    state: AppState,
    socket: axum::extract::ws::WebSocket,
) -> Result<(), String> {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Split sockets only flush queued pongs when the write half sends, so
    // long-lived subscription sockets need periodic writes to stay alive
    // behind reverse proxies.
    const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    match msg {
                        Some(message) => {
                            let closing = matches!(message, Message::Close(_));
                            if ws_sender.send(message).await.is_err() || closing {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut rate_limiter = TokenBucket::new(24.0, 12.0);
    let mut forward_task: Option<tokio::task::JoinHandle<()>> = None;

    while let Some(next_message) = ws_receiver.next().await {
        let message = match next_message {
            Ok(message) => message,
            Err(err) => {
                warn!("websocket receive error: {}", err);
                break;
            }
        };

        let data = match message {
            Message::Binary(data) => data,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Text(_) => continue,
        };

        let request = match decode_frame(&data) {
            Ok(WireMessage::Request(request)) => request,
            Ok(other) => {
                warn!("unexpected non-request frame from client: {:?}", other);
                continue;
            }
            Err(err) => {
                warn!("failed to decode frame: {}", err);
                continue;
            }
        };

        if request.is_mutating() && !rate_limiter.consume(1.0) {
            warn!("rate limit exceeded");
            send_frame(
                &outbound_tx,
                WireMessage::Response(Response::Error {
                    message: "rate limit exceeded".to_owned(),
                }),
            );
            continue;
        }

        if matches!(request, Request::Subscribe) {
            if forward_task.is_some() {
                warn!("duplicate subscribe on one connection ignored");
                continue;
            }
            // Subscribe to the broadcast before acknowledging so no event
            // published after the ack can be missed.
            let events = BroadcastStream::new(state.events.subscribe());
            send_frame(&outbound_tx, WireMessage::Response(Response::Subscribed));
            info!("subscriber attached");
            forward_task = Some(tokio::spawn(forward_events(events, outbound_tx.clone())));
            continue;
        }

        let response = state.apply(request).await;
        send_frame(&outbound_tx, WireMessage::Response(response));
    }

    if let Some(task) = forward_task {
        task.abort();
        info!("subscriber detached");
    }
    send_task.abort();
    Ok(())
}

async fn forward_events(
    mut events: BroadcastStream<ChangeEvent>,
    outbound_tx: mpsc::UnboundedSender<Message>,
) {
    while let Some(next) = events.next().await {
        match next {
            Ok(event) => {
                if !send_frame(&outbound_tx, WireMessage::Event(event)) {
                    break;
                }
            }
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                // The subscriber missed events; closing makes it resubscribe.
                warn!(skipped, "subscriber lagged, closing stream");
                let _ = outbound_tx.send(Message::Close(None));
                break;
            }
        }
    }
}

fn send_frame(outbound_tx: &mpsc::UnboundedSender<Message>, message: WireMessage) -> bool {
    let frame = match encode_frame(&message) {
        Ok(frame) => frame,
        Err(err) => {
            error!("failed to serialize frame: {}", err);
            return true;
        }
    };
    outbound_tx.send(Message::Binary(frame.into())).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceId {
        "device-a".to_owned()
    }

    #[test]
    fn store_assigns_fresh_ids_newest_first() {
        let mut store = ClipboardStore::default();
        store.create(vec!["x".to_owned(), "y".to_owned()], &device());
        store.create(vec!["z".to_owned()], &device());
        let order = store
            .items
            .iter()
            .map(|item| item.content.as_str())
            .collect::<Vec<_>>();
        assert_eq!(order, ["z", "x", "y"]);
        assert_eq!(store.items[0].id, "3");
    }

    #[test]
    fn store_delete_reports_missing_ids() {
        let mut store = ClipboardStore::default();
        store.create(vec!["x".to_owned()], &device());
        let (removed, all_found) = store.delete(&["1".to_owned(), "99".to_owned()], &device());
        assert_eq!(removed.len(), 1);
        assert!(!all_found);
        assert!(store.items.is_empty());
    }

    #[test]
    fn store_delete_ignores_repeated_ids() {
        let mut store = ClipboardStore::default();
        store.create(vec!["x".to_owned(), "y".to_owned()], &device());
        let (removed, all_found) = store.delete(&["1".to_owned(), "1".to_owned()], &device());
        assert_eq!(removed.len(), 1);
        assert!(all_found);
        assert_eq!(store.items.len(), 1);
    }

    #[test]
    fn token_bucket_exhausts() {
        let mut bucket = TokenBucket::new(2.0, 0.0);
        assert!(bucket.consume(1.0));
        assert!(bucket.consume(1.0));
        assert!(!bucket.consume(1.0));
    }

    #[tokio::test]
    async fn update_of_unknown_id_fails_without_event() {
        let state = AppState::new();
        let mut events = state.events.subscribe();
        let response = state
            .apply(Request::Update {
                id: "missing".to_owned(),
                new_content: "hi".to_owned(),
                device_id: device(),
            })
            .await;
        assert_eq!(response, Response::Updated { success: false });
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn empty_create_is_rejected() {
        let state = AppState::new();
        let response = state
            .apply(Request::Create {
                contents: vec![String::new()],
                device_id: device(),
            })
            .await;
        assert!(matches!(response, Response::Error { .. }));
        assert!(state.items().await.is_empty());
    }
}
