//! WebSocket transport for [`ClipboardService`].

use std::time::Duration;

use async_trait::async_trait;
use clipsync_core::{
    ClipboardItem, ItemId, Request, Response, WireMessage, decode_frame, encode_frame,
};
use futures::{SinkExt, StreamExt, stream};
use tokio::{net::TcpStream, time::timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::service::{ChangeStream, ClipboardService, TransportError};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(12);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct WsService {
    server_url: String,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl WsService {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeouts(mut self, connect_timeout: Duration, request_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.request_timeout = request_timeout;
        self
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    async fn connect(&self) -> Result<WsStream, TransportError> {
        debug!(server_url = %self.server_url, "opening transport");
        match timeout(self.connect_timeout, connect_async(self.server_url.as_str())).await {
            Ok(Ok((ws, _))) => Ok(ws),
            Ok(Err(err)) => Err(TransportError::Connect(err.to_string())),
            Err(_) => Err(TransportError::Timeout(self.connect_timeout)),
        }
    }

    /// One request/response exchange on a fresh connection.
    async fn call(&self, request: Request) -> Result<Response, TransportError> {
        let mut ws = self.connect().await?;
        let result = match timeout(self.request_timeout, exchange(&mut ws, request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.request_timeout)),
        };
        // Released on every path, not just on success.
        let _ = ws.close(None).await;
        match result? {
            Response::Error { message } => Err(TransportError::Server(message)),
            response => Ok(response),
        }
    }
}

#[async_trait]
impl ClipboardService for WsService {
    async fn fetch_all(&self) -> Result<Vec<ClipboardItem>, TransportError> {
        match self.call(Request::FetchAll).await? {
            Response::Items { items } => Ok(items),
            other => Err(unexpected(&other)),
        }
    }

    async fn subscribe(&self) -> Result<ChangeStream, TransportError> {
        let mut ws = self.connect().await?;
        let ack = match timeout(self.request_timeout, exchange(&mut ws, Request::Subscribe)).await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.request_timeout)),
        };
        match ack {
            Ok(Response::Subscribed) => Ok(event_stream(ws)),
            Ok(Response::Error { message }) => {
                let _ = ws.close(None).await;
                Err(TransportError::Server(message))
            }
            Ok(other) => {
                let _ = ws.close(None).await;
                Err(unexpected(&other))
            }
            Err(err) => {
                let _ = ws.close(None).await;
                Err(err)
            }
        }
    }

    async fn create(
        &self,
        contents: Vec<String>,
        device_id: &str,
    ) -> Result<Vec<ItemId>, TransportError> {
        let request = Request::Create {
            contents,
            device_id: device_id.to_owned(),
        };
        match self.call(request).await? {
            Response::Created { ids } => Ok(ids),
            other => Err(unexpected(&other)),
        }
    }

    async fn update(
        &self,
        id: &str,
        new_content: &str,
        device_id: &str,
    ) -> Result<bool, TransportError> {
        let request = Request::Update {
            id: id.to_owned(),
            new_content: new_content.to_owned(),
            device_id: device_id.to_owned(),
        };
        match self.call(request).await? {
            Response::Updated { success } => Ok(success),
            other => Err(unexpected(&other)),
        }
    }

    async fn delete(&self, ids: Vec<ItemId>, device_id: &str) -> Result<bool, TransportError> {
        let request = Request::Delete {
            ids,
            device_id: device_id.to_owned(),
        };
        match self.call(request).await? {
            Response::Deleted { success } => Ok(success),
            other => Err(unexpected(&other)),
        }
    }
}

async fn exchange(ws: &mut WsStream, request: Request) -> Result<Response, TransportError> {
    let frame = encode_frame(&WireMessage::Request(request))?;
    ws.send(Message::Binary(frame.into()))
        .await
        .map_err(|err| TransportError::Send(err.to_string()))?;

    while let Some(next) = ws.next().await {
        let message = next.map_err(|err| TransportError::Receive(err.to_string()))?;
        match message {
            Message::Binary(data) => match decode_frame(&data)? {
                WireMessage::Response(response) => return Ok(response),
                other => debug!("ignoring frame while awaiting reply: {:?}", other),
            },
            Message::Close(_) => return Err(TransportError::Closed),
            _ => {}
        }
    }
    Err(TransportError::Closed)
}

fn event_stream(ws: WsStream) -> ChangeStream {
    stream::unfold(Some(ws), |state| async move {
        let mut ws = state?;
        loop {
            let message = match ws.next().await {
                Some(Ok(message)) => message,
                Some(Err(err)) => {
                    return Some((Err(TransportError::Receive(err.to_string())), None));
                }
                None => return None,
            };
            match message {
                Message::Binary(data) => match decode_frame(&data) {
                    Ok(WireMessage::Event(event)) => return Some((Ok(event), Some(ws))),
                    Ok(other) => debug!("ignoring non-event frame on subscription: {:?}", other),
                    Err(err) => warn!("decode frame failed: {}", err),
                },
                Message::Close(_) => return None,
                _ => {}
            }
        }
    })
    .boxed()
}

fn unexpected(response: &Response) -> TransportError {
    TransportError::UnexpectedReply(format!("{:?}", response))
}
