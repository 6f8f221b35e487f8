use async_trait::async_trait;
use clipsync_core::{ChangeEvent, ClipboardItem, CoreError, ItemId};
use futures::stream::BoxStream;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("connection closed by server")]
    Closed,
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
    #[error("server error: {0}")]
    Server(String),
    #[error(transparent)]
    Protocol(#[from] CoreError),
}

/// Change events in arrival order. An `Err` item or the end of the stream
/// means the subscription is gone and must be reopened.
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent, TransportError>>;

/// The five operations of the remote clipboard service.
///
/// Every call builds its own transport handle and releases it before
/// returning; a subscription holds its handle until the stream is dropped.
#[async_trait]
pub trait ClipboardService: Send + Sync {
    async fn fetch_all(&self) -> Result<Vec<ClipboardItem>, TransportError>;

    async fn subscribe(&self) -> Result<ChangeStream, TransportError>;

    async fn create(
        &self,
        contents: Vec<String>,
        device_id: &str,
    ) -> Result<Vec<ItemId>, TransportError>;

    async fn update(
        &self,
        id: &str,
        new_content: &str,
        device_id: &str,
    ) -> Result<bool, TransportError>;

    async fn delete(&self, ids: Vec<ItemId>, device_id: &str) -> Result<bool, TransportError>;
}
