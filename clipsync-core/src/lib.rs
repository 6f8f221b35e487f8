use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const MAX_CLIPBOARD_TEXT_BYTES: usize = 256 * 1024;
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;
const DEVICE_ID_DIGEST_BYTES: usize = 16;

pub type ItemId = String;
pub type DeviceId = String;

/// A single clipboard entry as the service and the local list see it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClipboardItem {
    pub id: ItemId,
    pub content: String,
    /// Device that authored or last modified the entry.
    pub origin_device_id: DeviceId,
}

impl ClipboardItem {
    pub fn new(
        id: impl Into<ItemId>,
        content: impl Into<String>,
        origin_device_id: impl Into<DeviceId>,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            origin_device_id: origin_device_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One delta delivered over the subscription stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeEvent {
    pub operation: Operation,
    pub items: Vec<ClipboardItem>,
}

impl ChangeEvent {
    pub fn new(operation: Operation, items: Vec<ClipboardItem>) -> Self {
        Self { operation, items }
    }

    /// First item authored by a device other than `local_device_id`.
    ///
    /// `None` means the event is entirely self-originated.
    pub fn first_remote_item(&self, local_device_id: &str) -> Option<&ClipboardItem> {
        self.items
            .iter()
            .find(|item| item.origin_device_id != local_device_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum Request {
    FetchAll,
    Subscribe,
    Create {
        contents: Vec<String>,
        device_id: DeviceId,
    },
    Update {
        id: ItemId,
        new_content: String,
        device_id: DeviceId,
    },
    Delete {
        ids: Vec<ItemId>,
        device_id: DeviceId,
    },
}

impl Request {
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Request::Create { .. } | Request::Update { .. } | Request::Delete { .. }
        )
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        match self {
            Request::Create { contents, .. } => {
                if contents.is_empty() {
                    return Err(CoreError::EmptyContent);
                }
                contents.iter().try_for_each(|c| validate_content(c))
            }
            Request::Update { new_content, .. } => validate_content(new_content),
            Request::FetchAll | Request::Subscribe | Request::Delete { .. } => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum Response {
    Items { items: Vec<ClipboardItem> },
    Subscribed,
    Created { ids: Vec<ItemId> },
    Updated { success: bool },
    Deleted { success: bool },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Request(Request),
    Response(Response),
    Event(ChangeEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Request = 0,
    Response = 1,
    Event = 2,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("clipboard content must not be empty")]
    EmptyContent,
    #[error("clipboard content exceeds 256 KiB")]
    ContentTooLarge,
    #[error("invalid frame length")]
    InvalidFrameLength,
    #[error("frame of {0} bytes exceeds the 4 MiB limit")]
    FrameTooLarge(usize),
    #[error("unsupported message type {0}")]
    UnsupportedMessageType(u8),
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub fn validate_content(content: &str) -> Result<(), CoreError> {
    if content.is_empty() {
        return Err(CoreError::EmptyContent);
    }
    if content.len() > MAX_CLIPBOARD_TEXT_BYTES {
        return Err(CoreError::ContentTooLarge);
    }
    Ok(())
}

pub fn encode_frame(message: &WireMessage) -> Result<Vec<u8>, CoreError> {
    let (message_type, payload) = match message {
        WireMessage::Request(request) => (MessageType::Request as u8, to_json(request)?),
        WireMessage::Response(response) => (MessageType::Response as u8, to_json(response)?),
        WireMessage::Event(event) => (MessageType::Event as u8, to_json(event)?),
    };

    let frame_len = 1usize
        .checked_add(payload.len())
        .ok_or(CoreError::InvalidFrameLength)?;
    if frame_len + 4 > MAX_FRAME_BYTES {
        return Err(CoreError::FrameTooLarge(frame_len + 4));
    }
    let frame_len_u32 = u32::try_from(frame_len).map_err(|_| CoreError::InvalidFrameLength)?;

    let mut out = BytesMut::with_capacity(4 + frame_len);
    out.put_u32_le(frame_len_u32);
    out.put_u8(message_type);
    out.extend_from_slice(&payload);
    Ok(out.to_vec())
}

pub fn decode_frame(frame: &[u8]) -> Result<WireMessage, CoreError> {
    if frame.len() > MAX_FRAME_BYTES {
        return Err(CoreError::FrameTooLarge(frame.len()));
    }
    if frame.len() < 5 {
        return Err(CoreError::InvalidFrameLength);
    }

    let mut cursor = frame;
    let expected_len = cursor.get_u32_le() as usize;
    if expected_len + 4 != frame.len() {
        return Err(CoreError::InvalidFrameLength);
    }

    let message_type = cursor.get_u8();
    let payload = cursor;

    match message_type {
        x if x == MessageType::Request as u8 => Ok(WireMessage::Request(from_json(payload)?)),
        x if x == MessageType::Response as u8 => Ok(WireMessage::Response(from_json(payload)?)),
        x if x == MessageType::Event as u8 => Ok(WireMessage::Event(from_json(payload)?)),
        other => Err(CoreError::UnsupportedMessageType(other)),
    }
}

/// Stable device identifier derived from host and user names.
pub fn derive_device_id(host: &str, user: &str) -> DeviceId {
    let raw = format!("{}:{}", host, user);
    let digest = Sha256::digest(raw.as_bytes());
    hex::encode(&digest[0..DEVICE_ID_DIGEST_BYTES])
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, CoreError> {
    serde_json::to_vec(value).map_err(|err| CoreError::Serialization(err.to_string()))
}

fn from_json<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T, CoreError> {
    serde_json::from_slice(payload).map_err(|err| CoreError::Serialization(err.to_string()))
}
