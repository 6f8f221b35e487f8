pub mod config;
pub mod device;
pub mod list;
pub mod service;
pub mod sync;
pub mod ws;

pub use list::{ClipboardList, InsertOrder};
pub use service::{ChangeStream, ClipboardService, TransportError};
pub use sync::{
    DeletePolicy, ReconnectPolicy, RemoteChange, SubscriptionState, SyncClient, SyncError,
    SyncOptions, UpdateOutcome, WriteError,
};
pub use ws::WsService;
