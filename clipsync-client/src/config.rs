use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use clipsync_core::DeviceId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::{
    list::InsertOrder,
    sync::{DeletePolicy, SyncOptions},
    ws::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT, WsService},
};

/// `client.json` is expected to be tiny.
pub const MAX_CONFIG_BYTES: u64 = 64 * 1024;
pub const MAX_SERVER_URL_LEN: usize = 2048;
pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8080/ws";

/// On-disk settings. Every field is optional so partial files stay valid,
/// and the same shape doubles as a set of command-line overrides.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SavedClientConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_policy: Option<DeletePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insert_order: Option<InsertOrder>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_remote_changes: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resync_on_reconnect: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
}

impl SavedClientConfig {
    /// Fields set in `self` win over `base`.
    #[must_use]
    pub fn merged_over(self, base: SavedClientConfig) -> SavedClientConfig {
        SavedClientConfig {
            server_url: self.server_url.or(base.server_url),
            device_id: self.device_id.or(base.device_id),
            delete_policy: self.delete_policy.or(base.delete_policy),
            insert_order: self.insert_order.or(base.insert_order),
            notify_remote_changes: self.notify_remote_changes.or(base.notify_remote_changes),
            resync_on_reconnect: self.resync_on_reconnect.or(base.resync_on_reconnect),
            connect_timeout_secs: self.connect_timeout_secs.or(base.connect_timeout_secs),
            request_timeout_secs: self.request_timeout_secs.or(base.request_timeout_secs),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid server URL {url:?}: {reason}")]
    InvalidServerUrl { url: String, reason: String },
    #[error("server URL exceeds 2048 characters")]
    ServerUrlTooLong,
    #[error("device id must not be empty")]
    EmptyDeviceId,
    #[error("{name} must be at least one second")]
    ZeroTimeout { name: &'static str },
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("metadata read failed: {0}")]
    Metadata(#[source] io::Error),
    #[error("file too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("parse failed: {0}")]
    Parse(#[source] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigSaveError {
    #[error("serialize failed: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("tmp write failed: {0}")]
    WriteTmp(#[source] io::Error),
    #[error("rename failed: {0}")]
    Rename(#[source] io::Error),
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub device_id: DeviceId,
    pub options: SyncOptions,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn resolve(
        settings: SavedClientConfig,
        default_device_id: &str,
    ) -> Result<Self, ConfigError> {
        let server_url = settings
            .server_url
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_owned());
        validate_server_url(&server_url)?;

        let device_id = settings
            .device_id
            .unwrap_or_else(|| default_device_id.to_owned());
        if device_id.trim().is_empty() {
            return Err(ConfigError::EmptyDeviceId);
        }

        let defaults = SyncOptions::default();
        let options = SyncOptions {
            insert_order: settings.insert_order.unwrap_or(defaults.insert_order),
            notify_remote_changes: settings
                .notify_remote_changes
                .unwrap_or(defaults.notify_remote_changes),
            delete_policy: settings.delete_policy.unwrap_or(defaults.delete_policy),
            resync_on_reconnect: settings
                .resync_on_reconnect
                .unwrap_or(defaults.resync_on_reconnect),
            ..defaults
        };

        let connect_timeout = timeout_from_secs(
            "connect timeout",
            settings.connect_timeout_secs,
            DEFAULT_CONNECT_TIMEOUT,
        )?;
        let request_timeout = timeout_from_secs(
            "request timeout",
            settings.request_timeout_secs,
            DEFAULT_REQUEST_TIMEOUT,
        )?;

        Ok(Self {
            server_url,
            device_id,
            options,
            connect_timeout,
            request_timeout,
        })
    }

    pub fn service(&self) -> WsService {
        WsService::new(self.server_url.clone())
            .with_timeouts(self.connect_timeout, self.request_timeout)
    }
}

fn timeout_from_secs(
    name: &'static str,
    secs: Option<u64>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match secs {
        None => Ok(default),
        Some(0) => Err(ConfigError::ZeroTimeout { name }),
        Some(secs) => Ok(Duration::from_secs(secs)),
    }
}

pub fn validate_server_url(server_url: &str) -> Result<(), ConfigError> {
    if server_url.len() > MAX_SERVER_URL_LEN {
        return Err(ConfigError::ServerUrlTooLong);
    }
    let parsed = Url::parse(server_url).map_err(|err| ConfigError::InvalidServerUrl {
        url: server_url.to_owned(),
        reason: err.to_string(),
    })?;
    match parsed.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(ConfigError::InvalidServerUrl {
                url: server_url.to_owned(),
                reason: format!("unsupported scheme {other:?}, expected ws or wss"),
            });
        }
    }
    if parsed.host_str().is_none() {
        return Err(ConfigError::InvalidServerUrl {
            url: server_url.to_owned(),
            reason: "missing host".to_owned(),
        });
    }
    Ok(())
}

pub fn config_path() -> PathBuf {
    let dir = std::env::var_os("CLIPSYNC_CONFIG_DIR")
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("XDG_CONFIG_HOME")
                .or_else(|| std::env::var_os("LOCALAPPDATA"))
                .map(|base| PathBuf::from(base).join("clipsync"))
        })
        .or_else(|| {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config").join("clipsync"))
        })
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = fs::create_dir_all(&dir);
    dir.join("client.json")
}

pub fn parse_config_json(data: &str) -> Result<SavedClientConfig, serde_json::Error> {
    serde_json::from_str::<SavedClientConfig>(data)
}

pub fn load_config_from_path(path: &Path) -> Result<SavedClientConfig, ConfigLoadError> {
    let meta = fs::metadata(path).map_err(ConfigLoadError::Metadata)?;
    if meta.len() > MAX_CONFIG_BYTES {
        return Err(ConfigLoadError::TooLarge {
            size: meta.len(),
            max: MAX_CONFIG_BYTES,
        });
    }

    let data = fs::read_to_string(path).map_err(ConfigLoadError::Read)?;
    parse_config_json(&data).map_err(ConfigLoadError::Parse)
}

/// Loads the saved config, falling back to defaults when missing or invalid.
pub fn load_config(path: &Path) -> SavedClientConfig {
    match load_config_from_path(path) {
        Ok(config) => config,
        Err(ConfigLoadError::Metadata(err)) if err.kind() == io::ErrorKind::NotFound => {
            SavedClientConfig::default()
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), "saved config ignored: {}", err);
            SavedClientConfig::default()
        }
    }
}

pub fn save_config_to_path(path: &Path, config: &SavedClientConfig) -> Result<(), ConfigSaveError> {
    let tmp = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(config).map_err(ConfigSaveError::Serialize)?;
    fs::write(&tmp, payload.as_bytes()).map_err(ConfigSaveError::WriteTmp)?;

    if path.exists() {
        let _ = fs::remove_file(path);
    }

    fs::rename(&tmp, path).map_err(ConfigSaveError::Rename)?;
    Ok(())
}

pub fn save_config_with_retry(
    path: &Path,
    config: &SavedClientConfig,
) -> Result<(), ConfigSaveError> {
    const MAX_ATTEMPTS: u32 = 3;
    const BACKOFF_BASE_MS: u64 = 50;

    let mut attempt = 1;
    loop {
        match save_config_to_path(path, config) {
            Ok(()) => return Ok(()),
            Err(err) if attempt >= MAX_ATTEMPTS => return Err(err),
            Err(err) => {
                tracing::warn!(attempt, "config save failed, retrying: {}", err);
                let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                std::thread::sleep(Duration::from_millis(backoff_ms));
                attempt += 1;
            }
        }
    }
}
