use std::{fs, time::Duration};

use clipsync_client::{
    DeletePolicy, InsertOrder,
    config::{
        ClientConfig, ConfigError, ConfigLoadError, DEFAULT_SERVER_URL, MAX_CONFIG_BYTES,
        SavedClientConfig, load_config, load_config_from_path, parse_config_json,
        save_config_with_retry, validate_server_url,
    },
};
use tempfile::tempdir;

#[test]
fn overrides_win_over_saved_values() {
    let saved = SavedClientConfig {
        server_url: Some("ws://saved:1/ws".to_owned()),
        device_id: Some("saved-device".to_owned()),
        delete_policy: Some(DeletePolicy::Refetch),
        ..SavedClientConfig::default()
    };
    let overrides = SavedClientConfig {
        server_url: Some("wss://flag:2/ws".to_owned()),
        insert_order: Some(InsertOrder::Append),
        ..SavedClientConfig::default()
    };

    let merged = overrides.merged_over(saved);
    assert_eq!(merged.server_url.as_deref(), Some("wss://flag:2/ws"));
    assert_eq!(merged.device_id.as_deref(), Some("saved-device"));
    assert_eq!(merged.delete_policy, Some(DeletePolicy::Refetch));
    assert_eq!(merged.insert_order, Some(InsertOrder::Append));
}

#[test]
fn resolve_fills_defaults() {
    let config = ClientConfig::resolve(SavedClientConfig::default(), "derived").unwrap();
    assert_eq!(config.server_url, DEFAULT_SERVER_URL);
    assert_eq!(config.device_id, "derived");
    assert_eq!(config.options.delete_policy, DeletePolicy::Rollback);
    assert_eq!(config.options.insert_order, InsertOrder::Prepend);
    assert!(config.options.notify_remote_changes);
    assert!(!config.options.resync_on_reconnect);
    assert_eq!(config.connect_timeout, Duration::from_secs(12));
    assert_eq!(config.request_timeout, Duration::from_secs(30));
}

#[test]
fn timeouts_follow_override_then_saved_value() {
    let saved = SavedClientConfig {
        connect_timeout_secs: Some(5),
        request_timeout_secs: Some(45),
        ..SavedClientConfig::default()
    };
    let overrides = SavedClientConfig {
        request_timeout_secs: Some(90),
        ..SavedClientConfig::default()
    };

    let config = ClientConfig::resolve(overrides.merged_over(saved), "d").unwrap();
    assert_eq!(config.connect_timeout, Duration::from_secs(5));
    assert_eq!(config.request_timeout, Duration::from_secs(90));
}

#[test]
fn zero_timeout_is_rejected() {
    let settings = SavedClientConfig {
        connect_timeout_secs: Some(0),
        ..SavedClientConfig::default()
    };
    assert!(matches!(
        ClientConfig::resolve(settings, "d"),
        Err(ConfigError::ZeroTimeout { .. })
    ));
}

#[test]
fn resolve_rejects_bad_values() {
    let http = SavedClientConfig {
        server_url: Some("http://host/ws".to_owned()),
        ..SavedClientConfig::default()
    };
    assert!(matches!(
        ClientConfig::resolve(http, "d"),
        Err(ConfigError::InvalidServerUrl { .. })
    ));

    let blank_device = SavedClientConfig {
        device_id: Some("  ".to_owned()),
        ..SavedClientConfig::default()
    };
    assert!(matches!(
        ClientConfig::resolve(blank_device, "d"),
        Err(ConfigError::EmptyDeviceId)
    ));
}

#[test]
fn server_url_validation() {
    assert!(validate_server_url("ws://127.0.0.1:8080/ws").is_ok());
    assert!(validate_server_url("wss://sync.example.com/ws").is_ok());
    assert!(validate_server_url("not a url").is_err());
    let long = format!("ws://host/{}", "a".repeat(2100));
    assert!(matches!(
        validate_server_url(&long),
        Err(ConfigError::ServerUrlTooLong)
    ));
}

#[test]
fn partial_file_parses() {
    let parsed =
        parse_config_json(r#"{"delete_policy":"keep_optimistic","request_timeout_secs":10}"#)
            .unwrap();
    assert_eq!(parsed.delete_policy, Some(DeletePolicy::KeepOptimistic));
    assert_eq!(parsed.request_timeout_secs, Some(10));
    assert_eq!(parsed.server_url, None);
}

#[test]
fn saved_config_round_trips_through_disk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("client.json");
    let config = SavedClientConfig {
        server_url: Some("ws://10.0.0.2:8080/ws".to_owned()),
        notify_remote_changes: Some(false),
        ..SavedClientConfig::default()
    };

    save_config_with_retry(&path, &config).unwrap();
    assert_eq!(load_config_from_path(&path).unwrap(), config);
    assert!(!path.with_extension("json.tmp").exists());
}

#[test]
fn oversized_file_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("client.json");
    fs::write(&path, vec![b' '; MAX_CONFIG_BYTES as usize + 1]).unwrap();

    assert!(matches!(
        load_config_from_path(&path),
        Err(ConfigLoadError::TooLarge { .. })
    ));
    assert_eq!(load_config(&path), SavedClientConfig::default());
}

#[test]
fn missing_or_corrupt_file_falls_back_to_defaults() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("client.json");
    assert_eq!(load_config(&path), SavedClientConfig::default());

    fs::write(&path, "{ not json").unwrap();
    assert_eq!(load_config(&path), SavedClientConfig::default());
}
