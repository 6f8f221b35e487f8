use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
};

use clap::{Parser, Subcommand};
use clipsync_client::{
    DeletePolicy, InsertOrder, RemoteChange, SubscriptionState, SyncClient, UpdateOutcome,
    config::{
        ClientConfig, SavedClientConfig, config_path, load_config, save_config_with_retry,
    },
    device::local_device_id,
};
use clipsync_core::ClipboardItem;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::MakeWriter;

const PREVIEW_CHARS: usize = 60;

#[derive(Clone)]
struct FileMakeWriter {
    file: Arc<Mutex<File>>,
}

struct FileWriterGuard {
    file: Arc<Mutex<File>>,
}

impl Write for FileWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.flush()
    }
}

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = FileWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        FileWriterGuard {
            file: Arc::clone(&self.file),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "clipsync", version, about = "Clipboard sync client")]
struct ClientArgs {
    #[arg(long, env = "CLIPSYNC_SERVER_URL", global = true)]
    server_url: Option<String>,

    /// Overrides the derived device identity.
    #[arg(long, env = "CLIPSYNC_DEVICE_ID", global = true)]
    device_id: Option<String>,

    #[arg(long, value_enum, global = true)]
    delete_policy: Option<DeletePolicy>,

    /// Add new items at the end of the list instead of the front.
    #[arg(long, default_value_t = false, global = true)]
    append: bool,

    /// Do not report changes made on other devices.
    #[arg(long, default_value_t = false, global = true)]
    no_notify: bool,

    /// Re-fetch the full list after every reconnect.
    #[arg(long, default_value_t = false, global = true)]
    resync_on_reconnect: bool,

    /// Seconds allowed for opening a connection.
    #[arg(long, env = "CLIPSYNC_CONNECT_TIMEOUT_SECS", global = true)]
    connect_timeout_secs: Option<u64>,

    /// Seconds allowed for one request/response exchange.
    #[arg(long, env = "CLIPSYNC_REQUEST_TIMEOUT_SECS", global = true)]
    request_timeout_secs: Option<u64>,

    /// Write logs to this file instead of stderr.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl ClientArgs {
    fn overrides(&self) -> SavedClientConfig {
        SavedClientConfig {
            server_url: self.server_url.clone(),
            device_id: self.device_id.clone(),
            delete_policy: self.delete_policy,
            insert_order: self.append.then_some(InsertOrder::Append),
            notify_remote_changes: self.no_notify.then_some(false),
            resync_on_reconnect: self.resync_on_reconnect.then_some(true),
            connect_timeout_secs: self.connect_timeout_secs,
            request_timeout_secs: self.request_timeout_secs,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Keep the list in sync and print every change until interrupted.
    Watch,
    /// Print the current list once.
    List,
    /// Add a clipboard entry.
    Add { content: String },
    /// Replace the content of an entry.
    Edit { id: String, content: String },
    /// Delete an entry.
    Delete { id: String },
    /// Print this device's identity.
    DeviceId,
    /// Persist the given global flags as defaults.
    SaveConfig,
}

#[tokio::main]
async fn main() {
    let args = ClientArgs::parse();
    init_logging(args.log_file.as_ref());

    if let Err(err) = run(args).await {
        error!("{err}");
        eprintln!("{err}");
        std::process::exit(1);
    }
}

async fn run(args: ClientArgs) -> Result<(), String> {
    let path = config_path();
    let saved = load_config(&path);
    let overrides = args.overrides();

    if let Command::SaveConfig = args.command {
        let merged = overrides.merged_over(saved);
        ClientConfig::resolve(merged.clone(), local_device_id()).map_err(|e| e.to_string())?;
        save_config_with_retry(&path, &merged).map_err(|e| e.to_string())?;
        println!("saved {}", path.display());
        return Ok(());
    }

    let config = ClientConfig::resolve(overrides.merged_over(saved), local_device_id())
        .map_err(|err| err.to_string())?;

    if let Command::DeviceId = args.command {
        println!("{}", config.device_id);
        return Ok(());
    }

    info!(
        server_url = %config.server_url,
        device_id = %config.device_id,
        connect_timeout = ?config.connect_timeout,
        request_timeout = ?config.request_timeout,
        "client starting"
    );
    let client = SyncClient::initialize(
        Arc::new(config.service()),
        config.device_id.clone(),
        config.options,
    );

    let result = match args.command {
        Command::Watch => return watch(client).await,
        Command::List => list(&client).await,
        Command::Add { content } => add(&client, &content).await,
        Command::Edit { id, content } => edit(&client, &id, &content).await,
        Command::Delete { id } => delete(&client, &id).await,
        Command::DeviceId | Command::SaveConfig => Ok(()),
    };

    if let Err(err) = client.shutdown().await {
        warn!("shutdown: {}", err);
    }
    result
}

async fn watch(mut client: SyncClient) -> Result<(), String> {
    client
        .wait_until_synced()
        .await
        .map_err(|err| err.to_string())?;
    print_items(&client.items(), client.device_id());

    let mut items = client.watch_items();
    let mut state = client.watch_state();
    let mut notifications = client
        .take_notifications()
        .ok_or_else(|| "notifications already taken".to_owned())?;
    let mut last_state = *state.borrow_and_update();
    let _ = items.borrow_and_update();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                return client.shutdown().await.map_err(|err| err.to_string());
            }
            Some(change) = notifications.recv() => print_notification(&change),
            changed = items.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = items.borrow_and_update().clone();
                print_items(&snapshot, client.device_id());
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                if current != last_state {
                    eprintln!("[sync] {:?}", current);
                    last_state = current;
                }
                if current == SubscriptionState::Stopped {
                    break;
                }
            }
        }
    }

    client.stopped().await.map_err(|err| err.to_string())
}

async fn list(client: &SyncClient) -> Result<(), String> {
    client
        .wait_until_synced()
        .await
        .map_err(|err| err.to_string())?;
    print_items(&client.items(), client.device_id());
    Ok(())
}

async fn add(client: &SyncClient, content: &str) -> Result<(), String> {
    let ids = client.create_item(content).await.map_err(|err| {
        warn!("add failed: {}", err);
        err.user_message().to_owned()
    })?;
    println!("added {}", ids.join(", "));
    Ok(())
}

async fn edit(client: &SyncClient, id: &str, content: &str) -> Result<(), String> {
    // The unchanged check needs the current list.
    client
        .wait_until_synced()
        .await
        .map_err(|err| err.to_string())?;
    match client.update_item(id, content).await {
        Ok(UpdateOutcome::Updated) => println!("updated {id}"),
        Ok(UpdateOutcome::Unchanged) => println!("{id} unchanged"),
        Err(err) => {
            warn!("edit failed: {}", err);
            return Err(err.user_message().to_owned());
        }
    }
    Ok(())
}

async fn delete(client: &SyncClient, id: &str) -> Result<(), String> {
    client
        .wait_until_synced()
        .await
        .map_err(|err| err.to_string())?;
    client.delete_item(id).await.map_err(|err| {
        warn!("delete failed: {}", err);
        err.user_message().to_owned()
    })?;
    println!("deleted {id}");
    Ok(())
}

fn print_items(items: &[ClipboardItem], local_device_id: &str) {
    println!("--- {} item(s)", items.len());
    for item in items {
        let marker = if item.origin_device_id == local_device_id {
            '*'
        } else {
            ' '
        };
        println!("{marker} {:>6}  {}", item.id, preview_text(&item.content, PREVIEW_CHARS));
    }
}

fn print_notification(change: &RemoteChange) {
    println!(
        "[{}] {}",
        change.title,
        preview_text(&change.message, PREVIEW_CHARS)
    );
}

fn preview_text(text: &str, max_chars: usize) -> String {
    let mut out = String::new();
    for (index, ch) in text.chars().enumerate() {
        if index >= max_chars {
            out.push('…');
            break;
        }
        out.push(if ch.is_control() { ' ' } else { ch });
    }
    out
}

fn init_logging(log_file: Option<&PathBuf>) {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();

    let Some(log_path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .init();
        return;
    };

    let file = match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("failed to open log file {}: {err}", log_path.display());
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(io::stderr)
                .init();
            return;
        }
    };

    let make_writer = FileMakeWriter {
        file: Arc::new(Mutex::new(file)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(make_writer)
        .with_ansi(false)
        .init();
}
