use clap::Parser;
use clipsync_server::{AppState, serve};
use tokio::net::TcpListener;
use tracing::{error, info};

/// In-memory clipboard sync service.
#[derive(Parser, Debug)]
#[command(name = "clipsync-server", version)]
struct ServerArgs {
    /// Address the WebSocket endpoint listens on.
    #[arg(long, env = "CLIPSYNC_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    bind_address: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = ServerArgs::parse();
    let Ok(listener) = TcpListener::bind(&args.bind_address)
        .await
        .inspect_err(|err| error!(bind_address = %args.bind_address, "cannot listen: {}", err))
    else {
        std::process::exit(1);
    };

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("ctrl-c handler unavailable: {}", err);
            std::future::pending::<()>().await;
        }
        info!("shutdown requested, closing subscriptions");
    };

    match serve(listener, AppState::new(), shutdown).await {
        Ok(()) => info!("clipboard store discarded, service stopped"),
        Err(err) => {
            error!("clipboard sync service failed: {}", err);
            std::process::exit(1);
        }
    }
}
