use clap::{Parser, Subcommand};
use sipsync::{
    ApiClient, EventSource, FetchMode, PageVisibility, RealtimeChannel, ResponseCache,
    SyncConfig, SyncFacade, SyncView,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sipsync")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding an optional sipsync.json
    #[arg(long, env = "SIPSYNC_CONFIG_DIR", default_value = ".")]
    config_dir: PathBuf,
    #[arg(long, env = "SIPSYNC_API_URL")]
    api_url: Option<String>,
    #[arg(long, env = "SIPSYNC_WS_URL")]
    ws_url: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Follow an event live and print every view change as a JSON line
    Watch {
        #[arg(long)]
        event: String,
    },
    /// Read an event once and check the push channel
    Status {
        #[arg(long)]
        event: String,
    },
}

fn load_config(cli: &Cli) -> Result<SyncConfig, Box<dyn std::error::Error>> {
    let mut config = SyncConfig::load_or_default(&cli.config_dir);
    if let Some(url) = &cli.api_url {
        config.api_url = url.clone();
    }
    if let Some(url) = &cli.ws_url {
        config.ws_url = url.clone();
    }
    config.validate()?;
    Ok(config)
}

fn view_line(view: &SyncView) -> serde_json::Value {
    serde_json::json!({
        "currentWine": view.current_wine(),
        "pointer": view.pointer,
        "round": view.round,
        "connection": view.connection,
        "lastError": view.last_error,
    })
}

async fn run_watch(config: SyncConfig, event_id: String) -> Result<(), Box<dyn std::error::Error>> {
    let cache = Arc::new(ResponseCache::new(config.freshness_window()));
    let api = Arc::new(ApiClient::from_config(&config, cache));
    let channel = Arc::new(RealtimeChannel::new(config.channel_config()));

    channel.connect().await;
    if !channel.is_connected() {
        tracing::warn!("Push channel unavailable, continuing with polling only");
    }

    let facade = SyncFacade::new(
        event_id,
        api,
        Arc::clone(&channel),
        config.polling_config(),
        PageVisibility::default(),
    );
    facade
        .start_sync(|view| println!("{}", view_line(view)))
        .await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    facade.stop_sync();
    channel.disconnect().await;
    Ok(())
}

async fn run_status(config: SyncConfig, event_id: String) -> Result<(), Box<dyn std::error::Error>> {
    let cache = Arc::new(ResponseCache::new(config.freshness_window()));
    let api = ApiClient::from_config(&config, cache);
    let snapshot = api.fetch_event(&event_id, FetchMode::Revalidate).await?;

    let channel = RealtimeChannel::new(config.channel_config().with_reconnect_attempts(0));
    channel.connect().await;
    let status = channel.status();
    channel.disconnect().await;

    println!(
        "{}",
        serde_json::json!({
            "event": snapshot.event_id,
            "currentWine": snapshot.current_wine,
            "pointerUpdatedAt": snapshot.pointer_updated_at,
            "apiUrl": config.api_url,
            "wsUrl": config.ws_url,
            "pushChannel": status,
        })
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Command::Watch { event } => run_watch(config, event).await,
        Command::Status { event } => run_status(config, event).await,
    }
}
