use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};
use frames::{BatchUpdate, Payload, ProcessingUpdate};
use realtime::{
    BackoffConfig, BatchChannel, ConnectionOptions, EditorChannel, EnvironmentSignal, PageOrigin, RealtimeConfig,
    RealtimeError, Registry, Routed, handler,
};
use serde_json::Value;
use tokio::sync::mpsc;

const OPEN_TIMEOUT: Duration = Duration::from_secs(10);
const FLUSH_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] RealtimeError),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned HTTP {0}")]
    ServerStatus(u16),
    #[error("timed out waiting for connection `{0}` to open")]
    Timeout(String),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("signal handling failed: {0}")]
    Signal(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "realtime-cli", about = "Photo editor realtime channel client")]
struct Cli {
    /// Origin of the application; `https` selects `wss`.
    #[arg(long, env = "REALTIME_ORIGIN", default_value = realtime::config::DEFAULT_ORIGIN)]
    origin: String,

    #[arg(long, env = "REALTIME_RECONNECT_BASE_MS", default_value_t = realtime::config::DEFAULT_RECONNECT_BASE_MS)]
    reconnect_base_ms: u64,

    #[arg(long, env = "REALTIME_MAX_RECONNECT_ATTEMPTS", default_value_t = realtime::config::DEFAULT_MAX_RECONNECT_ATTEMPTS)]
    max_reconnect_attempts: u32,

    #[arg(long, env = "REALTIME_HEARTBEAT_INTERVAL_MS", default_value_t = realtime::config::DEFAULT_HEARTBEAT_INTERVAL_MS)]
    heartbeat_interval_ms: u64,

    /// Reconnect with backoff after abnormal closures (`true`/`false`).
    #[arg(long, env = "REALTIME_AUTO_RECONNECT", default_value_t = true, action = ArgAction::Set)]
    auto_reconnect: bool,

    /// Send keep-alive pings while connected (`true`/`false`).
    #[arg(long, env = "REALTIME_HEARTBEAT", default_value_t = true, action = ArgAction::Set)]
    heartbeat: bool,

    /// Shorthand for `--heartbeat false`.
    #[arg(long, default_value_t = false)]
    no_heartbeat: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check the relay's health endpoint.
    Ping,
    /// Open one named connection and print every inbound message.
    Listen(ListenArgs),
    /// Send one message on a named connection, then exit.
    Send(SendArgs),
    /// Follow processing updates for a photo.
    Editor(EditorArgs),
    /// Follow progress of a batch job.
    Batch(BatchArgs),
    /// Push batch progress into a batch room through the relay's HTTP hook.
    PublishBatch(PublishBatchArgs),
}

#[derive(Args, Debug)]
struct ListenArgs {
    #[arg(long, default_value = "main")]
    name: String,
    path: String,
    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Args, Debug)]
struct SendArgs {
    #[arg(long, default_value = "main")]
    name: String,
    path: String,
    /// JSON is sent structured; anything else as plain text.
    message: String,
}

#[derive(Args, Debug)]
struct EditorArgs {
    photo_id: String,
    /// Report this progress value once connected.
    #[arg(long)]
    progress: Option<f64>,
    #[arg(long, default_value = "processing")]
    status: String,
    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Args, Debug)]
struct BatchArgs {
    job_id: String,
    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Args, Debug)]
struct PublishBatchArgs {
    job_id: String,
    #[arg(long)]
    completed: u64,
    #[arg(long)]
    total: u64,
    #[arg(long, default_value = "processing")]
    status: String,
}

#[derive(Args, Debug)]
struct SessionArgs {
    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    duration_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let config = build_config(&cli)?;

    match cli.command {
        Command::Ping => run_ping(&config).await,
        Command::PublishBatch(args) => run_publish_batch(&config, args).await,
        Command::Listen(args) => run_listen(config, args).await,
        Command::Send(args) => run_send(config, args).await,
        Command::Editor(args) => run_editor(config, args).await,
        Command::Batch(args) => run_batch(config, args).await,
    }
}

fn build_config(cli: &Cli) -> Result<RealtimeConfig, CliError> {
    let mut config = RealtimeConfig::new(PageOrigin::parse(&cli.origin)?);
    config.backoff = BackoffConfig {
        base_delay: Duration::from_millis(cli.reconnect_base_ms),
        max_attempts: cli.max_reconnect_attempts,
    };
    config.connection = ConnectionOptions {
        auto_reconnect: cli.auto_reconnect,
        heartbeat: cli.heartbeat && !cli.no_heartbeat,
        heartbeat_interval: Duration::from_millis(cli.heartbeat_interval_ms),
        ..ConnectionOptions::default()
    };
    Ok(config)
}

fn http_base(config: &RealtimeConfig) -> String {
    config.origin.to_string()
}

// =============================================================================
// HTTP COMMANDS
// =============================================================================

async fn run_ping(config: &RealtimeConfig) -> Result<(), CliError> {
    let url = format!("{}/healthz", http_base(config));
    let response = reqwest::Client::new().get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(CliError::ServerStatus(status.as_u16()));
    }
    println!("ok");
    Ok(())
}

async fn run_publish_batch(config: &RealtimeConfig, args: PublishBatchArgs) -> Result<(), CliError> {
    let url = format!("{}/api/batch/{}/progress", http_base(config), args.job_id);
    let body = serde_json::json!({
        "completed": args.completed,
        "total": args.total,
        "status": args.status,
    });
    let response = reqwest::Client::new().post(url).json(&body).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(CliError::ServerStatus(status.as_u16()));
    }
    let json: Value = response.json().await?;
    print_json(&json)
}

// =============================================================================
// REALTIME COMMANDS
// =============================================================================

async fn run_listen(config: RealtimeConfig, args: ListenArgs) -> Result<(), CliError> {
    let registry = Registry::websocket(config)?;
    registry.add_global_handler(handler(|routed: &Routed| {
        println!("[{}] {}", routed.connection, routed.payload.encode());
        Ok(())
    }));
    registry.connect(&args.name, &args.path, registry.connection_options());
    run_session(&registry, &args.session).await
}

async fn run_send(config: RealtimeConfig, args: SendArgs) -> Result<(), CliError> {
    let registry = Registry::websocket(config)?;
    let conn = registry.connect(&args.name, &args.path, registry.connection_options().without_reconnect());
    conn.send(parse_message(&args.message));

    let opened = tokio::time::timeout(OPEN_TIMEOUT, async {
        while !conn.is_connected() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    if opened.is_err() {
        registry.shutdown();
        return Err(CliError::Timeout(args.name));
    }

    tokio::time::sleep(FLUSH_GRACE).await;
    registry.shutdown();
    tokio::time::sleep(FLUSH_GRACE).await;
    println!("sent");
    Ok(())
}

async fn run_editor(config: RealtimeConfig, args: EditorArgs) -> Result<(), CliError> {
    let registry = Registry::websocket(config)?;
    let editor = EditorChannel::new(registry.clone());
    editor.on_processing_update(|update: &ProcessingUpdate| {
        println!("{:>5.1}% {}", update.progress, update.status);
        Ok(())
    });
    editor.connect(&args.photo_id);
    if let Some(progress) = args.progress {
        editor.send_processing_update(&ProcessingUpdate { progress, status: args.status.clone() });
    }
    run_session(&registry, &args.session).await
}

async fn run_batch(config: RealtimeConfig, args: BatchArgs) -> Result<(), CliError> {
    let registry = Registry::websocket(config)?;
    let batch = BatchChannel::new(registry.clone());
    batch.on_batch_update(|update: &BatchUpdate| {
        println!("{}/{} {}", update.completed, update.total, update.status);
        Ok(())
    });
    batch.connect(&args.job_id);
    run_session(&registry, &args.session).await
}

/// Feed environment signals to the registry until Ctrl-C or the optional
/// deadline, then tear everything down.
async fn run_session(registry: &Registry, session: &SessionArgs) -> Result<(), CliError> {
    let (signals, rx) = mpsc::channel(8);
    registry.watch(rx);

    let deadline = async {
        match session.duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        () = deadline => {}
    }

    let _ = signals.send(EnvironmentSignal::Teardown).await;
    tokio::time::sleep(FLUSH_GRACE).await;
    registry.shutdown();
    Ok(())
}

fn parse_message(raw: &str) -> Payload {
    serde_json::from_str::<Value>(raw).map_or_else(|_| Payload::from(raw), Payload::from)
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
