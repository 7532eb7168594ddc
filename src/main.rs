//! CLI for Peril
//!
//! Subcommands:
//! - `server`: bootstrap the exchanges, collect game logs, and broadcast
//!   pause/resume typed on stdin
//! - `inspect-dlq`: log and acknowledge every dead-lettered message

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use peril::AckType;
use peril::broker::{AmqpConnection, Channel, Connection};
use peril::config::{Settings, load_config_from};
use peril::persistence::GameLogStore;
use peril::pubsub::{Dispatch, subscribe_dispatch};
use peril::routing::{GameLog, GameMessage, Handler, PlayingState, publish_message, subscribe_kind};
use peril::topology::{ExchangeKind, QueueBinding, QueueType, Topology, declare_exchanges};
use peril::utils::{CodecError, Result, logging};

const SERVER_NAME: &str = "server";

#[derive(Parser)]
#[command(name = "peril")]
struct Cli {
    /// Configuration file, extension optional
    #[arg(long, default_value = "config/default")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the game server console
    Server,
    /// Log and acknowledge every message in the dead-letter queue
    InspectDlq,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = match load_config_from(&cli.config) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    logging::init(&settings.logging.level);

    let result = match cli.command {
        Command::Server => run_server(settings).await,
        Command::InspectDlq => run_inspector(settings).await,
    };
    if let Err(e) = result {
        error!("Peril failed: {e}");
        std::process::exit(1);
    }
}

async fn run_server(settings: Settings) -> Result<()> {
    let conn = AmqpConnection::connect(&settings.broker.uri).await?;
    let channel = conn.create_channel().await?;
    declare_exchanges(channel.as_ref(), &settings.topology).await?;

    let store = GameLogStore::open(
        &settings.persistence.path,
        Some(settings.persistence.max_logs_per_player),
    )?;
    let collector = subscribe_kind(
        &conn,
        &settings.topology,
        SERVER_NAME,
        settings.broker.prefetch,
        Handler::game_log(move |log: GameLog| {
            let store = store.clone();
            async move {
                match store.append(&log) {
                    Ok(()) => AckType::Ack,
                    Err(e) => {
                        error!("Failed to store game log: {e}");
                        AckType::NackRequeue
                    }
                }
            }
        }),
    )
    .await?;

    info!("Server ready. Commands: pause | resume | quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received. Exiting gracefully.");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match line.trim() {
                    "" => {}
                    "pause" => broadcast_pause(channel.as_ref(), &settings.topology, true).await,
                    "resume" => broadcast_pause(channel.as_ref(), &settings.topology, false).await,
                    "quit" => break,
                    other => warn!("Unknown command: {other}"),
                }
            }
        }
    }

    collector.close().await?;
    channel.close().await?;
    conn.close().await
}

async fn broadcast_pause(channel: &dyn Channel, topology: &Topology, is_paused: bool) {
    let message = GameMessage::Pause(PlayingState { is_paused });
    match publish_message(channel, topology, SERVER_NAME, &message).await {
        Ok(()) => info!(is_paused, "Pause state broadcast"),
        Err(e) => error!("Failed to broadcast pause state: {e}"),
    }
}

/// Logs whatever lands in the dead-letter queue; JSON bodies are shown verbatim.
struct DeadLetterLog;

#[async_trait::async_trait]
impl Dispatch for DeadLetterLog {
    async fn dispatch(&mut self, payload: &[u8]) -> std::result::Result<AckType, CodecError> {
        match serde_json::from_slice::<serde_json::Value>(payload) {
            Ok(body) => info!(size = payload.len(), %body, "Dead-lettered message"),
            Err(_) => info!(size = payload.len(), "Dead-lettered binary message"),
        }
        Ok(AckType::Ack)
    }
}

async fn run_inspector(settings: Settings) -> Result<()> {
    let conn = AmqpConnection::connect(&settings.broker.uri).await?;
    let channel = conn.create_channel().await?;
    declare_exchanges(channel.as_ref(), &settings.topology).await?;
    channel.close().await?;

    let binding = QueueBinding::new(
        settings.topology.dead_letter_exchange.as_str(),
        ExchangeKind::Fanout,
        settings.topology.dead_letter_queue.as_str(),
        "",
        QueueType::Durable,
    );
    let subscription =
        subscribe_dispatch(&conn, &binding, settings.broker.prefetch, DeadLetterLog).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting gracefully.");
    subscription.close().await?;
    conn.close().await
}
