//! `relay-cli`: talk to a running relay from a terminal.
//!
//! With no subcommand it opens a REPL; otherwise it runs one command and exits.

mod commands;
mod repl;

use clap::{Parser, Subcommand};
use colored::Colorize;
use commands::Topic;
use relay_client::{Client, ClientError, ConnectionConfig};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Upper bound on a single wait in `watch`; expiry just loops.
const IDLE_POLL: Duration = Duration::from_secs(3600);

#[derive(Parser)]
#[command(name = "relay-cli")]
#[command(about = "Command-line interface for the relay")]
#[command(version)]
struct Cli {
    /// Server URL
    #[arg(short, long, env = "RELAY_URL", default_value = "ws://127.0.0.1:4000")]
    server: String,

    /// Connect timeout in seconds
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Interactive session (the default)
    Repl,

    /// Send a raw command
    Send {
        /// Command name, e.g. "room add"
        name: String,
        /// Payload as JSON (or @file.json)
        data: Option<String>,
    },

    /// Create a room
    AddRoom {
        /// Room name
        name: String,
    },

    /// Post a message to a room
    Say {
        /// Room ID
        room: String,
        /// Message body
        body: String,
        /// Display name to post under
        #[arg(long = "as")]
        author: Option<String>,
    },

    /// Subscribe to a topic and print events until Ctrl+C
    Watch {
        /// Topic to watch
        #[arg(value_enum)]
        topic: Topic,
        /// Room ID (required for messages)
        #[arg(long)]
        room: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let client = Client::new(
        ConnectionConfig::new(cli.server.clone())
            .with_connect_timeout(Duration::from_secs(cli.connect_timeout)),
    );

    let outcome = match cli.command.unwrap_or(Commands::Repl) {
        Commands::Repl => return repl::run(client, &cli.server).await,
        Commands::Watch { topic, room } => watch(&client, topic, room.as_deref()).await,
        cmd => match dial(&client).await {
            Ok(()) => {
                let output = commands::execute(&client, cmd).await;
                let _ = client.close().await;
                output.map(|text| println!("{}", text))
            }
            Err(e) => Err(e),
        },
    };

    if let Err(e) = outcome {
        eprintln!("{} {}", "error:".red().bold(), e);
        std::process::exit(1);
    }
    Ok(())
}

async fn dial(client: &Client) -> Result<(), Box<dyn std::error::Error>> {
    client
        .connect()
        .await
        .map_err(|e| format!("cannot reach relay: {}", e).into())
}

/// Prints events for one topic until the relay hangs up or Ctrl+C, then
/// cancels the subscription.
async fn watch(
    client: &Client,
    topic: Topic,
    room: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let subscribe = topic
        .subscribe_envelope(room)
        .ok_or("watching messages needs --room <room_id>")?;

    dial(client).await?;
    client.connection().send(&subscribe).await?;
    eprintln!(
        "{} {} {}",
        "watching".green(),
        topic.label().cyan(),
        "(Ctrl+C to stop)".dimmed()
    );

    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    loop {
        tokio::select! {
            event = client.recv_timeout(IDLE_POLL) => match event {
                Ok(envelope) => println!("{}", commands::format_event(&envelope)),
                Err(ClientError::Timeout) => {}
                Err(ClientError::ConnectionClosed) => {
                    eprintln!("{}", "relay closed the connection".red());
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            },
            _ = &mut interrupted => break,
        }
    }

    client.connection().send(&topic.unsubscribe_envelope()).await?;
    client.close().await?;
    Ok(())
}
