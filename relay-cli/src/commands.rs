//! Command execution and event formatting.

use crate::Commands;
use clap::ValueEnum;
use colored::Colorize;
use relay_client::Client;
use relay_protocol::{names, Envelope};
use serde_json::{json, Value};
use std::time::Duration;

/// How long a one-shot command waits for the relay to report an error.
const ERROR_WINDOW: Duration = Duration::from_millis(300);

/// A live topic a client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Topic {
    Rooms,
    Users,
    Messages,
}

impl Topic {
    pub fn label(self) -> &'static str {
        match self {
            Topic::Rooms => "rooms",
            Topic::Users => "users",
            Topic::Messages => "messages",
        }
    }

    /// Parses a topic name as typed in the REPL.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "rooms" | "room" => Some(Topic::Rooms),
            "users" | "user" => Some(Topic::Users),
            "messages" | "message" | "msgs" => Some(Topic::Messages),
            _ => None,
        }
    }

    /// Builds the subscribe command. Messages need a room.
    pub fn subscribe_envelope(self, room: Option<&str>) -> Option<Envelope> {
        match self {
            Topic::Rooms => Some(Envelope::named(names::ROOM_SUBSCRIBE)),
            Topic::Users => Some(Envelope::named(names::USER_SUBSCRIBE)),
            Topic::Messages => {
                room.map(|id| Envelope::new(names::MESSAGE_SUBSCRIBE, json!({ "roomId": id })))
            }
        }
    }

    pub fn unsubscribe_envelope(self) -> Envelope {
        match self {
            Topic::Rooms => Envelope::named(names::ROOM_UNSUBSCRIBE),
            Topic::Users => Envelope::named(names::USER_UNSUBSCRIBE),
            Topic::Messages => Envelope::named(names::MESSAGE_UNSUBSCRIBE),
        }
    }
}

/// Executes a one-shot command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Repl | Commands::Watch { .. } => unreachable!(),

        Commands::Send { name, data } => {
            let payload = data.map(|d| parse_json_arg(&d)).transpose()?;
            client.send(&name, payload.unwrap_or(Value::Null)).await?;
            check_rejected(client).await?;
            Ok(format!("{} {}", "Sent".green(), name.cyan()))
        }

        Commands::AddRoom { name } => {
            client.add_room(&name).await?;
            check_rejected(client).await?;
            Ok(format!("{} room {}", "Added".green(), name.cyan()))
        }

        Commands::Say { room, body, author } => {
            if let Some(ref author) = author {
                client.edit_user(author).await?;
            }
            client.add_message(&room, &body).await?;
            check_rejected(client).await?;
            Ok(format!(
                "{} to {} as {}",
                "Posted".green(),
                room.cyan(),
                author.as_deref().unwrap_or("anonymous").yellow()
            ))
        }
    }
}

/// Fails if the relay answers with an `error` event shortly after a send.
/// Silence means the command was accepted.
async fn check_rejected(client: &Client) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(event) = client.recv_within(ERROR_WINDOW).await? {
        if let Some(message) = event.error_message() {
            return Err(message.to_string().into());
        }
    }
    Ok(())
}

/// Formats an event for display: `<name> <data>`.
pub fn format_event(event: &Envelope) -> String {
    if let Some(message) = event.error_message() {
        return format!("{} {}", "error".red().bold(), message);
    }
    let name = match event.name().rsplit_once(' ').map(|(_, verb)| verb) {
        Some("add") => event.name().green(),
        Some("edit") => event.name().yellow(),
        Some("remove") => event.name().red(),
        _ => event.name().normal(),
    };
    format!("{} {}", name, event.data())
}

/// Parses a JSON argument (either inline JSON or @file.json).
pub fn parse_json_arg(arg: &str) -> Result<Value, Box<dyn std::error::Error>> {
    if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(serde_json::from_str(arg)?)
    }
}
