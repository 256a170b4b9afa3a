//! Interactive REPL.

use crate::commands::{self, Topic};
use colored::Colorize;
use relay_client::Client;
use relay_protocol::{names, Envelope};
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};
use serde_json::{json, Value};
use std::time::Duration;

/// How long to collect events after each line before prompting again.
const EVENT_WINDOW: Duration = Duration::from_millis(150);

const HELP_TEXT: &str = r#"
Available commands:
  help                          Show this help

  room <name>                   Create a room
  name <name>                   Set your display name
  say <room_id> <body...>       Post a message to a room

  watch rooms                   Subscribe to rooms
  watch users                   Subscribe to users
  watch messages <room_id>      Subscribe to a room's messages
  unwatch <topic>               Cancel a subscription

  send <name...> [json]         Send a raw command, e.g. send room add {"name":"x"}
  events                        Print events received so far

  quit, exit                    Exit the REPL
"#;

/// A parsed REPL line.
#[derive(Debug, PartialEq)]
enum Line {
    Help,
    Quit,
    Events,
    Send(Envelope),
    Usage(&'static str),
    Unknown(String),
}

pub async fn run(client: Client, url: &str) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "relay CLI".bold().cyan());
    println!("Connecting to {}...", url);

    client.connect().await?;
    println!("{}", "Connected!".green());

    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(config)?;

    let history_path = std::env::var("HOME")
        .map(|h| std::path::PathBuf::from(h).join(".relay_history"))
        .unwrap_or_else(|_| ".relay_history".into());
    let _ = rl.load_history(&history_path);

    println!("Type 'help' for available commands.\n");

    loop {
        let prompt = format!("{} ", "relay>".cyan());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match parse_line(line) {
                    Line::Help => println!("{}", HELP_TEXT),
                    Line::Quit => break,
                    Line::Usage(usage) => println!("Usage: {}\n", usage),
                    Line::Unknown(cmd) => {
                        println!("Unknown command: {}. Type 'help' for help.\n", cmd)
                    }
                    Line::Events => {}
                    Line::Send(envelope) => {
                        if let Err(e) = client.connection().send(&envelope).await {
                            println!("{}: {}\n", "Error".red(), e);
                            if !client.is_connected() {
                                break;
                            }
                            continue;
                        }
                    }
                }

                if !print_events(&client).await {
                    println!("{}", "Connection closed by server".red());
                    break;
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                println!("{}: {:?}", "Error".red(), err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);

    let _ = client.close().await;
    println!("{}", "Disconnected.".dimmed());

    Ok(())
}

/// Prints events that arrive within the window. Returns false once the
/// connection is gone.
async fn print_events(client: &Client) -> bool {
    loop {
        match client.recv_within(EVENT_WINDOW).await {
            Ok(Some(event)) => println!("{}", commands::format_event(&event)),
            Ok(None) => return true,
            Err(_) => return false,
        }
    }
}

fn parse_line(line: &str) -> Line {
    let (cmd, rest) = match line.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (cmd.to_lowercase(), rest.trim()),
        None => (line.to_lowercase(), ""),
    };

    match cmd.as_str() {
        "help" | "?" => Line::Help,
        "quit" | "exit" | "q" => Line::Quit,
        "events" | "e" => Line::Events,

        "room" => {
            if rest.is_empty() {
                return Line::Usage("room <name>");
            }
            Line::Send(Envelope::new(names::ROOM_ADD, json!({ "name": rest })))
        }

        "name" => {
            if rest.is_empty() {
                return Line::Usage("name <name>");
            }
            Line::Send(Envelope::new(names::USER_EDIT, json!({ "name": rest })))
        }

        "say" => match rest.split_once(char::is_whitespace) {
            Some((room, body)) => Line::Send(Envelope::new(
                names::MESSAGE_ADD,
                json!({ "roomId": room, "body": body }),
            )),
            None => Line::Usage("say <room_id> <body...>"),
        },

        "watch" | "w" => {
            let mut args = rest.split_whitespace();
            let envelope = args
                .next()
                .and_then(Topic::parse)
                .and_then(|topic| topic.subscribe_envelope(args.next()));
            match envelope {
                Some(envelope) => Line::Send(envelope),
                None => Line::Usage("watch rooms|users|messages <room_id>"),
            }
        }

        "unwatch" => match Topic::parse(rest) {
            Some(topic) => Line::Send(topic.unsubscribe_envelope()),
            None => Line::Usage("unwatch rooms|users|messages"),
        },

        "send" => match split_raw(rest) {
            Some(envelope) => Line::Send(envelope),
            None => Line::Usage("send <name...> [json]"),
        },

        _ => Line::Unknown(cmd),
    }
}

/// Splits `room add {"name":"x"}` into a command name and JSON payload.
/// The payload starts at the first `{`, `[` or `"`; without one it is null.
fn split_raw(rest: &str) -> Option<Envelope> {
    let (name, data) = match rest.find(|c: char| matches!(c, '{' | '[' | '"')) {
        Some(at) => {
            let data: Value = serde_json::from_str(&rest[at..]).ok()?;
            (rest[..at].trim(), data)
        }
        None => (rest, Value::Null),
    };
    if name.is_empty() {
        return None;
    }
    Some(Envelope::new(name, data))
}
