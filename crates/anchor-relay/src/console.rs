//! Operator console
//!
//! Line-oriented commands read from a control stream (stdin in the binary).
//! Each command takes the registry lock once, so it observes and acts on a
//! consistent snapshot.

use crate::registry::Registry;
use anchor_core::{ClientId, RelayError, Result, RoomId};
use serde_json::Value;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

pub const DEFAULT_DISABLE_MESSAGE: &str =
    "You have been disconnected by the server. Try to connect again in a bit!";
pub const DEFAULT_STOP_MESSAGE: &str = "Server restarting. Check back in a bit!";
pub const DELETE_ROOM_MESSAGE: &str = "Deleting your room. Goodbye!";

const HELP: &str = "\
Commands:
  help                          Show this summary
  roomCount                     Number of rooms
  clientCount                   Number of connected clients
  list                          Every room with its members and their data
  quiet                         Toggle quiet mode (traffic logging drops to trace)
  message <clientId> <text>     Send a server message to one client
  messageAll <text>             Send a server message to every client
  disable <clientId> [text]     Message then disable one client
  disableAll [text]             Message then disable every client
  deleteRoom <roomId>           Disable and disconnect every member of a room
  stop [text]                   Message and disconnect every client, then exit
";

/// One parsed console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    RoomCount,
    ClientCount,
    List,
    Quiet,
    Message { target: ClientId, text: String },
    MessageAll { text: String },
    Disable { target: ClientId, text: String },
    DisableAll { text: String },
    DeleteRoom { room: RoomId },
    Stop { text: String },
}

impl Command {
    /// Parse a line. Unknown verbs are `Help`; malformed arguments are a
    /// usage message for the operator.
    pub fn parse(line: &str) -> std::result::Result<Self, String> {
        let line = line.trim();
        let (verb, rest) = split_word(line);
        let command = match verb {
            "roomCount" => Command::RoomCount,
            "clientCount" => Command::ClientCount,
            "list" => Command::List,
            "quiet" => Command::Quiet,
            "message" => {
                let (target, text) = target_and_text(verb, rest)?;
                Command::Message {
                    target,
                    text: required_text(verb, text)?,
                }
            }
            "messageAll" => Command::MessageAll {
                text: required_text(verb, rest)?,
            },
            "disable" => {
                let (target, text) = target_and_text(verb, rest)?;
                Command::Disable {
                    target,
                    text: text_or(text, DEFAULT_DISABLE_MESSAGE),
                }
            }
            "disableAll" => Command::DisableAll {
                text: text_or(rest, DEFAULT_DISABLE_MESSAGE),
            },
            "deleteRoom" => {
                if rest.is_empty() {
                    return Err("usage: deleteRoom <roomId>".to_string());
                }
                Command::DeleteRoom {
                    room: RoomId::from(rest),
                }
            }
            "stop" => Command::Stop {
                text: text_or(rest, DEFAULT_STOP_MESSAGE),
            },
            _ => Command::Help,
        };
        Ok(command)
    }
}

fn split_word(s: &str) -> (&str, &str) {
    match s.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (s, ""),
    }
}

fn target_and_text<'a>(verb: &str, rest: &'a str) -> std::result::Result<(ClientId, &'a str), String> {
    let (id, text) = split_word(rest);
    let target = id
        .parse::<ClientId>()
        .map_err(|_| format!("usage: {} <clientId> <text>", verb))?;
    Ok((target, text))
}

fn required_text(verb: &str, text: &str) -> std::result::Result<String, String> {
    if text.is_empty() {
        return Err(format!("{}: message text required", verb));
    }
    Ok(text.to_string())
}

fn text_or(text: &str, default: &str) -> String {
    let text = if text.is_empty() { default } else { text };
    text.to_string()
}

/// Why [`Console::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleExit {
    /// Operator issued `stop`; every client has been told to disconnect
    Stop,
    /// Control stream reached EOF
    InputClosed,
}

/// Console bound to a registry
pub struct Console {
    registry: Arc<Registry>,
    stop_grace: Duration,
}

impl Console {
    pub fn new(registry: Arc<Registry>, stop_grace: Duration) -> Self {
        Self {
            registry,
            stop_grace,
        }
    }

    /// Read commands until `stop` or EOF, writing replies to `output`
    pub async fn run<R, W>(&self, mut input: R, mut output: W) -> Result<ConsoleExit>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = input
                .read_until(b'\n', &mut line)
                .await
                .map_err(|e| RelayError::ConnectionError(format!("console read failed: {}", e)))?;
            if read == 0 {
                info!("Console input closed");
                return Ok(ConsoleExit::InputClosed);
            }

            let text = String::from_utf8_lossy(&line);
            if text.trim().is_empty() {
                continue;
            }

            let (reply, exit) = match Command::parse(&text) {
                Ok(command) => {
                    let stop = matches!(command, Command::Stop { .. });
                    (self.execute(command).await, stop)
                }
                Err(usage) => (usage, false),
            };
            write_reply(&mut output, &reply).await?;
            if exit {
                return Ok(ConsoleExit::Stop);
            }
        }
    }

    /// Carry out one command and return the operator-facing reply
    pub async fn execute(&self, command: Command) -> String {
        match command {
            Command::Help => HELP.trim_end().to_string(),
            Command::RoomCount => self.registry.lock().await.room_count().to_string(),
            Command::ClientCount => self.registry.lock().await.client_count().to_string(),
            Command::List => self.list().await,
            Command::Quiet => {
                let mut state = self.registry.lock().await;
                let quiet = !state.quiet();
                state.set_quiet(quiet);
                format!("Quiet mode {}", if quiet { "on" } else { "off" })
            }
            Command::Message { target, text } => {
                let packet = anchor_core::Packet::server_message(text);
                match self.registry.lock().await.send_to(target, &packet) {
                    Ok(()) => format!("Sent message to client {}", target),
                    Err(RelayError::ClientNotFound(_)) => not_found_client(target),
                    Err(e) => format!("Failed to message client {}: {}", target, e),
                }
            }
            Command::MessageAll { text } => {
                let packet = anchor_core::Packet::server_message(text);
                let sent = self.registry.lock().await.send_all(&packet);
                format!("Sent message to {} clients", sent)
            }
            Command::Disable { target, text } => {
                match self.registry.lock().await.disable(target, &text) {
                    Ok(()) => format!("Disabled client {}", target),
                    Err(RelayError::ClientNotFound(_)) => not_found_client(target),
                    Err(e) => format!("Failed to disable client {}: {}", target, e),
                }
            }
            Command::DisableAll { text } => {
                let mut state = self.registry.lock().await;
                let mut disabled = 0;
                for id in state.client_ids() {
                    match state.disable(id, &text) {
                        Ok(()) => disabled += 1,
                        Err(e) => warn!("Failed to disable client {}: {}", id, e),
                    }
                }
                format!("Disabled {} clients", disabled)
            }
            Command::DeleteRoom { room } => {
                match self.registry.lock().await.delete_room(&room, DELETE_ROOM_MESSAGE) {
                    Ok(members) => format!("Deleted room {} ({} clients)", room, members.len()),
                    Err(_) => format!("Room {} not found", room),
                }
            }
            Command::Stop { text } => {
                let closing = self.registry.lock().await.shut_down_clients(&text);
                info!("Stopping: waiting for {} clients to disconnect", closing);
                if tokio::time::timeout(self.stop_grace, self.registry.wait_until_empty())
                    .await
                    .is_err()
                {
                    warn!(
                        "Clients still connected after {:?}; stopping anyway",
                        self.stop_grace
                    );
                }
                "Stopped".to_string()
            }
        }
    }

    async fn list(&self) -> String {
        let state = self.registry.lock().await;
        let rooms = state.rooms();
        if rooms.is_empty() {
            return "No rooms".to_string();
        }
        let mut out = String::new();
        for room in rooms {
            let _ = writeln!(out, "Room {} ({} clients)", room.id(), room.len());
            for &member in room.members() {
                let data = state
                    .client(member)
                    .map(|client| Value::Object(client.data().clone()))
                    .unwrap_or(Value::Null);
                let _ = writeln!(out, "  Client {}: {}", member, data);
            }
        }
        out.trim_end().to_string()
    }
}

fn not_found_client(id: ClientId) -> String {
    format!("Client {} not found", id)
}

async fn write_reply<W: AsyncWrite + Unpin>(output: &mut W, reply: &str) -> Result<()> {
    let written = async {
        output.write_all(reply.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await
    }
    .await;
    written.map_err(|e| RelayError::ConnectionError(format!("console write failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Outbound;
    use std::net::SocketAddr;
    use tokio::sync::{Notify, mpsc};

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("roomCount"), Ok(Command::RoomCount));
        assert_eq!(Command::parse("  list \n"), Ok(Command::List));
        assert_eq!(Command::parse("frobnicate"), Ok(Command::Help));
        assert_eq!(Command::parse("ROOMCOUNT"), Ok(Command::Help));
        assert_eq!(
            Command::parse("message 3 hello there"),
            Ok(Command::Message {
                target: ClientId(3),
                text: "hello there".into()
            })
        );
        assert_eq!(
            Command::parse("disable 4"),
            Ok(Command::Disable {
                target: ClientId(4),
                text: DEFAULT_DISABLE_MESSAGE.into()
            })
        );
        assert_eq!(
            Command::parse("stop"),
            Ok(Command::Stop {
                text: DEFAULT_STOP_MESSAGE.into()
            })
        );
        assert_eq!(
            Command::parse("deleteRoom lobby"),
            Ok(Command::DeleteRoom {
                room: RoomId::from("lobby")
            })
        );
    }

    #[test]
    fn test_parse_usage_errors() {
        assert!(Command::parse("message").is_err());
        assert!(Command::parse("message abc hi").is_err());
        assert!(Command::parse("message 3").is_err());
        assert!(Command::parse("messageAll").is_err());
        assert!(Command::parse("disable x").is_err());
        assert!(Command::parse("deleteRoom").is_err());
    }

    async fn registry_with_client() -> (Arc<Registry>, ClientId, mpsc::Receiver<Outbound>) {
        let registry = Arc::new(Registry::new());
        let (tx, rx) = mpsc::channel(16);
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let id = registry
            .register_client(peer, tx, Arc::new(Notify::new()))
            .await;
        (registry, id, rx)
    }

    async fn run_script(registry: Arc<Registry>, script: &str) -> (ConsoleExit, String) {
        let console = Console::new(registry, Duration::from_millis(50));
        let mut output = Vec::new();
        let exit = console.run(script.as_bytes(), &mut output).await.unwrap();
        (exit, String::from_utf8(output).unwrap())
    }

    #[tokio::test]
    async fn test_counts_and_not_found() {
        let (registry, _id, _rx) = registry_with_client().await;
        let (exit, output) =
            run_script(registry, "clientCount\n\nroomCount\nmessage 42 hi\nbogus\n").await;

        assert_eq!(exit, ConsoleExit::InputClosed);
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines[0], "1");
        assert_eq!(lines[1], "0");
        assert_eq!(lines[2], "Client 42 not found");
        assert_eq!(lines[3], "Commands:");
    }

    #[tokio::test]
    async fn test_disable_sends_both_packets() {
        let (registry, id, mut rx) = registry_with_client().await;
        let (_, output) = run_script(registry, &format!("disable {}\n", id)).await;
        assert_eq!(output.trim(), format!("Disabled client {}", id));

        let mut kinds = Vec::new();
        while let Ok(Outbound::Frame(frame)) = rx.try_recv() {
            let value: Value = serde_json::from_str(&frame).unwrap();
            kinds.push(value["type"].as_str().unwrap().to_string());
        }
        assert_eq!(kinds, vec!["SERVER_MESSAGE", "DISABLE_ANCHOR"]);
    }

    #[tokio::test]
    async fn test_quiet_toggles() {
        let (registry, _id, _rx) = registry_with_client().await;
        let (_, output) = run_script(registry.clone(), "quiet\n").await;
        assert_eq!(output.trim(), "Quiet mode on");
        assert!(registry.lock().await.quiet());
    }

    #[tokio::test]
    async fn test_stop_closes_clients_and_returns() {
        let (registry, _id, mut rx) = registry_with_client().await;
        let (exit, output) = run_script(registry, "stop\nclientCount\n").await;

        assert_eq!(exit, ConsoleExit::Stop);
        assert_eq!(output.trim(), "Stopped", "nothing after stop is executed");
        match rx.recv().await {
            Some(Outbound::Frame(frame)) => assert!(frame.contains(DEFAULT_STOP_MESSAGE)),
            other => panic!("Expected message frame, got {:?}", other),
        }
        assert_eq!(rx.recv().await, Some(Outbound::Close));
    }

    #[tokio::test]
    async fn test_list_shows_rooms() {
        let (registry, id, _rx) = registry_with_client().await;
        registry
            .lock()
            .await
            .join_room(id, &RoomId::from("lobby"))
            .unwrap();

        let (_, output) = run_script(registry, "list\n").await;
        assert_eq!(output, format!("Room lobby (1 clients)\n  Client {}: {{}}\n", id));
    }
}
