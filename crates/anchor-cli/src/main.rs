//! Anchor relay server
//!
//! Listens for game clients, relays their packets within rooms, and reads
//! operator commands from stdin. Every option can also be set through its
//! `ANCHOR_RELAY_*` environment variable; flags win over the environment.

use anchor_relay::RelayServer;
use anchor_relay::config::{RelayConfig, parse_secs};
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Room-based relay for Anchor game sessions
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Interface to bind [default: 0.0.0.0]
    #[arg(long, env = "ANCHOR_RELAY_BIND")]
    bind: Option<String>,

    /// Listen port, 0 picks a free one [default: 43384]
    #[arg(long, env = "ANCHOR_RELAY_PORT")]
    port: Option<u16>,

    /// Per-client outbound queue capacity [default: 256]
    #[arg(long, env = "ANCHOR_RELAY_QUEUE")]
    queue: Option<usize>,

    /// Bytes a client may buffer without a newline before it is dropped
    #[arg(long, env = "ANCHOR_RELAY_MAX_BUFFER")]
    max_buffer: Option<usize>,

    /// Seconds of silence before a client is dropped
    #[arg(long, env = "ANCHOR_RELAY_IDLE_TIMEOUT", value_parser = parse_secs)]
    idle_timeout: Option<Duration>,

    /// Ban a peer's address after this many consecutive invalid frames
    #[arg(long, env = "ANCHOR_RELAY_BAN_INVALID_AFTER")]
    ban_invalid_after: Option<u32>,

    /// Seconds between heartbeats [default: 30]
    #[arg(long, env = "ANCHOR_RELAY_HEARTBEAT", value_parser = parse_secs)]
    heartbeat: Option<Duration>,

    /// Path of the status document for the health watcher
    #[arg(long, env = "ANCHOR_RELAY_STATUS_FILE")]
    status_file: Option<PathBuf>,

    /// Seconds between status document writes [default: 5]
    #[arg(long, env = "ANCHOR_RELAY_STATUS_INTERVAL", value_parser = parse_secs)]
    status_interval: Option<Duration>,

    /// Seconds `stop` waits for clients to disconnect [default: 5]
    #[arg(long, env = "ANCHOR_RELAY_STOP_GRACE", value_parser = parse_secs)]
    stop_grace: Option<Duration>,

    /// Debug logging unless RUST_LOG is set
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> RelayConfig {
        let defaults = RelayConfig::default();
        RelayConfig {
            bind_address: self.bind.unwrap_or(defaults.bind_address),
            port: self.port.unwrap_or(defaults.port),
            outbound_queue_capacity: self.queue.unwrap_or(defaults.outbound_queue_capacity),
            max_buffered_bytes: self.max_buffer.or(defaults.max_buffered_bytes),
            idle_timeout: self.idle_timeout.or(defaults.idle_timeout),
            ban_invalid_after: self.ban_invalid_after.or(defaults.ban_invalid_after),
            heartbeat_interval: self.heartbeat.unwrap_or(defaults.heartbeat_interval),
            status_file: self.status_file.or(defaults.status_file),
            status_interval: self.status_interval.unwrap_or(defaults.status_interval),
            stop_grace: self.stop_grace.unwrap_or(defaults.stop_grace),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let server = RelayServer::new(args.into_config())?;
    let listener = server.bind().await?;
    info!("Type `help` for operator commands");

    server
        .run(listener, BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await?;

    info!("Relay stopped");
    // A pending stdin read would otherwise hold the runtime open on exit
    std::process::exit(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_command_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::try_parse_from([
            "anchor-relay",
            "--bind",
            "127.0.0.1",
            "--port",
            "0",
            "--heartbeat",
            "2.5",
            "--ban-invalid-after",
            "3",
            "--status-file",
            "/tmp/stats.json",
            "-v",
        ])
        .unwrap();
        assert!(args.verbose);

        let config = args.into_config();
        assert_eq!(config.listen_address(), "127.0.0.1:0");
        assert_eq!(config.heartbeat_interval, Duration::from_millis(2500));
        assert_eq!(config.ban_invalid_after, Some(3));
        assert_eq!(config.status_file, Some(PathBuf::from("/tmp/stats.json")));
        assert_eq!(config.outbound_queue_capacity, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_values_are_rejected() {
        for (flag, value) in [
            ("--heartbeat", "1e20"),
            ("--idle-timeout", "-1"),
            ("--stop-grace", "soon"),
            ("--port", "70000"),
            ("--queue", "many"),
        ] {
            assert!(
                Args::try_parse_from(["anchor-relay", flag, value]).is_err(),
                "{} {} should be rejected",
                flag,
                value
            );
        }
        assert!(Args::try_parse_from(["anchor-relay", "--bogus"]).is_err());
    }
}
