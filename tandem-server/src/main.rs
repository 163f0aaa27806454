//! Tandem sync server.
//!
//! Hosts collaborative text rooms over WebSockets. Clients connect to
//! `ws://<bind>/<room>`; rooms are created on first join and discarded when
//! the last client leaves.
//!
//! Usage:
//!   RUST_LOG=info tandem-server --bind 0.0.0.0:9090
//!   tandem-server --presence-ttl-secs 10 --idle-timeout-secs 60

use std::time::Duration;

use clap::Parser;
use log::info;
use tandem_collab::{ServerConfig, SessionConfig, SyncServer};

/// Real-time collaborative editing server.
#[derive(Parser, Debug)]
#[command(name = "tandem-server")]
#[command(about = "WebSocket sync server for shared text rooms")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// Maximum clients per room
    #[arg(long, default_value_t = 100)]
    max_clients: usize,

    /// Drop connections silent for this many seconds
    #[arg(long, default_value_t = 30)]
    idle_timeout_secs: u64,

    /// Messages queued per client before it is evicted
    #[arg(long, default_value_t = 256)]
    outbound_capacity: usize,

    /// Expire presence not refreshed for this many seconds
    #[arg(long, default_value_t = 30)]
    presence_ttl_secs: u64,

    /// How often rooms sweep stale presence, in milliseconds
    #[arg(long, default_value_t = 5000)]
    sweep_interval_ms: u64,

    /// Drop buffered edits whose dependency never arrives after this many seconds
    #[arg(long, default_value_t = 60)]
    orphan_max_age_secs: u64,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            max_clients_per_room: self.max_clients,
            idle_timeout_secs: self.idle_timeout_secs,
            session: SessionConfig {
                outbound_capacity: self.outbound_capacity,
                presence_ttl: Duration::from_secs(self.presence_ttl_secs),
                sweep_interval: Duration::from_millis(self.sweep_interval_ms.max(1)),
                orphan_max_age: Duration::from_secs(self.orphan_max_age_secs),
                ..SessionConfig::default()
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();
    let config = args.server_config();

    info!(
        "Starting tandem-server on {} (max {} clients/room, idle timeout {}s)",
        config.bind_addr, config.max_clients_per_room, config.idle_timeout_secs
    );

    let server = SyncServer::new(config);
    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}
