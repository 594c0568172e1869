use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use peerwire_proto::{JoinRequest, PollRequest};
use serde::Serialize;
use tokio::time::Duration;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "peerwire-road")]
#[command(about = "Peerwire signaling relay and debug client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the relay (default when no command is given)
    Serve {
        /// Port to listen on; overrides PEERWIRE_ROAD_PORT
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Talk to a running relay and print the JSON it returns
    Debug {
        /// Relay base URL
        #[arg(short, long, default_value = "http://localhost:8787")]
        url: String,

        #[command(subcommand)]
        command: DebugCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum DebugCommands {
    /// Join a room as the given peer
    Join {
        #[arg(short, long)]
        room: String,
        #[arg(short, long)]
        peer: String,
        /// Register as the room host
        #[arg(long)]
        host: bool,
    },
    /// Poll a peer's mailbox once
    Poll {
        #[arg(short, long)]
        room: String,
        #[arg(short, long)]
        peer: String,
        /// Cursor returned by a previous poll
        #[arg(long, default_value_t = 0)]
        since: u64,
    },
    /// Show the relay's view of a room
    Room {
        #[arg(short, long)]
        room: String,
    },
}

pub async fn run_debug_client(url: String, command: DebugCommands) -> Result<()> {
    let base = url.trim_end_matches('/').to_string();
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .context("failed to build HTTP client")?;

    let response = match command {
        DebugCommands::Join { room, peer, host } => {
            post(
                &client,
                &format!("{base}/signal/join"),
                &JoinRequest {
                    room_id: room,
                    peer_id: peer,
                    is_host: host,
                },
            )
            .await?
        }
        DebugCommands::Poll { room, peer, since } => {
            post(
                &client,
                &format!("{base}/signal/poll"),
                &PollRequest {
                    room_id: room,
                    peer_id: peer,
                    last_poll: since,
                },
            )
            .await?
        }
        DebugCommands::Room { room } => {
            let endpoint = format!("{base}/rooms/{room}");
            debug!("fetching {}", endpoint);
            client
                .get(&endpoint)
                .send()
                .await
                .with_context(|| format!("request to {endpoint} failed; is the relay running?"))?
        }
    };

    let status = response.status();
    let body: serde_json::Value = response
        .json()
        .await
        .context("relay returned a non-JSON body")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    if !status.is_success() {
        bail!("relay answered {status}");
    }
    Ok(())
}

async fn post<T: Serialize>(
    client: &reqwest::Client,
    endpoint: &str,
    body: &T,
) -> Result<reqwest::Response> {
    debug!("posting to {}", endpoint);
    client
        .post(endpoint)
        .json(body)
        .send()
        .await
        .with_context(|| format!("request to {endpoint} failed; is the relay running?"))
}
