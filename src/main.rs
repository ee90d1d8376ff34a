use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use meet_client::session::SessionNotice;
use meet_client::{
    ClientConfig, SessionActor, SessionHandle, SessionParams, SessionSnapshot, SignalingChannel,
    WsRelayLink,
};

/// Headless chat-only room client.
#[derive(Parser, Debug)]
#[command(name = "meet-client", version, about)]
struct Args {
    /// Room to join (or create with --create)
    #[arg(long)]
    room: String,

    /// Display name shown to other participants
    #[arg(long)]
    name: String,

    /// Create the room and become its admin
    #[arg(long)]
    create: bool,

    /// Relay websocket URL (overrides MEET_SERVER_URL)
    #[arg(long)]
    server: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meet_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = ClientConfig::from_env().context("loading configuration")?;
    if let Some(server) = args.server {
        config.server_url = server;
    }
    info!(server_url = %config.server_url, room = %args.room, "Connecting to relay");

    let link = WsRelayLink::connect(&config.server_url, config.reconnect_policy())
        .await
        .context("connecting to relay")?;
    let mut connection = link.monitor().subscribe();
    let signaling = SignalingChannel::new(Arc::new(link), config.request_policy());

    let cancel_token = CancellationToken::new();
    let (handle, task) = SessionActor::spawn(
        SessionParams {
            room_id: args.room,
            display_name: args.name,
            create: args.create,
        },
        config,
        signaling,
        None,
        cancel_token.clone(),
    );

    tokio::spawn(async move {
        while connection.changed().await.is_ok() {
            let status = connection.borrow_and_update().clone();
            info!(state = %status.state, attempts = status.reconnect_attempts, "Relay connection");
        }
    });
    tokio::spawn(watch_session(handle.clone()));
    tokio::spawn(watch_notices(handle.clone()));

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !run_command(&handle, line.trim()).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Failed to read stdin");
                    break;
                }
            },
            () = cancel_token.cancelled() => break,
        }
        if handle.snapshot().is_terminated() {
            break;
        }
    }

    handle.leave().await?;
    task.await.context("session task panicked")?;
    if let Some(reason) = handle.snapshot().last_error {
        warn!(%reason, "Session ended with an error");
    }
    Ok(())
}

/// Returns false when the user asked to leave.
async fn run_command(handle: &SessionHandle, line: &str) -> bool {
    let result = match line.split_once(' ').unwrap_or((line, "")) {
        ("", _) => return true,
        ("/leave", _) => return false,
        ("/admit", peer_id) => handle.admit(peer_id.trim()).await,
        ("/name", name) => handle.set_display_name(name).await,
        ("/pending", _) => match handle.list_pending().await {
            Ok(pending) => {
                for request in pending {
                    info!(peer_id = %request.peer_id, name = %request.name, "Waiting for admission");
                }
                Ok(())
            }
            Err(e) => Err(e),
        },
        ("/hand", _) => {
            let raised = handle
                .snapshot()
                .self_id
                .as_deref()
                .and_then(|id| handle.snapshot().peer(id).map(|p| p.media.hand_raised))
                .unwrap_or(false);
            handle.set_hand_raised(!raised).await
        }
        _ => handle.send_chat(line).await,
    };
    if let Err(e) = result {
        warn!(error = %e, "Command failed");
    }
    true
}

async fn watch_session(handle: SessionHandle) {
    let mut rx = handle.subscribe();
    let mut previous: Option<SessionSnapshot> = None;
    loop {
        let current = rx.borrow_and_update().clone();
        log_changes(previous.as_ref(), &current);
        if current.is_terminated() {
            break;
        }
        previous = Some(current);
        if rx.changed().await.is_err() {
            break;
        }
    }
}

fn log_changes(previous: Option<&SessionSnapshot>, current: &SessionSnapshot) {
    if previous.map(|p| &p.status) != Some(&current.status) {
        info!(status = ?current.status, "Session status");
    }

    let seen = previous.map_or(0, |p| p.messages.len());
    for message in current.messages.iter().skip(seen) {
        info!(from = %message.sender_name, at = %message.timestamp, "{}", message.text);
    }

    let before: Vec<&str> = previous
        .map(|p| p.peers.iter().map(|peer| peer.id.as_str()).collect())
        .unwrap_or_default();
    for peer in &current.peers {
        if !before.contains(&peer.id.as_str()) {
            info!(peer_id = %peer.id, name = %peer.display_name, admin = peer.is_admin, "Participant present");
        }
    }
}

async fn watch_notices(handle: SessionHandle) {
    let mut notices = handle.notices();
    while let Ok(notice) = notices.recv().await {
        match notice {
            SessionNotice::JoinRequest { peer_id, name } => {
                info!(%peer_id, %name, "Join request (type /admit {})", peer_id);
            }
            other => info!(notice = ?other, "Session notice"),
        }
    }
}
