//! One client connection: read a single command line, answer it, and for
//! `Subscribe` keep streaming status until either side goes away.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use markmirror_sync::SyncState;

use crate::{ClientCommand, ServerEvent};

use super::DaemonState;

pub(super) async fn handle_connection(
    stream: UnixStream,
    state: Arc<DaemonState>,
    shutdown_tx: watch::Sender<bool>,
) -> Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut line = String::new();
    if BufReader::new(read_half).read_line(&mut line).await? == 0 {
        return Ok(());
    }

    let command = match serde_json::from_str::<ClientCommand>(line.trim()) {
        Ok(command) => command,
        Err(err) => {
            warn!(%err, "rejecting malformed daemon command");
            return send_event(&mut writer, ServerEvent::Error(format!("bad command: {err}"))).await;
        }
    };
    debug!(?command, "daemon command");

    match command {
        ClientCommand::Subscribe => stream_status(&mut writer, &state, shutdown_tx.subscribe()).await,
        ClientCommand::Shutdown => {
            // The ack goes out before the listener stops.
            let sent = send_event(&mut writer, ServerEvent::Ack("shutdown requested".into())).await;
            let _ = shutdown_tx.send(true);
            sent
        }
        ClientCommand::PushEvents { events } => {
            let reply = push_events(&state, events).await;
            send_event(&mut writer, reply).await
        }
        query => send_event(&mut writer, answer(&state, query)).await,
    }
}

/// Answer a command that needs nothing but a read of the daemon state.
fn answer(state: &DaemonState, command: ClientCommand) -> ServerEvent {
    let nodes = |result: markmirror_sync::Result<_>| match result {
        Ok(nodes) => ServerEvent::Nodes(nodes),
        Err(err) => ServerEvent::Error(err.to_string()),
    };
    match command {
        ClientCommand::GetStatus => ServerEvent::Status(state.status()),
        ClientCommand::Ping => ServerEvent::Ack("pong".into()),
        ClientCommand::GetNode { id } => match state.sync.get_node(&id) {
            Ok(node) => ServerEvent::Node(node),
            Err(err) => ServerEvent::Error(err.to_string()),
        },
        ClientCommand::GetChildren { parent_id } => nodes(state.sync.get_children(parent_id.as_deref())),
        ClientCommand::Search { term, limit } => {
            let limit = limit.unwrap_or(state.config.sync.search_limit);
            nodes(state.sync.search(&term, limit))
        }
        ClientCommand::ForceFullSync => match state.sync.force_full_sync() {
            Ok(()) => {
                info!("full sync requested by client");
                ServerEvent::Ack("full sync scheduled".into())
            }
            Err(err) => ServerEvent::Error(err.to_string()),
        },
        other => ServerEvent::Error(format!("{other:?} cannot be answered inline")),
    }
}

/// Hand events to the provider and reply once the coordinator has drained
/// them.  A degraded mirror drops them; the recovery sync reads the tree.
async fn push_events(state: &DaemonState, events: Vec<markmirror_sync::RawEvent>) -> ServerEvent {
    let delivered = state.provider.push(events);
    match state.sync.flush().await {
        Ok(()) if state.sync.status().state == SyncState::Degraded => ServerEvent::Error(format!(
            "mirror degraded; {delivered} events left to the recovery sync"
        )),
        Ok(()) => ServerEvent::Ack(format!("{delivered} events applied")),
        Err(err) => ServerEvent::Error(err.to_string()),
    }
}

/// A status snapshot, then every status message until the client hangs up
/// or the daemon stops.
async fn stream_status(
    writer: &mut OwnedWriteHalf,
    state: &DaemonState,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let mut messages = state.sync.subscribe_status();
    send_event(writer, ServerEvent::Status(state.status())).await?;
    loop {
        let message = tokio::select! {
            message = messages.recv() => message,
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return Ok(());
                }
                continue;
            }
        };
        match message {
            Ok(message) => {
                if send_event(writer, ServerEvent::Progress(message)).await.is_err() {
                    debug!("status subscriber went away");
                    return Ok(());
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(n, "status subscriber lagged; messages dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

async fn send_event(writer: &mut OwnedWriteHalf, event: ServerEvent) -> Result<()> {
    let mut encoded = serde_json::to_vec(&event)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}
