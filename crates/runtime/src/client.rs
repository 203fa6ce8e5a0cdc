use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use markmirror_store::BookmarkNode;
use markmirror_sync::RawEvent;

use crate::{ClientCommand, DaemonStatus, ServerEvent};

/// Typed access to a running mirror daemon.  Every call opens its own
/// connection, so clones are independent.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket_path: PathBuf,
}

/// One command sent, its response lines still to read.
struct Exchange {
    reader: BufReader<OwnedReadHalf>,
    // Held so the socket stays fully open while the reply streams in.
    _writer: OwnedWriteHalf,
    line: String,
}

impl Exchange {
    async fn open(socket_path: &Path, command: &ClientCommand) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("connecting to mirror daemon at {}", socket_path.display()))?;
        let (read_half, mut write_half) = stream.into_split();
        let mut request = serde_json::to_vec(command)?;
        request.push(b'\n');
        write_half.write_all(&request).await?;
        write_half.flush().await?;
        Ok(Self {
            reader: BufReader::new(read_half),
            _writer: write_half,
            line: String::new(),
        })
    }

    /// Next event, or `None` once the daemon closes the connection.  Lines
    /// that fail to decode are skipped when `lenient`.
    async fn next(&mut self, lenient: bool) -> Result<Option<ServerEvent>> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line).await? == 0 {
                return Ok(None);
            }
            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str(trimmed) {
                Ok(event) => return Ok(Some(event)),
                Err(err) if lenient => warn!(%err, "skipping undecodable daemon line"),
                Err(err) => return Err(err).context("decoding daemon response"),
            }
        }
    }
}

impl DaemonClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Wait for the daemon socket to accept connections, doubling the pause
    /// between attempts up to two seconds.
    pub async fn connect_with_backoff(&self, max_attempts: usize) -> Result<()> {
        let attempts = max_attempts.max(1);
        let mut delay = Duration::from_millis(100);
        for attempt in 1..=attempts {
            match UnixStream::connect(&self.socket_path).await {
                Ok(_) => return Ok(()),
                Err(err) if attempt == attempts => {
                    return Err(err).with_context(|| {
                        format!("mirror daemon not reachable at {}", self.socket_path.display())
                    });
                }
                Err(err) => {
                    debug!(attempt, %err, "daemon socket not ready");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(2));
                }
            }
        }
        Ok(())
    }

    pub async fn ping(&self) -> Result<String> {
        self.ack(ClientCommand::Ping).await
    }

    pub async fn get_status(&self) -> Result<DaemonStatus> {
        match self.request(ClientCommand::GetStatus).await? {
            ServerEvent::Status(status) => Ok(status),
            other => bail!("unexpected status response: {other:?}"),
        }
    }

    pub async fn get_node(&self, id: &str) -> Result<Option<BookmarkNode>> {
        let command = ClientCommand::GetNode { id: id.to_string() };
        match self.request(command).await? {
            ServerEvent::Node(node) => Ok(node),
            other => bail!("unexpected node response: {other:?}"),
        }
    }

    pub async fn get_children(&self, parent_id: Option<&str>) -> Result<Vec<BookmarkNode>> {
        let command = ClientCommand::GetChildren {
            parent_id: parent_id.map(str::to_string),
        };
        self.nodes(command).await
    }

    pub async fn search(&self, term: &str, limit: Option<usize>) -> Result<Vec<BookmarkNode>> {
        let command = ClientCommand::Search {
            term: term.to_string(),
            limit,
        };
        self.nodes(command).await
    }

    pub async fn force_full_sync(&self) -> Result<String> {
        self.ack(ClientCommand::ForceFullSync).await
    }

    /// Returns once the daemon has applied the events.
    pub async fn push_events(&self, events: Vec<RawEvent>) -> Result<String> {
        self.ack(ClientCommand::PushEvents { events }).await
    }

    pub async fn graceful_shutdown(&self) -> Result<()> {
        self.ack(ClientCommand::Shutdown).await.map(drop)
    }

    /// Stream the daemon's status snapshot and every following status
    /// message into `tx`.  Runs until the connection drops or `tx` closes.
    pub async fn subscribe(&self, tx: mpsc::UnboundedSender<ServerEvent>) -> Result<()> {
        let mut exchange = Exchange::open(&self.socket_path, &ClientCommand::Subscribe).await?;
        while let Some(event) = exchange.next(true).await? {
            if tx.send(event).is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn nodes(&self, command: ClientCommand) -> Result<Vec<BookmarkNode>> {
        match self.request(command).await? {
            ServerEvent::Nodes(nodes) => Ok(nodes),
            other => bail!("unexpected node list response: {other:?}"),
        }
    }

    async fn ack(&self, command: ClientCommand) -> Result<String> {
        match self.request(command).await? {
            ServerEvent::Ack(msg) => Ok(msg),
            other => bail!("unexpected response: {other:?}"),
        }
    }

    /// Send one command and return its terminal response, skipping any
    /// progress lines before it.  A daemon-side error becomes `Err`.
    async fn request(&self, command: ClientCommand) -> Result<ServerEvent> {
        let mut exchange = Exchange::open(&self.socket_path, &command).await?;
        while let Some(event) = exchange.next(false).await? {
            match event {
                ServerEvent::Error(msg) => bail!("daemon error: {msg}"),
                event if event.is_terminal() => return Ok(event),
                _ => {}
            }
        }
        bail!("daemon closed the connection without answering; check daemon logs")
    }
}
