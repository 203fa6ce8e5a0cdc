use serde::{Deserialize, Serialize};

use markmirror_store::BookmarkNode;
use markmirror_sync::{CoordinatorStatus, RawEvent, StatusMessage};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub pid: u32,
    /// Bookmark tree the file provider reads.
    pub provider: String,
    pub store_path: String,
    /// Schema the mirror's cursor was written under; `None` before the
    /// first sync or while the mirror is not open.
    pub schema_version: Option<u32>,
    pub uptime_secs: u64,
    /// `None` while the mirror is not open.
    pub node_count: Option<u64>,
    pub sync: CoordinatorStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientCommand {
    GetStatus,
    GetNode { id: String },
    /// `None` lists the top-level roots.
    GetChildren { parent_id: Option<String> },
    /// `limit` falls back to `sync.search_limit`.
    Search { term: String, limit: Option<usize> },
    ForceFullSync,
    /// Hand provider events to the daemon; answered once they are applied.
    PushEvents { events: Vec<RawEvent> },
    /// Open a persistent connection that receives every status message.
    Subscribe,
    Ping,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerEvent {
    Status(DaemonStatus),
    Node(Option<BookmarkNode>),
    Nodes(Vec<BookmarkNode>),
    Progress(StatusMessage),
    Ack(String),
    Error(String),
}

impl ServerEvent {
    /// Whether this event ends a request/response exchange.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress(_))
    }
}
