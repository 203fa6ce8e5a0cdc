//! The external bookmark source the mirror follows.
//!
//! A provider exposes two things: a full tree read, used by full syncs, and
//! a stream of change notifications, used by steady-state sync.  Both shapes
//! follow the browser bookmarks API closely so a real extension bridge can be
//! plugged in behind [`BookmarkProvider`] without translation.

mod file;
mod memory;

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use markmirror_store::NodeKind;

use crate::error::Result;

pub use file::FileTreeProvider;
pub use memory::MemoryProvider;

/// One node of the provider's tree, as returned by a full tree read or
/// carried by a `created` event.  A node without a `url` is a folder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderNode {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_added: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<ProviderNode>>,
}

impl ProviderNode {
    pub fn folder(id: impl Into<String>, title: impl Into<String>, children: Vec<Self>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            index: None,
            title: title.into(),
            url: None,
            date_added: None,
            children: Some(children),
        }
    }

    pub fn bookmark(id: impl Into<String>, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            index: None,
            title: title.into(),
            url: Some(url.into()),
            date_added: None,
            children: None,
        }
    }

    pub fn kind(&self) -> NodeKind {
        if self.url.is_some() {
            NodeKind::Bookmark
        } else {
            NodeKind::Folder
        }
    }

    pub fn children(&self) -> &[ProviderNode] {
        self.children.as_deref().unwrap_or(&[])
    }

    /// Total number of nodes in this subtree, including `self`.
    pub fn count(&self) -> usize {
        let mut total = 0;
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            total += 1;
            stack.extend(node.children());
        }
        total
    }
}

/// A change notification as delivered by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    /// Provider-side timestamp; the normalizer orders on it.
    pub observed_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: RawEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RawEventKind {
    Created {
        id: String,
        node: ProviderNode,
    },
    Removed {
        id: String,
        parent_id: String,
        index: u32,
    },
    Moved {
        id: String,
        parent_id: String,
        index: u32,
        old_parent_id: String,
        old_index: u32,
    },
    Changed {
        id: String,
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    ChildrenReordered {
        id: String,
        child_ids: Vec<String>,
    },
}

impl RawEventKind {
    /// Id the event is about; a reorder is about its parent folder.
    pub fn subject(&self) -> &str {
        match self {
            Self::Created { id, .. }
            | Self::Removed { id, .. }
            | Self::Moved { id, .. }
            | Self::Changed { id, .. }
            | Self::ChildrenReordered { id, .. } => id,
        }
    }
}

impl RawEvent {
    pub fn now(kind: RawEventKind) -> Self {
        Self {
            observed_at: Utc::now(),
            kind,
        }
    }
}

#[async_trait]
pub trait BookmarkProvider: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Read the complete tree, rooted at the provider's single root node.
    async fn get_full_tree(&self) -> Result<ProviderNode>;

    /// Open a new change stream.  Events produced before the call are not
    /// replayed.
    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<RawEvent>>;
}

/// Fan-out of raw events to every live subscriber.
#[derive(Default)]
pub(crate) struct Subscribers {
    senders: Mutex<Vec<mpsc::UnboundedSender<RawEvent>>>,
}

impl Subscribers {
    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<RawEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        rx
    }

    /// Deliver `event` to every subscriber, dropping the ones that hung up.
    /// Returns how many received it.
    pub(crate) fn publish(&self, event: &RawEvent) -> usize {
        let mut senders = self
            .senders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        senders.retain(|tx| tx.send(event.clone()).is_ok());
        senders.len()
    }
}
