//! Read-only query surface used by every consumer of the mirror.
//!
//! Each call opens its own read transaction, so readers always observe a
//! committed batch and never a half-applied one.  There is no cache in front
//! of these lookups.

use redb::ReadableTable;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::schema::{BookmarkNode, NodeKind, SyncCursor};
use crate::store::MirrorStore;
use crate::txn::{NODES_TABLE, NodeSource};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub nodes: u64,
    pub folders: u64,
    pub bookmarks: u64,
    pub cursor: Option<SyncCursor>,
    pub bootstrap_in_progress: bool,
}

impl MirrorStore {
    pub fn get_node(&self, id: &str) -> Result<Option<BookmarkNode>> {
        self.read()?.get_node(id)
    }

    pub fn get_children(&self, parent_id: Option<&str>) -> Result<Vec<BookmarkNode>> {
        self.read()?.get_children(parent_id)
    }

    pub fn get_cursor(&self) -> Result<Option<SyncCursor>> {
        self.read()?.get_cursor()
    }

    pub fn node_count(&self) -> Result<u64> {
        self.read()?.node_count()
    }

    /// Case-insensitive match of every whitespace-separated term against the
    /// title or URL.  Title-prefix hits sort first, then by title.
    pub fn search(&self, term: &str, limit: usize) -> Result<Vec<BookmarkNode>> {
        let terms: Vec<String> = term
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let tx = self.read()?;
        let nodes = tx.raw().open_table(NODES_TABLE)?;
        let mut hits = Vec::new();
        for entry in nodes.iter()? {
            let (_, raw) = entry?;
            let node: BookmarkNode = serde_json::from_slice(raw.value())?;
            let title = node.title.to_lowercase();
            let url = node.url.as_deref().unwrap_or_default().to_lowercase();
            if terms.iter().all(|t| title.contains(t.as_str()) || url.contains(t.as_str())) {
                let prefix = title.starts_with(terms[0].as_str());
                hits.push((!prefix, title, node));
            }
        }
        hits.sort_by(|a, b| (a.0, &a.1, &a.2.id).cmp(&(b.0, &b.1, &b.2.id)));
        Ok(hits.into_iter().take(limit).map(|(_, _, node)| node).collect())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let tx = self.read()?;
        let mut stats = StoreStats {
            cursor: tx.get_cursor()?,
            bootstrap_in_progress: tx.get_bootstrap_progress()?.is_some(),
            ..StoreStats::default()
        };
        let nodes = tx.raw().open_table(NODES_TABLE)?;
        for entry in nodes.iter()? {
            let (_, raw) = entry?;
            let node: BookmarkNode = serde_json::from_slice(raw.value())?;
            stats.nodes += 1;
            match node.kind {
                NodeKind::Folder => stats.folders += 1,
                NodeKind::Bookmark => stats.bookmarks += 1,
            }
        }
        Ok(stats)
    }
}
