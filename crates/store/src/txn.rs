//! Transaction handles over the mirror tables.
//!
//! # Tables
//!
//! | Name       | Key                     | Value                         |
//! |------------|-------------------------|-------------------------------|
//! | `nodes`    | node id (`&str`)        | JSON-encoded [`BookmarkNode`] |
//! | `children` | `(parent key, child id)`| `()`                          |
//! | `meta`     | `&str`                  | JSON bytes                    |
//!
//! Roots are indexed under the empty parent key.  Ordering of a child list
//! comes from each node's `index`, not from the `children` key order.

use redb::{ReadTransaction, ReadableTable, ReadableTableMetadata, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;
use crate::schema::{BookmarkNode, BootstrapProgress, SyncCursor, parent_key};

pub(crate) const NODES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");
pub(crate) const CHILDREN_TABLE: TableDefinition<(&str, &str), ()> =
    TableDefinition::new("children");
pub(crate) const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

pub(crate) const META_SCHEMA_VERSION: &str = "schema_version";
pub(crate) const META_CURSOR: &str = "cursor";
pub(crate) const META_BOOTSTRAP: &str = "bootstrap";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnMode {
    ReadOnly,
    ReadWrite,
}

/// Point and range reads available on every transaction handle.
pub trait NodeSource {
    fn get_node(&self, id: &str) -> Result<Option<BookmarkNode>>;

    /// Children of `parent_id` (`None` lists roots), ordered by `index`.
    fn get_children(&self, parent_id: Option<&str>) -> Result<Vec<BookmarkNode>>;

    fn get_cursor(&self) -> Result<Option<SyncCursor>>;

    fn get_bootstrap_progress(&self) -> Result<Option<BootstrapProgress>>;

    fn node_count(&self) -> Result<u64>;

    /// Every node row, in id order.
    fn all_nodes(&self) -> Result<Vec<BookmarkNode>>;
}

// ── table helpers ─────────────────────────────────────────────────────────────

pub(crate) fn load_node<T>(table: &T, id: &str) -> Result<Option<BookmarkNode>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(id)? {
        None => Ok(None),
        Some(raw) => Ok(Some(serde_json::from_slice(raw.value())?)),
    }
}

pub(crate) fn load_all_nodes<T>(table: &T) -> Result<Vec<BookmarkNode>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let mut nodes = Vec::new();
    for entry in table.iter()? {
        let (_, raw) = entry?;
        nodes.push(serde_json::from_slice(raw.value())?);
    }
    Ok(nodes)
}

pub(crate) fn child_ids<T>(table: &T, parent: &str) -> Result<Vec<String>>
where
    T: ReadableTable<(&'static str, &'static str), ()>,
{
    let mut ids = Vec::new();
    for entry in table.range((parent, "")..)? {
        let (key, _) = entry?;
        let (owner, child) = key.value();
        if owner != parent {
            break;
        }
        ids.push(child.to_string());
    }
    Ok(ids)
}

pub(crate) fn load_meta<T, M>(table: &T, key: &str) -> Result<Option<M>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
    M: DeserializeOwned,
{
    match table.get(key)? {
        None => Ok(None),
        Some(raw) => Ok(Some(serde_json::from_slice(raw.value())?)),
    }
}

fn sort_siblings(children: &mut [BookmarkNode]) {
    children.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.id.cmp(&b.id)));
}

// ── read-only handle ──────────────────────────────────────────────────────────

pub struct ReadTxn {
    tx: ReadTransaction,
}

impl ReadTxn {
    pub(crate) fn new(tx: ReadTransaction) -> Self {
        Self { tx }
    }

    pub(crate) fn raw(&self) -> &ReadTransaction {
        &self.tx
    }
}

impl NodeSource for ReadTxn {
    fn get_node(&self, id: &str) -> Result<Option<BookmarkNode>> {
        let nodes = self.tx.open_table(NODES_TABLE)?;
        load_node(&nodes, id)
    }

    fn get_children(&self, parent_id: Option<&str>) -> Result<Vec<BookmarkNode>> {
        let children = self.tx.open_table(CHILDREN_TABLE)?;
        let nodes = self.tx.open_table(NODES_TABLE)?;
        let mut out = Vec::new();
        for id in child_ids(&children, parent_key(parent_id))? {
            if let Some(node) = load_node(&nodes, &id)? {
                out.push(node);
            }
        }
        sort_siblings(&mut out);
        Ok(out)
    }

    fn get_cursor(&self) -> Result<Option<SyncCursor>> {
        let meta = self.tx.open_table(META_TABLE)?;
        load_meta(&meta, META_CURSOR)
    }

    fn get_bootstrap_progress(&self) -> Result<Option<BootstrapProgress>> {
        let meta = self.tx.open_table(META_TABLE)?;
        load_meta(&meta, META_BOOTSTRAP)
    }

    fn node_count(&self) -> Result<u64> {
        let nodes = self.tx.open_table(NODES_TABLE)?;
        Ok(nodes.len()?)
    }

    fn all_nodes(&self) -> Result<Vec<BookmarkNode>> {
        let nodes = self.tx.open_table(NODES_TABLE)?;
        load_all_nodes(&nodes)
    }
}

// ── read-write handle ─────────────────────────────────────────────────────────

/// A single write transaction.  Nothing is visible to readers until
/// [`WriteTxn::commit`]; dropping the handle without committing discards
/// every change made through it.
pub struct WriteTxn {
    tx: WriteTransaction,
}

impl WriteTxn {
    pub(crate) fn new(tx: WriteTransaction) -> Self {
        Self { tx }
    }

    /// Insert or overwrite a node row, keeping the `children` index in step
    /// when the parent changes.
    pub fn put_node(&mut self, node: &BookmarkNode) -> Result<()> {
        let bytes = serde_json::to_vec(node)?;
        let mut nodes = self.tx.open_table(NODES_TABLE)?;
        let mut children = self.tx.open_table(CHILDREN_TABLE)?;
        if let Some(previous) = load_node(&nodes, &node.id)? {
            if previous.parent_key() != node.parent_key() {
                children.remove((previous.parent_key(), previous.id.as_str()))?;
            }
        }
        children.insert((node.parent_key(), node.id.as_str()), ())?;
        nodes.insert(node.id.as_str(), bytes.as_slice())?;
        Ok(())
    }

    /// Remove a single node row and its index entry.  Does not touch the
    /// node's children or siblings.
    pub fn delete_node(&mut self, id: &str) -> Result<Option<BookmarkNode>> {
        let mut nodes = self.tx.open_table(NODES_TABLE)?;
        let mut children = self.tx.open_table(CHILDREN_TABLE)?;
        let Some(previous) = load_node(&nodes, id)? else {
            return Ok(None);
        };
        children.remove((previous.parent_key(), previous.id.as_str()))?;
        nodes.remove(id)?;
        Ok(Some(previous))
    }

    /// Ids listed under `parent_id` in the `children` index, unordered.
    pub fn child_ids(&self, parent_id: Option<&str>) -> Result<Vec<String>> {
        let children = self.tx.open_table(CHILDREN_TABLE)?;
        child_ids(&children, parent_key(parent_id))
    }

    pub fn put_cursor(&mut self, cursor: &SyncCursor) -> Result<()> {
        self.put_meta(META_CURSOR, cursor)
    }

    pub fn put_bootstrap_progress(&mut self, progress: &BootstrapProgress) -> Result<()> {
        self.put_meta(META_BOOTSTRAP, progress)
    }

    pub fn clear_bootstrap_progress(&mut self) -> Result<()> {
        let mut meta = self.tx.open_table(META_TABLE)?;
        meta.remove(META_BOOTSTRAP)?;
        Ok(())
    }

    pub(crate) fn put_meta<M: Serialize>(&mut self, key: &str, value: &M) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        let mut meta = self.tx.open_table(META_TABLE)?;
        meta.insert(key, bytes.as_slice())?;
        Ok(())
    }

    pub(crate) fn raw(&self) -> &WriteTransaction {
        &self.tx
    }

    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }

    pub fn abort(self) -> Result<()> {
        self.tx.abort()?;
        Ok(())
    }
}

impl NodeSource for WriteTxn {
    fn get_node(&self, id: &str) -> Result<Option<BookmarkNode>> {
        let nodes = self.tx.open_table(NODES_TABLE)?;
        load_node(&nodes, id)
    }

    fn get_children(&self, parent_id: Option<&str>) -> Result<Vec<BookmarkNode>> {
        let children = self.tx.open_table(CHILDREN_TABLE)?;
        let nodes = self.tx.open_table(NODES_TABLE)?;
        let mut out = Vec::new();
        for id in child_ids(&children, parent_key(parent_id))? {
            if let Some(node) = load_node(&nodes, &id)? {
                out.push(node);
            }
        }
        sort_siblings(&mut out);
        Ok(out)
    }

    fn get_cursor(&self) -> Result<Option<SyncCursor>> {
        let meta = self.tx.open_table(META_TABLE)?;
        load_meta(&meta, META_CURSOR)
    }

    fn get_bootstrap_progress(&self) -> Result<Option<BootstrapProgress>> {
        let meta = self.tx.open_table(META_TABLE)?;
        load_meta(&meta, META_BOOTSTRAP)
    }

    fn node_count(&self) -> Result<u64> {
        let nodes = self.tx.open_table(NODES_TABLE)?;
        Ok(nodes.len()?)
    }

    fn all_nodes(&self) -> Result<Vec<BookmarkNode>> {
        let nodes = self.tx.open_table(NODES_TABLE)?;
        load_all_nodes(&nodes)
    }
}

// ── mode-selected handle ──────────────────────────────────────────────────────

/// Handle returned by [`crate::MirrorStore::open_transaction`].
pub enum Txn {
    Read(ReadTxn),
    Write(WriteTxn),
}

impl Txn {
    pub fn mode(&self) -> TxnMode {
        match self {
            Self::Read(_) => TxnMode::ReadOnly,
            Self::Write(_) => TxnMode::ReadWrite,
        }
    }

    pub fn as_write(&mut self) -> Option<&mut WriteTxn> {
        match self {
            Self::Read(_) => None,
            Self::Write(tx) => Some(tx),
        }
    }

    pub fn into_write(self) -> Option<WriteTxn> {
        match self {
            Self::Read(_) => None,
            Self::Write(tx) => Some(tx),
        }
    }

    fn source(&self) -> &dyn NodeSource {
        match self {
            Self::Read(tx) => tx,
            Self::Write(tx) => tx,
        }
    }
}

impl NodeSource for Txn {
    fn get_node(&self, id: &str) -> Result<Option<BookmarkNode>> {
        self.source().get_node(id)
    }

    fn get_children(&self, parent_id: Option<&str>) -> Result<Vec<BookmarkNode>> {
        self.source().get_children(parent_id)
    }

    fn get_cursor(&self) -> Result<Option<SyncCursor>> {
        self.source().get_cursor()
    }

    fn get_bootstrap_progress(&self) -> Result<Option<BootstrapProgress>> {
        self.source().get_bootstrap_progress()
    }

    fn node_count(&self) -> Result<u64> {
        self.source().node_count()
    }

    fn all_nodes(&self) -> Result<Vec<BookmarkNode>> {
        self.source().all_nodes()
    }
}
