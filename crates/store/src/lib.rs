//! Persistent, indexed mirror of an external bookmark tree.
//!
//! The mirror is a single [`redb`] file holding three tables: node rows keyed
//! by provider id, a `(parent, child)` index for ordered child listing, and a
//! small `meta` table for the schema stamp, the [`SyncCursor`] and the
//! bootstrap progress marker.  Every write goes through a [`WriteTxn`], so a
//! batch of node changes and the cursor that records it commit together.

pub mod error;
pub mod query;
pub mod schema;
pub mod store;
pub mod txn;
pub mod verify;

pub use error::{Result, StoreError};
pub use query::StoreStats;
pub use schema::{
    BookmarkNode, BootstrapProgress, CursorStatus, NodeKind, NodePatch, RECOVERY_ROOT_ID,
    SCHEMA_VERSION, SyncCursor,
};
pub use store::MirrorStore;
pub use txn::{NodeSource, ReadTxn, Txn, TxnMode, WriteTxn};
pub use verify::Violation;
