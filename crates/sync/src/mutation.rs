use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use markmirror_store::{BookmarkNode, NodePatch};

/// Provider event a mutation was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Removed,
    Moved,
    Changed,
    ChildrenReordered,
    /// Synthesised by a full sync diff rather than delivered by the provider.
    Bootstrap,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Removed => "removed",
            Self::Moved => "moved",
            Self::Changed => "changed",
            Self::ChildrenReordered => "children_reordered",
            Self::Bootstrap => "bootstrap",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationOrigin {
    pub event: EventKind,
    /// Id carried by the raw event (the parent for a reorder).
    pub node_id: String,
    pub observed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MutationOp {
    /// `node.index` is the requested position; out-of-range positions append.
    Create(BookmarkNode),
    Remove {
        id: String,
    },
    Move {
        id: String,
        parent_id: Option<String>,
        index: u32,
    },
    Update {
        id: String,
        patch: NodePatch,
    },
}

impl MutationOp {
    pub fn node_id(&self) -> &str {
        match self {
            Self::Create(node) => &node.id,
            Self::Remove { id } | Self::Move { id, .. } | Self::Update { id, .. } => id,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Remove { .. } => "remove",
            Self::Move { .. } => "move",
            Self::Update { .. } => "update",
        }
    }
}

/// Canonical, totally ordered change to the mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub sequence: u64,
    pub origin: MutationOrigin,
    pub op: MutationOp,
}

impl Mutation {
    pub fn new(sequence: u64, origin: MutationOrigin, op: MutationOp) -> Self {
        Self {
            sequence,
            origin,
            op,
        }
    }

    /// Number `ops` from `first_sequence` as a full-sync batch.
    pub fn sequenced_bootstrap(ops: Vec<MutationOp>, first_sequence: u64) -> Vec<Self> {
        ops.into_iter()
            .zip(first_sequence..)
            .map(|(op, sequence)| Self {
                sequence,
                origin: MutationOrigin {
                    event: EventKind::Bootstrap,
                    node_id: op.node_id().to_string(),
                    observed_at: None,
                },
                op,
            })
            .collect()
    }
}
