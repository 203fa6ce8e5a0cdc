use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current on-disk schema.
///
/// | Version | Change                                              |
/// |---------|-----------------------------------------------------|
/// | 1       | `nodes` + `meta` tables                             |
/// | 2       | adds the `children` `(parent, child)` index table   |
pub const SCHEMA_VERSION: u32 = 2;

/// Folder that receives nodes whose real parent could not be resolved when a
/// mutation was applied.  It never exists in the provider tree, so the next
/// full sync moves its contents back and deletes it.
pub const RECOVERY_ROOT_ID: &str = "__recovery__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Folder,
    Bookmark,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Folder => "folder",
            Self::Bookmark => "bookmark",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkNode {
    pub id: String,
    pub parent_id: Option<String>,
    pub title: String,
    /// Present iff `kind` is [`NodeKind::Bookmark`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub index: u32,
    #[serde(default)]
    pub date_added: Option<DateTime<Utc>>,
    #[serde(default)]
    pub date_modified: Option<DateTime<Utc>>,
    pub kind: NodeKind,
}

impl BookmarkNode {
    pub fn folder(
        id: impl Into<String>,
        parent_id: Option<&str>,
        index: u32,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            parent_id: parent_id.map(str::to_string),
            title: title.into(),
            url: None,
            index,
            date_added: None,
            date_modified: None,
            kind: NodeKind::Folder,
        }
    }

    pub fn bookmark(
        id: impl Into<String>,
        parent_id: &str,
        index: u32,
        title: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            parent_id: Some(parent_id.to_string()),
            title: title.into(),
            url: Some(url.into()),
            index,
            date_added: None,
            date_modified: None,
            kind: NodeKind::Bookmark,
        }
    }

    pub fn is_folder(&self) -> bool {
        self.kind == NodeKind::Folder
    }

    /// Key under which this node is listed in the `children` index.  Roots
    /// share the empty key.
    pub fn parent_key(&self) -> &str {
        parent_key(self.parent_id.as_deref())
    }

    /// Fields a consumer can see change without the tree shape changing.
    pub fn same_content(&self, other: &Self) -> bool {
        self.title == other.title && self.url == other.url && self.kind == other.kind
    }
}

pub(crate) fn parent_key(parent_id: Option<&str>) -> &str {
    parent_id.unwrap_or("")
}

/// Mutable, non-structural fields of a node.  `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_modified: Option<DateTime<Utc>>,
}

impl NodePatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.url.is_none() && self.date_modified.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorStatus {
    #[default]
    Idle,
    Syncing,
    Degraded,
}

/// Durable marker of the last fully-applied mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCursor {
    pub sequence: u64,
    pub last_full_sync_at: Option<DateTime<Utc>>,
    pub status: CursorStatus,
    /// Schema the cursor was written under.  A cursor that predates the
    /// current schema forces a full sync.
    #[serde(default)]
    pub schema_version: u32,
}

impl Default for SyncCursor {
    fn default() -> Self {
        Self {
            sequence: 0,
            last_full_sync_at: None,
            status: CursorStatus::Idle,
            schema_version: SCHEMA_VERSION,
        }
    }
}

impl SyncCursor {
    pub fn is_current_schema(&self) -> bool {
        self.schema_version == SCHEMA_VERSION
    }
}

/// Written with every bootstrap batch and cleared when the bootstrap commits
/// its final cursor.  Finding one on cold start means the previous bootstrap
/// was interrupted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapProgress {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub batches_committed: u64,
    pub mutations_applied: u64,
    pub mutations_planned: u64,
}

impl BootstrapProgress {
    pub fn new(mutations_planned: u64) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            batches_committed: 0,
            mutations_applied: 0,
            mutations_planned,
        }
    }

    pub fn percentage(&self) -> u8 {
        if self.mutations_planned == 0 {
            return 100;
        }
        ((self.mutations_applied.min(self.mutations_planned) * 100) / self.mutations_planned) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_serializes_camel_case_without_folder_url() {
        let folder = BookmarkNode::folder("1", Some("0"), 0, "Bookmarks bar");
        let json = serde_json::to_value(&folder).unwrap();
        assert_eq!(json["parentId"], "0");
        assert_eq!(json["kind"], "folder");
        assert!(json.get("url").is_none());
    }

    #[test]
    fn roots_share_the_empty_parent_key() {
        let root = BookmarkNode::folder("0", None, 0, "");
        assert_eq!(root.parent_key(), "");
        let child = BookmarkNode::bookmark("5", "0", 0, "Rust", "https://rust-lang.org");
        assert_eq!(child.parent_key(), "0");
    }

    #[test]
    fn progress_percentage_handles_empty_plan() {
        let mut p = BootstrapProgress::new(0);
        assert_eq!(p.percentage(), 100);
        p.mutations_planned = 200;
        p.mutations_applied = 50;
        assert_eq!(p.percentage(), 25);
    }
}
