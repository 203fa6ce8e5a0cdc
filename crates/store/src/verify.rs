use std::collections::{HashMap, HashSet};
use std::fmt;

use redb::ReadableTable;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::schema::{BookmarkNode, NodeKind};
use crate::store::MirrorStore;
use crate::txn::{CHILDREN_TABLE, NODES_TABLE, load_all_nodes};

/// A structural invariant the mirror currently breaks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum Violation {
    DanglingParent { id: String, parent_id: String },
    ParentNotFolder { id: String, parent_id: String },
    UrlKindMismatch { id: String, kind: NodeKind },
    IndexGap { parent_id: Option<String>, indices: Vec<u32> },
    MissingIndexEntry { id: String },
    StaleIndexEntry { parent_key: String, id: String },
    Cycle { id: String },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DanglingParent { id, parent_id } => {
                write!(f, "node {id} points at missing parent {parent_id}")
            }
            Self::ParentNotFolder { id, parent_id } => {
                write!(f, "node {id} has non-folder parent {parent_id}")
            }
            Self::UrlKindMismatch { id, kind } => {
                write!(f, "node {id} of kind {} has mismatched url", kind.as_str())
            }
            Self::IndexGap { parent_id, indices } => write!(
                f,
                "children of {} are not dense from 0: {indices:?}",
                parent_id.as_deref().unwrap_or("<root>")
            ),
            Self::MissingIndexEntry { id } => write!(f, "node {id} missing from children index"),
            Self::StaleIndexEntry { parent_key, id } => {
                write!(f, "children index lists {id} under {parent_key:?} but the row disagrees")
            }
            Self::Cycle { id } => write!(f, "node {id} is its own ancestor"),
        }
    }
}

impl MirrorStore {
    /// Walk the whole mirror and report every structural invariant it breaks.
    /// An empty result means the mirror is consistent.
    pub fn verify(&self) -> Result<Vec<Violation>> {
        let tx = self.read()?;
        let raw = tx.raw();
        let nodes = {
            let table = raw.open_table(NODES_TABLE)?;
            load_all_nodes(&table)?
        };
        let mut index_entries: HashSet<(String, String)> = HashSet::new();
        {
            let table = raw.open_table(CHILDREN_TABLE)?;
            for entry in table.iter()? {
                let (key, _) = entry?;
                let (parent, child) = key.value();
                index_entries.insert((parent.to_string(), child.to_string()));
            }
        }
        Ok(check_nodes(&nodes, &index_entries))
    }
}

fn check_nodes(nodes: &[BookmarkNode], index_entries: &HashSet<(String, String)>) -> Vec<Violation> {
    let by_id: HashMap<&str, &BookmarkNode> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    let mut violations = Vec::new();
    let mut siblings: HashMap<Option<&str>, Vec<u32>> = HashMap::new();

    for node in nodes {
        siblings.entry(node.parent_id.as_deref()).or_default().push(node.index);

        if let Some(parent_id) = node.parent_id.as_deref() {
            match by_id.get(parent_id) {
                None => violations.push(Violation::DanglingParent {
                    id: node.id.clone(),
                    parent_id: parent_id.to_string(),
                }),
                Some(parent) if !parent.is_folder() => violations.push(Violation::ParentNotFolder {
                    id: node.id.clone(),
                    parent_id: parent_id.to_string(),
                }),
                Some(_) => {}
            }
        }

        if node.url.is_some() != (node.kind == NodeKind::Bookmark) {
            violations.push(Violation::UrlKindMismatch {
                id: node.id.clone(),
                kind: node.kind,
            });
        }

        if !index_entries.contains(&(node.parent_key().to_string(), node.id.clone())) {
            violations.push(Violation::MissingIndexEntry { id: node.id.clone() });
        }

        if has_cycle(node, &by_id) {
            violations.push(Violation::Cycle { id: node.id.clone() });
        }
    }

    for (parent_key, id) in index_entries {
        let matches = by_id
            .get(id.as_str())
            .is_some_and(|n| n.parent_key() == parent_key.as_str());
        if !matches {
            violations.push(Violation::StaleIndexEntry {
                parent_key: parent_key.clone(),
                id: id.clone(),
            });
        }
    }

    for (parent_id, mut indices) in siblings {
        indices.sort_unstable();
        let dense = indices.iter().enumerate().all(|(pos, idx)| *idx as usize == pos);
        if !dense {
            violations.push(Violation::IndexGap {
                parent_id: parent_id.map(str::to_string),
                indices,
            });
        }
    }

    violations
}

fn has_cycle(node: &BookmarkNode, by_id: &HashMap<&str, &BookmarkNode>) -> bool {
    let mut current = node.parent_id.as_deref();
    let mut steps = 0usize;
    while let Some(id) = current {
        if id == node.id {
            return true;
        }
        steps += 1;
        if steps > by_id.len() {
            return true;
        }
        current = by_id.get(id).and_then(|n| n.parent_id.as_deref());
    }
    false
}
