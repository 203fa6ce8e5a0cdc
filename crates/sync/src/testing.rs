//! Fixtures shared by the unit tests.

use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use markmirror_store::{MirrorStore, NodeSource};

use crate::provider::ProviderNode;

/// Row used to compare a mirror against a provider tree:
/// `(id, parent, index, title, url)`.
pub(crate) type ShapeRow = (String, Option<String>, u32, String, Option<String>);

/// A small browser-like tree:
///
/// ```text
/// 0
/// ├── 1 Bookmarks bar
/// │   ├── 10 Rust Book
/// │   └── 11 Tokio
/// └── 2 Other bookmarks
///     ├── 20 Reading/
///     │   └── 21 redb
///     └── 22 serde
/// ```
pub(crate) fn sample_tree() -> ProviderNode {
    ProviderNode::folder(
        "0",
        "",
        vec![
            ProviderNode::folder(
                "1",
                "Bookmarks bar",
                vec![
                    ProviderNode::bookmark("10", "Rust Book", "https://doc.rust-lang.org/book/"),
                    ProviderNode::bookmark("11", "Tokio", "https://tokio.rs"),
                ],
            ),
            ProviderNode::folder(
                "2",
                "Other bookmarks",
                vec![
                    ProviderNode::folder(
                        "20",
                        "Reading",
                        vec![ProviderNode::bookmark("21", "redb", "https://www.redb.org")],
                    ),
                    ProviderNode::bookmark("22", "serde", "https://serde.rs"),
                ],
            ),
        ],
    )
}

/// A root with `folders` folders of `per_folder` bookmarks each.
pub(crate) fn generated_tree(folders: usize, per_folder: usize) -> ProviderNode {
    let children = (0..folders)
        .map(|f| {
            let bookmarks = (0..per_folder)
                .map(|b| {
                    ProviderNode::bookmark(
                        format!("b{f}-{b}"),
                        format!("Bookmark {f}/{b}"),
                        format!("https://site{f}.example/page/{b}"),
                    )
                })
                .collect();
            ProviderNode::folder(format!("f{f}"), format!("Folder {f}"), bookmarks)
        })
        .collect();
    ProviderNode::folder("0", "", children)
}

struct Slot {
    id: String,
    title: String,
    url: Option<String>,
    depth: usize,
    children: Vec<usize>,
}

/// A seeded random tree of exactly `nodes` nodes (root included), at most
/// `max_depth` levels below the root.  One folder chain reaches `max_depth`;
/// the rest attach mostly under recently created folders, so deep narrow
/// branches sit next to wide flat ones.
pub(crate) fn random_tree(seed: u64, nodes: usize, max_depth: usize) -> ProviderNode {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut slots = vec![Slot {
        id: "0".into(),
        title: String::new(),
        url: None,
        depth: 0,
        children: Vec::new(),
    }];
    let mut folders = vec![0usize];

    // `folders` only holds folders that may still take children.
    let mut parent = 0;
    while slots.len() < nodes && slots[parent].depth < max_depth {
        parent = push_slot(&mut slots, parent, true);
        if slots[parent].depth < max_depth {
            folders.push(parent);
        }
    }

    while slots.len() < nodes {
        let parent = if rng.gen_bool(0.7) {
            let recent = folders.len().min(32);
            folders[folders.len() - 1 - rng.gen_range(0..recent)]
        } else {
            folders[rng.gen_range(0..folders.len())]
        };
        let folder = slots[parent].depth + 1 < max_depth && rng.gen_bool(0.12);
        let n = push_slot(&mut slots, parent, folder);
        if folder {
            folders.push(n);
        }
    }
    build_slot(&slots, 0)
}

fn push_slot(slots: &mut Vec<Slot>, parent: usize, folder: bool) -> usize {
    let n = slots.len();
    let depth = slots[parent].depth + 1;
    let slot = if folder {
        Slot {
            id: format!("f{n}"),
            title: format!("Folder {n}"),
            url: None,
            depth,
            children: Vec::new(),
        }
    } else {
        Slot {
            id: format!("b{n}"),
            title: format!("Page {n} on topic {}", n % 97),
            url: Some(format!("https://site{}.example/page/{n}", n % 1_000)),
            depth,
            children: Vec::new(),
        }
    };
    slots.push(slot);
    slots[parent].children.push(n);
    n
}

fn build_slot(slots: &[Slot], at: usize) -> ProviderNode {
    let slot = &slots[at];
    match &slot.url {
        Some(url) => ProviderNode::bookmark(slot.id.clone(), slot.title.clone(), url.clone()),
        None => ProviderNode::folder(
            slot.id.clone(),
            slot.title.clone(),
            slot.children.iter().map(|&child| build_slot(slots, child)).collect(),
        ),
    }
}

/// Levels below the root of the deepest node.
pub(crate) fn tree_depth(root: &ProviderNode) -> usize {
    root.children()
        .iter()
        .map(|child| 1 + tree_depth(child))
        .max()
        .unwrap_or(0)
}

pub(crate) fn open_store(dir: &Path) -> MirrorStore {
    MirrorStore::open(dir.join("mirror.redb")).expect("open mirror")
}

pub(crate) fn mirror_shape(store: &MirrorStore) -> Vec<ShapeRow> {
    let tx = store.read().expect("read txn");
    let mut rows: Vec<ShapeRow> = tx
        .all_nodes()
        .expect("all nodes")
        .into_iter()
        .map(|n| (n.id, n.parent_id, n.index, n.title, n.url))
        .collect();
    rows.sort();
    rows
}

pub(crate) fn tree_shape(root: &ProviderNode) -> Vec<ShapeRow> {
    let mut rows = Vec::new();
    let mut stack: Vec<(&ProviderNode, Option<String>, u32)> = vec![(root, None, 0)];
    while let Some((node, parent, index)) = stack.pop() {
        rows.push((node.id.clone(), parent, index, node.title.clone(), node.url.clone()));
        for (child, i) in node.children().iter().zip(0u32..) {
            stack.push((child, Some(node.id.clone()), i));
        }
    }
    rows.sort();
    rows
}

/// Write `root` straight into the mirror, bypassing the reconciler, and
/// stamp an idle cursor at `sequence`.
pub(crate) fn seed_store(store: &MirrorStore, root: &ProviderNode, sequence: u64) {
    use markmirror_store::{BookmarkNode, NodeKind, SyncCursor};

    let mut tx = store.write().expect("write txn");
    for (id, parent_id, index, title, url) in tree_shape(root) {
        let kind = if url.is_some() {
            NodeKind::Bookmark
        } else {
            NodeKind::Folder
        };
        tx.put_node(&BookmarkNode {
            id,
            parent_id,
            title,
            url,
            index,
            date_added: None,
            date_modified: None,
            kind,
        })
        .expect("put node");
    }
    tx.put_cursor(&SyncCursor {
        sequence,
        ..SyncCursor::default()
    })
    .expect("put cursor");
    tx.commit().expect("commit");
}
