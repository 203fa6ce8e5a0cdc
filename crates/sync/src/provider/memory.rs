use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use super::{BookmarkProvider, ProviderNode, RawEvent, RawEventKind, Subscribers};
use crate::error::{Result, SyncError};

#[derive(Debug, Clone)]
struct Entry {
    parent: Option<String>,
    title: String,
    url: Option<String>,
    date_added: Option<chrono::DateTime<Utc>>,
    children: Vec<String>,
}

#[derive(Debug)]
struct Tree {
    root: String,
    entries: HashMap<String, Entry>,
    next_id: u64,
}

impl Tree {
    fn from_root(root: &ProviderNode) -> Self {
        let mut entries = HashMap::new();
        let mut max_numeric = 0u64;
        let mut stack: Vec<(&ProviderNode, Option<String>)> = vec![(root, None)];
        while let Some((node, parent)) = stack.pop() {
            if let Ok(n) = node.id.parse::<u64>() {
                max_numeric = max_numeric.max(n);
            }
            entries.insert(
                node.id.clone(),
                Entry {
                    parent,
                    title: node.title.clone(),
                    url: node.url.clone(),
                    date_added: node.date_added,
                    children: node.children().iter().map(|c| c.id.clone()).collect(),
                },
            );
            for child in node.children() {
                stack.push((child, Some(node.id.clone())));
            }
        }
        Self {
            root: root.id.clone(),
            entries,
            next_id: max_numeric + 1,
        }
    }

    fn build(&self, id: &str, parent: Option<&str>, index: Option<u32>) -> Option<ProviderNode> {
        let entry = self.entries.get(id)?;
        let children = if entry.url.is_some() {
            None
        } else {
            Some(
                entry
                    .children
                    .iter()
                    .zip(0u32..)
                    .filter_map(|(child, i)| self.build(child, Some(id), Some(i)))
                    .collect(),
            )
        };
        Some(ProviderNode {
            id: id.to_string(),
            parent_id: parent.map(str::to_string),
            index,
            title: entry.title.clone(),
            url: entry.url.clone(),
            date_added: entry.date_added,
            children,
        })
    }

    fn folder(&self, id: &str) -> Result<&Entry> {
        match self.entries.get(id) {
            Some(entry) if entry.url.is_none() => Ok(entry),
            Some(_) => Err(SyncError::InvalidTree(format!("{id} is not a folder"))),
            None => Err(SyncError::InvalidTree(format!("no such node {id}"))),
        }
    }

    fn position(&self, id: &str) -> Result<(String, u32)> {
        let parent = self
            .entries
            .get(id)
            .and_then(|e| e.parent.clone())
            .ok_or_else(|| SyncError::InvalidTree(format!("{id} has no parent")))?;
        let index = self.folder(&parent)?.children.iter().position(|c| c == id).unwrap_or(0);
        Ok((parent, index as u32))
    }

    fn detach(&mut self, id: &str) -> Result<(String, u32)> {
        let (parent, index) = self.position(id)?;
        if let Some(entry) = self.entries.get_mut(&parent) {
            entry.children.retain(|c| c != id);
        }
        Ok((parent, index))
    }

    fn attach(&mut self, id: &str, parent: &str, index: Option<u32>) -> Result<u32> {
        self.folder(parent)?;
        let siblings = &mut self
            .entries
            .get_mut(parent)
            .ok_or_else(|| SyncError::InvalidTree(format!("no such node {parent}")))?
            .children;
        let pos = index.map_or(siblings.len(), |i| (i as usize).min(siblings.len()));
        siblings.insert(pos, id.to_string());
        if let Some(entry) = self.entries.get_mut(id) {
            entry.parent = Some(parent.to_string());
        }
        Ok(pos as u32)
    }
}

/// In-process provider holding a mutable tree.  Every mutation method updates
/// the tree and emits the matching browser-style event to subscribers.
pub struct MemoryProvider {
    tree: Mutex<Tree>,
    subscribers: Subscribers,
    available: AtomicBool,
}

impl MemoryProvider {
    pub fn new(root: ProviderNode) -> Self {
        Self {
            tree: Mutex::new(Tree::from_root(&root)),
            subscribers: Subscribers::default(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the provider going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Publish an event without touching the tree.  Useful for replaying
    /// duplicates or out-of-order deliveries.
    pub fn inject(&self, event: RawEvent) -> usize {
        self.subscribers.publish(&event)
    }

    pub fn create_folder(&self, parent: &str, index: Option<u32>, title: &str) -> Result<String> {
        self.create(parent, index, title, None)
    }

    pub fn create_bookmark(
        &self,
        parent: &str,
        index: Option<u32>,
        title: &str,
        url: &str,
    ) -> Result<String> {
        self.create(parent, index, title, Some(url.to_string()))
    }

    fn create(
        &self,
        parent: &str,
        index: Option<u32>,
        title: &str,
        url: Option<String>,
    ) -> Result<String> {
        let (id, node) = {
            let mut tree = self.lock();
            tree.folder(parent)?;
            let id = tree.next_id.to_string();
            tree.next_id += 1;
            let now = Utc::now();
            tree.entries.insert(
                id.clone(),
                Entry {
                    parent: Some(parent.to_string()),
                    title: title.to_string(),
                    url: url.clone(),
                    date_added: Some(now),
                    children: Vec::new(),
                },
            );
            let pos = tree.attach(&id, parent, index)?;
            let node = ProviderNode {
                id: id.clone(),
                parent_id: Some(parent.to_string()),
                index: Some(pos),
                title: title.to_string(),
                children: url.is_none().then(Vec::new),
                url,
                date_added: Some(now),
            };
            (id, node)
        };
        self.emit(RawEventKind::Created {
            id: id.clone(),
            node,
        });
        Ok(id)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        let (parent_id, index) = {
            let mut tree = self.lock();
            let (parent, index) = tree.detach(id)?;
            let mut stack = vec![id.to_string()];
            while let Some(current) = stack.pop() {
                if let Some(entry) = tree.entries.remove(&current) {
                    stack.extend(entry.children);
                }
            }
            (parent, index)
        };
        self.emit(RawEventKind::Removed {
            id: id.to_string(),
            parent_id,
            index,
        });
        Ok(())
    }

    pub fn move_node(&self, id: &str, parent: &str, index: Option<u32>) -> Result<()> {
        let (old_parent_id, old_index, index) = {
            let mut tree = self.lock();
            tree.folder(parent)?;
            let mut ancestor = Some(parent.to_string());
            while let Some(current) = ancestor {
                if current == id {
                    return Err(SyncError::InvalidTree(format!(
                        "cannot move {id} into its own subtree"
                    )));
                }
                ancestor = tree.entries.get(&current).and_then(|e| e.parent.clone());
            }
            let (old_parent, old_index) = tree.detach(id)?;
            let pos = tree.attach(id, parent, index)?;
            (old_parent, old_index, pos)
        };
        self.emit(RawEventKind::Moved {
            id: id.to_string(),
            parent_id: parent.to_string(),
            index,
            old_parent_id,
            old_index,
        });
        Ok(())
    }

    pub fn update(&self, id: &str, title: &str, url: Option<&str>) -> Result<()> {
        let url = {
            let mut tree = self.lock();
            let entry = tree
                .entries
                .get_mut(id)
                .ok_or_else(|| SyncError::InvalidTree(format!("no such node {id}")))?;
            entry.title = title.to_string();
            if entry.url.is_some() {
                if let Some(url) = url {
                    entry.url = Some(url.to_string());
                }
            }
            entry.url.clone()
        };
        self.emit(RawEventKind::Changed {
            id: id.to_string(),
            title: title.to_string(),
            url,
        });
        Ok(())
    }

    /// Replace the child order of `parent`.  `child_ids` must be a
    /// permutation of the current children.
    pub fn reorder(&self, parent: &str, child_ids: &[&str]) -> Result<()> {
        {
            let mut tree = self.lock();
            let current = &tree.folder(parent)?.children;
            let mut sorted_now: Vec<&str> = current.iter().map(String::as_str).collect();
            let mut sorted_new = child_ids.to_vec();
            sorted_now.sort_unstable();
            sorted_new.sort_unstable();
            if sorted_now != sorted_new {
                return Err(SyncError::InvalidTree(format!(
                    "reorder of {parent} is not a permutation of its children"
                )));
            }
            if let Some(entry) = tree.entries.get_mut(parent) {
                entry.children = child_ids.iter().map(|c| c.to_string()).collect();
            }
        }
        self.emit(RawEventKind::ChildrenReordered {
            id: parent.to_string(),
            child_ids: child_ids.iter().map(|c| c.to_string()).collect(),
        });
        Ok(())
    }

    fn emit(&self, kind: RawEventKind) {
        self.subscribers.publish(&RawEvent::now(kind));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::ProviderUnavailable("memory provider switched off".into()))
        }
    }
}

#[async_trait]
impl BookmarkProvider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_full_tree(&self) -> Result<ProviderNode> {
        self.ensure_available()?;
        let tree = self.lock();
        tree.build(&tree.root, None, None)
            .ok_or_else(|| SyncError::InvalidTree("root node missing".into()))
    }

    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<RawEvent>> {
        self.ensure_available()?;
        Ok(self.subscribers.subscribe())
    }
}
