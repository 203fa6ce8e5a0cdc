use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;

use super::{BookmarkProvider, ProviderNode, RawEvent, Subscribers};
use crate::error::{Result, SyncError};

/// Microseconds between 1601-01-01 (the Chromium/Windows epoch) and the Unix
/// epoch.
const CHROMIUM_EPOCH_OFFSET_MICROS: i64 = 11_644_473_600_000_000;

/// Provider backed by a JSON file on disk.
///
/// Two layouts are accepted: a plain [`ProviderNode`] tree, or a Chromium
/// profile `Bookmarks` file (detected by its top-level `roots` object).  The
/// file is re-read on every full tree request.  Change events cannot be
/// observed from a file, so they are fed in through [`FileTreeProvider::push`].
pub struct FileTreeProvider {
    path: PathBuf,
    subscribers: Subscribers,
}

impl FileTreeProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            subscribers: Subscribers::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Forward externally captured events to every subscriber.
    pub fn push(&self, events: impl IntoIterator<Item = RawEvent>) -> usize {
        let mut delivered = 0;
        for event in events {
            self.subscribers.publish(&event);
            delivered += 1;
        }
        delivered
    }
}

#[async_trait]
impl BookmarkProvider for FileTreeProvider {
    fn name(&self) -> &str {
        "file"
    }

    async fn get_full_tree(&self) -> Result<ProviderNode> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|err| {
            SyncError::ProviderUnavailable(format!("reading {}: {err}", self.path.display()))
        })?;
        let tree = parse_tree(&raw)?;
        debug!(path = %self.path.display(), nodes = tree.count(), "provider tree loaded");
        Ok(tree)
    }

    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<RawEvent>> {
        Ok(self.subscribers.subscribe())
    }
}

/// Parse either supported layout.
pub(crate) fn parse_tree(raw: &str) -> Result<ProviderNode> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|err| SyncError::InvalidTree(err.to_string()))?;
    if value.get("roots").is_some() {
        let file: ChromiumFile =
            serde_json::from_value(value).map_err(|err| SyncError::InvalidTree(err.to_string()))?;
        Ok(file.into_tree())
    } else {
        serde_json::from_value(value).map_err(|err| SyncError::InvalidTree(err.to_string()))
    }
}

#[derive(Deserialize)]
struct ChromiumFile {
    roots: ChromiumRoots,
}

#[derive(Deserialize)]
struct ChromiumRoots {
    bookmark_bar: Option<ChromiumNode>,
    other: Option<ChromiumNode>,
    synced: Option<ChromiumNode>,
}

#[derive(Deserialize)]
struct ChromiumNode {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    date_added: Option<String>,
    #[serde(default)]
    children: Vec<ChromiumNode>,
}

impl ChromiumFile {
    fn into_tree(self) -> ProviderNode {
        let roots = [self.roots.bookmark_bar, self.roots.other, self.roots.synced];
        let children = roots
            .into_iter()
            .flatten()
            .map(ChromiumNode::into_node)
            .collect();
        ProviderNode::folder("0", "", children)
    }
}

impl ChromiumNode {
    fn into_node(self) -> ProviderNode {
        let date_added = self.date_added.as_deref().and_then(chromium_time);
        if self.kind == "url" {
            ProviderNode {
                date_added,
                ..ProviderNode::bookmark(self.id, self.name, self.url.unwrap_or_default())
            }
        } else {
            let children = self.children.into_iter().map(Self::into_node).collect();
            ProviderNode {
                date_added,
                ..ProviderNode::folder(self.id, self.name, children)
            }
        }
    }
}

fn chromium_time(raw: &str) -> Option<DateTime<Utc>> {
    let micros: i64 = raw.parse().ok()?;
    if micros == 0 {
        return None;
    }
    // Out-of-range stamps become `None`; event-created nodes then take the
    // event's `observed_at`.
    let unix_micros = micros.checked_sub(CHROMIUM_EPOCH_OFFSET_MICROS)?;
    DateTime::from_timestamp_micros(unix_micros)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::testing::sample_tree;

    const CHROMIUM: &str = r#"{
        "checksum": "00",
        "roots": {
            "bookmark_bar": {
                "children": [
                    {"date_added": "13370000000000000", "id": "5", "name": "Rust", "type": "url", "url": "https://rust-lang.org"},
                    {"children": [], "date_added": "0", "id": "6", "name": "Empty", "type": "folder"}
                ],
                "date_added": "13370000000000000", "id": "1", "name": "Bookmarks bar", "type": "folder"
            },
            "other": {"children": [], "id": "2", "name": "Other bookmarks", "type": "folder"},
            "synced": {"children": [], "id": "3", "name": "Mobile bookmarks", "type": "folder"}
        },
        "version": 1
    }"#;

    #[test]
    fn parses_chromium_profile_file() {
        let tree = parse_tree(CHROMIUM).unwrap();
        assert_eq!(tree.id, "0");
        let ids: Vec<&str> = tree.children().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["1", "2", "3"]);

        let rust = &tree.children()[0].children()[0];
        assert_eq!(rust.url.as_deref(), Some("https://rust-lang.org"));
        let added = rust.date_added.unwrap();
        assert_eq!(added.timestamp(), 13_370_000_000 - 11_644_473_600);

        let empty = &tree.children()[0].children()[1];
        assert!(empty.url.is_none());
        assert!(empty.date_added.is_none());
    }

    #[test]
    fn out_of_range_chromium_times_are_dropped() {
        assert!(chromium_time(&i64::MIN.to_string()).is_none());
        assert!(chromium_time(&i64::MAX.to_string()).is_none());
        assert!(chromium_time("not a number").is_none());

        let hostile = CHROMIUM.replace(
            r#""date_added": "13370000000000000", "id": "5""#,
            r#""date_added": "-9223372036854775808", "id": "5""#,
        );
        let tree = parse_tree(&hostile).unwrap();
        let rust = &tree.children()[0].children()[0];
        assert_eq!(rust.id, "5");
        assert!(rust.date_added.is_none());
    }

    #[tokio::test]
    async fn reads_plain_tree_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tree.json");
        std::fs::write(&path, serde_json::to_string(&sample_tree()).unwrap()).unwrap();

        let provider = FileTreeProvider::new(&path);
        let tree = provider.get_full_tree().await.unwrap();
        assert_eq!(tree, sample_tree());
    }

    #[tokio::test]
    async fn missing_file_is_provider_unavailable() {
        let dir = TempDir::new().unwrap();
        let provider = FileTreeProvider::new(dir.path().join("nope.json"));
        assert!(matches!(
            provider.get_full_tree().await,
            Err(SyncError::ProviderUnavailable(_))
        ));
    }

    #[test]
    fn garbage_is_invalid_tree() {
        assert!(matches!(parse_tree("[1, 2"), Err(SyncError::InvalidTree(_))));
    }
}
