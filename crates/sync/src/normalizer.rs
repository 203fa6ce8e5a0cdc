//! Turns raw provider events into sequenced [`Mutation`]s.
//!
//! Events are buffered with [`Normalizer::push`] and released by
//! [`Normalizer::drain`], which orders them by provider timestamp (arrival
//! order breaks ties), drops repeated deliveries inside the coalescing window
//! and assigns strictly increasing sequence numbers.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use markmirror_store::{BookmarkNode, NodeKind, NodePatch};

use crate::mutation::{EventKind, Mutation, MutationOp, MutationOrigin};
use crate::provider::{ProviderNode, RawEvent, RawEventKind};

#[derive(Debug)]
pub struct Normalizer {
    next_sequence: u64,
    window: chrono::Duration,
    pending: Vec<(u64, RawEvent)>,
    arrivals: u64,
    /// Last delivered event per subject: `(fingerprint, observed_at)`.
    last_seen: HashMap<String, (Vec<u8>, DateTime<Utc>)>,
    newest_seen: Option<DateTime<Utc>>,
    duplicates_dropped: u64,
}

impl Normalizer {
    pub fn new(coalesce_window: Duration) -> Self {
        Self {
            next_sequence: 1,
            window: chrono::Duration::from_std(coalesce_window)
                .unwrap_or_else(|_| chrono::Duration::milliseconds(50)),
            pending: Vec::new(),
            arrivals: 0,
            last_seen: HashMap::new(),
            newest_seen: None,
            duplicates_dropped: 0,
        }
    }

    /// Continue numbering after `sequence`, e.g. the persisted cursor.  Never
    /// moves the counter backwards.
    pub fn resume_after(&mut self, sequence: u64) {
        self.next_sequence = self.next_sequence.max(sequence.saturating_add(1));
    }

    /// Highest sequence number handed out so far (0 if none).
    pub fn high_water(&self) -> u64 {
        self.next_sequence - 1
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn duplicates_dropped(&self) -> u64 {
        self.duplicates_dropped
    }

    pub fn push(&mut self, event: RawEvent) {
        self.pending.push((self.arrivals, event));
        self.arrivals += 1;
    }

    /// Release every buffered event as mutations, in causal order.
    pub fn drain(&mut self) -> Vec<Mutation> {
        let mut events = std::mem::take(&mut self.pending);
        events.sort_by(|(a_arrival, a), (b_arrival, b)| {
            a.observed_at
                .cmp(&b.observed_at)
                .then(a_arrival.cmp(b_arrival))
        });

        let mut out = Vec::with_capacity(events.len());
        for (_, event) in events {
            if self.is_duplicate(&event) {
                self.duplicates_dropped += 1;
                trace!(subject = event.kind.subject(), "duplicate provider event dropped");
                continue;
            }
            self.expand(event, &mut out);
        }
        self.prune();
        if !out.is_empty() {
            debug!(
                mutations = out.len(),
                high_water = self.high_water(),
                "events normalized"
            );
        }
        out
    }

    /// Convenience for callers holding a complete batch.
    pub fn normalize(&mut self, events: impl IntoIterator<Item = RawEvent>) -> Vec<Mutation> {
        for event in events {
            self.push(event);
        }
        self.drain()
    }

    fn is_duplicate(&mut self, event: &RawEvent) -> bool {
        let fingerprint = fingerprint(&event.kind);
        let subject = event.kind.subject().to_string();
        self.newest_seen = Some(match self.newest_seen {
            Some(newest) => newest.max(event.observed_at),
            None => event.observed_at,
        });
        let duplicate = self.last_seen.get(&subject).is_some_and(|(prev, at)| {
            *prev == fingerprint && (event.observed_at - *at).abs() <= self.window
        });
        self.last_seen.insert(subject, (fingerprint, event.observed_at));
        duplicate
    }

    fn prune(&mut self) {
        let Some(newest) = self.newest_seen else {
            return;
        };
        let horizon = newest - self.window;
        self.last_seen.retain(|_, (_, at)| *at >= horizon);
    }

    fn next(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    fn emit(&mut self, origin: &MutationOrigin, op: MutationOp, out: &mut Vec<Mutation>) {
        let sequence = self.next();
        out.push(Mutation::new(sequence, origin.clone(), op));
    }

    fn expand(&mut self, event: RawEvent, out: &mut Vec<Mutation>) {
        let observed_at = event.observed_at;
        let origin = |kind: EventKind, id: &str| MutationOrigin {
            event: kind,
            node_id: id.to_string(),
            observed_at: Some(observed_at),
        };

        match event.kind {
            RawEventKind::Created { id, node } => {
                let origin = origin(EventKind::Created, &id);
                let parent = node.parent_id.clone();
                let index = node.index.unwrap_or(u32::MAX);
                // A created folder may arrive with its subtree attached.
                let mut stack = vec![(node, parent, index)];
                while let Some((mut node, parent, index)) = stack.pop() {
                    let children = node.children.take().unwrap_or_default();
                    let id = node.id.clone();
                    self.emit(
                        &origin,
                        MutationOp::Create(to_store_node(node, parent, index, observed_at)),
                        out,
                    );
                    for (i, child) in children.into_iter().enumerate().rev() {
                        stack.push((child, Some(id.clone()), i as u32));
                    }
                }
            }
            RawEventKind::Removed { id, .. } => {
                let origin = origin(EventKind::Removed, &id);
                self.emit(&origin, MutationOp::Remove { id }, out);
            }
            RawEventKind::Moved {
                id,
                parent_id,
                index,
                ..
            } => {
                let origin = origin(EventKind::Moved, &id);
                self.emit(
                    &origin,
                    MutationOp::Move {
                        id,
                        parent_id: Some(parent_id),
                        index,
                    },
                    out,
                );
            }
            RawEventKind::Changed { id, title, url } => {
                let origin = origin(EventKind::Changed, &id);
                let patch = NodePatch {
                    title: Some(title),
                    url,
                    date_modified: Some(observed_at),
                };
                self.emit(&origin, MutationOp::Update { id, patch }, out);
            }
            RawEventKind::ChildrenReordered { id, child_ids } => {
                let origin = origin(EventKind::ChildrenReordered, &id);
                for (child, index) in child_ids.into_iter().zip(0u32..) {
                    self.emit(
                        &origin,
                        MutationOp::Move {
                            id: child,
                            parent_id: Some(id.clone()),
                            index,
                        },
                        out,
                    );
                }
            }
        }
    }
}

fn to_store_node(
    node: ProviderNode,
    parent_id: Option<String>,
    index: u32,
    observed_at: DateTime<Utc>,
) -> BookmarkNode {
    let kind = node.kind();
    BookmarkNode {
        id: node.id,
        parent_id,
        title: node.title,
        url: if kind == NodeKind::Bookmark { node.url } else { None },
        index,
        date_added: node.date_added.or(Some(observed_at)),
        date_modified: None,
        kind,
    }
}

fn fingerprint(kind: &RawEventKind) -> Vec<u8> {
    let bytes = serde_json::to_vec(kind).unwrap_or_default();
    Sha256::digest(&bytes).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_760_000_000_000 + ms).unwrap()
    }

    fn changed(id: &str, title: &str, ms: i64) -> RawEvent {
        RawEvent {
            observed_at: at(ms),
            kind: RawEventKind::Changed {
                id: id.into(),
                title: title.into(),
                url: None,
            },
        }
    }

    fn normalizer() -> Normalizer {
        Normalizer::new(Duration::from_millis(50))
    }

    #[test]
    fn orders_by_timestamp_then_arrival() {
        let mut n = normalizer();
        let out = n.normalize([
            changed("a", "late", 100),
            changed("b", "early", 10),
            changed("c", "tie-first", 50),
            changed("d", "tie-second", 50),
        ]);
        let ids: Vec<&str> = out.iter().map(|m| m.op.node_id()).collect();
        assert_eq!(ids, ["b", "c", "d", "a"]);
        let seqs: Vec<u64> = out.iter().map(|m| m.sequence).collect();
        assert_eq!(seqs, [1, 2, 3, 4]);
    }

    #[test]
    fn sequences_resume_after_cursor_and_keep_rising() {
        let mut n = normalizer();
        n.resume_after(41);
        let first = n.normalize([changed("a", "x", 0)]);
        assert_eq!(first[0].sequence, 42);
        n.resume_after(10);
        let second = n.normalize([changed("a", "y", 500)]);
        assert_eq!(second[0].sequence, 43);
        assert_eq!(n.high_water(), 43);
    }

    #[test]
    fn reorder_becomes_one_move_per_child() {
        let mut n = normalizer();
        let out = n.normalize([RawEvent {
            observed_at: at(0),
            kind: RawEventKind::ChildrenReordered {
                id: "1".into(),
                child_ids: vec!["c".into(), "a".into(), "b".into()],
            },
        }]);
        let moves: Vec<(String, u32)> = out
            .into_iter()
            .map(|m| match m.op {
                MutationOp::Move {
                    id,
                    parent_id,
                    index,
                } => {
                    assert_eq!(parent_id.as_deref(), Some("1"));
                    (id, index)
                }
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            moves,
            [("c".to_string(), 0), ("a".to_string(), 1), ("b".to_string(), 2)]
        );
    }

    #[test]
    fn duplicates_inside_window_are_dropped() {
        let mut n = normalizer();
        let out = n.normalize([
            changed("a", "x", 0),
            changed("a", "x", 20),
            changed("a", "x", 200),
        ]);
        assert_eq!(out.len(), 2);
        assert_eq!(n.duplicates_dropped(), 1);
    }

    #[test]
    fn flip_flop_edits_are_not_mistaken_for_duplicates() {
        let mut n = normalizer();
        let out = n.normalize([
            changed("a", "B", 0),
            changed("a", "A", 1),
            changed("a", "B", 2),
        ]);
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn duplicate_split_across_batches_is_dropped() {
        let mut n = normalizer();
        assert_eq!(n.normalize([changed("a", "x", 0)]).len(), 1);
        assert!(n.normalize([changed("a", "x", 10)]).is_empty());
    }

    #[test]
    fn created_folder_with_subtree_expands_parent_first() {
        let mut n = normalizer();
        let mut folder = ProviderNode::folder(
            "f",
            "New",
            vec![ProviderNode::bookmark("b", "Inner", "https://inner.example")],
        );
        folder.parent_id = Some("1".into());
        folder.index = Some(3);
        let out = n.normalize([RawEvent {
            observed_at: at(0),
            kind: RawEventKind::Created {
                id: "f".into(),
                node: folder,
            },
        }]);
        match (&out[0].op, &out[1].op) {
            (MutationOp::Create(f), MutationOp::Create(b)) => {
                assert_eq!((f.id.as_str(), f.parent_id.as_deref(), f.index), ("f", Some("1"), 3));
                assert_eq!((b.parent_id.as_deref(), b.index), (Some("f"), 0));
                assert_eq!(b.url.as_deref(), Some("https://inner.example"));
                assert_eq!(f.date_added, Some(at(0)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn changed_event_becomes_update_patch() {
        let mut n = normalizer();
        let out = n.normalize([RawEvent {
            observed_at: at(5),
            kind: RawEventKind::Changed {
                id: "10".into(),
                title: "Book".into(),
                url: Some("https://book.example".into()),
            },
        }]);
        assert_eq!(out[0].origin.event, EventKind::Changed);
        assert_eq!(
            out[0].op,
            MutationOp::Update {
                id: "10".into(),
                patch: NodePatch {
                    title: Some("Book".into()),
                    url: Some("https://book.example".into()),
                    date_modified: Some(at(5)),
                }
            }
        );
    }
}
