//! Applies sequenced mutations to the mirror inside one write transaction.
//!
//! Every operation keeps sibling indices dense from zero and the parent
//! graph acyclic.  Mutations whose parent is not there yet are parked and
//! retried once at the end of the batch; if the parent is still missing the
//! node goes under the recovery root and the next full sync puts it back.

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use markmirror_store::{
    BookmarkNode, MirrorStore, NodeKind, NodePatch, NodeSource, RECOVERY_ROOT_ID, StoreError,
    WriteTxn,
};

use crate::mutation::{Mutation, MutationOp};

type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Steady state: replays at or below the cursor are skipped and the
    /// cursor advances in the same transaction.
    Incremental,
    /// Full sync: the cursor is left alone; the caller records progress.
    Bootstrap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Parent never showed up; node placed under the recovery root.
    ParentMissing,
    /// Parent exists but is a bookmark; node placed under the recovery root.
    ParentNotFolder,
    /// Move or update for a node the mirror does not have.
    MissingNode,
    /// Move would make a node its own ancestor.
    Cycle,
    /// Create for an existing id of the other kind.
    KindConflict,
    FolderUrlIgnored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Anomaly {
    pub sequence: u64,
    pub node_id: String,
    pub kind: AnomalyKind,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyOutcome {
    pub applied: usize,
    pub skipped: usize,
    /// Mutations parked at least once while waiting for their parent.
    pub deferred: usize,
    pub removed_nodes: usize,
    pub anomalies: Vec<Anomaly>,
    pub max_sequence: Option<u64>,
    /// The batch referenced state the mirror does not have; a full sync is
    /// the only way to converge.
    pub drift_detected: bool,
}

impl ApplyOutcome {
    fn note(&mut self, sequence: u64, node_id: &str, kind: AnomalyKind, detail: String) {
        warn!(sequence, node_id, ?kind, "{detail}");
        if matches!(kind, AnomalyKind::MissingNode | AnomalyKind::KindConflict) {
            self.drift_detected = true;
        }
        self.anomalies.push(Anomaly {
            sequence,
            node_id: node_id.to_string(),
            kind,
            detail,
        });
    }
}

enum Step {
    Applied,
    Skipped,
    Park,
}

enum Parent {
    Ready(Option<String>),
    Park,
    Recover(AnomalyKind),
}

/// Apply `mutations` inside `txn`, in sequence order.  Nothing is committed
/// here; the caller owns the transaction.
pub fn apply(txn: &mut WriteTxn, mut mutations: Vec<Mutation>, mode: ApplyMode) -> Result<ApplyOutcome> {
    mutations.sort_by_key(|m| m.sequence);
    let mut outcome = ApplyOutcome::default();

    let cursor = match mode {
        ApplyMode::Incremental => Some(txn.get_cursor()?.unwrap_or_default()),
        ApplyMode::Bootstrap => None,
    };
    let floor = cursor.as_ref().map(|c| c.sequence);

    let mut parked = Vec::new();
    for mutation in mutations {
        if floor.is_some_and(|f| mutation.sequence <= f) {
            debug!(sequence = mutation.sequence, "replayed mutation skipped");
            outcome.skipped += 1;
            continue;
        }
        outcome.max_sequence = outcome.max_sequence.max(Some(mutation.sequence));
        match step(txn, &mutation, false, &mut outcome)? {
            Step::Applied => outcome.applied += 1,
            Step::Skipped => outcome.skipped += 1,
            Step::Park => {
                outcome.deferred += 1;
                parked.push(mutation);
            }
        }
    }

    for mutation in parked {
        match step(txn, &mutation, true, &mut outcome)? {
            Step::Applied => outcome.applied += 1,
            Step::Skipped | Step::Park => outcome.skipped += 1,
        }
    }

    if let (Some(mut cursor), Some(max)) = (cursor, outcome.max_sequence) {
        if max > cursor.sequence {
            cursor.sequence = max;
            txn.put_cursor(&cursor)?;
        }
    }
    Ok(outcome)
}

/// Apply one incremental batch in its own transaction.
pub fn apply_batch(store: &MirrorStore, mutations: Vec<Mutation>) -> Result<ApplyOutcome> {
    let count = mutations.len();
    let mut txn = store.write()?;
    let outcome = apply(&mut txn, mutations, ApplyMode::Incremental)?;
    txn.commit()?;
    info!(
        mutations = count,
        applied = outcome.applied,
        skipped = outcome.skipped,
        deferred = outcome.deferred,
        anomalies = outcome.anomalies.len(),
        cursor = ?outcome.max_sequence,
        "batch committed"
    );
    Ok(outcome)
}

fn step(txn: &mut WriteTxn, m: &Mutation, last_chance: bool, outcome: &mut ApplyOutcome) -> Result<Step> {
    match &m.op {
        MutationOp::Create(node) => create(txn, m.sequence, node, last_chance, outcome),
        MutationOp::Remove { id } => remove(txn, id, outcome),
        MutationOp::Move {
            id,
            parent_id,
            index,
        } => move_node(txn, m.sequence, id, parent_id.as_deref(), *index, last_chance, outcome),
        MutationOp::Update { id, patch } => update(txn, m.sequence, id, patch, outcome),
    }
}

fn create(
    txn: &mut WriteTxn,
    sequence: u64,
    node: &BookmarkNode,
    last_chance: bool,
    outcome: &mut ApplyOutcome,
) -> Result<Step> {
    if let Some(existing) = txn.get_node(&node.id)? {
        if existing.kind != node.kind {
            outcome.note(
                sequence,
                &node.id,
                AnomalyKind::KindConflict,
                format!(
                    "create of {} {} collides with existing {}",
                    node.kind.as_str(),
                    node.id,
                    existing.kind.as_str()
                ),
            );
            return Ok(Step::Skipped);
        }
        if existing.same_content(node) {
            return Ok(Step::Skipped);
        }
        let patch = NodePatch {
            title: Some(node.title.clone()),
            url: node.url.clone(),
            date_modified: node.date_modified,
        };
        return update(txn, sequence, &node.id, &patch, outcome);
    }

    let (parent, index) = match resolve_parent(txn, node.parent_id.as_deref(), last_chance)? {
        Parent::Ready(parent) => (parent, node.index),
        Parent::Park => return Ok(Step::Park),
        Parent::Recover(kind) => {
            recover(txn, sequence, &node.id, node.parent_id.as_deref(), kind, outcome)?;
            (Some(RECOVERY_ROOT_ID.to_string()), u32::MAX)
        }
    };

    let mut node = node.clone();
    if node.kind == NodeKind::Folder {
        node.url = None;
    }
    node.parent_id = parent;
    let siblings = txn.get_children(node.parent_id.as_deref())?;
    place(txn, node, siblings, index)?;
    Ok(Step::Applied)
}

fn remove(txn: &mut WriteTxn, id: &str, outcome: &mut ApplyOutcome) -> Result<Step> {
    let Some(node) = txn.get_node(id)? else {
        return Ok(Step::Skipped);
    };
    let mut stack = vec![id.to_string()];
    let mut removed = 0;
    while let Some(current) = stack.pop() {
        stack.extend(txn.child_ids(Some(&current))?);
        if txn.delete_node(&current)?.is_some() {
            removed += 1;
        }
    }
    close_gap(txn, node.parent_id.as_deref(), id)?;
    outcome.removed_nodes += removed;
    Ok(Step::Applied)
}

fn move_node(
    txn: &mut WriteTxn,
    sequence: u64,
    id: &str,
    parent_id: Option<&str>,
    index: u32,
    last_chance: bool,
    outcome: &mut ApplyOutcome,
) -> Result<Step> {
    let Some(node) = txn.get_node(id)? else {
        outcome.note(
            sequence,
            id,
            AnomalyKind::MissingNode,
            format!("move of unknown node {id}"),
        );
        return Ok(Step::Skipped);
    };

    let (target, index) = match resolve_parent(txn, parent_id, last_chance)? {
        Parent::Ready(target) => (target, index),
        Parent::Park => return Ok(Step::Park),
        Parent::Recover(kind) => {
            recover(txn, sequence, id, parent_id, kind, outcome)?;
            (Some(RECOVERY_ROOT_ID.to_string()), u32::MAX)
        }
    };

    if let Some(target) = target.as_deref() {
        if is_within(txn, target, id)? {
            outcome.note(
                sequence,
                id,
                AnomalyKind::Cycle,
                format!("move of {id} under {target} would create a cycle"),
            );
            return Ok(Step::Skipped);
        }
    }

    let siblings: Vec<BookmarkNode> = txn
        .get_children(target.as_deref())?
        .into_iter()
        .filter(|s| s.id != id)
        .collect();
    let pos = (index as usize).min(siblings.len()) as u32;
    let same_parent = node.parent_id == target;
    if same_parent && node.index == pos {
        return Ok(Step::Skipped);
    }
    if !same_parent {
        close_gap(txn, node.parent_id.as_deref(), id)?;
    }

    let mut moved = node;
    moved.parent_id = target;
    place(txn, moved, siblings, pos)?;
    Ok(Step::Applied)
}

fn update(
    txn: &mut WriteTxn,
    sequence: u64,
    id: &str,
    patch: &NodePatch,
    outcome: &mut ApplyOutcome,
) -> Result<Step> {
    let Some(mut node) = txn.get_node(id)? else {
        outcome.note(
            sequence,
            id,
            AnomalyKind::MissingNode,
            format!("update of unknown node {id}"),
        );
        return Ok(Step::Skipped);
    };

    let mut changed = false;
    if let Some(title) = &patch.title {
        if *title != node.title {
            node.title = title.clone();
            changed = true;
        }
    }
    if let Some(url) = &patch.url {
        if node.is_folder() {
            outcome.note(
                sequence,
                id,
                AnomalyKind::FolderUrlIgnored,
                format!("url change for folder {id} ignored"),
            );
        } else if node.url.as_deref() != Some(url.as_str()) {
            node.url = Some(url.clone());
            changed = true;
        }
    }
    if !changed {
        return Ok(Step::Skipped);
    }
    node.date_modified = patch.date_modified.or_else(|| Some(Utc::now()));
    txn.put_node(&node)?;
    Ok(Step::Applied)
}

fn resolve_parent(txn: &WriteTxn, parent_id: Option<&str>, last_chance: bool) -> Result<Parent> {
    let Some(parent_id) = parent_id else {
        return Ok(Parent::Ready(None));
    };
    Ok(match txn.get_node(parent_id)? {
        Some(parent) if parent.is_folder() => Parent::Ready(Some(parent_id.to_string())),
        Some(_) => Parent::Recover(AnomalyKind::ParentNotFolder),
        None if last_chance => Parent::Recover(AnomalyKind::ParentMissing),
        None => Parent::Park,
    })
}

fn recover(
    txn: &mut WriteTxn,
    sequence: u64,
    id: &str,
    intended: Option<&str>,
    kind: AnomalyKind,
    outcome: &mut ApplyOutcome,
) -> Result<()> {
    if txn.get_node(RECOVERY_ROOT_ID)?.is_none() {
        let roots = txn.get_children(None)?;
        let mut folder = BookmarkNode::folder(RECOVERY_ROOT_ID, None, roots.len() as u32, "Recovered bookmarks");
        folder.date_added = Some(Utc::now());
        txn.put_node(&folder)?;
    }
    outcome.note(
        sequence,
        id,
        kind,
        format!(
            "parent {} unusable for {id}; placed under recovery root",
            intended.unwrap_or("<root>")
        ),
    );
    Ok(())
}

/// Whether `candidate` is `ancestor` or lies below it.
fn is_within(txn: &WriteTxn, candidate: &str, ancestor: &str) -> Result<bool> {
    let limit = txn.node_count()?;
    let mut current = Some(candidate.to_string());
    let mut steps = 0u64;
    while let Some(id) = current {
        if id == ancestor {
            return Ok(true);
        }
        steps += 1;
        if steps > limit {
            return Ok(true);
        }
        current = txn.get_node(&id)?.and_then(|n| n.parent_id);
    }
    Ok(false)
}

/// Insert `node` at `index` (clamped) among `siblings` and renumber the list.
/// `siblings` must not contain `node`.
fn place(txn: &mut WriteTxn, node: BookmarkNode, mut siblings: Vec<BookmarkNode>, index: u32) -> Result<()> {
    let pos = (index as usize).min(siblings.len());
    let id = node.id.clone();
    siblings.insert(pos, node);
    for (i, mut sibling) in siblings.into_iter().enumerate() {
        let i = i as u32;
        if sibling.id == id || sibling.index != i {
            sibling.index = i;
            txn.put_node(&sibling)?;
        }
    }
    Ok(())
}

/// Renumber the children of `parent` after `departed` left.
fn close_gap(txn: &mut WriteTxn, parent: Option<&str>, departed: &str) -> Result<()> {
    let siblings = txn.get_children(parent)?;
    for (i, mut sibling) in siblings.into_iter().filter(|s| s.id != departed).enumerate() {
        let i = i as u32;
        if sibling.index != i {
            sibling.index = i;
            txn.put_node(&sibling)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::TempDir;

    use super::*;
    use crate::mutation::{EventKind, MutationOrigin};
    use crate::testing::{open_store, sample_tree, seed_store};

    fn m(sequence: u64, op: MutationOp) -> Mutation {
        Mutation::new(
            sequence,
            MutationOrigin {
                event: EventKind::Moved,
                node_id: op.node_id().to_string(),
                observed_at: None,
            },
            op,
        )
    }

    fn mv(id: &str, parent: &str, index: u32) -> MutationOp {
        MutationOp::Move {
            id: id.into(),
            parent_id: Some(parent.into()),
            index,
        }
    }

    fn child_ids(store: &MirrorStore, parent: &str) -> Vec<(String, u32)> {
        store
            .read()
            .unwrap()
            .get_children(Some(parent))
            .unwrap()
            .into_iter()
            .map(|n| (n.id, n.index))
            .collect()
    }

    fn ids(list: &[(String, u32)]) -> Vec<&str> {
        list.iter().map(|(id, _)| id.as_str()).collect()
    }

    fn seeded() -> Result<(TempDir, MirrorStore)> {
        let dir = TempDir::new()?;
        let store = open_store(dir.path());
        seed_store(&store, &sample_tree(), 0);
        Ok((dir, store))
    }

    #[test]
    fn create_inserts_and_shifts_siblings() -> Result<()> {
        let (_dir, store) = seeded()?;
        let node = BookmarkNode::bookmark("12", "1", 0, "Docs", "https://docs.rs");
        let outcome = apply_batch(&store, vec![m(1, MutationOp::Create(node))])?;
        assert_eq!(outcome.applied, 1);
        let bar = child_ids(&store, "1");
        assert_eq!(
            bar,
            [("12".to_string(), 0), ("10".to_string(), 1), ("11".to_string(), 2)]
        );
        assert!(store.verify()?.is_empty());
        Ok(())
    }

    #[test]
    fn out_of_range_index_appends() -> Result<()> {
        let (_dir, store) = seeded()?;
        let node = BookmarkNode::bookmark("12", "1", 99, "Docs", "https://docs.rs");
        apply_batch(&store, vec![m(1, MutationOp::Create(node))])?;
        assert_eq!(child_ids(&store, "1").last(), Some(&("12".to_string(), 2)));
        Ok(())
    }

    #[test]
    fn remove_cascades_and_closes_gap() -> Result<()> {
        let (_dir, store) = seeded()?;
        let outcome = apply_batch(&store, vec![m(1, MutationOp::Remove { id: "20".into() })])?;
        assert_eq!(outcome.removed_nodes, 2);
        let tx = store.read()?;
        assert!(tx.get_node("21")?.is_none());
        assert_eq!(tx.get_node("22")?.map(|n| n.index), Some(0));
        assert!(store.verify()?.is_empty());
        Ok(())
    }

    #[test]
    fn remove_of_unknown_node_is_a_noop() -> Result<()> {
        let (_dir, store) = seeded()?;
        let outcome = apply_batch(&store, vec![m(1, MutationOp::Remove { id: "nope".into() })])?;
        assert_eq!((outcome.applied, outcome.skipped), (0, 1));
        assert!(!outcome.drift_detected);
        Ok(())
    }

    #[test]
    fn move_across_parents_renumbers_both_sides() -> Result<()> {
        let (_dir, store) = seeded()?;
        apply_batch(&store, vec![m(1, mv("10", "2", 1))])?;
        assert_eq!(child_ids(&store, "1"), [("11".to_string(), 0)]);
        assert_eq!(ids(&child_ids(&store, "2")), ["20", "10", "22"]);
        assert!(store.verify()?.is_empty());
        Ok(())
    }

    #[test]
    fn move_within_parent_reorders() -> Result<()> {
        let (_dir, store) = seeded()?;
        let outcome = apply_batch(&store, vec![m(1, mv("10", "1", 1))])?;
        assert_eq!(outcome.applied, 1);
        assert_eq!(ids(&child_ids(&store, "1")), ["11", "10"]);

        let again = apply_batch(&store, vec![m(2, mv("10", "1", 1))])?;
        assert_eq!((again.applied, again.skipped), (0, 1));
        Ok(())
    }

    #[test]
    fn move_into_own_subtree_is_rejected() -> Result<()> {
        let (_dir, store) = seeded()?;
        let before = crate::testing::mirror_shape(&store);
        let outcome = apply_batch(&store, vec![m(1, mv("2", "20", 0))])?;
        assert_eq!(outcome.anomalies[0].kind, AnomalyKind::Cycle);
        assert_eq!(crate::testing::mirror_shape(&store), before);
        Ok(())
    }

    #[test]
    fn move_of_unknown_node_flags_drift() -> Result<()> {
        let (_dir, store) = seeded()?;
        let outcome = apply_batch(&store, vec![m(1, mv("ghost", "1", 0))])?;
        assert!(outcome.drift_detected);
        assert_eq!(outcome.anomalies[0].kind, AnomalyKind::MissingNode);
        Ok(())
    }

    #[test]
    fn child_before_parent_is_parked_then_applied() -> Result<()> {
        let (_dir, store) = seeded()?;
        let child = BookmarkNode::bookmark("31", "30", 0, "Inner", "https://inner.example");
        let folder = BookmarkNode::folder("30", Some("1"), 0, "New folder");
        let outcome = apply_batch(
            &store,
            vec![m(1, MutationOp::Create(child)), m(2, MutationOp::Create(folder))],
        )?;
        assert_eq!((outcome.applied, outcome.deferred), (2, 1));
        assert!(outcome.anomalies.is_empty());
        assert_eq!(child_ids(&store, "30"), [("31".to_string(), 0)]);
        Ok(())
    }

    #[test]
    fn unresolvable_parent_goes_to_recovery_root() -> Result<()> {
        let (_dir, store) = seeded()?;
        let orphan = BookmarkNode::bookmark("40", "missing", 0, "Orphan", "https://orphan.example");
        let outcome = apply_batch(&store, vec![m(1, MutationOp::Create(orphan))])?;
        assert_eq!(outcome.anomalies[0].kind, AnomalyKind::ParentMissing);
        assert_eq!(child_ids(&store, RECOVERY_ROOT_ID), [("40".to_string(), 0)]);
        let recovery = store.read()?.get_node(RECOVERY_ROOT_ID)?.unwrap();
        assert_eq!((recovery.parent_id, recovery.index), (None, 1));
        assert!(store.verify()?.is_empty());
        Ok(())
    }

    #[test]
    fn move_into_folder_removed_earlier_in_batch_is_recovered() -> Result<()> {
        let (_dir, store) = seeded()?;
        let outcome = apply_batch(
            &store,
            vec![m(1, MutationOp::Remove { id: "20".into() }), m(2, mv("22", "20", 0))],
        )?;
        assert_eq!(outcome.deferred, 1);
        assert_eq!(outcome.removed_nodes, 2);
        assert_eq!(outcome.anomalies.len(), 1);
        assert_eq!(outcome.anomalies[0].kind, AnomalyKind::ParentMissing);
        assert_eq!(outcome.anomalies[0].node_id, "22");

        let moved = store.read()?.get_node("22")?.unwrap();
        assert_eq!(moved.parent_id.as_deref(), Some(RECOVERY_ROOT_ID));
        assert_eq!(moved.index, 0);
        assert!(child_ids(&store, "2").is_empty());
        assert!(store.verify()?.is_empty());
        Ok(())
    }

    /// One random mutation against the ids seen so far.  Subjects may have
    /// been removed already and parents may be bookmarks or never exist, so
    /// every recovery path gets exercised.
    fn random_op(rng: &mut StdRng, known: &mut Vec<String>, sequence: u64) -> MutationOp {
        let pick = |rng: &mut StdRng, known: &[String]| known[rng.gen_range(0..known.len())].clone();
        let parent = |rng: &mut StdRng, known: &[String]| match rng.gen_range(0..10) {
            0 => "never-created".to_string(),
            1 => "0".to_string(),
            _ => pick(rng, known),
        };
        match rng.gen_range(0..4) {
            0 => {
                let id = format!("n{sequence}");
                let parent = parent(rng, known.as_slice());
                let index = rng.gen_range(0..6);
                let node = if rng.gen_bool(0.4) {
                    BookmarkNode::folder(&id, Some(parent.as_str()), index, &format!("Folder {sequence}"))
                } else {
                    BookmarkNode::bookmark(
                        &id,
                        &parent,
                        index,
                        &format!("Page {sequence}"),
                        &format!("https://page{sequence}.example"),
                    )
                };
                known.push(id);
                MutationOp::Create(node)
            }
            1 => MutationOp::Remove {
                id: pick(rng, known.as_slice()),
            },
            2 => {
                let id = pick(rng, known.as_slice());
                let target = parent(rng, known.as_slice());
                mv(&id, &target, rng.gen_range(0..6))
            }
            _ => MutationOp::Update {
                id: pick(rng, known.as_slice()),
                patch: NodePatch {
                    title: Some(format!("Renamed {sequence}")),
                    url: rng
                        .gen_bool(0.5)
                        .then(|| format!("https://renamed{sequence}.example")),
                    date_modified: None,
                },
            },
        }
    }

    #[test]
    fn random_interleavings_keep_invariants() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0x6d69_7272_6f72);
        for round in 0..40 {
            let (_dir, store) = seeded()?;
            let mut known: Vec<String> = ["1", "2", "10", "11", "20", "21", "22"]
                .into_iter()
                .map(String::from)
                .collect();
            let mut sequence = 0;
            for batch_no in 0..15 {
                let mut batch = Vec::new();
                for _ in 0..rng.gen_range(1..=6) {
                    sequence += 1;
                    batch.push(m(sequence, random_op(&mut rng, &mut known, sequence)));
                }
                apply_batch(&store, batch)?;
                let violations = store.verify()?;
                assert!(
                    violations.is_empty(),
                    "round {round}, batch {batch_no}: {violations:?}"
                );
                assert_eq!(store.get_cursor()?.unwrap().sequence, sequence);
            }
            assert!(store.read()?.get_node("0")?.is_some());
        }
        Ok(())
    }

    #[test]
    fn bookmark_parent_is_treated_as_unusable() -> Result<()> {
        let (_dir, store) = seeded()?;
        let node = BookmarkNode::bookmark("41", "10", 0, "Nested", "https://nested.example");
        let outcome = apply_batch(&store, vec![m(1, MutationOp::Create(node))])?;
        assert_eq!(outcome.anomalies[0].kind, AnomalyKind::ParentNotFolder);
        assert_eq!(
            store.read()?.get_node("41")?.unwrap().parent_id.as_deref(),
            Some(RECOVERY_ROOT_ID)
        );
        Ok(())
    }

    #[test]
    fn update_patches_fields_and_ignores_folder_url() -> Result<()> {
        let (_dir, store) = seeded()?;
        let outcome = apply_batch(
            &store,
            vec![
                m(
                    1,
                    MutationOp::Update {
                        id: "10".into(),
                        patch: NodePatch {
                            title: Some("The Book".into()),
                            url: Some("https://book.example".into()),
                            date_modified: None,
                        },
                    },
                ),
                m(
                    2,
                    MutationOp::Update {
                        id: "1".into(),
                        patch: NodePatch {
                            title: None,
                            url: Some("https://nope.example".into()),
                            date_modified: None,
                        },
                    },
                ),
            ],
        )?;
        assert_eq!((outcome.applied, outcome.skipped), (1, 1));
        assert_eq!(outcome.anomalies[0].kind, AnomalyKind::FolderUrlIgnored);
        let tx = store.read()?;
        let book = tx.get_node("10")?.unwrap();
        assert_eq!(book.title, "The Book");
        assert_eq!(book.url.as_deref(), Some("https://book.example"));
        assert!(book.date_modified.is_some());
        assert!(tx.get_node("1")?.unwrap().url.is_none());
        Ok(())
    }

    #[test]
    fn create_of_existing_id_updates_or_skips() -> Result<()> {
        let (_dir, store) = seeded()?;
        let same = BookmarkNode::bookmark("10", "1", 0, "Rust Book", "https://doc.rust-lang.org/book/");
        let renamed = BookmarkNode::bookmark("11", "1", 1, "tokio.rs", "https://tokio.rs");
        let folder = BookmarkNode::folder("10", Some("1"), 0, "Clash");
        let outcome = apply_batch(
            &store,
            vec![
                m(1, MutationOp::Create(same)),
                m(2, MutationOp::Create(renamed)),
                m(3, MutationOp::Create(folder)),
            ],
        )?;
        assert_eq!((outcome.applied, outcome.skipped), (1, 2));
        assert_eq!(outcome.anomalies[0].kind, AnomalyKind::KindConflict);
        assert!(outcome.drift_detected);
        assert_eq!(store.read()?.get_node("11")?.unwrap().title, "tokio.rs");
        Ok(())
    }

    #[test]
    fn replayed_batch_is_skipped_via_cursor() -> Result<()> {
        let (_dir, store) = seeded()?;
        let batch = vec![
            m(1, mv("10", "2", 0)),
            m(2, MutationOp::Remove { id: "22".into() }),
        ];
        let first = apply_batch(&store, batch.clone())?;
        assert_eq!(first.applied, 2);
        assert_eq!(store.get_cursor()?.unwrap().sequence, 2);
        let shape = crate::testing::mirror_shape(&store);

        let replay = apply_batch(&store, batch)?;
        assert_eq!((replay.applied, replay.skipped), (0, 2));
        assert_eq!(crate::testing::mirror_shape(&store), shape);
        assert_eq!(store.get_cursor()?.unwrap().sequence, 2);
        Ok(())
    }

    #[test]
    fn bootstrap_mode_leaves_cursor_alone() -> Result<()> {
        let (_dir, store) = seeded()?;
        let mut txn = store.write()?;
        let outcome = apply(&mut txn, vec![m(7, mv("10", "1", 1))], ApplyMode::Bootstrap)?;
        txn.commit()?;
        assert_eq!(outcome.max_sequence, Some(7));
        assert_eq!(store.get_cursor()?.unwrap().sequence, 0);
        Ok(())
    }

    #[test]
    fn failed_batch_leaves_no_partial_state() -> Result<()> {
        let (_dir, store) = seeded()?;
        let before = crate::testing::mirror_shape(&store);
        {
            let mut txn = store.write()?;
            apply(&mut txn, vec![m(1, MutationOp::Remove { id: "2".into() })], ApplyMode::Incremental)?;
            // simulated crash: never committed
        }
        assert_eq!(crate::testing::mirror_shape(&store), before);
        assert_eq!(store.get_cursor()?.unwrap().sequence, 0);
        Ok(())
    }
}
