//! Revision trees
//!
//! Every document owns a tree of revisions. Nodes live in an arena and point
//! at their parent by index, so the tree has no owning cycles and maps
//! one-to-one onto rows of the `revisions` table.
//!
//! ## Identity
//!
//! A revision is `(generation, hash)`. The hash is a SHA-256 digest over the
//! generation, the canonical JSON body (or a tombstone marker) and the parent
//! hash. Two replicas that perform the same edit mint the same revision, and
//! two independent edits of the same parent never collide.
//!
//! ## Winner
//!
//! The current revision is the greatest leaf under a [`ConflictResolver`].
//! The default rule orders leaves by generation, then by hash, so any two
//! replicas holding the same revisions agree without talking to each other.
//! Losing leaves stay in the tree.

use std::cmp::Ordering;
use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::models::{Body, Document, Revision};
use crate::storage::{StoreError, StoreResult};

/// Serialize a body the way it is hashed and stored
///
/// `serde_json::Map` keeps keys sorted, so equal bodies produce equal text.
pub fn canonical_body(body: &Body) -> StoreResult<String> {
    Ok(serde_json::to_string(body)?)
}

/// Compute the content-derived hash of a revision
///
/// `body` is the canonical JSON text, or `None` for a tombstone.
pub fn revision_hash(generation: u64, body: Option<&str>, parent: Option<&Revision>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(generation.to_string().as_bytes());
    hasher.update([0u8]);
    match body {
        Some(json) => {
            hasher.update(b"body:");
            hasher.update(json.as_bytes());
        }
        None => hasher.update(b"tombstone"),
    }
    hasher.update([0u8]);
    if let Some(parent) = parent {
        hasher.update(parent.hash.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// One revision with its parent link and content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionNode {
    pub revision: Revision,
    pub parent: Option<Revision>,
    pub deleted: bool,
    /// Canonical JSON body; `None` for tombstones
    pub body: Option<String>,
}

impl RevisionNode {
    /// Build the child of `parent` carrying `body` (or a tombstone)
    pub fn mint(parent: Option<&Revision>, body: Option<&Body>) -> StoreResult<Self> {
        let generation = parent.map_or(1, |p| p.generation + 1);
        let body = body.map(canonical_body).transpose()?;
        let hash = revision_hash(generation, body.as_deref(), parent);

        Ok(Self {
            revision: Revision::new(generation, hash),
            parent: parent.cloned(),
            deleted: body.is_none(),
            body,
        })
    }

    /// Check that the revision id matches the content it claims
    pub fn verify(&self) -> StoreResult<()> {
        let invalid = |details: String| StoreError::InvalidRevision {
            revision: self.revision.to_string(),
            details,
        };

        let expected_generation = self.parent.as_ref().map_or(1, |p| p.generation + 1);
        if self.revision.generation != expected_generation {
            return Err(invalid(format!(
                "generation should be {}",
                expected_generation
            )));
        }
        if self.deleted != self.body.is_none() {
            return Err(invalid("tombstone flag disagrees with body".to_string()));
        }

        let hash = revision_hash(
            self.revision.generation,
            self.body.as_deref(),
            self.parent.as_ref(),
        );
        if hash != self.revision.hash {
            return Err(invalid("hash does not match content".to_string()));
        }
        Ok(())
    }

    /// Parse the stored body (empty for tombstones)
    pub fn parsed_body(&self) -> StoreResult<Body> {
        match &self.body {
            Some(json) => Ok(serde_json::from_str(json)?),
            None => Ok(Body::new()),
        }
    }

    /// View this revision as a document
    pub fn to_document(&self, id: &str) -> StoreResult<Document> {
        Ok(Document {
            id: id.to_string(),
            revision: self.revision.clone(),
            deleted: self.deleted,
            body: self.parsed_body()?,
        })
    }
}

/// Picks the winning leaf of a revision tree
///
/// Implementations must be a total order that depends only on the nodes, so
/// that every replica computes the same winner from the same revisions.
pub trait ConflictResolver: Send + Sync {
    /// Compare two leaves; the greatest one wins
    fn compare(&self, a: &RevisionNode, b: &RevisionNode) -> Ordering;
}

/// Highest generation wins, ties broken by the highest hash
#[derive(Debug, Default, Clone, Copy)]
pub struct DeterministicResolver;

impl ConflictResolver for DeterministicResolver {
    fn compare(&self, a: &RevisionNode, b: &RevisionNode) -> Ordering {
        a.revision
            .generation
            .cmp(&b.revision.generation)
            .then_with(|| a.revision.hash.cmp(&b.revision.hash))
    }
}

/// Live leaves beat tombstones, then the deterministic rule applies
///
/// This is the CouchDB/PouchDB winner rule. With it, deleting a losing
/// branch dismisses that conflict without deleting the document.
#[derive(Debug, Default, Clone, Copy)]
pub struct LiveFirstResolver;

impl ConflictResolver for LiveFirstResolver {
    fn compare(&self, a: &RevisionNode, b: &RevisionNode) -> Ordering {
        b.deleted
            .cmp(&a.deleted)
            .then_with(|| DeterministicResolver.compare(a, b))
    }
}

#[derive(Debug, Clone)]
struct Slot {
    node: RevisionNode,
    parent: Option<usize>,
    children: usize,
}

/// Arena-backed revision tree of one document
///
/// Independent creations of the same id yield several generation-1 roots;
/// the winner rule covers that case unchanged.
#[derive(Debug, Clone)]
pub struct RevisionTree {
    id: String,
    slots: Vec<Slot>,
    index: HashMap<Revision, usize>,
}

impl RevisionTree {
    /// Create an empty tree
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            slots: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Rebuild a tree from persisted nodes, checking structural invariants
    ///
    /// Any violation is reported as [`StoreError::Corrupt`].
    pub fn from_nodes(id: impl Into<String>, mut nodes: Vec<RevisionNode>) -> StoreResult<Self> {
        let mut tree = Self::new(id);
        // Parents always have a lower generation, so they are inserted first.
        nodes.sort_by(|a, b| a.revision.cmp(&b.revision));

        for node in nodes {
            let rev = node.revision.to_string();
            if tree.index.contains_key(&node.revision) {
                return Err(tree.corrupt(format!("duplicate revision {}", rev)));
            }
            if node.deleted != node.body.is_none() {
                return Err(tree.corrupt(format!("revision {} has inconsistent tombstone", rev)));
            }
            match &node.parent {
                Some(parent) if !tree.index.contains_key(parent) => {
                    return Err(
                        tree.corrupt(format!("parent {} of revision {} is missing", parent, rev))
                    );
                }
                Some(parent) if node.revision.generation != parent.generation + 1 => {
                    return Err(tree.corrupt(format!(
                        "revision {} is not one generation after its parent {}",
                        rev, parent
                    )));
                }
                None if node.revision.generation != 1 => {
                    return Err(tree.corrupt(format!("root revision {} is not generation 1", rev)));
                }
                _ => {}
            }
            tree.push(node);
        }

        Ok(tree)
    }

    fn corrupt(&self, details: String) -> StoreError {
        StoreError::Corrupt {
            id: self.id.clone(),
            details,
        }
    }

    fn push(&mut self, node: RevisionNode) {
        let parent = node.parent.as_ref().and_then(|p| self.index.get(p).copied());
        if let Some(p) = parent {
            self.slots[p].children += 1;
        }
        self.index.insert(node.revision.clone(), self.slots.len());
        self.slots.push(Slot {
            node,
            parent,
            children: 0,
        });
    }

    /// Document id this tree belongs to
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn contains(&self, revision: &Revision) -> bool {
        self.index.contains_key(revision)
    }

    /// Look up a revision
    pub fn get(&self, revision: &Revision) -> Option<&RevisionNode> {
        self.index.get(revision).map(|&i| &self.slots[i].node)
    }

    /// Mint a new revision under `parent` without inserting it
    pub fn mint(&self, parent: Option<&Revision>, body: Option<&Body>) -> StoreResult<RevisionNode> {
        if let Some(parent) = parent {
            if !self.contains(parent) {
                return Err(StoreError::NotFound {
                    id: format!("{}@{}", self.id, parent),
                });
            }
        }
        RevisionNode::mint(parent, body)
    }

    /// Graft a revision into the tree
    ///
    /// Returns `false` when the revision is already present: revision ids are
    /// content-derived, so re-inserting one changes nothing.
    pub fn insert(&mut self, node: RevisionNode) -> StoreResult<bool> {
        if self.contains(&node.revision) {
            return Ok(false);
        }
        if let Some(parent) = &node.parent {
            if !self.contains(parent) {
                return Err(StoreError::MissingAncestor {
                    id: self.id.clone(),
                    revision: node.revision.to_string(),
                    parent: parent.to_string(),
                });
            }
        }
        node.verify()?;
        self.push(node);
        Ok(true)
    }

    /// All revisions without descendants
    pub fn leaves(&self) -> impl Iterator<Item = &RevisionNode> {
        self.slots
            .iter()
            .filter(|slot| slot.children == 0)
            .map(|slot| &slot.node)
    }

    /// The winning leaf under `resolver`
    pub fn winner(&self, resolver: &dyn ConflictResolver) -> Option<&RevisionNode> {
        self.leaves().max_by(|a, b| resolver.compare(a, b))
    }

    /// Non-winning leaves, best first
    pub fn conflicts(&self, resolver: &dyn ConflictResolver) -> Vec<Revision> {
        let Some(winner) = self.winner(resolver) else {
            return Vec::new();
        };
        let mut losers: Vec<&RevisionNode> = self
            .leaves()
            .filter(|leaf| leaf.revision != winner.revision)
            .collect();
        losers.sort_by(|a, b| resolver.compare(b, a));
        losers.into_iter().map(|n| n.revision.clone()).collect()
    }

    /// Ancestry of `revision`, newest first, ending at its root
    pub fn history(&self, revision: &Revision) -> Vec<Revision> {
        let mut path = Vec::new();
        let mut cursor = self.index.get(revision).copied();
        while let Some(i) = cursor {
            path.push(self.slots[i].node.revision.clone());
            cursor = self.slots[i].parent;
        }
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(value: serde_json::Value) -> Body {
        value.as_object().cloned().unwrap()
    }

    fn edit(tree: &mut RevisionTree, parent: Option<&Revision>, value: serde_json::Value) -> Revision {
        let node = tree.mint(parent, Some(&body(value))).unwrap();
        let rev = node.revision.clone();
        assert!(tree.insert(node).unwrap());
        rev
    }

    #[test]
    fn test_mint_root_and_child_generations() {
        let mut tree = RevisionTree::new("e1");
        let r1 = edit(&mut tree, None, json!({"amount": 12}));
        let r2 = edit(&mut tree, Some(&r1), json!({"amount": 15}));

        assert_eq!(r1.generation, 1);
        assert_eq!(r2.generation, 2);
        assert_eq!(r1.hash.len(), 64);
        assert_eq!(tree.winner(&DeterministicResolver).unwrap().revision, r2);
    }

    #[test]
    fn test_hash_is_content_derived() {
        let parent = Revision::new(1, "ab");
        let a = RevisionNode::mint(Some(&parent), Some(&body(json!({"x": 1})))).unwrap();
        let b = RevisionNode::mint(Some(&parent), Some(&body(json!({"x": 1})))).unwrap();
        let c = RevisionNode::mint(Some(&parent), Some(&body(json!({"x": 2})))).unwrap();
        let tomb = RevisionNode::mint(Some(&parent), None).unwrap();

        assert_eq!(a.revision, b.revision);
        assert_ne!(a.revision, c.revision);
        assert_ne!(a.revision, tomb.revision);
        assert!(tomb.deleted);
    }

    #[test]
    fn test_canonical_body_sorts_keys() {
        let a = body(json!({"b": 1, "a": 2}));
        let b = body(json!({"a": 2, "b": 1}));
        assert_eq!(canonical_body(&a).unwrap(), canonical_body(&b).unwrap());
    }

    #[test]
    fn test_insert_existing_is_noop() {
        let mut tree = RevisionTree::new("e1");
        let r1 = edit(&mut tree, None, json!({"n": 1}));
        let again = tree.get(&r1).cloned().unwrap();

        assert!(!tree.insert(again).unwrap());
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_insert_rejects_missing_parent() {
        let mut tree = RevisionTree::new("e1");
        let stranger = RevisionNode::mint(Some(&Revision::new(1, "ff")), None).unwrap();

        let err = tree.insert(stranger).unwrap_err();
        assert!(matches!(err, StoreError::MissingAncestor { .. }));
    }

    #[test]
    fn test_insert_rejects_forged_hash() {
        let mut tree = RevisionTree::new("e1");
        let mut node = RevisionNode::mint(None, Some(&body(json!({"n": 1})))).unwrap();
        node.body = Some("{\"n\":2}".to_string());

        let err = tree.insert(node).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRevision { .. }));
    }

    #[test]
    fn test_winner_is_commutative() {
        let root = RevisionNode::mint(None, Some(&body(json!({"t": "buy milk"})))).unwrap();
        let left = RevisionNode::mint(Some(&root.revision), Some(&body(json!({"t": "buy oat milk"})))).unwrap();
        let right = RevisionNode::mint(Some(&root.revision), Some(&body(json!({"t": "buy bread"})))).unwrap();

        let mut ab = RevisionTree::new("t1");
        ab.insert(root.clone()).unwrap();
        ab.insert(left.clone()).unwrap();
        ab.insert(right.clone()).unwrap();

        let mut ba = RevisionTree::new("t1");
        ba.insert(root).unwrap();
        ba.insert(right.clone()).unwrap();
        ba.insert(left.clone()).unwrap();

        let resolver = DeterministicResolver;
        let winner_ab = ab.winner(&resolver).unwrap().revision.clone();
        let winner_ba = ba.winner(&resolver).unwrap().revision.clone();
        assert_eq!(winner_ab, winner_ba);

        let expected = std::cmp::max(left.revision.clone(), right.revision.clone());
        assert_eq!(winner_ab, expected);
        assert_eq!(ab.conflicts(&resolver), ba.conflicts(&resolver));
        assert_eq!(ab.conflicts(&resolver).len(), 1);
    }

    #[test]
    fn test_higher_generation_beats_higher_hash() {
        let mut tree = RevisionTree::new("n1");
        let r1 = edit(&mut tree, None, json!({"v": 0}));
        let a2 = edit(&mut tree, Some(&r1), json!({"v": "a"}));
        let b2 = edit(&mut tree, Some(&r1), json!({"v": "b"}));
        let (low, high) = if a2 < b2 { (a2, b2) } else { (b2, a2) };
        let low3 = edit(&mut tree, Some(&low), json!({"v": "low-branch"}));

        let resolver = DeterministicResolver;
        assert_eq!(tree.winner(&resolver).unwrap().revision, low3);
        assert_eq!(tree.conflicts(&resolver), vec![high]);
    }

    #[test]
    fn test_tombstone_on_losing_branch() {
        let mut tree = RevisionTree::new("n1");
        let r1 = edit(&mut tree, None, json!({"v": 0}));
        let a2 = edit(&mut tree, Some(&r1), json!({"v": "a"}));
        let b2 = edit(&mut tree, Some(&r1), json!({"v": "b"}));
        let live_winner = std::cmp::max(a2.clone(), b2.clone());
        let loser = std::cmp::min(a2, b2);

        let tomb = tree.mint(Some(&loser), None).unwrap();
        let tomb_rev = tomb.revision.clone();
        tree.insert(tomb).unwrap();

        // Generation 3 tombstone outranks the generation 2 leaf
        let strict = DeterministicResolver;
        assert_eq!(tree.winner(&strict).unwrap().revision, tomb_rev);
        assert_eq!(tree.conflicts(&strict), vec![live_winner.clone()]);

        let live_first = LiveFirstResolver;
        assert_eq!(tree.winner(&live_first).unwrap().revision, live_winner);
        assert_eq!(tree.conflicts(&live_first), vec![tomb_rev]);
    }

    #[test]
    fn test_history_walks_to_root() {
        let mut tree = RevisionTree::new("n1");
        let r1 = edit(&mut tree, None, json!({"v": 1}));
        let r2 = edit(&mut tree, Some(&r1), json!({"v": 2}));
        let r3 = edit(&mut tree, Some(&r2), json!({"v": 3}));

        assert_eq!(tree.history(&r3), vec![r3, r2, r1]);
        assert!(tree.history(&Revision::new(9, "00")).is_empty());
    }

    #[test]
    fn test_from_nodes_detects_orphan() {
        let root = RevisionNode::mint(None, Some(&body(json!({"v": 1})))).unwrap();
        let orphan = RevisionNode::mint(Some(&Revision::new(1, "dead")), None).unwrap();

        let err = RevisionTree::from_nodes("x", vec![root, orphan]).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn test_from_nodes_detects_generation_gap() {
        let root = RevisionNode::mint(None, Some(&body(json!({"v": 1})))).unwrap();
        let mut child = RevisionNode::mint(Some(&root.revision), None).unwrap();
        child.revision.generation = 5;

        let err = RevisionTree::from_nodes("x", vec![child, root]).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn test_from_nodes_accepts_unsorted_input() {
        let root = RevisionNode::mint(None, Some(&body(json!({"v": 1})))).unwrap();
        let child = RevisionNode::mint(Some(&root.revision), Some(&body(json!({"v": 2})))).unwrap();
        let leaf = child.revision.clone();

        let tree = RevisionTree::from_nodes("x", vec![child, root]).unwrap();
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.winner(&DeterministicResolver).unwrap().revision, leaf);
    }
}
