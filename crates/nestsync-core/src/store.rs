//! Document store
//!
//! The `DocumentStore` is the storage API of one collection (expenses, tasks,
//! notes, ...). It owns the collection's documents and coordinates between:
//! - the revision tree of each document (which revision is current)
//! - SQLite persistence (revisions, change feed, checkpoints)
//!
//! ## Concurrency
//!
//! Mutations are serialized per document id: a writer holds that document's
//! lock while it loads the tree, checks the expected revision, mints and
//! commits. Writers to different ids do not wait on each other beyond the
//! short SQLite transaction itself.
//!
//! ## Usage
//!
//! ```ignore
//! let store = DocumentStore::open(&config, "expenses")?;
//!
//! let rev = store.put("e1", body, None)?;
//! let rev = store.put("e1", updated, Some(&rev))?;
//! store.delete("e1", &rev)?;
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::config::Config;
use crate::models::{
    Ack, Body, ChangeBatch, ChangeEntry, ChangeRecord, Checkpoint, Direction, Document, Revision,
};
use crate::revision::{
    canonical_body, ConflictResolver, DeterministicResolver, RevisionNode, RevisionTree,
};
use crate::storage::{ChangeFeed, Changes, SqlitePersistence, StoreError, StoreResult};

/// Per-document mutual exclusion
#[derive(Default)]
struct DocumentLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DocumentLocks {
    /// Run `f` holding the lock of a document id
    ///
    /// The id's entry is dropped afterwards unless another caller holds or
    /// waits for it.
    fn with<T>(&self, id: &str, f: impl FnOnce() -> T) -> T {
        let lock = Arc::clone(self.map().entry(id.to_string()).or_default());
        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };

        let mut locks = self.map();
        // One reference in the map, one here
        if Arc::strong_count(&lock) == 2 {
            locks.remove(id);
        }
        result
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map().len()
    }
}

/// Outcome of grafting one remote change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The revision was new and is now in the tree
    Applied,
    /// The revision was already known
    Duplicate,
    /// The document is quarantined; the change is kept and replayed once the
    /// document is released
    Deferred,
}

/// Storage API of one collection
pub struct DocumentStore {
    /// Collection name
    name: String,
    persistence: SqlitePersistence,
    resolver: Arc<dyn ConflictResolver>,
    locks: DocumentLocks,
    /// Documents that failed tree validation; writes to them are refused
    quarantined: Mutex<HashSet<String>>,
}

impl DocumentStore {
    /// Open the named collection under the configured data directory
    pub fn open(config: &Config, name: &str) -> StoreResult<Self> {
        let persistence = SqlitePersistence::open(&config.collection_path(name))?;
        Ok(Self::with_persistence(name, persistence))
    }

    /// Open an in-memory collection (for testing)
    pub fn open_in_memory(name: &str) -> StoreResult<Self> {
        Ok(Self::with_persistence(name, SqlitePersistence::open_in_memory()?))
    }

    fn with_persistence(name: &str, persistence: SqlitePersistence) -> Self {
        Self {
            name: name.to_string(),
            persistence,
            resolver: Arc::new(DeterministicResolver),
            locks: DocumentLocks::default(),
            quarantined: Mutex::new(HashSet::new()),
        }
    }

    /// Replace the winner rule
    ///
    /// Every replica of a collection must use the same rule to converge.
    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Collection name
    pub fn name(&self) -> &str {
        &self.name
    }

    // ==================== Document Operations ====================

    /// Write a document
    ///
    /// With `expected = None` the write creates the document, or re-creates
    /// it on top of a winning tombstone. Otherwise `expected` must be the
    /// current revision. A mismatch fails with [`StoreError::Conflict`].
    pub fn put(&self, id: &str, body: Body, expected: Option<&Revision>) -> StoreResult<Revision> {
        validate_id(id)?;
        self.locks.with(id, || self.put_locked(id, &body, expected))
    }

    fn put_locked(&self, id: &str, body: &Body, expected: Option<&Revision>) -> StoreResult<Revision> {
        let tree = self.load_tree(id)?;
        let current = tree.winner(self.resolver.as_ref());

        let parent = match (current, expected) {
            (None, None) => None,
            (Some(cur), None) if cur.deleted => Some(&cur.revision),
            (Some(cur), Some(exp)) if cur.revision == *exp => Some(&cur.revision),
            (cur, exp) => return Err(conflict(id, exp, cur)),
        };

        let node = tree.mint(parent, Some(body))?;
        let entry = self.persistence.commit_revision(id, &node)?;
        debug!(collection = %self.name, id, rev = %node.revision, seq = entry.seq, "put");
        Ok(node.revision)
    }

    /// Get the current revision of a document
    ///
    /// Fails with [`StoreError::NotFound`] if the document does not exist or
    /// its winning revision is a tombstone.
    pub fn get(&self, id: &str) -> StoreResult<Document> {
        let tree = self.load_tree(id)?;
        match tree.winner(self.resolver.as_ref()) {
            Some(winner) if !winner.deleted => winner.to_document(id),
            _ => Err(not_found(id)),
        }
    }

    /// Get a document as of a specific revision, losing or deleted ones included
    pub fn get_revision(&self, id: &str, revision: &Revision) -> StoreResult<Document> {
        self.ensure_healthy(id)?;
        match self.persistence.load_revision(id, revision)? {
            Some(node) => node.to_document(id),
            None => Err(not_found(&format!("{}@{}", id, revision))),
        }
    }

    /// Delete a document by writing a tombstone revision
    ///
    /// Same optimistic-concurrency contract as [`put`](Self::put).
    pub fn delete(&self, id: &str, expected: &Revision) -> StoreResult<Revision> {
        validate_id(id)?;
        self.locks.with(id, || self.delete_locked(id, expected))
    }

    fn delete_locked(&self, id: &str, expected: &Revision) -> StoreResult<Revision> {
        let tree = self.load_tree(id)?;
        let current = match tree.winner(self.resolver.as_ref()) {
            Some(cur) if !cur.deleted => cur,
            _ => return Err(not_found(id)),
        };
        if current.revision != *expected {
            return Err(conflict(id, Some(expected), Some(current)));
        }

        let node = tree.mint(Some(&current.revision), None)?;
        let entry = self.persistence.commit_revision(id, &node)?;
        debug!(collection = %self.name, id, rev = %node.revision, seq = entry.seq, "delete");
        Ok(node.revision)
    }

    /// All documents ordered by id
    ///
    /// Tombstoned documents are included only when asked for. Corrupt
    /// documents are left out and logged.
    pub fn all_documents(&self, include_deleted: bool) -> StoreResult<Vec<Document>> {
        let mut documents = Vec::new();

        for (id, nodes) in self.persistence.load_all_revisions()? {
            if self.is_quarantined(&id) {
                continue;
            }
            let tree = match RevisionTree::from_nodes(id.as_str(), nodes) {
                Ok(tree) => tree,
                Err(e) => {
                    self.quarantine(&id, &e);
                    continue;
                }
            };
            if let Some(winner) = tree.winner(self.resolver.as_ref()) {
                if include_deleted || !winner.deleted {
                    documents.push(winner.to_document(&id)?);
                }
            }
        }

        Ok(documents)
    }

    /// Non-winning leaf revisions of a document
    pub fn conflicts(&self, id: &str) -> StoreResult<Vec<Revision>> {
        let tree = self.load_tree(id)?;
        if tree.is_empty() {
            return Err(not_found(id));
        }
        Ok(tree.conflicts(self.resolver.as_ref()))
    }

    /// Winning revision of a document, tombstones included
    pub fn current_revision(&self, id: &str) -> StoreResult<Revision> {
        let tree = self.load_tree(id)?;
        tree.winner(self.resolver.as_ref())
            .map(|node| node.revision.clone())
            .ok_or_else(|| not_found(id))
    }

    /// Ancestry of a revision, newest first
    pub fn revision_history(&self, id: &str, revision: &Revision) -> StoreResult<Vec<Revision>> {
        let tree = self.load_tree(id)?;
        let history = tree.history(revision);
        if history.is_empty() {
            return Err(not_found(&format!("{}@{}", id, revision)));
        }
        Ok(history)
    }

    /// Number of documents, tombstoned ones included
    pub fn document_count(&self) -> StoreResult<u64> {
        self.persistence.document_count()
    }

    /// Ids currently refused because their revision tree is corrupt
    pub fn quarantined(&self) -> Vec<String> {
        let set = self.quarantined.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = set.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Re-validate a quarantined document after it was repaired
    ///
    /// Remote revisions that arrived while it was quarantined are applied.
    /// Returns how many of them were.
    pub fn release_quarantine(&self, id: &str) -> StoreResult<usize> {
        self.locks.with(id, || {
            self.quarantined
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(id);
            let mut tree = self.load_tree(id)?;
            self.replay_deferred(id, &mut tree)
        })
    }

    // ==================== Change Feed ====================

    /// Read handle on this collection's change feed
    pub fn feed(&self) -> ChangeFeed {
        self.persistence.feed()
    }

    /// Snapshot of the change feed after `seq`
    pub fn changes_since(&self, seq: u64) -> StoreResult<Changes> {
        self.feed().since(seq)
    }

    /// Highest sequence number assigned so far
    pub fn last_sequence(&self) -> StoreResult<u64> {
        self.feed().last_sequence()
    }

    // ==================== Replication ====================

    /// Read up to `limit` feed entries after `since`, with the content needed
    /// to replay them on a peer
    pub fn export_changes(&self, since: u64, limit: usize) -> StoreResult<ChangeBatch> {
        self.export_changes_for(None, since, limit)
    }

    /// Like [`export_changes`](Self::export_changes), leaving out entries
    /// that were replicated from `peer`
    ///
    /// `limit` bounds the entries scanned, so a batch may be empty while
    /// `last_seq` still moves forward.
    pub fn export_changes_for(
        &self,
        peer: Option<&str>,
        since: u64,
        limit: usize,
    ) -> StoreResult<ChangeBatch> {
        let mut batch = ChangeBatch {
            records: Vec::new(),
            last_seq: since,
        };

        for entry in self.changes_since(since)?.take(limit) {
            let entry = entry?;
            batch.last_seq = entry.seq;
            if peer.is_some() && entry.origin.as_deref() == peer {
                continue;
            }
            batch.records.push(self.record_for(&entry)?);
        }

        Ok(batch)
    }

    /// Feed entries after the push checkpoint that `peer` does not have yet
    pub fn pending_changes(&self, peer: &str) -> StoreResult<u64> {
        let pushed = self
            .checkpoint(peer, Direction::Push)?
            .map_or(0, |cp| cp.seq);
        self.feed().pending_since(pushed, Some(peer))
    }

    /// Build the replication record for a feed entry
    pub fn record_for(&self, entry: &ChangeEntry) -> StoreResult<ChangeRecord> {
        let node = self
            .persistence
            .load_revision(&entry.id, &entry.revision)?
            .ok_or_else(|| StoreError::Corrupt {
                id: entry.id.clone(),
                details: format!("feed entry {} points at missing revision {}", entry.seq, entry.revision),
            })?;
        let body = match node.body {
            Some(_) => Some(node.parsed_body()?),
            None => None,
        };

        Ok(ChangeRecord {
            seq: entry.seq,
            id: entry.id.clone(),
            revision: node.revision,
            parent: node.parent,
            deleted: node.deleted,
            body,
        })
    }

    /// Graft a revision produced by a peer into the local tree
    ///
    /// The peer's parent linkage is taken as-is: no expected-revision check,
    /// conflicts are settled by the winner rule. Re-applying a known revision
    /// is a no-op.
    pub fn apply_remote(&self, record: &ChangeRecord) -> StoreResult<ApplyOutcome> {
        self.apply_remote_from(None, record)
    }

    /// Graft a revision replicated from `origin`
    ///
    /// The feed entry remembers the origin so the revision is not sent back
    /// to it.
    pub fn apply_remote_from(
        &self,
        origin: Option<&str>,
        record: &ChangeRecord,
    ) -> StoreResult<ApplyOutcome> {
        validate_id(&record.id)?;
        self.locks
            .with(&record.id, || self.apply_remote_locked(origin, record))
    }

    fn apply_remote_locked(
        &self,
        origin: Option<&str>,
        record: &ChangeRecord,
    ) -> StoreResult<ApplyOutcome> {
        let body = record
            .body
            .as_ref()
            .map(canonical_body)
            .transpose()?;
        let node = RevisionNode {
            revision: record.revision.clone(),
            parent: record.parent.clone(),
            deleted: record.deleted,
            body,
        };

        let mut tree = match self.load_tree(&record.id) {
            Ok(tree) => tree,
            Err(StoreError::Corrupt { id, details }) => {
                node.verify()?;
                warn!(collection = %self.name, id, details, rev = %node.revision, "deferring change for corrupt document");
                self.persistence.defer_revision(&record.id, &node, origin)?;
                return Ok(ApplyOutcome::Deferred);
            }
            Err(e) => return Err(e),
        };

        if !tree.insert(node.clone())? {
            return Ok(ApplyOutcome::Duplicate);
        }
        let entry = self
            .persistence
            .commit_revision_from(&record.id, &node, origin)?;
        debug!(
            collection = %self.name,
            id = %record.id,
            rev = %node.revision,
            seq = entry.seq,
            "applied remote revision"
        );
        self.replay_deferred(&record.id, &mut tree)?;
        Ok(ApplyOutcome::Applied)
    }

    /// Apply a batch of remote records in order
    pub fn import_changes(&self, records: &[ChangeRecord]) -> StoreResult<Ack> {
        self.import_changes_from(None, records)
    }

    /// Apply a batch of records replicated from `origin`
    ///
    /// Deferred records count as applied: they are stored and need not be
    /// sent again.
    pub fn import_changes_from(
        &self,
        origin: Option<&str>,
        records: &[ChangeRecord],
    ) -> StoreResult<Ack> {
        let mut ack = Ack::default();
        for record in records {
            match self.apply_remote_from(origin, record)? {
                ApplyOutcome::Applied | ApplyOutcome::Deferred => ack.applied += 1,
                ApplyOutcome::Duplicate => ack.duplicates += 1,
            }
        }
        Ok(ack)
    }

    /// Commit deferred revisions of a healthy document
    ///
    /// Revisions whose parent is still unknown stay deferred.
    fn replay_deferred(&self, id: &str, tree: &mut RevisionTree) -> StoreResult<usize> {
        let mut applied = 0;
        for (node, origin) in self.persistence.deferred_revisions(id)? {
            match tree.insert(node.clone()) {
                Ok(true) => {
                    let entry = self
                        .persistence
                        .commit_revision_from(id, &node, origin.as_deref())?;
                    debug!(collection = %self.name, id, rev = %node.revision, seq = entry.seq, "applied deferred revision");
                    applied += 1;
                }
                Ok(false) => self.persistence.discard_deferred(id, &node.revision)?,
                Err(StoreError::MissingAncestor { .. }) => {
                    debug!(collection = %self.name, id, rev = %node.revision, "deferred revision still lacks its parent");
                }
                Err(e) => {
                    warn!(collection = %self.name, id, rev = %node.revision, error = %e, "dropping invalid deferred revision");
                    self.persistence.discard_deferred(id, &node.revision)?;
                }
            }
        }
        Ok(applied)
    }

    /// Replication checkpoint for a peer
    pub fn checkpoint(&self, peer_id: &str, direction: Direction) -> StoreResult<Option<Checkpoint>> {
        self.persistence.checkpoint(peer_id, direction)
    }

    /// Advance a replication checkpoint
    pub fn save_checkpoint(&self, peer_id: &str, direction: Direction, seq: u64) -> StoreResult<()> {
        self.persistence.save_checkpoint(peer_id, direction, seq)
    }

    /// Checkpoints with every peer this collection has synced with
    pub fn checkpoints(&self) -> StoreResult<Vec<Checkpoint>> {
        self.persistence.checkpoints()
    }

    /// Reset both checkpoints of a peer to the feed origin
    pub fn reset_checkpoints(&self, peer_id: &str) -> StoreResult<()> {
        self.persistence.reset_checkpoints(peer_id)
    }

    /// Time of the most recent checkpoint update
    pub fn last_sync_at(&self) -> StoreResult<Option<chrono::DateTime<chrono::Utc>>> {
        self.persistence.last_sync_at()
    }

    // ==================== Internals ====================

    fn is_quarantined(&self, id: &str) -> bool {
        self.quarantined
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    fn quarantine(&self, id: &str, error: &StoreError) {
        warn!(collection = %self.name, id, %error, "quarantining corrupt document");
        self.quarantined
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string());
    }

    fn ensure_healthy(&self, id: &str) -> StoreResult<()> {
        if self.is_quarantined(id) {
            return Err(StoreError::Corrupt {
                id: id.to_string(),
                details: "document is quarantined".to_string(),
            });
        }
        Ok(())
    }

    /// Load and validate a document's tree; corrupt trees are quarantined
    fn load_tree(&self, id: &str) -> StoreResult<RevisionTree> {
        self.ensure_healthy(id)?;
        let nodes = self.persistence.load_revisions(id)?;
        RevisionTree::from_nodes(id, nodes).map_err(|e| {
            self.quarantine(id, &e);
            e
        })
    }

    #[cfg(test)]
    pub(crate) fn persistence(&self) -> &SqlitePersistence {
        &self.persistence
    }
}

fn validate_id(id: &str) -> StoreResult<()> {
    if id.is_empty() {
        return Err(StoreError::InvalidId(id.to_string()));
    }
    Ok(())
}

fn not_found(id: &str) -> StoreError {
    StoreError::NotFound { id: id.to_string() }
}

fn conflict(id: &str, expected: Option<&Revision>, current: Option<&RevisionNode>) -> StoreError {
    StoreError::Conflict {
        id: id.to_string(),
        expected: expected.map_or_else(|| "(none)".to_string(), |r| r.to_string()),
        actual: current.map_or_else(|| "(none)".to_string(), |n| n.revision.to_string()),
    }
}
