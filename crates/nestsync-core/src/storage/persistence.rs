//! Collection persistence
//!
//! Stores revision trees, the change feed and replication checkpoints of one
//! collection in a SQLite database.
//!
//! Storage location: `<data_dir>/<collection>.db` (see `Config`)
//!
//! Every revision is written in the same transaction as its change feed
//! entry, so after a crash either both exist or neither does.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::feed::{timestamp_from_millis, ChangeFeed};
use super::schema::{init_schema, needs_init};
use super::{StoreError, StoreResult};
use crate::models::{ChangeEntry, Checkpoint, Direction, Revision};
use crate::revision::RevisionNode;

/// Lock a shared connection, recovering it if a holder panicked
///
/// SQLite transactions roll back on drop, so a poisoned connection is still
/// consistent.
pub(crate) fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}

/// SQLite persistence for one collection
pub struct SqlitePersistence {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqlitePersistence {
    /// Open or create the collection database at `path`
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::CreateDirectory {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")?;

        if needs_init(&conn) {
            init_schema(&conn)?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Database file, if on disk
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Read handle on the change feed
    pub fn feed(&self) -> ChangeFeed {
        ChangeFeed::new(Arc::clone(&self.conn))
    }

    /// Load every revision of a document (empty if unknown)
    pub fn load_revisions(&self, id: &str) -> StoreResult<Vec<RevisionNode>> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT generation, hash, parent_generation, parent_hash, deleted, body
             FROM revisions WHERE doc_id = ?",
        )?;
        let nodes = stmt
            .query_map(params![id], node_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(nodes)
    }

    /// Load a single revision
    pub fn load_revision(&self, id: &str, revision: &Revision) -> StoreResult<Option<RevisionNode>> {
        let conn = lock(&self.conn);
        let node = conn
            .query_row(
                "SELECT generation, hash, parent_generation, parent_hash, deleted, body
                 FROM revisions WHERE doc_id = ? AND generation = ? AND hash = ?",
                params![id, revision.generation as i64, revision.hash],
                node_from_row,
            )
            .optional()?;
        Ok(node)
    }

    /// Load all revisions grouped by document, ordered by document id
    pub fn load_all_revisions(&self) -> StoreResult<Vec<(String, Vec<RevisionNode>)>> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT doc_id, generation, hash, parent_generation, parent_hash, deleted, body
             FROM revisions ORDER BY doc_id",
        )?;
        let mut rows = stmt.query([])?;

        let mut grouped: Vec<(String, Vec<RevisionNode>)> = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let node = node_from_row_offset(row, 1)?;
            match grouped.last_mut() {
                Some((last_id, nodes)) if *last_id == id => nodes.push(node),
                _ => grouped.push((id, vec![node])),
            }
        }
        Ok(grouped)
    }

    /// Number of distinct documents with at least one revision
    pub fn document_count(&self) -> StoreResult<u64> {
        let conn = lock(&self.conn);
        let count: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT doc_id) FROM revisions",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Persist a revision and append its change feed entry atomically
    pub fn commit_revision(&self, id: &str, node: &RevisionNode) -> StoreResult<ChangeEntry> {
        self.commit_revision_from(id, node, None)
    }

    /// Persist a revision replicated from `origin`
    ///
    /// A deferred copy of the same revision is removed in the same transaction.
    pub fn commit_revision_from(
        &self,
        id: &str,
        node: &RevisionNode,
        origin: Option<&str>,
    ) -> StoreResult<ChangeEntry> {
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO revisions
                (doc_id, generation, hash, parent_generation, parent_hash, deleted, body)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                id,
                node.revision.generation as i64,
                node.revision.hash,
                node.parent.as_ref().map(|p| p.generation as i64),
                node.parent.as_ref().map(|p| p.hash.as_str()),
                node.deleted,
                node.body,
            ],
        )?;
        let entry = ChangeFeed::append(&tx, id, &node.revision, node.deleted, origin)?;
        tx.execute(
            "DELETE FROM deferred WHERE doc_id = ? AND generation = ? AND hash = ?",
            params![id, node.revision.generation as i64, node.revision.hash],
        )?;

        tx.commit()?;
        Ok(entry)
    }

    // ==================== Deferred revisions ====================

    /// Hold a remote revision until its document can take it
    ///
    /// Returns `false` if the same revision was already deferred.
    pub fn defer_revision(
        &self,
        id: &str,
        node: &RevisionNode,
        origin: Option<&str>,
    ) -> StoreResult<bool> {
        let conn = lock(&self.conn);
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO deferred
                (doc_id, generation, hash, parent_generation, parent_hash, deleted, body, origin)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                id,
                node.revision.generation as i64,
                node.revision.hash,
                node.parent.as_ref().map(|p| p.generation as i64),
                node.parent.as_ref().map(|p| p.hash.as_str()),
                node.deleted,
                node.body,
                origin,
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Deferred revisions of a document in arrival order, with their origin
    pub fn deferred_revisions(&self, id: &str) -> StoreResult<Vec<(RevisionNode, Option<String>)>> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT generation, hash, parent_generation, parent_hash, deleted, body, origin
             FROM deferred WHERE doc_id = ? ORDER BY id",
        )?;
        let deferred = stmt
            .query_map(params![id], |row| Ok((node_from_row(row)?, row.get(6)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(deferred)
    }

    /// Drop a deferred revision that turned out to be known already
    pub fn discard_deferred(&self, id: &str, revision: &Revision) -> StoreResult<()> {
        let conn = lock(&self.conn);
        conn.execute(
            "DELETE FROM deferred WHERE doc_id = ? AND generation = ? AND hash = ?",
            params![id, revision.generation as i64, revision.hash],
        )?;
        Ok(())
    }

    // ==================== Checkpoints ====================

    /// Get the checkpoint for a peer and direction
    pub fn checkpoint(&self, peer_id: &str, direction: Direction) -> StoreResult<Option<Checkpoint>> {
        let conn = lock(&self.conn);
        let checkpoint = conn
            .query_row(
                "SELECT seq, updated_at FROM checkpoints WHERE peer_id = ? AND direction = ?",
                params![peer_id, direction.as_str()],
                |row| {
                    let seq: i64 = row.get(0)?;
                    let millis: i64 = row.get(1)?;
                    Ok(Checkpoint {
                        peer_id: peer_id.to_string(),
                        direction,
                        seq: seq as u64,
                        updated_at: timestamp_from_millis(1, millis)?,
                    })
                },
            )
            .optional()?;
        Ok(checkpoint)
    }

    /// All checkpoints, ordered by peer and direction
    pub fn checkpoints(&self) -> StoreResult<Vec<Checkpoint>> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT peer_id, direction, seq, updated_at FROM checkpoints
             ORDER BY peer_id, direction DESC",
        )?;
        let mut rows = stmt.query([])?;

        let mut checkpoints = Vec::new();
        while let Some(row) = rows.next()? {
            let direction: String = row.get(1)?;
            let direction = match direction.as_str() {
                "push" => Direction::Push,
                "pull" => Direction::Pull,
                other => {
                    return Err(StoreError::Corrupt {
                        id: "checkpoints".to_string(),
                        details: format!("unknown direction '{}'", other),
                    })
                }
            };
            let seq: i64 = row.get(2)?;
            let millis: i64 = row.get(3)?;
            checkpoints.push(Checkpoint {
                peer_id: row.get(0)?,
                direction,
                seq: seq as u64,
                updated_at: timestamp_from_millis(3, millis)?,
            });
        }
        Ok(checkpoints)
    }

    /// Advance a checkpoint; never moves it backwards
    pub fn save_checkpoint(&self, peer_id: &str, direction: Direction, seq: u64) -> StoreResult<()> {
        let conn = lock(&self.conn);
        conn.execute(
            "INSERT INTO checkpoints (peer_id, direction, seq, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT (peer_id, direction) DO UPDATE SET
                seq = MAX(seq, excluded.seq),
                updated_at = excluded.updated_at",
            params![
                peer_id,
                direction.as_str(),
                seq as i64,
                Utc::now().timestamp_millis()
            ],
        )?;
        Ok(())
    }

    /// Forget all progress with a peer (resync from scratch)
    pub fn reset_checkpoints(&self, peer_id: &str) -> StoreResult<()> {
        let conn = lock(&self.conn);
        conn.execute("DELETE FROM checkpoints WHERE peer_id = ?", params![peer_id])?;
        Ok(())
    }

    /// Most recent checkpoint update with any peer
    pub fn last_sync_at(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let conn = lock(&self.conn);
        let millis: Option<i64> =
            conn.query_row("SELECT MAX(updated_at) FROM checkpoints", [], |row| row.get(0))?;
        millis
            .map(|ms| timestamp_from_millis(0, ms).map_err(StoreError::from))
            .transpose()
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> StoreResult<()> {
        lock(&self.conn).execute_batch(sql)?;
        Ok(())
    }
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<RevisionNode> {
    node_from_row_offset(row, 0)
}

fn node_from_row_offset(row: &Row<'_>, at: usize) -> rusqlite::Result<RevisionNode> {
    let generation: i64 = row.get(at)?;
    let parent_generation: Option<i64> = row.get(at + 2)?;
    let parent_hash: Option<String> = row.get(at + 3)?;

    let parent = match (parent_generation, parent_hash) {
        (Some(generation), Some(hash)) => Some(Revision::new(generation as u64, hash)),
        _ => None,
    };

    Ok(RevisionNode {
        revision: Revision::new(generation as u64, row.get::<_, String>(at + 1)?),
        parent,
        deleted: row.get(at + 4)?,
        body: row.get(at + 5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Body;
    use serde_json::json;
    use tempfile::TempDir;

    fn body(value: serde_json::Value) -> Body {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_commit_and_load_revisions() {
        let persistence = SqlitePersistence::open_in_memory().unwrap();
        let root = RevisionNode::mint(None, Some(&body(json!({"amount": 40})))).unwrap();
        let child = RevisionNode::mint(Some(&root.revision), None).unwrap();

        let e1 = persistence.commit_revision("e1", &root).unwrap();
        let e2 = persistence.commit_revision("e1", &child).unwrap();

        assert_eq!(e1.seq, 1);
        assert_eq!(e2.seq, 2);
        assert!(e2.deleted);

        let mut loaded = persistence.load_revisions("e1").unwrap();
        loaded.sort_by(|a, b| a.revision.cmp(&b.revision));
        assert_eq!(loaded, vec![root.clone(), child]);

        let single = persistence.load_revision("e1", &root.revision).unwrap();
        assert_eq!(single, Some(root));
        assert!(persistence.load_revisions("missing").unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_revision_rolls_back_feed_entry() {
        let persistence = SqlitePersistence::open_in_memory().unwrap();
        let root = RevisionNode::mint(None, Some(&body(json!({"x": 1})))).unwrap();

        persistence.commit_revision("e1", &root).unwrap();
        assert!(persistence.commit_revision("e1", &root).is_err());

        assert_eq!(persistence.feed().last_sequence().unwrap(), 1);
    }

    #[test]
    fn test_load_all_revisions_groups_by_id() {
        let persistence = SqlitePersistence::open_in_memory().unwrap();
        for id in ["b", "a", "c"] {
            let root = RevisionNode::mint(None, Some(&body(json!({"id": id})))).unwrap();
            let child = RevisionNode::mint(Some(&root.revision), Some(&body(json!({"v": 2})))).unwrap();
            persistence.commit_revision(id, &root).unwrap();
            persistence.commit_revision(id, &child).unwrap();
        }

        let grouped = persistence.load_all_revisions().unwrap();
        let ids: Vec<&str> = grouped.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(grouped.iter().all(|(_, nodes)| nodes.len() == 2));
        assert_eq!(persistence.document_count().unwrap(), 3);
    }

    #[test]
    fn test_checkpoints_only_move_forward() {
        let persistence = SqlitePersistence::open_in_memory().unwrap();
        assert!(persistence
            .checkpoint("server", Direction::Push)
            .unwrap()
            .is_none());
        assert!(persistence.last_sync_at().unwrap().is_none());

        persistence.save_checkpoint("server", Direction::Push, 10).unwrap();
        persistence.save_checkpoint("server", Direction::Push, 4).unwrap();
        persistence.save_checkpoint("server", Direction::Pull, 7).unwrap();

        let push = persistence.checkpoint("server", Direction::Push).unwrap().unwrap();
        let pull = persistence.checkpoint("server", Direction::Pull).unwrap().unwrap();
        assert_eq!(push.seq, 10);
        assert_eq!(pull.seq, 7);
        assert!(persistence.last_sync_at().unwrap().is_some());

        let all = persistence.checkpoints().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].direction, Direction::Push);
        assert_eq!(all[1].direction, Direction::Pull);

        persistence.reset_checkpoints("server").unwrap();
        assert!(persistence.checkpoints().unwrap().is_empty());
        assert!(persistence
            .checkpoint("server", Direction::Push)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_sequence_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("tasks.db");

        {
            let persistence = SqlitePersistence::open(&path).unwrap();
            let root = RevisionNode::mint(None, Some(&body(json!({"title": "a"})))).unwrap();
            persistence.commit_revision("t1", &root).unwrap();
            persistence.save_checkpoint("peer", Direction::Pull, 3).unwrap();
        }

        let persistence = SqlitePersistence::open(&path).unwrap();
        assert_eq!(persistence.path(), Some(path.as_path()));
        assert_eq!(persistence.feed().last_sequence().unwrap(), 1);
        assert_eq!(
            persistence
                .checkpoint("peer", Direction::Pull)
                .unwrap()
                .unwrap()
                .seq,
            3
        );

        let next = RevisionNode::mint(None, Some(&body(json!({"title": "b"})))).unwrap();
        assert_eq!(persistence.commit_revision("t2", &next).unwrap().seq, 2);
    }

    #[test]
    fn test_deferred_revision_is_cleared_on_commit() {
        let persistence = SqlitePersistence::open_in_memory().unwrap();
        let root = RevisionNode::mint(None, Some(&body(json!({"x": 1})))).unwrap();
        let child = RevisionNode::mint(Some(&root.revision), Some(&body(json!({"x": 2})))).unwrap();

        assert!(persistence.defer_revision("e1", &root, Some("phone")).unwrap());
        assert!(persistence.defer_revision("e1", &child, Some("phone")).unwrap());
        assert!(!persistence.defer_revision("e1", &root, Some("phone")).unwrap());

        let deferred = persistence.deferred_revisions("e1").unwrap();
        assert_eq!(
            deferred,
            vec![
                (root.clone(), Some("phone".to_string())),
                (child.clone(), Some("phone".to_string()))
            ]
        );

        let entry = persistence
            .commit_revision_from("e1", &root, Some("phone"))
            .unwrap();
        assert_eq!(entry.origin.as_deref(), Some("phone"));
        assert_eq!(persistence.deferred_revisions("e1").unwrap().len(), 1);

        persistence.discard_deferred("e1", &child.revision).unwrap();
        assert!(persistence.deferred_revisions("e1").unwrap().is_empty());
    }
}
