//! Change feed
//!
//! An append-only, sequence-numbered log of every revision committed to a
//! collection. Sequence numbers come from the persisted `last_seq` counter,
//! which is bumped in the same transaction as the entry it numbers, so a
//! number is never handed out twice, even across restarts.
//!
//! Reads are snapshots: [`ChangeFeed::since`] fixes the high-water mark when
//! it is called and pages lazily up to it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, Row, Transaction};

use super::persistence::lock;
use super::StoreResult;
use crate::models::{ChangeEntry, Revision};

/// Entries fetched per query while iterating
const PAGE_SIZE: usize = 256;

/// Read handle on a collection's change feed
#[derive(Clone)]
pub struct ChangeFeed {
    conn: Arc<Mutex<Connection>>,
}

impl ChangeFeed {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Append an entry inside the caller's transaction
    ///
    /// Assigns the next sequence number and persists the new high-water mark.
    /// `origin` names the peer a replicated revision came from.
    pub(crate) fn append(
        tx: &Transaction<'_>,
        id: &str,
        revision: &Revision,
        deleted: bool,
        origin: Option<&str>,
    ) -> rusqlite::Result<ChangeEntry> {
        let last: i64 = tx.query_row("SELECT value FROM meta WHERE key = 'last_seq'", [], |row| {
            row.get(0)
        })?;
        let seq = last + 1;
        let committed_at = Utc::now();

        tx.execute(
            "INSERT INTO changes (seq, doc_id, generation, hash, deleted, committed_at, origin)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                seq,
                id,
                revision.generation as i64,
                revision.hash,
                deleted,
                committed_at.timestamp_millis(),
                origin
            ],
        )?;
        tx.execute(
            "UPDATE meta SET value = ? WHERE key = 'last_seq'",
            params![seq],
        )?;

        Ok(ChangeEntry {
            seq: seq as u64,
            id: id.to_string(),
            revision: revision.clone(),
            deleted,
            committed_at,
            origin: origin.map(str::to_string),
        })
    }

    /// Highest sequence number ever assigned (0 for an empty feed)
    pub fn last_sequence(&self) -> StoreResult<u64> {
        let conn = lock(&self.conn);
        let last: i64 = conn.query_row(
            "SELECT value FROM meta WHERE key = 'last_seq'",
            [],
            |row| row.get(0),
        )?;
        Ok(last as u64)
    }

    /// Number of entries after `seq` that did not come from `exclude_origin`
    pub fn pending_since(&self, seq: u64, exclude_origin: Option<&str>) -> StoreResult<u64> {
        let conn = lock(&self.conn);
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM changes
             WHERE seq > ?1 AND (?2 IS NULL OR origin IS NULL OR origin != ?2)",
            params![seq as i64, exclude_origin],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// All entries with a sequence greater than `seq`, ascending
    ///
    /// Entries committed after this call are not included.
    pub fn since(&self, seq: u64) -> StoreResult<Changes> {
        let upper = self.last_sequence()?;
        Ok(Changes {
            conn: Arc::clone(&self.conn),
            cursor: seq,
            upper,
            page: VecDeque::new(),
        })
    }
}

/// Lazy iterator over a snapshot of the change feed
///
/// Restartable: resume with `since(last_seen_seq)`.
pub struct Changes {
    conn: Arc<Mutex<Connection>>,
    cursor: u64,
    upper: u64,
    page: VecDeque<ChangeEntry>,
}

impl Changes {
    /// Sequence of the last entry this snapshot will yield
    pub fn upper_bound(&self) -> u64 {
        self.upper
    }

    fn fill(&mut self) -> StoreResult<()> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT seq, doc_id, generation, hash, deleted, committed_at, origin FROM changes
             WHERE seq > ? AND seq <= ? ORDER BY seq LIMIT ?",
        )?;
        let rows = stmt.query_map(
            params![self.cursor as i64, self.upper as i64, PAGE_SIZE as i64],
            entry_from_row,
        )?;
        for row in rows {
            self.page.push_back(row?);
        }
        Ok(())
    }
}

impl Iterator for Changes {
    type Item = StoreResult<ChangeEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && self.cursor < self.upper {
            if let Err(e) = self.fill() {
                // Stop after reporting the failure
                self.cursor = self.upper;
                return Some(Err(e));
            }
        }

        let entry = self.page.pop_front()?;
        self.cursor = entry.seq;
        Some(Ok(entry))
    }
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<ChangeEntry> {
    let seq: i64 = row.get(0)?;
    let generation: i64 = row.get(2)?;
    let millis: i64 = row.get(5)?;
    Ok(ChangeEntry {
        seq: seq as u64,
        id: row.get(1)?,
        revision: Revision::new(generation as u64, row.get::<_, String>(3)?),
        deleted: row.get(4)?,
        committed_at: timestamp_from_millis(5, millis)?,
        origin: row.get(6)?,
    })
}

pub(crate) fn timestamp_from_millis(column: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(column, millis))
}
