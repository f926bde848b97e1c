//! Secondary index files: key to id-list.
//!
//! Keys carry a one-character prefix: `=` equality, `*` substring, `+`
//! presence. A key whose list grows past the all-ids threshold either
//! collapses to the all-ids marker or, for files opened without collapsing,
//! keeps its rows and only reports the crossing.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use rusqlite::{Connection, params};
use tracing::{debug, instrument};

use super::{WriteBatch, open_connection};
use crate::config::IndexKind;
use crate::entry::dn::normalize_value;
use crate::error::{ImportError, Result};

pub const EQ_PREFIX: char = '=';
pub const SUB_PREFIX: char = '*';
pub const PRES_KEY: &str = "+";

/// Length of substring index grams.
const SUBSTRING_LEN: usize = 3;

/// The ids stored under one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdList {
    Ids(Vec<u64>),
    AllIds,
}

impl IdList {
    pub fn empty() -> Self {
        IdList::Ids(Vec::new())
    }

    pub fn is_all_ids(&self) -> bool {
        matches!(self, IdList::AllIds)
    }

    pub fn len(&self) -> Option<usize> {
        match self {
            IdList::Ids(ids) => Some(ids.len()),
            IdList::AllIds => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, IdList::Ids(ids) if ids.is_empty())
    }

    pub fn ids(&self) -> &[u64] {
        match self {
            IdList::Ids(ids) => ids,
            IdList::AllIds => &[],
        }
    }

    /// Sorted union; collapses to all-ids past `limit` (0 = unlimited).
    pub fn union(&self, other: &IdList, limit: usize) -> IdList {
        match (self, other) {
            (IdList::AllIds, _) | (_, IdList::AllIds) => IdList::AllIds,
            (IdList::Ids(a), IdList::Ids(b)) => {
                let mut merged = Vec::with_capacity(a.len() + b.len());
                let (mut i, mut j) = (0, 0);
                while i < a.len() || j < b.len() {
                    let next = match (a.get(i), b.get(j)) {
                        (Some(x), Some(y)) if x == y => {
                            i += 1;
                            j += 1;
                            *x
                        }
                        (Some(x), Some(y)) if x < y => {
                            i += 1;
                            *x
                        }
                        (Some(_), Some(y)) => {
                            j += 1;
                            *y
                        }
                        (Some(x), None) => {
                            i += 1;
                            *x
                        }
                        (None, Some(y)) => {
                            j += 1;
                            *y
                        }
                        (None, None) => break,
                    };
                    merged.push(next);
                }
                if limit > 0 && merged.len() > limit {
                    IdList::AllIds
                } else {
                    IdList::Ids(merged)
                }
            }
        }
    }
}

/// What an insert did to the key's list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Normal,
    /// This insert pushed the key past the all-ids threshold.
    NowAllIds,
    /// The key was already past the threshold.
    AllIds,
}

/// Keys for a set of values under the given index kinds.
pub fn keys_for(kinds: &[IndexKind], values: &[String]) -> Vec<String> {
    let mut keys = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |key: String, keys: &mut Vec<String>| {
        if seen.insert(key.clone()) {
            keys.push(key);
        }
    };
    for kind in kinds {
        match kind {
            IndexKind::Pres => {
                if !values.is_empty() {
                    push(PRES_KEY.to_string(), &mut keys);
                }
            }
            IndexKind::Eq => {
                for value in values {
                    push(equality_key(value), &mut keys);
                }
            }
            IndexKind::Sub => {
                for value in values {
                    for key in substring_keys(value) {
                        push(key, &mut keys);
                    }
                }
            }
        }
    }
    keys
}

pub fn equality_key(value: &str) -> String {
    format!("{}{}", EQ_PREFIX, normalize_value(value))
}

/// Key of an id-keyed index (parentid, ancestorid).
pub fn id_key(id: u64) -> String {
    format!("{}{}", EQ_PREFIX, id)
}

/// Trigram keys with `^`/`$` anchors.
pub fn substring_keys(value: &str) -> Vec<String> {
    let anchored: Vec<char> = format!("^{}$", normalize_value(value)).chars().collect();
    if anchored.len() < SUBSTRING_LEN {
        return Vec::new();
    }
    anchored
        .windows(SUBSTRING_LEN)
        .map(|w| format!("{}{}", SUB_PREFIX, w.iter().collect::<String>()))
        .collect()
}

pub struct IndexFile {
    name: String,
    conn: Connection,
    batch: WriteBatch,
    /// 0 disables the threshold.
    allids_limit: usize,
    collapse: bool,
    counts: HashMap<String, usize>,
    all_ids: HashSet<String>,
}

impl IndexFile {
    /// Open or create an index file.
    ///
    /// With `collapse` off, keys past `allids_limit` keep their ids and the
    /// threshold is only reported through [`Disposition`].
    pub fn open(path: &Path, name: &str, allids_limit: usize, collapse: bool) -> Result<Self> {
        let conn = open_connection(path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS idl (
                key TEXT NOT NULL,
                id INTEGER NOT NULL,
                PRIMARY KEY (key, id)
            ) WITHOUT ROWID;
            CREATE TABLE IF NOT EXISTS allids (
                key TEXT PRIMARY KEY
            );
            "#,
        )?;
        let mut all_ids = HashSet::new();
        {
            let mut stmt = conn.prepare("SELECT key FROM allids")?;
            for key in stmt.query_map([], |row| row.get::<_, String>(0))? {
                all_ids.insert(key?);
            }
        }
        Ok(Self {
            name: name.to_string(),
            conn,
            batch: WriteBatch::default(),
            allids_limit,
            collapse,
            counts: HashMap::new(),
            all_ids,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn write_err(&self, e: rusqlite::Error) -> ImportError {
        ImportError::from_write(e, &self.name)
    }

    fn stored_count(&self, key: &str) -> Result<usize> {
        let n: i64 = self
            .conn
            .prepare_cached("SELECT COUNT(*) FROM idl WHERE key = ?1")?
            .query_row(params![key], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Add `id` under `key`.
    pub fn insert(&mut self, key: &str, id: u64) -> Result<Disposition> {
        if self.all_ids.contains(key) {
            return Ok(Disposition::AllIds);
        }
        self.batch.touch(&self.conn)?;
        let added = self
            .conn
            .prepare_cached("INSERT OR IGNORE INTO idl (key, id) VALUES (?1, ?2)")?
            .execute(params![key, id as i64])
            .map_err(|e| self.write_err(e))?;

        let count = match self.counts.get(key) {
            Some(count) => *count + added,
            None => self.stored_count(key)?,
        };
        self.counts.insert(key.to_string(), count);

        if self.allids_limit == 0 || count <= self.allids_limit {
            return Ok(Disposition::Normal);
        }
        if !self.collapse {
            return Ok(if count == self.allids_limit + 1 && added == 1 {
                Disposition::NowAllIds
            } else {
                Disposition::AllIds
            });
        }

        debug!(index = %self.name, key, count, "key reached the all-ids threshold");
        self.conn
            .prepare_cached("DELETE FROM idl WHERE key = ?1")?
            .execute(params![key])
            .map_err(|e| self.write_err(e))?;
        self.conn
            .prepare_cached("INSERT OR IGNORE INTO allids (key) VALUES (?1)")?
            .execute(params![key])
            .map_err(|e| self.write_err(e))?;
        self.counts.remove(key);
        self.all_ids.insert(key.to_string());
        Ok(Disposition::NowAllIds)
    }

    /// Remove `id` from `key`. Removing from an all-ids key is a no-op.
    pub fn delete(&mut self, key: &str, id: u64) -> Result<()> {
        if self.all_ids.contains(key) {
            return Ok(());
        }
        self.batch.touch(&self.conn)?;
        let removed = self
            .conn
            .prepare_cached("DELETE FROM idl WHERE key = ?1 AND id = ?2")?
            .execute(params![key, id as i64])
            .map_err(|e| self.write_err(e))?;
        if let Some(count) = self.counts.get_mut(key) {
            *count = count.saturating_sub(removed);
        }
        Ok(())
    }

    /// Add keys derived from `values`, returning the last disposition other than `Normal`.
    pub fn add_values(&mut self, kinds: &[IndexKind], values: &[String], id: u64) -> Result<Disposition> {
        let mut disposition = Disposition::Normal;
        for key in keys_for(kinds, values) {
            match self.insert(&key, id)? {
                Disposition::Normal => {}
                other => disposition = other,
            }
        }
        Ok(disposition)
    }

    /// Remove keys derived from `values`.
    pub fn remove_values(&mut self, kinds: &[IndexKind], values: &[String], id: u64) -> Result<()> {
        for key in keys_for(kinds, values) {
            self.delete(&key, id)?;
        }
        Ok(())
    }

    /// Ids stored under `key`, ascending.
    pub fn fetch(&self, key: &str) -> Result<IdList> {
        if self.all_ids.contains(key) {
            return Ok(IdList::AllIds);
        }
        let mut stmt = self
            .conn
            .prepare_cached("SELECT id FROM idl WHERE key = ?1 ORDER BY id")?;
        let ids = stmt
            .query_map(params![key], |row| Ok(row.get::<_, i64>(0)? as u64))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(IdList::Ids(ids))
    }

    /// Number of ids under `key`, `None` for an all-ids key.
    pub fn count(&self, key: &str) -> Result<Option<usize>> {
        if self.all_ids.contains(key) {
            return Ok(None);
        }
        Ok(Some(self.stored_count(key)?))
    }

    /// Replace everything stored under `key` with `ids`.
    pub fn store_block(&mut self, key: &str, ids: &IdList) -> Result<()> {
        self.batch.touch(&self.conn)?;
        self.conn
            .prepare_cached("DELETE FROM idl WHERE key = ?1")?
            .execute(params![key])
            .map_err(|e| self.write_err(e))?;
        self.conn
            .prepare_cached("DELETE FROM allids WHERE key = ?1")?
            .execute(params![key])
            .map_err(|e| self.write_err(e))?;
        self.all_ids.remove(key);
        self.counts.remove(key);
        match ids {
            IdList::AllIds => {
                self.conn
                    .prepare_cached("INSERT INTO allids (key) VALUES (?1)")?
                    .execute(params![key])
                    .map_err(|e| self.write_err(e))?;
                self.all_ids.insert(key.to_string());
            }
            IdList::Ids(ids) => {
                let mut stmt = self
                    .conn
                    .prepare_cached("INSERT OR IGNORE INTO idl (key, id) VALUES (?1, ?2)")?;
                for id in ids {
                    stmt.execute(params![key, *id as i64])
                        .map_err(|e| ImportError::from_write(e, &self.name))?;
                }
            }
        }
        Ok(())
    }

    /// Every distinct key starting with `prefix`, in key order. All-ids keys included.
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let mut keys: Vec<String> = {
            let mut stmt = self.conn.prepare(
                "SELECT DISTINCT key FROM idl WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key",
            )?;
            stmt.query_map(params![pattern], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };
        keys.extend(self.all_ids.iter().filter(|k| k.starts_with(prefix)).cloned());
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Drop every key and id.
    pub fn clear(&mut self) -> Result<()> {
        self.batch.commit(&self.conn)?;
        self.conn
            .execute_batch("DELETE FROM idl; DELETE FROM allids;")
            .map_err(|e| self.write_err(e))?;
        self.counts.clear();
        self.all_ids.clear();
        Ok(())
    }

    #[instrument(skip(self), fields(index = %self.name))]
    pub fn flush(&mut self) -> Result<()> {
        self.batch.commit(&self.conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(dir: &Path, limit: usize, collapse: bool) -> IndexFile {
        IndexFile::open(&dir.join("test.db"), "test", limit, collapse).unwrap()
    }

    #[test]
    fn test_keys_for_kinds() {
        let values = vec!["Bob".to_string()];
        let keys = keys_for(&[IndexKind::Eq, IndexKind::Pres, IndexKind::Sub], &values);
        assert_eq!(keys, vec!["=bob", "+", "*^bo", "*bob", "*ob$"]);
        assert!(keys_for(&[IndexKind::Pres], &[]).is_empty());
    }

    #[test]
    fn test_insert_fetch_delete() {
        let dir = tempdir().unwrap();
        let mut idx = open(dir.path(), 0, true);
        idx.insert("=a", 3).unwrap();
        idx.insert("=a", 1).unwrap();
        idx.insert("=a", 1).unwrap();
        idx.flush().unwrap();
        assert_eq!(idx.fetch("=a").unwrap(), IdList::Ids(vec![1, 3]));
        idx.delete("=a", 3).unwrap();
        assert_eq!(idx.count("=a").unwrap(), Some(1));
        assert!(idx.fetch("=missing").unwrap().is_empty());
    }

    #[test]
    fn test_collapse_to_all_ids() {
        let dir = tempdir().unwrap();
        let mut idx = open(dir.path(), 2, true);
        assert_eq!(idx.insert("=x", 1).unwrap(), Disposition::Normal);
        assert_eq!(idx.insert("=x", 2).unwrap(), Disposition::Normal);
        assert_eq!(idx.insert("=x", 3).unwrap(), Disposition::NowAllIds);
        assert_eq!(idx.insert("=x", 4).unwrap(), Disposition::AllIds);
        assert_eq!(idx.fetch("=x").unwrap(), IdList::AllIds);
        assert_eq!(idx.count("=x").unwrap(), None);
    }

    #[test]
    fn test_threshold_without_collapse_keeps_ids() {
        let dir = tempdir().unwrap();
        let mut idx = open(dir.path(), 2, false);
        idx.insert("=1", 2).unwrap();
        idx.insert("=1", 3).unwrap();
        assert_eq!(idx.insert("=1", 4).unwrap(), Disposition::NowAllIds);
        assert_eq!(idx.insert("=1", 5).unwrap(), Disposition::AllIds);
        assert_eq!(idx.fetch("=1").unwrap().len(), Some(4));
    }

    #[test]
    fn test_store_block_replaces() {
        let dir = tempdir().unwrap();
        let mut idx = open(dir.path(), 0, true);
        idx.insert("=1", 9).unwrap();
        idx.store_block("=1", &IdList::Ids(vec![2, 3])).unwrap();
        assert_eq!(idx.fetch("=1").unwrap(), IdList::Ids(vec![2, 3]));
        idx.store_block("=1", &IdList::AllIds).unwrap();
        assert!(idx.fetch("=1").unwrap().is_all_ids());
    }

    #[test]
    fn test_keys_with_prefix_sorted_by_string() {
        let dir = tempdir().unwrap();
        let mut idx = open(dir.path(), 0, true);
        for key in ["=10", "=2", "+", "=1"] {
            idx.insert(key, 1).unwrap();
        }
        assert_eq!(idx.keys_with_prefix("=").unwrap(), vec!["=1", "=10", "=2"]);
    }

    #[test]
    fn test_union() {
        let a = IdList::Ids(vec![1, 3, 5]);
        let b = IdList::Ids(vec![2, 3, 6]);
        assert_eq!(a.union(&b, 0), IdList::Ids(vec![1, 2, 3, 5, 6]));
        assert_eq!(a.union(&b, 4), IdList::AllIds);
        assert_eq!(a.union(&IdList::AllIds, 0), IdList::AllIds);
    }

    #[test]
    fn test_reopen_sees_all_ids_marker() {
        let dir = tempdir().unwrap();
        {
            let mut idx = open(dir.path(), 1, true);
            idx.insert("=k", 1).unwrap();
            idx.insert("=k", 2).unwrap();
            idx.flush().unwrap();
        }
        let idx = open(dir.path(), 1, true);
        assert!(idx.fetch("=k").unwrap().is_all_ids());
    }
}
