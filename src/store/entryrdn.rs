//! DN-tree index: each entry is a node `(id, parent_id, rdn)`.
//!
//! A suffix is a single node under the virtual root `0` whose RDN is the
//! whole suffix DN. Lookups walk from the suffix node down one RDN at a time;
//! DN reconstruction walks parent pointers up. When the DN-tree is disabled
//! the legacy `entrydn` equality index (normalized DN to id) is used instead;
//! [`DnIndex`] hides the difference from the foreman.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use super::index::{IdList, IndexFile, equality_key};
use super::{WriteBatch, open_connection};
use crate::entry::dn;
use crate::error::{ImportError, Result};

/// Depth cap for upward DN reconstruction.
pub const MAX_DN_DEPTH: usize = 512;

/// Result of adding a DN to the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnInsert {
    Added,
    /// The DN is already indexed under another id.
    Duplicate(u64),
}

pub struct EntryRdnIndex {
    conn: Connection,
    batch: WriteBatch,
    suffixes: Vec<String>,
}

impl EntryRdnIndex {
    pub fn open(path: &Path, suffixes: &[String]) -> Result<Self> {
        let conn = open_connection(path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS entryrdn (
                id INTEGER PRIMARY KEY,
                parent_id INTEGER NOT NULL,
                nrdn TEXT NOT NULL,
                rdn TEXT NOT NULL,
                UNIQUE (parent_id, nrdn)
            );
            "#,
        )?;
        let mut suffixes: Vec<String> = suffixes.iter().map(|s| dn::normalize(s)).collect();
        // Longest first so nested suffixes resolve to the deepest match
        suffixes.sort_by_key(|s| std::cmp::Reverse(dn::explode(s).len()));
        Ok(Self {
            conn,
            batch: WriteBatch::default(),
            suffixes,
        })
    }

    fn child(&self, parent_id: u64, nrdn: &str) -> Result<Option<u64>> {
        Ok(self
            .conn
            .prepare_cached("SELECT id FROM entryrdn WHERE parent_id = ?1 AND nrdn = ?2")?
            .query_row(params![parent_id as i64, nrdn], |row| row.get::<_, i64>(0))
            .optional()?
            .map(|id| id as u64))
    }

    /// Split a DN into (suffix, RDNs below the suffix, top-down).
    fn locate(&self, ndn: &str) -> Option<(String, Vec<String>)> {
        self.suffixes.iter().find_map(|suffix| {
            if ndn == suffix {
                return Some((suffix.clone(), Vec::new()));
            }
            let head = ndn.strip_suffix(suffix.as_str())?.strip_suffix(',')?;
            let mut rdns = dn::explode(head);
            rdns.reverse();
            Some((suffix.clone(), rdns))
        })
    }

    /// Id of the entry with this DN.
    pub fn lookup(&self, dn_str: &str) -> Result<Option<u64>> {
        let ndn = dn::normalize(dn_str);
        let Some((suffix, rdns)) = self.locate(&ndn) else {
            return Ok(None);
        };
        let Some(mut id) = self.child(0, &suffix)? else {
            return Ok(None);
        };
        for rdn in rdns {
            match self.child(id, &dn::normalize_rdn(&rdn))? {
                Some(next) => id = next,
                None => return Ok(None),
            }
        }
        Ok(Some(id))
    }

    /// Add node `id` with `rdn` under `parent_id` (0 for a suffix).
    pub fn add(&mut self, id: u64, parent_id: u64, rdn: &str) -> Result<DnInsert> {
        let nrdn = normalize_node_rdn(rdn);
        if let Some(existing) = self.child(parent_id, &nrdn)? {
            if existing != id {
                return Ok(DnInsert::Duplicate(existing));
            }
            return Ok(DnInsert::Added);
        }
        self.batch.touch(&self.conn)?;
        self.conn
            .prepare_cached(
                "INSERT OR REPLACE INTO entryrdn (id, parent_id, nrdn, rdn) VALUES (?1, ?2, ?3, ?4)",
            )?
            .execute(params![id as i64, parent_id as i64, nrdn, rdn])
            .map_err(|e| ImportError::from_write(e, "entryrdn"))?;
        Ok(DnInsert::Added)
    }

    pub fn delete(&mut self, id: u64) -> Result<()> {
        self.batch.touch(&self.conn)?;
        self.conn
            .prepare_cached("DELETE FROM entryrdn WHERE id = ?1")?
            .execute(params![id as i64])
            .map_err(|e| ImportError::from_write(e, "entryrdn"))?;
        Ok(())
    }

    /// `(parent_id, rdn)` of a node.
    pub fn node(&self, id: u64) -> Result<Option<(u64, String)>> {
        Ok(self
            .conn
            .prepare_cached("SELECT parent_id, rdn FROM entryrdn WHERE id = ?1")?
            .query_row(params![id as i64], |row| {
                Ok((row.get::<_, i64>(0)? as u64, row.get::<_, String>(1)?))
            })
            .optional()?)
    }

    /// Rebuild the DN of `id` by walking parent pointers.
    pub fn dn_of(&self, id: u64) -> Result<Option<String>> {
        let mut rdns = Vec::new();
        let mut current = id;
        while current != 0 {
            if rdns.len() >= MAX_DN_DEPTH {
                return Err(ImportError::CorruptParentChain { id });
            }
            match self.node(current)? {
                Some((parent, rdn)) => {
                    rdns.push(rdn);
                    current = parent;
                }
                None if rdns.is_empty() => return Ok(None),
                None => return Err(ImportError::CorruptParentChain { id }),
            }
        }
        Ok(Some(rdns.join(",")))
    }

    pub fn flush(&mut self) -> Result<()> {
        self.batch.commit(&self.conn)
    }
}

/// Node RDNs may span two RDNs (tombstones); normalize each part.
fn normalize_node_rdn(rdn: &str) -> String {
    dn::explode(rdn)
        .iter()
        .map(|r| dn::normalize_rdn(r))
        .collect::<Vec<_>>()
        .join(",")
}

/// The DN-to-id index the foreman maintains.
pub enum DnIndex {
    Tree(EntryRdnIndex),
    /// Legacy `entrydn` equality index over normalized DNs.
    Legacy(IndexFile),
}

impl DnIndex {
    pub fn lookup(&self, dn_str: &str) -> Result<Option<u64>> {
        match self {
            DnIndex::Tree(tree) => tree.lookup(dn_str),
            DnIndex::Legacy(index) => match index.fetch(&equality_key(&dn::normalize(dn_str)))? {
                IdList::Ids(ids) => Ok(ids.first().copied()),
                IdList::AllIds => Ok(None),
            },
        }
    }

    /// Index entry `id`. `rdn` is the node RDN, `parent_id` 0 for a suffix.
    pub fn add(&mut self, id: u64, dn_str: &str, rdn: &str, parent_id: u64) -> Result<DnInsert> {
        match self {
            DnIndex::Tree(tree) => tree.add(id, parent_id, rdn),
            DnIndex::Legacy(index) => {
                let key = equality_key(&dn::normalize(dn_str));
                if let IdList::Ids(ids) = index.fetch(&key)?
                    && let Some(existing) = ids.iter().find(|e| **e != id)
                {
                    return Ok(DnInsert::Duplicate(*existing));
                }
                index.insert(&key, id)?;
                Ok(DnInsert::Added)
            }
        }
    }

    /// Forget entry `id` stored under `dn_str`.
    pub fn remove(&mut self, id: u64, dn_str: &str) -> Result<()> {
        match self {
            DnIndex::Tree(tree) => tree.delete(id),
            DnIndex::Legacy(index) => index.delete(&equality_key(&dn::normalize(dn_str)), id),
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        match self {
            DnIndex::Tree(tree) => tree.flush(),
            DnIndex::Legacy(index) => index.flush(),
        }
    }
}
