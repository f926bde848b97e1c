//! The primary store: entry id to serialized entry.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::instrument;

use super::{WriteBatch, open_connection};
use crate::entry::Entry;
use crate::entry::ldif::{self, Header, ParseOptions};
use crate::error::{ImportError, Result};

/// A stored entry together with the header form it was written in.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub id: u64,
    pub header: Header,
    /// With an `rdn:` header the entry's DN holds only the RDN.
    pub entry: Entry,
}

pub struct Id2Entry {
    conn: Connection,
    batch: WriteBatch,
}

impl Id2Entry {
    /// Open or create the primary store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_connection(path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS id2entry (
                id INTEGER PRIMARY KEY,
                entry TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn,
            batch: WriteBatch::default(),
        })
    }

    /// Insert or replace the entry stored under `id`.
    pub fn upsert(&mut self, id: u64, entry: &Entry, rdn: Option<&str>) -> Result<()> {
        self.batch.touch(&self.conn)?;
        let text = ldif::to_ldif(entry, rdn);
        self.conn
            .prepare_cached("INSERT OR REPLACE INTO id2entry (id, entry) VALUES (?1, ?2)")?
            .execute(params![id as i64, text])
            .map_err(|e| ImportError::from_write(e, "id2entry"))?;
        Ok(())
    }

    pub fn get_raw(&self, id: u64) -> Result<Option<String>> {
        Ok(self
            .conn
            .prepare_cached("SELECT entry FROM id2entry WHERE id = ?1")?
            .query_row(params![id as i64], |row| row.get(0))
            .optional()?)
    }

    /// Fetch and decode one entry.
    pub fn get(&self, id: u64) -> Result<Option<StoredEntry>> {
        match self.get_raw(id)? {
            Some(text) => decode(id, &text).map(Some),
            None => Ok(None),
        }
    }

    /// Next `limit` raw entries with an id greater than `after`, in id order.
    pub fn scan_after(&self, after: u64, limit: usize) -> Result<Vec<(u64, String)>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT id, entry FROM id2entry WHERE id > ?1 ORDER BY id LIMIT ?2")?;
        let rows = stmt
            .query_map(params![after as i64, limit as i64], |row| {
                Ok((row.get::<_, i64>(0)? as u64, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM id2entry", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    pub fn max_id(&self) -> Result<u64> {
        let n: Option<i64> = self
            .conn
            .query_row("SELECT MAX(id) FROM id2entry", [], |row| row.get(0))?;
        Ok(n.unwrap_or(0) as u64)
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?)
    }

    pub fn set_meta(&mut self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_meta(&mut self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM meta WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Mark an index offline (being built) or online.
    pub fn set_index_offline(&mut self, index: &str, offline: bool) -> Result<()> {
        let key = format!("offline:{}", index.to_lowercase());
        if offline {
            self.set_meta(&key, "1")
        } else {
            self.delete_meta(&key)
        }
    }

    pub fn offline_indexes(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key FROM meta WHERE key LIKE 'offline:%' ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix("offline:").map(str::to_string))
            .collect())
    }

    /// Commit pending writes.
    #[instrument(skip(self))]
    pub fn flush(&mut self) -> Result<()> {
        self.batch.commit(&self.conn)
    }
}

/// Decode a stored entry.
pub fn decode(id: u64, text: &str) -> Result<StoredEntry> {
    let opts = ParseOptions {
        allow_rdn_header: true,
        ..Default::default()
    };
    let (header, mut entry) = ldif::parse_entry(text, opts).map_err(|e| ImportError::CorruptEntry {
        id,
        reason: e.to_string(),
    })?;
    entry.set_id(id);
    Ok(StoredEntry { id, header, entry })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(dn: &str, cn: &str) -> Entry {
        let mut e = Entry::new(dn);
        e.add_value("objectclass", "person");
        e.add_value("cn", cn);
        e
    }

    #[test]
    fn test_upsert_replaces_instead_of_duplicating() {
        let dir = tempdir().unwrap();
        let mut store = Id2Entry::open(&dir.path().join("id2entry.db")).unwrap();
        store.upsert(1, &entry("cn=a,dc=x", "a"), None).unwrap();
        store.upsert(1, &entry("cn=a,dc=x", "changed"), None).unwrap();
        store.flush().unwrap();
        assert_eq!(store.count().unwrap(), 1);
        let stored = store.get(1).unwrap().unwrap();
        assert_eq!(stored.entry.first_value("cn"), Some("changed"));
        assert_eq!(stored.entry.id(), 1);
    }

    #[test]
    fn test_rdn_header_round_trip() {
        let dir = tempdir().unwrap();
        let mut store = Id2Entry::open(&dir.path().join("id2entry.db")).unwrap();
        store
            .upsert(5, &entry("cn=b,dc=x", "b"), Some("cn=b"))
            .unwrap();
        store.flush().unwrap();
        let stored = store.get(5).unwrap().unwrap();
        assert_eq!(stored.header, Header::Rdn);
        assert_eq!(stored.entry.dn(), "cn=b");
        assert!(store.get(6).unwrap().is_none());
    }

    #[test]
    fn test_scan_after_pages_in_id_order() {
        let dir = tempdir().unwrap();
        let mut store = Id2Entry::open(&dir.path().join("id2entry.db")).unwrap();
        for id in [3u64, 1, 2] {
            store
                .upsert(id, &entry(&format!("cn={},dc=x", id), "x"), None)
                .unwrap();
        }
        store.flush().unwrap();
        let page = store.scan_after(0, 2).unwrap();
        assert_eq!(page.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![1, 2]);
        let page = store.scan_after(2, 2).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(store.max_id().unwrap(), 3);
    }

    #[test]
    fn test_offline_flags() {
        let dir = tempdir().unwrap();
        let mut store = Id2Entry::open(&dir.path().join("id2entry.db")).unwrap();
        store.set_index_offline("CN", true).unwrap();
        store.set_index_offline("uid", true).unwrap();
        assert_eq!(store.offline_indexes().unwrap(), vec!["cn", "uid"]);
        store.set_index_offline("cn", false).unwrap();
        assert_eq!(store.offline_indexes().unwrap(), vec!["uid"]);
    }
}
