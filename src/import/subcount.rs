//! Subordinate counts, derived from the parent-id index after the pipeline drains.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, instrument, warn};

use super::ImportJob;
use crate::config::IdlMode;
use crate::entry::ldif::Header;
use crate::entry::{ATTR_NUMSUBORDINATES, ATTR_PARENTID, ATTR_TOMBSTONE_NUMSUBORDINATES};
use crate::error::{ImportError, Result};
use crate::store::id2entry::{Id2Entry, decode};
use crate::store::index::{EQ_PREFIX, IndexFile};
use crate::store::{self, PARENTID};

/// Entries read per batch when trawling the primary store.
const TRAWL_BATCH: usize = 1_000;

/// Child counts the foreman tracks for parents whose parent-id key went
/// past the all-ids threshold, so the builder need not count them again.
#[derive(Debug, Default)]
pub struct SubcountHints {
    counts: HashMap<u64, u64>,
}

impl SubcountHints {
    /// Start tracking a parent with `count` children.
    pub fn init(&mut self, parent_id: u64, count: u64) {
        self.counts.insert(parent_id, count);
    }

    /// One more child of a tracked parent.
    pub fn count(&mut self, parent_id: u64) {
        if let Some(n) = self.counts.get_mut(&parent_id) {
            *n += 1;
        }
    }

    pub fn lookup(&self, parent_id: u64) -> Option<u64> {
        self.counts.get(&parent_id).copied()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Open the parent-id index the way the foreman wrote it.
pub fn open_parentid(job: &ImportJob) -> Result<IndexFile> {
    IndexFile::open(
        &job.instance.path_for(PARENTID),
        PARENTID,
        job.config.allids_threshold,
        job.config.idl_mode == IdlMode::Old,
    )
}

fn parse_id_key(key: &str) -> Option<u64> {
    key.strip_prefix(EQ_PREFIX)?.parse().ok()
}

/// Write `numsubordinates` (or its tombstone variant) on every parent entry.
#[instrument(skip(job))]
pub fn update_subordinate_counts(job: &ImportJob) -> Result<()> {
    let parentid = open_parentid(job)?;
    let mut primary = Id2Entry::open(&job.instance.path_for(store::ID2ENTRY))?;
    let mut numsub_index = match job.config.index_for(ATTR_NUMSUBORDINATES) {
        Some(config) => Some((
            IndexFile::open(
                &job.instance.path_for(ATTR_NUMSUBORDINATES),
                ATTR_NUMSUBORDINATES,
                job.config.allids_threshold,
                true,
            )?,
            config.types.clone(),
        )),
        None => None,
    };

    let keys = parentid.keys_with_prefix(&EQ_PREFIX.to_string())?;
    let hints = job.mothers.lock().unwrap_or_else(|p| p.into_inner());
    let mut trawl: HashSet<u64> = HashSet::new();
    let mut updated = 0u64;
    for key in keys {
        if job.is_aborted() {
            return Err(ImportError::Aborted);
        }
        let Some(parent_id) = parse_id_key(&key) else {
            warn!(key = %key, "ignoring malformed parentid key");
            continue;
        };
        let count = match hints.lookup(parent_id) {
            Some(n) => Some(n),
            None => parentid.count(&key)?.map(|n| n as u64),
        };
        match count {
            Some(n) => {
                update_entry_subcount(&mut primary, numsub_index.as_mut(), parent_id, n)?;
                updated += 1;
            }
            None => {
                trawl.insert(parent_id);
            }
        }
    }
    drop(hints);

    if !trawl.is_empty() {
        info!(parents = trawl.len(), "counting children of all-ids parents by scanning the entries");
        for (parent_id, n) in trawl_counts(&primary, &trawl, job)? {
            update_entry_subcount(&mut primary, numsub_index.as_mut(), parent_id, n)?;
            updated += 1;
        }
    }

    primary.flush()?;
    if let Some((index, _)) = numsub_index.as_mut() {
        index.flush()?;
    }
    debug!(parents = updated, "subordinate counts written");
    Ok(())
}

/// Count children of the given parents by reading every stored entry.
fn trawl_counts(primary: &Id2Entry, parents: &HashSet<u64>, job: &ImportJob) -> Result<HashMap<u64, u64>> {
    let mut counts: HashMap<u64, u64> = parents.iter().map(|p| (*p, 0)).collect();
    let mut after = 0;
    loop {
        if job.is_aborted() {
            return Err(ImportError::Aborted);
        }
        let batch = primary.scan_after(after, TRAWL_BATCH)?;
        let Some((last, _)) = batch.last() else {
            break;
        };
        after = *last;
        for (id, text) in &batch {
            let stored = decode(*id, text)?;
            for value in stored.entry.values(ATTR_PARENTID) {
                if let Ok(pid) = value.parse::<u64>()
                    && let Some(n) = counts.get_mut(&pid)
                {
                    *n += 1;
                }
            }
        }
    }
    Ok(counts)
}

/// Replace the subordinate count of one parent entry.
fn update_entry_subcount(
    primary: &mut Id2Entry,
    numsub_index: Option<&mut (IndexFile, Vec<crate::config::IndexKind>)>,
    parent_id: u64,
    count: u64,
) -> Result<()> {
    let Some(stored) = primary.get(parent_id)? else {
        warn!(id = parent_id, "parent entry missing from id2entry, cannot set its subordinate count");
        return Ok(());
    };
    let mut entry = stored.entry;
    let attr = if entry.is_tombstone() {
        ATTR_TOMBSTONE_NUMSUBORDINATES
    } else {
        ATTR_NUMSUBORDINATES
    };
    let old = entry.values(attr).to_vec();
    let new = vec![count.to_string()];
    if old == new {
        return Ok(());
    }
    entry.replace(attr, new.clone());
    let rdn = match stored.header {
        Header::Rdn => Some(entry.dn().to_string()),
        Header::Dn => None,
    };
    primary.upsert(parent_id, &entry, rdn.as_deref())?;

    if attr == ATTR_NUMSUBORDINATES
        && let Some((index, kinds)) = numsub_index
    {
        index.remove_values(kinds, &old, parent_id)?;
        index.add_values(kinds, &new, parent_id)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, IndexConfig, IndexKind};
    use crate::entry::Entry;
    use crate::import::JobOptions;
    use crate::store::index::{equality_key, id_key};
    use tempfile::tempdir;

    #[test]
    fn test_hints_count_only_tracked_parents() {
        let mut hints = SubcountHints::default();
        hints.count(3);
        assert_eq!(hints.lookup(3), None);
        hints.init(3, 5);
        hints.count(3);
        assert_eq!(hints.lookup(3), Some(6));
        assert_eq!(hints.len(), 1);
    }

    fn stored(primary: &mut Id2Entry, id: u64, dn: &str, parent: Option<u64>) {
        let mut e = Entry::new(dn);
        e.add_value("objectclass", "top");
        if let Some(p) = parent {
            e.add_value(ATTR_PARENTID, p.to_string());
        }
        primary.upsert(id, &e, None).unwrap();
    }

    #[test]
    fn test_counts_written_from_parentid() {
        let dir = tempdir().unwrap();
        let mut config = BackendConfig::default();
        config.indexes.push(IndexConfig::new("numsubordinates", &[IndexKind::Eq]));
        let job = ImportJob::new(config, dir.path(), JobOptions::default()).unwrap();
        job.instance.ensure().unwrap();

        let mut primary = Id2Entry::open(&job.instance.path_for(store::ID2ENTRY)).unwrap();
        stored(&mut primary, 1, "dc=example,dc=com", None);
        stored(&mut primary, 2, "ou=a,dc=example,dc=com", Some(1));
        stored(&mut primary, 3, "ou=b,dc=example,dc=com", Some(1));
        stored(&mut primary, 4, "cn=x,ou=a,dc=example,dc=com", Some(2));
        primary.flush().unwrap();

        let mut parentid = open_parentid(&job).unwrap();
        parentid.insert(&id_key(1), 2).unwrap();
        parentid.insert(&id_key(1), 3).unwrap();
        parentid.insert(&id_key(2), 4).unwrap();
        parentid.flush().unwrap();

        update_subordinate_counts(&job).unwrap();

        let primary = Id2Entry::open(&job.instance.path_for(store::ID2ENTRY)).unwrap();
        let root = primary.get(1).unwrap().unwrap().entry;
        assert_eq!(root.first_value(ATTR_NUMSUBORDINATES), Some("2"));
        let ou = primary.get(2).unwrap().unwrap().entry;
        assert_eq!(ou.first_value(ATTR_NUMSUBORDINATES), Some("1"));
        let leaf = primary.get(4).unwrap().unwrap().entry;
        assert!(!leaf.has(ATTR_NUMSUBORDINATES));

        let numsub = IndexFile::open(
            &job.instance.path_for(ATTR_NUMSUBORDINATES),
            ATTR_NUMSUBORDINATES,
            0,
            true,
        )
        .unwrap();
        assert_eq!(numsub.fetch(&equality_key("2")).unwrap().ids(), &[1]);
    }

    #[test]
    fn test_all_ids_parent_is_trawled() {
        let dir = tempdir().unwrap();
        let mut config = BackendConfig::default();
        config.allids_threshold = 1;
        config.idl_mode = IdlMode::Old;
        let job = ImportJob::new(config, dir.path(), JobOptions::default()).unwrap();
        job.instance.ensure().unwrap();

        let mut primary = Id2Entry::open(&job.instance.path_for(store::ID2ENTRY)).unwrap();
        stored(&mut primary, 1, "dc=example,dc=com", None);
        stored(&mut primary, 2, "ou=a,dc=example,dc=com", Some(1));
        stored(&mut primary, 3, "ou=b,dc=example,dc=com", Some(1));
        primary.flush().unwrap();

        let mut parentid = open_parentid(&job).unwrap();
        parentid.insert(&id_key(1), 2).unwrap();
        parentid.insert(&id_key(1), 3).unwrap();
        parentid.flush().unwrap();
        assert!(parentid.fetch(&id_key(1)).unwrap().is_all_ids());

        update_subordinate_counts(&job).unwrap();
        let primary = Id2Entry::open(&job.instance.path_for(store::ID2ENTRY)).unwrap();
        let root = primary.get(1).unwrap().unwrap().entry;
        assert_eq!(root.first_value(ATTR_NUMSUBORDINATES), Some("2"));
    }
}
