//! The ancestor-id index: every non-leaf entry keyed to all of its descendants.
//!
//! Two builds, picked by [`IdlMode`]:
//!
//! - **default** (`old`): walks non-leaf ids from the highest down, keeping
//!   the descendant sets of not-yet-visited parents in memory and writing
//!   each node's closure in one block.
//! - **streaming** (`new`): writes each node's children under its own key
//!   and under the key of every ancestor found by walking `parentid` up.
//!   Nothing but a parent cache is held in memory.

use std::collections::HashMap;

use tracing::{debug, info, instrument};

use super::ImportJob;
use super::subcount::open_parentid;
use crate::config::IdlMode;
use crate::entry::ATTR_PARENTID;
use crate::error::{ImportError, Result};
use crate::store::entryrdn::MAX_DN_DEPTH;
use crate::store::id2entry::Id2Entry;
use crate::store::index::{EQ_PREFIX, IdList, IndexFile, id_key};
use crate::store::{self, ANCESTORID};

/// Nodes between progress lines.
const PROGRESS_EVERY: usize = 5_000;

/// Build the ancestor-id index from the finished parent-id index.
#[instrument(skip(job))]
pub fn create_index(job: &ImportJob) -> Result<()> {
    let parentid = open_parentid(job)?;
    let primary = Id2Entry::open(&job.instance.path_for(store::ID2ENTRY))?;
    let nodes = non_leaf_ids(&parentid)?;
    info!(nodes = nodes.len(), "Creating ancestorid index");

    let mut parents = ParentCache::new(&primary);
    match job.config.idl_mode {
        IdlMode::Old => {
            let mut ancestorid = IndexFile::open(
                &job.instance.path_for(ANCESTORID),
                ANCESTORID,
                job.config.allids_threshold,
                true,
            )?;
            build_default(job, &parentid, &mut ancestorid, &mut parents, &nodes)?;
            ancestorid.flush()?;
        }
        IdlMode::New => {
            let mut ancestorid = IndexFile::open(
                &job.instance.path_for(ANCESTORID),
                ANCESTORID,
                job.config.allids_threshold,
                false,
            )?;
            build_streaming(job, &parentid, &mut ancestorid, &mut parents, &nodes)?;
            ancestorid.flush()?;
        }
    }
    info!("Created ancestorid index");
    Ok(())
}

/// Ids with at least one child, ascending.
fn non_leaf_ids(parentid: &IndexFile) -> Result<Vec<u64>> {
    let mut ids: Vec<u64> = parentid
        .keys_with_prefix(&EQ_PREFIX.to_string())?
        .iter()
        .filter_map(|k| k.strip_prefix(EQ_PREFIX)?.parse().ok())
        .collect();
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}

fn progress(done: usize, total: usize) {
    if done % PROGRESS_EVERY == 0 && total > 0 {
        info!(
            "Creating ancestorid index: processed {}% ({}/{})",
            done * 100 / total,
            done,
            total
        );
    }
}

fn build_default(
    job: &ImportJob,
    parentid: &IndexFile,
    ancestorid: &mut IndexFile,
    parents: &mut ParentCache<'_>,
    nodes: &[u64],
) -> Result<()> {
    let limit = job.config.allids_threshold;
    let mut pending: HashMap<u64, IdList> = HashMap::new();
    for (done, &node) in nodes.iter().rev().enumerate() {
        if job.is_aborted() {
            return Err(ImportError::Aborted);
        }
        let children = parentid.fetch(&id_key(node))?;
        let descendants = match pending.remove(&node) {
            Some(below) => children.union(&below, limit),
            None => children,
        };
        ancestorid.store_block(&id_key(node), &descendants)?;
        if let Some(parent) = parents.parent_of(node)? {
            let merged = match pending.remove(&parent) {
                Some(acc) => acc.union(&descendants, limit),
                None => descendants,
            };
            pending.insert(parent, merged);
        }
        progress(done + 1, nodes.len());
    }
    if !pending.is_empty() {
        return Err(ImportError::AncestorCacheNotEmpty(pending.len()));
    }
    Ok(())
}

fn build_streaming(
    job: &ImportJob,
    parentid: &IndexFile,
    ancestorid: &mut IndexFile,
    parents: &mut ParentCache<'_>,
    nodes: &[u64],
) -> Result<()> {
    for (done, &node) in nodes.iter().rev().enumerate() {
        if job.is_aborted() {
            return Err(ImportError::Aborted);
        }
        let children = parentid.fetch(&id_key(node))?;
        let children = children.ids();
        for child in children {
            ancestorid.insert(&id_key(node), *child)?;
        }
        let mut current = node;
        let mut depth = 0;
        while let Some(parent) = parents.parent_of(current)? {
            depth += 1;
            if depth > MAX_DN_DEPTH {
                return Err(ImportError::CorruptParentChain { id: node });
            }
            for child in children {
                ancestorid.insert(&id_key(parent), *child)?;
            }
            current = parent;
        }
        progress(done + 1, nodes.len());
    }
    Ok(())
}

/// Memoized `parentid` attribute lookups against the primary store.
struct ParentCache<'a> {
    primary: &'a Id2Entry,
    cache: HashMap<u64, Option<u64>>,
}

impl<'a> ParentCache<'a> {
    fn new(primary: &'a Id2Entry) -> Self {
        Self {
            primary,
            cache: HashMap::new(),
        }
    }

    fn parent_of(&mut self, id: u64) -> Result<Option<u64>> {
        if let Some(parent) = self.cache.get(&id) {
            return Ok(*parent);
        }
        let parent = match self.primary.get(id)? {
            Some(stored) => stored
                .entry
                .first_value(ATTR_PARENTID)
                .and_then(|v| v.parse().ok()),
            None => {
                debug!(id, "no stored entry while walking parents");
                None
            }
        };
        self.cache.insert(id, parent);
        Ok(parent)
    }
}
