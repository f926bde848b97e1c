//! The reindex producer: replays the stored entries through the pipeline.
//!
//! Entries stored in the RDN form carry only their RDN, so the full DN is
//! rebuilt from the DN cache, then the DN-tree index, then by walking the
//! stored `parentid` attributes upward.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::ImportJob;
use super::fifo::Source;
use super::producer::publish_entry;
use super::thread::{ThreadInfo, ThreadState};
use crate::entry::ATTR_PARENTID;
use crate::entry::ldif::Header;
use crate::error::{ImportError, Result};
use crate::store::entryrdn::{EntryRdnIndex, MAX_DN_DEPTH};
use crate::store::id2entry::{Id2Entry, StoredEntry, decode};
use crate::store::{self, ENTRYRDN};

/// Stored entries read per query.
const SCAN_BATCH: usize = 500;

/// Bounded id to DN cache; the oldest insertions are evicted first.
#[derive(Debug)]
pub struct DnCache {
    capacity: usize,
    map: HashMap<u64, String>,
    order: VecDeque<u64>,
}

impl DnCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn get(&self, id: u64) -> Option<&str> {
        self.map.get(&id).map(String::as_str)
    }

    pub fn insert(&mut self, id: u64, dn: String) {
        if self.map.insert(id, dn).is_none() {
            self.order.push_back(id);
        }
        while self.map.len() > self.capacity {
            match self.order.pop_front() {
                Some(old) => {
                    self.map.remove(&old);
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

fn parent_id(stored: &StoredEntry) -> Option<u64> {
    stored
        .entry
        .first_value(ATTR_PARENTID)
        .and_then(|v| v.parse().ok())
}

/// Rebuilds full DNs of stored entries.
pub struct DnResolver<'a> {
    primary: &'a Id2Entry,
    tree: Option<EntryRdnIndex>,
    cache: DnCache,
}

impl<'a> DnResolver<'a> {
    pub fn new(job: &ImportJob, primary: &'a Id2Entry) -> Result<Self> {
        let tree_path = job.instance.path_for(ENTRYRDN);
        let tree = if job.config.entryrdn && !job.flags().dn2rdn && tree_path.exists() {
            Some(EntryRdnIndex::open(&tree_path, &job.config.suffixes)?)
        } else {
            None
        };
        Ok(Self {
            primary,
            tree,
            cache: DnCache::new(job.config.dn_cache_entries),
        })
    }

    pub fn remember(&mut self, id: u64, dn: &str) {
        self.cache.insert(id, dn.to_string());
    }

    /// Full DN of a stored entry.
    pub fn full_dn(&mut self, stored: &StoredEntry) -> Result<String> {
        if stored.header == Header::Dn {
            return Ok(stored.entry.dn().to_string());
        }
        let rdn = stored.entry.dn();
        match parent_id(stored) {
            None => Ok(rdn.to_string()),
            Some(pid) => Ok(format!("{},{}", rdn, self.dn_of(pid)?)),
        }
    }

    /// DN of entry `id`, which must exist.
    pub fn dn_of(&mut self, id: u64) -> Result<String> {
        if let Some(dn) = self.cache.get(id) {
            return Ok(dn.to_string());
        }
        if let Some(tree) = &self.tree
            && let Some(dn) = tree.dn_of(id)?
        {
            self.cache.insert(id, dn.clone());
            return Ok(dn);
        }

        // Walk up collecting RDNs until a cached or full-DN ancestor
        let mut chain: Vec<(u64, String)> = Vec::new();
        let mut current = id;
        let mut base: Option<String> = None;
        loop {
            if chain.len() >= MAX_DN_DEPTH {
                return Err(ImportError::CorruptParentChain { id });
            }
            if let Some(dn) = self.cache.get(current) {
                base = Some(dn.to_string());
                break;
            }
            let stored = self
                .primary
                .get(current)?
                .ok_or(ImportError::CorruptParentChain { id })?;
            if stored.header == Header::Dn {
                base = Some(stored.entry.dn().to_string());
                break;
            }
            let next = parent_id(&stored);
            chain.push((current, stored.entry.dn().to_string()));
            match next {
                Some(pid) => current = pid,
                None => break,
            }
        }

        let mut dn = base;
        for (cid, rdn) in chain.into_iter().rev() {
            let full = match dn {
                Some(d) => format!("{},{}", rdn, d),
                None => rdn,
            };
            self.cache.insert(cid, full.clone());
            dn = Some(full);
        }
        dn.ok_or(ImportError::CorruptParentChain { id })
    }
}

/// Whether a store scan keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Walk the primary store in id order, handing each entry and its full DN
/// to `each`. Undecodable entries are skipped and counted.
pub fn scan_store(
    job: &ImportJob,
    info: &ThreadInfo,
    primary: &Id2Entry,
    mut each: impl FnMut(StoredEntry, String) -> Result<Flow>,
) -> Result<()> {
    let mut resolver = DnResolver::new(job, primary)?;
    let mut after = 0;
    loop {
        let batch = primary.scan_after(after, SCAN_BATCH)?;
        let Some((last, _)) = batch.last() else {
            return Ok(());
        };
        after = *last;
        for (id, text) in batch {
            if !job.honor_command(info)? {
                info!("Producer stopped at entry {}", id);
                return Ok(());
            }
            info.set_state(ThreadState::Running);
            let stored = match decode(id, &text) {
                Ok(stored) => stored,
                Err(e) => {
                    warn!(id, error = %e, "Skipping undecodable entry {}", id);
                    job.counters.skip();
                    continue;
                }
            };
            let dn = resolver.full_dn(&stored)?;
            resolver.remember(id, &dn);
            if each(stored, dn)? == Flow::Stop {
                return Ok(());
            }
        }
    }
}

/// Producer thread body for reindexing.
pub fn run(job: &ImportJob, info: &ThreadInfo) -> Result<()> {
    info.set_state(ThreadState::Running);
    let primary = Id2Entry::open(&job.instance.path_for(store::ID2ENTRY))?;
    let total = primary.count()?;
    info!(entries = total, "{}: scanning {} stored entries", job.opstr(), total);
    let file: Arc<str> = Arc::from(store::ID2ENTRY);

    scan_store(job, info, &primary, |stored, dn| {
        let mut entry = stored.entry;
        entry.set_dn(dn);
        entry.set_id(stored.id);
        let source = Source {
            file: Arc::clone(&file),
            line: stored.id as usize,
        };
        let seq = job.lead_id() + 1;
        if !publish_entry(job, seq, entry, source)? {
            debug!(id = stored.id, "stored entry did not fit in the fifo");
        }
        Ok(Flow::Continue)
    })
}
