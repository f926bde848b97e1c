//! The foreman: commits entries to the primary store strictly in id order.
//!
//! For each published entry it resolves the parent, maintains the DN and
//! parent-id indexes, writes the primary store, then hands the entry to the
//! workers by raising the ready watermark.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use super::ImportJob;
use super::fifo::Source;
use super::subcount::open_parentid;
use super::thread::{ThreadInfo, ThreadState};
use crate::entry::{ATTR_ENTRYDN, ATTR_ENTRYID, ATTR_PARENTID, ATTR_UNIQUEID, Entry, RUV_UNIQUEID};
use crate::error::Result;
use crate::store::entryrdn::{DnIndex, DnInsert, EntryRdnIndex};
use crate::store::id2entry::Id2Entry;
use crate::store::index::{Disposition, IndexFile, id_key};
use crate::store::{ENTRYDN, ENTRYRDN};

/// What the foreman decided for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Commit,
    Reject,
}

/// The stores the foreman owns for one pass.
pub struct ForemanStores {
    primary: Id2Entry,
    dn_index: Option<DnIndex>,
    parentid: IndexFile,
}

impl ForemanStores {
    pub fn open(job: &ImportJob) -> Result<Self> {
        let flags = job.flags();
        let primary = Id2Entry::open(&job.primary_path())?;
        // A plain reindex keeps the DN tree it already has
        let dn_index = if job.config.entryrdn {
            if flags.reindexing && !flags.dn2rdn {
                None
            } else {
                Some(DnIndex::Tree(EntryRdnIndex::open(
                    &job.instance.path_for(ENTRYRDN),
                    &job.config.suffixes,
                )?))
            }
        } else {
            Some(DnIndex::Legacy(IndexFile::open(
                &job.instance.path_for(ENTRYDN),
                ENTRYDN,
                0,
                false,
            )?))
        };
        Ok(Self {
            primary,
            dn_index,
            parentid: open_parentid(job)?,
        })
    }

    pub fn flush(&mut self) -> Result<()> {
        self.primary.flush()?;
        if let Some(index) = self.dn_index.as_mut() {
            index.flush()?;
        }
        self.parentid.flush()
    }
}

/// Foreman thread body for one pass.
pub fn run(job: &ImportJob, info: &ThreadInfo) -> Result<()> {
    let mut stores = ForemanStores::open(job)?;
    let mut id = info.first_id();
    debug!(first_id = id, "foreman starting");

    loop {
        if !job.honor_command(info)? {
            break;
        }
        if id > job.lead_id() {
            info.set_state(ThreadState::Waiting);
            std::thread::sleep(job.poll_interval());
            continue;
        }
        info.set_state(ThreadState::Running);

        match job.fifo.take(id) {
            Some((entry, source)) => {
                let mut entry = Arc::unwrap_or_clone(entry);
                match process(job, &mut stores, &mut entry, &source)? {
                    Verdict::Commit => {
                        let entry_id = entry.id();
                        job.fifo.ready(id, Arc::new(entry), job.worker_count());
                        job.ready_entry_id.store(entry_id, Ordering::SeqCst);
                    }
                    Verdict::Reject => {
                        job.counters.reject();
                        job.fifo.mark_bad(id, None);
                    }
                }
            }
            None => debug!(id, "no entry under this id, moving on"),
        }
        job.ready_id.store(id, Ordering::SeqCst);
        info.set_last_id(id);
        id += 1;
    }

    stores.flush()?;
    debug!(last_id = info.last_id(), "foreman stopped");
    Ok(())
}

/// Run every foreman step on one entry.
fn process(
    job: &ImportJob,
    stores: &mut ForemanStores,
    entry: &mut Entry,
    source: &Source,
) -> Result<Verdict> {
    let flags = job.flags();
    let from_store = flags.reindexing || flags.upgrading_dn();
    let ndn = entry.ndn();
    let is_suffix = job.is_suffix(&ndn);

    let parent_id = if from_store {
        if is_suffix {
            None
        } else {
            entry.first_value(ATTR_PARENTID).and_then(|v| v.parse::<u64>().ok())
        }
    } else {
        entry.remove_all(ATTR_PARENTID);
        entry.remove_all(ATTR_ENTRYID);
        match resolve_parent(stores, entry, is_suffix)? {
            Ok(parent) => parent,
            Err(()) => {
                warn!(
                    "Skipping entry \"{}\" which has no parent, ending at line {} of file \"{}\"",
                    entry.dn(),
                    source.line,
                    source.file
                );
                return Ok(Verdict::Reject);
            }
        }
    };
    if !from_store {
        if let Some(parent) = parent_id {
            entry.add_value(ATTR_PARENTID, parent.to_string());
        }
        entry.add_value(ATTR_ENTRYID, entry.id().to_string());
    }

    if stores.dn_index.is_some() && !index_dn(job, stores, entry, parent_id, source)? {
        return Ok(Verdict::Reject);
    }

    if !flags.reindexing || flags.dn2rdn {
        let rdn = job.config.entryrdn.then(|| node_rdn(entry, parent_id));
        stores.primary.upsert(entry.id(), entry, rdn.as_deref())?;
    }

    if let Some(parent) = parent_id {
        let disposition = stores.parentid.insert(&id_key(parent), entry.id())?;
        if !flags.upgrading_dn() {
            let mut mothers = job.mothers.lock().unwrap_or_else(|p| p.into_inner());
            match disposition {
                Disposition::NowAllIds => {
                    let count = job.config.allids_threshold as u64 + 1;
                    debug!(parent, count, "parent reached the all-ids threshold");
                    mothers.init(parent, count);
                }
                Disposition::AllIds => mothers.count(parent),
                Disposition::Normal => {}
            }
        }
    }

    if !job.vlv.is_done() {
        job.vlv.grok(entry);
    }
    Ok(Verdict::Commit)
}

/// Parent id through the DN index. `Err(())` means the parent is missing.
fn resolve_parent(
    stores: &ForemanStores,
    entry: &Entry,
    is_suffix: bool,
) -> Result<std::result::Result<Option<u64>, ()>> {
    if is_suffix {
        return Ok(Ok(None));
    }
    let Some(parent_dn) = entry.effective_parent_dn() else {
        return Ok(no_parent(entry));
    };
    let Some(dn_index) = stores.dn_index.as_ref() else {
        return Ok(no_parent(entry));
    };
    match dn_index.lookup(&parent_dn)? {
        Some(parent) => Ok(Ok(Some(parent))),
        None => Ok(no_parent(entry)),
    }
}

/// Only the replication state entry may live without a parent.
fn no_parent(entry: &Entry) -> std::result::Result<Option<u64>, ()> {
    if entry
        .unique_id()
        .is_some_and(|u| u.eq_ignore_ascii_case(RUV_UNIQUEID))
    {
        Ok(None)
    } else {
        Err(())
    }
}

/// RDN the entry is filed under. A node without a parent, such as a
/// suffix, carries its whole DN.
fn node_rdn(entry: &Entry, parent_id: Option<u64>) -> String {
    match parent_id {
        None => entry.dn().to_string(),
        Some(_) => entry
            .effective_rdn()
            .unwrap_or_else(|| entry.dn().to_string()),
    }
}

/// Add the entry to the DN index. `false` rejects the entry.
fn index_dn(
    job: &ImportJob,
    stores: &mut ForemanStores,
    entry: &mut Entry,
    parent_id: Option<u64>,
    source: &Source,
) -> Result<bool> {
    let Some(dn_index) = stores.dn_index.as_mut() else {
        return Ok(true);
    };
    let upgrading = job.flags().upgrading_dn();
    let id = entry.id();

    if upgrading {
        match dn_index {
            DnIndex::Tree(_) => dn_index.remove(id, "")?,
            DnIndex::Legacy(_) => {
                let old: Vec<String> = entry.deleted_values(ATTR_ENTRYDN).to_vec();
                for old_dn in old {
                    dn_index.remove(id, &old_dn)?;
                }
                dn_index.remove(id, entry.dn())?;
            }
        }
    }

    let mut rdn = node_rdn(entry, parent_id);
    let mut retried = false;
    loop {
        match dn_index.add(id, entry.dn(), &rdn, parent_id.unwrap_or(0))? {
            DnInsert::Added => return Ok(true),
            DnInsert::Duplicate(existing) if upgrading && !retried => {
                let Some(uniqueid) = entry.first_value(ATTR_UNIQUEID).map(str::to_string) else {
                    warn!(id, existing, "Duplicate DN \"{}\" without a unique id to rename it", entry.dn());
                    return Ok(false);
                };
                let renamed = format!("{}={}+{}", ATTR_UNIQUEID, uniqueid, rdn);
                let new_dn = match entry.effective_parent_dn() {
                    Some(parent) => format!("{},{}", renamed, parent),
                    None => renamed.clone(),
                };
                info!(
                    id,
                    existing,
                    "Entry \"{}\" duplicates entry {}; renaming it to \"{}\"",
                    entry.dn(),
                    existing,
                    new_dn
                );
                entry.set_dn(new_dn);
                rdn = renamed;
                retried = true;
            }
            DnInsert::Duplicate(existing) => {
                warn!(
                    "Duplicated DN detected: \"{}\": Entry ID: ({}), skipping entry ending at line {} of file \"{}\" (entry {} already has it)",
                    entry.dn(),
                    id,
                    source.line,
                    source.file,
                    existing
                );
                return Ok(false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::import::JobOptions;
    use crate::import::thread::{Command, ThreadKind};
    use crate::store::{self, ID2ENTRY};

    fn entry(dn_str: &str, id: u64) -> Entry {
        let mut e = Entry::new(dn_str);
        e.add_value("objectclass", "top");
        e.set_id(id);
        e
    }

    fn job(options: JobOptions) -> (tempfile::TempDir, ImportJob) {
        let dir = tempfile::tempdir().unwrap();
        let job = ImportJob::new(BackendConfig::default(), dir.path(), options).unwrap();
        job.instance.ensure().unwrap();
        (dir, job)
    }

    fn publish(job: &ImportJob, entries: Vec<Entry>) {
        for e in entries {
            let id = job.lead_id() + 1;
            assert!(crate::import::producer::publish_entry(job, id, e, Source::default()).unwrap());
        }
    }

    /// Run the foreman until it catches up with the producer.
    fn drain(job: &ImportJob) {
        let info = ThreadInfo::new("Foreman", ThreadKind::Foreman, job.first_id());
        std::thread::scope(|s| {
            let handle = s.spawn(|| run(job, &info));
            while job.ready_id() < job.lead_id() {
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            info.set_command(Command::Stop);
            handle.join().unwrap().unwrap();
        });
    }

    #[test]
    fn test_commits_parent_links() {
        let (_d, job) = job(JobOptions::default());
        publish(
            &job,
            vec![
                entry("dc=example,dc=com", 1),
                entry("ou=people,dc=example,dc=com", 2),
            ],
        );
        drain(&job);

        assert_eq!(job.ready_id(), 2);
        assert_eq!(job.ready_entry_id.load(Ordering::SeqCst), 2);
        let parentid = open_parentid(&job).unwrap();
        assert_eq!(parentid.fetch(&id_key(1)).unwrap().ids(), &[2]);
        let primary = Id2Entry::open(&job.instance.path_for(ID2ENTRY)).unwrap();
        let ou = primary.get(2).unwrap().unwrap().entry;
        assert_eq!(ou.first_value(ATTR_PARENTID), Some("1"));
        assert_eq!(ou.first_value(ATTR_ENTRYID), Some("2"));
    }

    #[test]
    fn test_suffix_is_filed_under_its_whole_dn() {
        let (_d, job) = job(JobOptions::default());
        publish(
            &job,
            vec![
                entry("dc=example,dc=com", 1),
                entry("ou=people,dc=example,dc=com", 2),
                entry("cn=a,ou=people,dc=example,dc=com", 3),
            ],
        );
        drain(&job);

        assert_eq!(job.counters.skipped(), 0);
        let tree = EntryRdnIndex::open(&job.instance.path_for(ENTRYRDN), &job.config.suffixes).unwrap();
        assert_eq!(tree.lookup("dc=example,dc=com").unwrap(), Some(1));
        assert_eq!(tree.node(1).unwrap(), Some((0, "dc=example,dc=com".to_string())));
        assert_eq!(tree.node(3).unwrap(), Some((2, "cn=a".to_string())));
        assert_eq!(
            tree.dn_of(3).unwrap().as_deref(),
            Some("cn=a,ou=people,dc=example,dc=com")
        );

        // The stored header of a suffix holds the whole DN
        let primary = Id2Entry::open(&job.instance.path_for(ID2ENTRY)).unwrap();
        assert_eq!(primary.get(1).unwrap().unwrap().entry.dn(), "dc=example,dc=com");
        assert_eq!(primary.get(3).unwrap().unwrap().entry.dn(), "cn=a");
    }

    #[test]
    fn test_duplicate_dn_is_skipped_once() {
        let (_d, job) = job(JobOptions::default());
        publish(
            &job,
            vec![
                entry("dc=example,dc=com", 1),
                entry("ou=people,dc=example,dc=com", 2),
                entry("OU=People,dc=example,dc=com", 3),
            ],
        );
        drain(&job);

        assert_eq!(job.counters.skipped(), 1);
        assert_eq!(job.counters.rejected(), 1);
        let tree = EntryRdnIndex::open(&job.instance.path_for(ENTRYRDN), &job.config.suffixes).unwrap();
        assert_eq!(tree.lookup("ou=people,dc=example,dc=com").unwrap(), Some(2));
        let primary = Id2Entry::open(&job.instance.path_for(ID2ENTRY)).unwrap();
        assert!(primary.get(3).unwrap().is_none());
        assert!(job.fifo.fetch(3).is_none());
    }

    #[test]
    fn test_orphan_is_rejected() {
        let (_d, job) = job(JobOptions::default());
        publish(
            &job,
            vec![
                entry("dc=example,dc=com", 1),
                entry("cn=x,ou=missing,dc=example,dc=com", 2),
            ],
        );
        drain(&job);
        assert_eq!(job.counters.skipped(), 1);
        let primary = Id2Entry::open(&job.instance.path_for(store::ID2ENTRY)).unwrap();
        assert_eq!(primary.count().unwrap(), 1);
    }

    #[test]
    fn test_legacy_dn_index() {
        let dir = tempfile::tempdir().unwrap();
        let config = BackendConfig {
            entryrdn: false,
            ..BackendConfig::default()
        };
        let job = ImportJob::new(config, dir.path(), JobOptions::default()).unwrap();
        job.instance.ensure().unwrap();
        publish(
            &job,
            vec![
                entry("dc=example,dc=com", 1),
                entry("ou=people,dc=example,dc=com", 2),
                entry("cn=a,ou=people,dc=example,dc=com", 3),
            ],
        );
        drain(&job);
        assert_eq!(job.counters.skipped(), 0);
        let parentid = open_parentid(&job).unwrap();
        assert_eq!(parentid.fetch(&id_key(2)).unwrap().ids(), &[3]);
    }
}
