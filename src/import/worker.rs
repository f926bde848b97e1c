//! Index workers: one thread per secondary index, trailing the foreman.

use tracing::{debug, trace};

use super::ImportJob;
use super::descriptor::{IndexDescriptor, IndexType};
use super::thread::{ThreadInfo, ThreadState};
use crate::config::{IdlMode, IndexKind};
use crate::entry::{
    ATTR_NSCP_ENTRYDN, ATTR_OBJECTCLASS, ATTR_TOMBSTONE_CSN, ATTR_UNIQUEID, Entry,
    TOMBSTONE_OBJECTCLASS,
};
use crate::error::Result;
use crate::store::index::IndexFile;

/// Indexes a tombstone is kept in.
const TOMBSTONE_INDEXES: [&str; 4] = [
    ATTR_UNIQUEID,
    ATTR_OBJECTCLASS,
    ATTR_NSCP_ENTRYDN,
    ATTR_TOMBSTONE_CSN,
];

/// Open the file a descriptor writes to.
pub fn open_index(job: &ImportJob, descriptor: &IndexDescriptor) -> Result<IndexFile> {
    let file_name = descriptor.file_name();
    let path = job.instance.path_for(&file_name);
    match descriptor.index_type {
        IndexType::Vlv(_) => IndexFile::open(&path, &file_name, 0, false),
        IndexType::Attribute { .. } => IndexFile::open(
            &path,
            &file_name,
            job.config.allids_threshold,
            job.config.idl_mode == IdlMode::Old,
        ),
    }
}

/// Values of `base` over the live attributes, subtypes included.
fn live_values(entry: &Entry, base: &str) -> Vec<String> {
    entry
        .find_all(base)
        .flat_map(|a| a.values.iter().cloned())
        .collect()
}

/// Values of `base` an upgrade pass moved aside.
fn stale_values(entry: &Entry, base: &str) -> Vec<String> {
    entry
        .deleted_attrs()
        .iter()
        .filter(|a| a.base_type() == base)
        .flat_map(|a| a.values.iter().cloned())
        .collect()
}

/// Write one entry's keys for this descriptor.
pub fn index_entry(
    job: &ImportJob,
    descriptor: &IndexDescriptor,
    index: &mut IndexFile,
    entry: &Entry,
) -> Result<()> {
    let id = entry.id();
    match &descriptor.index_type {
        IndexType::Vlv(vlv) => {
            if vlv.selects(entry) {
                index.insert(&vlv.sort_key(entry), id)?;
            }
        }
        IndexType::Attribute { kinds } => {
            let name = descriptor.name.as_str();
            if entry.is_tombstone() {
                if !TOMBSTONE_INDEXES.contains(&name) {
                    return Ok(());
                }
                if name == ATTR_OBJECTCLASS {
                    // Only the marker; searches for live classes must miss tombstones
                    if kinds.contains(&IndexKind::Eq) {
                        index.add_values(&[IndexKind::Eq], &[TOMBSTONE_OBJECTCLASS.to_string()], id)?;
                    }
                    return Ok(());
                }
            }
            if job.flags().upgrading_dn() {
                let stale = stale_values(entry, name);
                if !stale.is_empty() {
                    trace!(id, index = %name, values = stale.len(), "retracting stale keys");
                    index.remove_values(kinds, &stale, id)?;
                }
            }
            let values = live_values(entry, name);
            if !values.is_empty() {
                index.add_values(kinds, &values, id)?;
            }
        }
    }
    Ok(())
}

/// Worker thread body for one index.
pub fn run(job: &ImportJob, info: &ThreadInfo, descriptor: &IndexDescriptor) -> Result<()> {
    let mut index = open_index(job, descriptor)?;
    let mut id = info.first_id();
    debug!(index = %descriptor.name, first_id = id, "worker starting");

    loop {
        if !job.honor_command(info)? {
            break;
        }
        if id > job.ready_id() {
            info.set_state(ThreadState::Waiting);
            std::thread::sleep(job.poll_interval());
            continue;
        }
        info.set_state(ThreadState::Running);

        if let Some(fetched) = job.fifo.fetch(id) {
            let indexed = index_entry(job, descriptor, &mut index, &fetched.entry);
            job.fifo.release(id);
            indexed?;
        }
        info.set_last_id(id);
        id += 1;
    }

    index.flush()?;
    debug!(index = %descriptor.name, last_id = info.last_id(), "worker stopped");
    Ok(())
}
