//! Online bulk import: an external feeder pushes entries one at a time.
//!
//! There is no producer thread. [`BulkImport::start`] runs the pipeline in
//! the background and returns once it is ready for entries; every
//! [`BulkImport::queue`] call publishes one entry under the feeder mutex.
//! The `import --online` command drives it from LDIF inputs through
//! [`BulkImport::feed_ldif`].

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::fifo::Source;
use super::producer::{input_name, open_input, publish_entry};
use super::{ImportJob, JobOptions, Outcome};
use crate::config::BackendConfig;
use crate::entry::ldif::{LdifReader, ParseOptions, parse_entry};
use crate::entry::{ATTR_UNIQUEID, Entry, dn};
use crate::error::{ImportError, Result};
use crate::store::InstanceLock;

/// One-shot "pipeline ready" signal.
#[derive(Debug, Default)]
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub fn open(&self) {
        let mut open = self.open.lock().unwrap_or_else(|p| p.into_inner());
        *open = true;
        self.cond.notify_all();
    }

    /// Block until the gate opens, re-checking `abort` every `poll`.
    pub fn wait(&self, abort: &AtomicBool, poll: Duration) -> Result<()> {
        let mut open = self.open.lock().unwrap_or_else(|p| p.into_inner());
        while !*open {
            if abort.load(Ordering::SeqCst) {
                return Err(ImportError::Aborted);
            }
            open = match self.cond.wait_timeout(open, poll) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        if abort.load(Ordering::SeqCst) {
            return Err(ImportError::Aborted);
        }
        Ok(())
    }
}

/// A running online import.
pub struct BulkImport {
    job: Arc<ImportJob>,
    /// Next entry id; also serializes feeders.
    next_id: Mutex<u64>,
    pipeline: Option<JoinHandle<Result<Outcome>>>,
    _lock: InstanceLock,
}

impl BulkImport {
    /// Claim and reset the instance, start the pipeline and wait until it is ready.
    pub fn start(config: BackendConfig, db_dir: &Path, mut options: JobOptions) -> Result<Self> {
        options.flags.use_files = false;
        options.flags.online = true;
        let job = Arc::new(ImportJob::new(config, db_dir, options)?);
        let lock = job.instance.lock()?;
        job.instance.reset()?;
        info!(instance = %job.instance.name(), "Bulk import: starting");

        let runner = Arc::clone(&job);
        let pipeline = std::thread::Builder::new()
            .name("bulk-import".to_string())
            .spawn(move || super::run(&runner))
            .map_err(|e| ImportError::ThreadSpawn("bulk-import".to_string(), e))?;

        if let Err(e) = job.wire_gate.wait(job.abort_flag(), job.poll_interval()) {
            // The pipeline's own error explains the abort better
            return match pipeline.join() {
                Ok(Err(inner)) => Err(inner),
                _ => Err(e),
            };
        }
        info!("Bulk import: ready for entries");
        Ok(Self {
            next_id: Mutex::new(job.starting_id),
            job,
            pipeline: Some(pipeline),
            _lock: lock,
        })
    }

    pub fn job(&self) -> &ImportJob {
        &self.job
    }

    /// A handle on the job for callers that outlive a borrow, such as a
    /// signal handler.
    pub fn shared_job(&self) -> Arc<ImportJob> {
        Arc::clone(&self.job)
    }

    /// Publish one entry, blocking while the fifo is full.
    pub fn queue(&self, mut entry: Entry) -> Result<()> {
        if self.job.is_aborted() {
            return Err(ImportError::Aborted);
        }
        let mut next_id = self.next_id.lock().unwrap_or_else(|p| p.into_inner());
        entry.detect_tombstone();
        if !entry.has(ATTR_UNIQUEID)
            && let Some(uniqueid) = self.job.uniqueid.generate(&entry.ndn())?
        {
            entry.add_value(ATTR_UNIQUEID, uniqueid);
        }
        fix_tombstone_rdn(&mut entry);

        let size = entry.size();
        let entry_dn = entry.dn().to_string();
        if !self.job.fifo.grow_if_needed(size) {
            return Err(ImportError::EntryTooLarge { dn: entry_dn, size });
        }
        let id = *next_id;
        entry.set_id(id);
        let source = Source {
            file: Arc::from("bulk import"),
            line: id as usize,
        };
        if !publish_entry(&self.job, id, entry, source)? {
            return Err(ImportError::EntryTooLarge { dn: entry_dn, size });
        }
        *next_id += 1;
        debug!(id, "queued entry");
        Ok(())
    }

    /// Queue every entry of an LDIF input (`-` is standard input).
    ///
    /// Records that do not parse are skipped and counted as bad entries.
    /// Returns how many entries were queued.
    pub fn feed_ldif(&self, path: &Path) -> Result<u64> {
        let name = input_name(path);
        info!(file = %name, "Bulk import: feeding \"{}\"", name);
        let options = &self.job.options;
        let mut queued = 0;
        for record in LdifReader::new(open_input(path)?) {
            let record = record?;
            let parse = ParseOptions {
                allow_rdn_header: false,
                remove_duplicate_values: options.remove_duplicate_values,
                expand_objectclasses: options.expand_objectclasses,
                add_rdn_values: options.add_rdn_values,
                big_entry: record.is_big(),
            };
            match parse_entry(&record.text, parse) {
                Ok((_, entry)) => {
                    self.queue(entry)?;
                    queued += 1;
                }
                Err(e) => {
                    warn!(
                        "Skipping bad LDIF entry ending at line {} of file \"{}\": {}",
                        record.line + record.line_count.saturating_sub(1),
                        name,
                        e
                    );
                    self.job.counters.skip();
                }
            }
        }
        Ok(queued)
    }

    /// Tell the pipeline no more entries are coming and wait for it to finish.
    pub fn done(mut self) -> Result<Outcome> {
        self.job.set_producer_done();
        info!("Bulk import: feeder done");
        self.join()
    }

    /// Abort the import and wait for the pipeline to unwind.
    pub fn abort(mut self) -> Result<Outcome> {
        self.job.abort();
        self.join()
    }

    /// Abort after the feeder failed with `cause`. The pipeline's own error
    /// wins when a thread failed first.
    pub fn abort_with(self, cause: ImportError) -> ImportError {
        match self.abort() {
            Err(ImportError::Aborted) | Ok(_) => cause,
            Err(pipeline) => pipeline,
        }
    }

    fn join(&mut self) -> Result<Outcome> {
        match self.pipeline.take() {
            Some(handle) => handle.join().unwrap_or(Err(ImportError::Aborted)),
            None => Err(ImportError::Aborted),
        }
    }
}

impl Drop for BulkImport {
    fn drop(&mut self) {
        if self.pipeline.is_some() {
            self.job.abort();
            let _ = self.join();
        }
    }
}

/// A tombstone's DN must start with its `nsuniqueid=` RDN.
fn fix_tombstone_rdn(entry: &mut Entry) {
    if !entry.is_tombstone() {
        return;
    }
    let Some(uniqueid) = entry.unique_id().map(str::to_string) else {
        return;
    };
    let leads_with_id = dn::rdn(entry.dn())
        .is_some_and(|rdn| rdn.to_lowercase().starts_with("nsuniqueid="));
    if !leads_with_id {
        let fixed = format!("nsuniqueid={},{}", uniqueid, entry.dn());
        debug!(from = %entry.dn(), to = %fixed, "tombstone RDN fixed");
        entry.set_dn(fixed);
    }
}
