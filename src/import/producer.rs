//! The LDIF producer: reads the input files and publishes entries into the fifo.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use super::ImportJob;
use super::fifo::{RetryLater, Source};
use super::prepare::{Disposition, prepare_entry};
use super::thread::{ThreadInfo, ThreadState};
use crate::entry::Entry;
use crate::entry::ldif::{LdifReader, ParseOptions, parse_entry, starts_with_dn};
use crate::error::{ImportError, Result};

/// Display name of an input; `-` is standard input.
pub(super) fn input_name(path: &Path) -> Arc<str> {
    if path.as_os_str() == "-" {
        Arc::from("stdin")
    } else {
        Arc::from(path.display().to_string())
    }
}

pub(super) fn open_input(path: &Path) -> Result<Box<dyn BufRead>> {
    if path.as_os_str() == "-" {
        Ok(Box::new(BufReader::new(std::io::stdin())))
    } else {
        Ok(Box::new(BufReader::new(File::open(path)?)))
    }
}

/// Producer thread body for LDIF imports.
pub fn run(job: &ImportJob, info: &ThreadInfo) -> Result<()> {
    info.set_state(ThreadState::Running);
    let options = &job.options;
    for path in &options.input_files {
        let name = input_name(path);
        info!(file = %name, "Processing file \"{}\"", name);
        let mut reader = LdifReader::new(open_input(path)?);
        let mut published = 0u64;

        for record in &mut reader {
            if !job.honor_command(info)? {
                info!(file = %name, "Producer stopped before the end of \"{}\"", name);
                return Ok(());
            }
            info.set_state(ThreadState::Running);
            let record = record?;
            let source = Source {
                file: Arc::clone(&name),
                line: record.line + record.line_count.saturating_sub(1),
            };

            if job.config.entryrdn && !starts_with_dn(&record.text) {
                warn!(
                    "Skipping entry ending at line {} of file \"{}\": not starting with \"dn: \"",
                    source.line, name
                );
                job.counters.skip();
                continue;
            }

            let parse = ParseOptions {
                allow_rdn_header: false,
                remove_duplicate_values: options.remove_duplicate_values,
                expand_objectclasses: options.expand_objectclasses,
                add_rdn_values: options.add_rdn_values,
                big_entry: record.is_big(),
            };
            let mut entry = match parse_entry(&record.text, parse) {
                Ok((_, entry)) => entry,
                Err(e) => {
                    warn!(
                        "Skipping bad LDIF entry ending at line {} of file \"{}\": {}",
                        source.line, name, e
                    );
                    job.counters.skip();
                    continue;
                }
            };

            if prepare_entry(job, &mut entry, &source)? != Disposition::Publish {
                continue;
            }
            let id = job.lead_id() + 1;
            entry.set_id(id);
            if publish_entry(job, id, entry, source)? {
                published += 1;
            }
        }

        if let Some(version) = reader.version() {
            debug!(file = %name, version, "LDIF version");
        }
        job.counters.files_processed.fetch_add(1, Ordering::SeqCst);
        info!(
            file = %name,
            entries = published,
            "Finished scanning file \"{}\" ({} entries)",
            name,
            published
        );
    }
    Ok(())
}

/// Publish an entry under sequence id `id`, blocking for a free slot and
/// for byte capacity. The entry keeps whatever entry id it carries.
///
/// Returns `false` when the entry cannot fit in the fifo even after growing
/// it; the entry is skipped and `id` stays free.
pub fn publish_entry(job: &ImportJob, id: u64, entry: Entry, source: Source) -> Result<bool> {
    let size = entry.size();
    if !job.fifo.grow_if_needed(size) {
        warn!(
            "Skipping entry \"{}\" ending at line {} of file \"{}\": {} bytes do not fit in the import cache",
            entry.dn(),
            source.line,
            source.file,
            size
        );
        job.counters.skip();
        return Ok(false);
    }

    let abort = job.abort_flag();
    let (mut entry, mut source) = (entry, source);
    loop {
        job.fifo
            .wait_for_slot(id, &job.ready_id, abort)
            .map_err(|_| ImportError::Aborted)?;
        job.fifo
            .wait_for_capacity(size, &job.ready_id, abort)
            .map_err(|_| ImportError::Aborted)?;
        match job.fifo.publish(id, entry, source) {
            Ok(()) => break,
            Err(RetryLater { entry: e, source: s }) => {
                entry = e;
                source = s;
                job.nap()?;
            }
        }
    }
    job.lead_id.store(id, Ordering::SeqCst);
    Ok(true)
}
