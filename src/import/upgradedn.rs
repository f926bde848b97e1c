//! The DN-format upgrade producer.
//!
//! Stored DNs written before RFC 4514 may carry quoted or backslash-escaped
//! RDN values, and older normalizers kept runs of spaces that the current
//! one collapses. A dry run only reports what a real run would change; the
//! spaces variant also writes every RDN with spaces to a side file. A real
//! run rewrites the affected values in place, moving the old ones to the
//! entry's deleted list so the workers retract their stale keys.
//!
//! Two entries whose DNs differ only in spacing collide once normalized.
//! The side file resolves that: after the candidate lines (`<dn>:<id>`) it
//! carries one line per collision, `<primary-id>:<conflict-id> ...`. The
//! primary keeps its RDN, every other id is renamed to `<rdn> <id>`.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::fifo::Source;
use super::producer::publish_entry;
use super::reindex::{Flow, scan_store};
use super::thread::{ThreadInfo, ThreadState};
use super::{DnUpgradeNeed, ImportJob};
use crate::entry::ldif::add_rdn_values;
use crate::entry::{ATTR_ENTRYDN, ATTR_ENTRYRDN, Entry, dn};
use crate::error::Result;
use crate::store::{self, id2entry::Id2Entry};

const DEFAULT_SIDE_DIR: &str = "/var/tmp";

/// Where the space-normalization side file lives.
pub fn side_file_path(job: &ImportJob) -> PathBuf {
    let dir = job
        .config
        .ldif_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SIDE_DIR));
    dir.join(format!("{}_dn_norm_sp.txt", job.instance.name()))
}

/// Conflict resolution read back from the side file.
#[derive(Debug, Default)]
pub struct Conflicts {
    primary_of: HashMap<u64, u64>,
}

impl Conflicts {
    /// Parse `<primary>:<id> <id> ...` lines; anything else is ignored.
    pub fn parse(reader: impl BufRead) -> std::io::Result<Self> {
        let mut primary_of = HashMap::new();
        for line in reader.lines() {
            let line = line?;
            if !line.starts_with(|c: char| c.is_ascii_digit()) {
                continue;
            }
            let Some((head, rest)) = line.split_once(':') else {
                continue;
            };
            let Ok(primary) = head.trim().parse::<u64>() else {
                continue;
            };
            primary_of.insert(primary, primary);
            for id in rest.split_whitespace().filter_map(|s| s.parse::<u64>().ok()) {
                primary_of.insert(id, primary);
            }
        }
        Ok(Self { primary_of })
    }

    /// Load the side file; a missing file means no conflicts.
    pub fn load(path: &Path) -> Result<Self> {
        match File::open(path) {
            Ok(file) => {
                let conflicts = Self::parse(BufReader::new(file))?;
                info!(
                    path = %path.display(),
                    ids = conflicts.primary_of.len(),
                    "Loaded DN conflict list"
                );
                Ok(conflicts)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No DN conflict list found");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn primary_of(&self, id: u64) -> Option<u64> {
        self.primary_of.get(&id).copied()
    }
}

/// Whether rewriting `rdn` into RFC 4514 form changes it.
fn rdn_needs_upgrade(rdn: &str) -> bool {
    dn::explode_rdn(rdn).iter().any(|ava| {
        dn::split_ava(ava).is_some_and(|(_, value)| dn::value_needs_rfc4514_upgrade(value))
    }) && dn::upgrade_rdn(rdn) != rdn
}

fn dn_needs_upgrade(value: &str) -> bool {
    dn::explode(value).iter().any(|rdn| rdn_needs_upgrade(rdn))
}

fn upgrade_dn(value: &str) -> String {
    dn::explode(value)
        .iter()
        .map(|rdn| {
            if rdn_needs_upgrade(rdn) {
                dn::upgrade_rdn(rdn)
            } else {
                rdn.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// What one entry needs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Findings {
    rfc4514: bool,
    spaces: bool,
}

/// Give the entry a new leftmost RDN, remembering the old DN index values.
fn rename(entry: &mut Entry, old_rdn: &str, new_rdn: &str) {
    let old_dn = entry.dn().to_string();
    entry.push_deleted(ATTR_ENTRYRDN, vec![old_rdn.to_string()]);
    entry.push_deleted(ATTR_ENTRYDN, vec![old_dn.clone()]);
    let new_dn = match dn::parent(&old_dn) {
        Some(parent) => format!("{},{}", new_rdn, parent),
        None => new_rdn.to_string(),
    };
    entry.set_dn(new_dn);
    add_rdn_values(entry);
}

/// Rewrite legacy values of DN-syntax attributes. Returns whether any was found.
fn upgrade_dn_values(job: &ImportJob, entry: &mut Entry, rewrite: bool) -> bool {
    let names: Vec<String> = entry
        .attrs()
        .iter()
        .filter(|a| job.schema.is_dn_syntax(&a.name))
        .filter(|a| a.values.iter().any(|v| dn_needs_upgrade(v)))
        .map(|a| a.name.clone())
        .collect();
    if !rewrite {
        return !names.is_empty();
    }
    for name in &names {
        let old: Vec<String> = entry.values(name).to_vec();
        let stale: Vec<String> = old.iter().filter(|v| dn_needs_upgrade(v)).cloned().collect();
        let new = old
            .iter()
            .map(|v| if dn_needs_upgrade(v) { upgrade_dn(v) } else { v.clone() })
            .collect();
        entry.push_deleted(name, stale);
        entry.replace(name, new);
    }
    !names.is_empty()
}

/// Producer thread body for the DN-format upgrade.
pub fn run(job: &ImportJob, info: &ThreadInfo) -> Result<()> {
    info.set_state(ThreadState::Running);
    let flags = job.flags();
    let dry_run = flags.dry_run;
    let check_rfc4514 = flags.upgrade_dn_format;
    let check_spaces = flags.upgrade_dn_format_spaces;
    let primary = Id2Entry::open(&job.instance.path_for(store::ID2ENTRY))?;
    let side_path = side_file_path(job);

    let mut side = if dry_run && check_spaces {
        if let Some(dir) = side_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        info!(path = %side_path.display(), "Writing DN space candidates");
        Some(BufWriter::new(File::create(&side_path)?))
    } else {
        None
    };
    let conflicts = if !dry_run && check_spaces {
        Conflicts::load(&side_path)?
    } else {
        Conflicts::default()
    };

    let file: Arc<str> = Arc::from(store::ID2ENTRY);
    let mut found = Findings::default();
    let mut quit = false;

    scan_store(job, info, &primary, |stored, full_dn| {
        let id = stored.id;
        let mut entry = stored.entry;
        entry.set_dn(full_dn);
        entry.set_id(id);

        let Some(rdn) = dn::rdn(entry.dn()) else {
            warn!(id, "Skipping an entry with an empty DN");
            job.counters.skip();
            return Ok(Flow::Continue);
        };
        if dn::split_ava(&rdn).is_none() {
            warn!(id, dn = %entry.dn(), "Skipping an entry with corrupted RDN \"{}\"", rdn);
            job.counters.skip();
            return Ok(Flow::Continue);
        }

        let mut current_rdn = rdn.clone();
        if check_rfc4514 {
            if rdn_needs_upgrade(&current_rdn) {
                found.rfc4514 = true;
            }
            if !dry_run && dn_needs_upgrade(entry.dn()) {
                // Ancestors are rewritten too, so the parent lookup matches
                let old_dn = entry.dn().to_string();
                entry.push_deleted(ATTR_ENTRYRDN, vec![current_rdn.clone()]);
                entry.push_deleted(ATTR_ENTRYDN, vec![old_dn.clone()]);
                entry.set_dn(upgrade_dn(&old_dn));
                add_rdn_values(&mut entry);
                current_rdn = dn::rdn(entry.dn()).unwrap_or(current_rdn);
            }
            if upgrade_dn_values(job, &mut entry, !dry_run) {
                found.rfc4514 = true;
            }
            if dry_run && found.rfc4514 && !check_spaces {
                info!(id, dn = %entry.dn(), "Found a DN in the pre-RFC 4514 form");
                job.note_dn_upgrade(DnUpgradeNeed::Rfc4514);
                quit = true;
                return Ok(Flow::Stop);
            }
        }

        if check_spaces {
            let run = dn::max_space_run(&current_rdn);
            if run > 0 {
                if let Some(side) = side.as_mut() {
                    writeln!(side, "{}:{}", entry.dn(), id)?;
                }
                if run > 1 {
                    found.spaces = true;
                }
                if let Some(primary_id) = conflicts.primary_of(id) {
                    if primary_id != id {
                        let renamed = format!("{} {}", current_rdn, id);
                        info!(
                            id,
                            "Entry {} ({}) is a conflict of ({})",
                            entry.dn(),
                            id,
                            primary_id
                        );
                        info!(id, "Renaming \"{}\" to \"{}\"", current_rdn, renamed);
                        rename(&mut entry, &current_rdn, &renamed);
                    } else {
                        let unchanged = current_rdn.clone();
                        rename(&mut entry, &current_rdn, &unchanged);
                    }
                } else if run > 1 && !dry_run {
                    // Re-key under the collapsed normalization
                    let unchanged = current_rdn.clone();
                    rename(&mut entry, &current_rdn, &unchanged);
                }
            }
        }

        if dry_run {
            return Ok(Flow::Continue);
        }
        let source = Source {
            file: Arc::clone(&file),
            line: id as usize,
        };
        let seq = job.lead_id() + 1;
        if !publish_entry(job, seq, entry, source)? {
            debug!(id, "upgraded entry did not fit in the fifo");
        }
        Ok(Flow::Continue)
    })?;

    if let Some(mut side) = side.take() {
        side.flush()?;
    }
    if dry_run {
        if found.rfc4514 {
            job.note_dn_upgrade(DnUpgradeNeed::Rfc4514);
        }
        if found.spaces {
            job.note_dn_upgrade(DnUpgradeNeed::Spaces);
        }
        if quit || found.rfc4514 || found.spaces {
            info.set_state(ThreadState::Quit);
        }
    }
    Ok(())
}

/// Append one collision line per group of candidates whose DNs normalize alike.
///
/// The lowest id of a group is its primary.
pub fn finish_side_file(job: &ImportJob) -> Result<()> {
    let path = side_file_path(job);
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let mut groups: BTreeMap<String, Vec<u64>> = BTreeMap::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let Some((dn_text, id)) = line.rsplit_once(':') else {
            continue;
        };
        let Ok(id) = id.trim().parse::<u64>() else {
            continue;
        };
        // Collision lines start with a bare id and have no '=' before the colon
        if !dn_text.contains('=') {
            continue;
        }
        groups.entry(dn::normalize(dn_text)).or_default().push(id);
    }

    let mut collisions = 0;
    let mut out = BufWriter::new(OpenOptions::new().append(true).open(&path)?);
    for ids in groups.values_mut().filter(|ids| ids.len() > 1) {
        ids.sort_unstable();
        ids.dedup();
        if ids.len() < 2 {
            continue;
        }
        let rest: Vec<String> = ids[1..].iter().map(u64::to_string).collect();
        writeln!(out, "{}:{}", ids[0], rest.join(" "))?;
        collisions += 1;
    }
    out.flush()?;
    info!(
        path = %path.display(),
        collisions,
        "DN space candidates written to \"{}\"",
        path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::entry::ATTR_PARENTID;
    use crate::import::JobOptions;
    use crate::import::thread::ThreadKind;
    use tempfile::tempdir;

    #[test]
    fn test_conflicts_parse_skips_candidates() {
        let text = "cn=a  b,dc=example,dc=com:3\n3:7 9\nnot a line\n12:\n";
        let conflicts = Conflicts::parse(text.as_bytes()).unwrap();
        assert_eq!(conflicts.primary_of(3), Some(3));
        assert_eq!(conflicts.primary_of(7), Some(3));
        assert_eq!(conflicts.primary_of(9), Some(3));
        assert_eq!(conflicts.primary_of(12), Some(12));
        assert_eq!(conflicts.primary_of(4), None);
    }

    #[test]
    fn test_rfc4514_detection() {
        assert!(rdn_needs_upgrade("cn=\"Smith, John\""));
        assert!(rdn_needs_upgrade("cn=Smith\\2C John"));
        assert!(!rdn_needs_upgrade("cn=Smith\\, John"));
        assert!(!rdn_needs_upgrade("cn=plain"));
        assert_eq!(
            upgrade_dn("cn=\"a,b\",ou=x,dc=example,dc=com"),
            "cn=a\\,b,ou=x,dc=example,dc=com"
        );
    }

    fn job_for(options: JobOptions, dir: &std::path::Path) -> ImportJob {
        let config = BackendConfig {
            ldif_dir: Some(dir.join("ldif")),
            ..BackendConfig::default()
        };
        ImportJob::new(config, dir, options).unwrap()
    }

    fn store(job: &ImportJob, rows: &[(u64, &str, Option<u64>)]) {
        job.instance.ensure().unwrap();
        let mut primary = Id2Entry::open(&job.instance.path_for(store::ID2ENTRY)).unwrap();
        for (id, dn_text, parent) in rows {
            let mut e = Entry::new(*dn_text);
            e.add_value("objectclass", "top");
            if let Some(p) = parent {
                e.add_value(ATTR_PARENTID, p.to_string());
            }
            primary.upsert(*id, &e, None).unwrap();
        }
        primary.flush().unwrap();
    }

    #[test]
    fn test_dry_run_stops_at_first_legacy_dn() {
        let dir = tempdir().unwrap();
        let mut options = JobOptions::default();
        options.flags.upgrade_dn_format = true;
        options.flags.dry_run = true;
        let job = job_for(options, dir.path());
        store(
            &job,
            &[
                (1, "dc=example,dc=com", None),
                (2, "cn=\"a,b\",dc=example,dc=com", Some(1)),
            ],
        );
        let info = ThreadInfo::new("Producer", ThreadKind::Producer, 1);
        run(&job, &info).unwrap();
        assert_eq!(info.state(), ThreadState::Quit);
        assert_eq!(job.dn_upgrade_need(), Some(DnUpgradeNeed::Rfc4514));
        assert_eq!(job.lead_id(), 0);
    }

    #[test]
    fn test_spaces_dry_run_writes_side_file_and_collisions() {
        let dir = tempdir().unwrap();
        let mut options = JobOptions::default();
        options.flags.upgrade_dn_format_spaces = true;
        options.flags.dry_run = true;
        let job = job_for(options, dir.path());
        store(
            &job,
            &[
                (1, "dc=example,dc=com", None),
                (2, "cn=a  b,dc=example,dc=com", Some(1)),
                (3, "cn=a b,dc=example,dc=com", Some(1)),
                (4, "cn=c,dc=example,dc=com", Some(1)),
            ],
        );
        let info = ThreadInfo::new("Producer", ThreadKind::Producer, 1);
        run(&job, &info).unwrap();
        assert_eq!(job.dn_upgrade_need(), Some(DnUpgradeNeed::Spaces));

        finish_side_file(&job).unwrap();
        let text = std::fs::read_to_string(side_file_path(&job)).unwrap();
        assert_eq!(
            text,
            "cn=a  b,dc=example,dc=com:2\ncn=a b,dc=example,dc=com:3\n2:3\n"
        );
    }

    #[test]
    fn test_real_run_renames_conflicts() {
        let dir = tempdir().unwrap();
        let mut options = JobOptions::default();
        options.flags.upgrade_dn_format_spaces = true;
        let job = job_for(options, dir.path());
        store(
            &job,
            &[
                (1, "dc=example,dc=com", None),
                (2, "cn=a  b,dc=example,dc=com", Some(1)),
                (3, "cn=a b,dc=example,dc=com", Some(1)),
            ],
        );
        let side = side_file_path(&job);
        std::fs::create_dir_all(side.parent().unwrap()).unwrap();
        std::fs::write(&side, "2:3\n").unwrap();

        let info = ThreadInfo::new("Producer", ThreadKind::Producer, 1);
        run(&job, &info).unwrap();
        assert_eq!(job.lead_id(), 3);
        let (kept, _) = job.fifo.take(2).unwrap();
        assert_eq!(kept.dn(), "cn=a  b,dc=example,dc=com");
        assert_eq!(kept.deleted_values(ATTR_ENTRYRDN), &["cn=a  b".to_string()]);
        let (renamed, _) = job.fifo.take(3).unwrap();
        assert_eq!(renamed.dn(), "cn=a b 3,dc=example,dc=com");
        assert_eq!(renamed.id(), 3);
        assert!(renamed.has_value("cn", "a b 3"));
    }
}
