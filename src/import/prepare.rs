//! Per-entry policy applied by the producer before an entry is published.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use super::ImportJob;
use super::fifo::Source;
use crate::config::PasswordScheme;
use crate::entry::{ATTR_OBJECTCLASS, ATTR_TOMBSTONE_CSN, ATTR_UNIQUEID, Entry, dn};
use crate::error::Result;

const ATTR_USERPASSWORD: &str = "userpassword";
const ATTR_ENTRYUSN: &str = "entryusn";
const CSN_SUBTYPE: &str = "vucsn-";
const SALT_LEN: usize = 8;

/// Whether the producer publishes or drops an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Publish,
    /// Counted as not belonging to this backend.
    NotHere,
    /// Outside the include/exclude lists; not counted.
    Filtered,
    /// Counted as a bad entry.
    Rejected,
}

/// Run every producer-side check and enrichment on a parsed entry.
///
/// Only unique-id generation failures are errors; everything else decides
/// a [`Disposition`] and updates the job counters.
pub fn prepare_entry(job: &ImportJob, entry: &mut Entry, source: &Source) -> Result<Disposition> {
    let ndn = entry.ndn();

    if !job.belongs(&ndn) {
        debug!(
            dn = %entry.dn(),
            "Skipping entry \"{}\" which does not belong to this backend",
            entry.dn()
        );
        job.counters.not_here.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        return Ok(Disposition::NotHere);
    }

    if !in_scope(job, &ndn) {
        return Ok(Disposition::Filtered);
    }

    if let Err(violation) = job.schema.check_entry(entry) {
        warn!(
            "Skipping entry \"{}\" which violates schema, ending line {} of file \"{}\": {}",
            entry.dn(),
            source.line,
            source.file,
            violation
        );
        job.counters.skip();
        return Ok(Disposition::Rejected);
    }

    if let Err(violation) = check_syntax(job, entry) {
        warn!(
            "Skipping entry \"{}\" which violates attribute syntax, ending line {} of file \"{}\": {}",
            entry.dn(),
            source.line,
            source.file,
            violation
        );
        job.counters.skip();
        return Ok(Disposition::Rejected);
    }

    if !entry.has(ATTR_UNIQUEID)
        && let Some(id) = job.uniqueid.generate(&ndn)?
    {
        entry.add_value(ATTR_UNIQUEID, id);
    }

    if job.config.lastmod {
        add_lastmod(entry);
    }

    if entry.is_tombstone() && !entry.has(ATTR_TOMBSTONE_CSN) {
        match tombstone_csn(entry) {
            Some(csn) => entry.add_value(ATTR_TOMBSTONE_CSN, csn),
            None => debug!(dn = %entry.dn(), "tombstone carries no deletion CSN"),
        }
    }

    if job.config.password_scheme == PasswordScheme::Ssha256 {
        encode_passwords(entry);
    }

    if job.config.entryusn && !entry.has(ATTR_ENTRYUSN) {
        entry.add_value(ATTR_ENTRYUSN, "0");
    }
    Ok(Disposition::Publish)
}

/// Include/exclude subtree filtering.
fn in_scope(job: &ImportJob, ndn: &str) -> bool {
    let within = |list: &[String]| list.iter().any(|base| dn::is_within(ndn, &dn::normalize(base)));
    let options = &job.options;
    if !options.include_suffixes.is_empty() && !within(&options.include_suffixes) {
        return false;
    }
    !within(&options.exclude_suffixes)
}

/// Syntax check; attributes stored encrypted are validated on a separate copy.
fn check_syntax(job: &ImportJob, entry: &Entry) -> std::result::Result<(), crate::schema::Violation> {
    if !job.flags().encrypt || job.config.encrypted_attributes.is_empty() {
        return job.schema.check_syntax(entry, &[]);
    }
    let encrypted = &job.config.encrypted_attributes;
    job.schema.check_syntax(entry, encrypted)?;
    let mut copy = Entry::new(entry.dn());
    for attr in entry.attrs() {
        if job.config.is_encrypted(&attr.base_type()) {
            for value in &attr.values {
                copy.add_value(&attr.name, value.clone());
            }
        }
    }
    job.schema.check_syntax(&copy, &[])
}

fn add_lastmod(entry: &mut Entry) {
    let now = chrono::Utc::now().format("%Y%m%d%H%M%SZ").to_string();
    for name in ["creatorsName", "modifiersName"] {
        if !entry.has(name) {
            entry.add_value(name, "");
        }
    }
    for name in ["createTimestamp", "modifyTimestamp"] {
        if !entry.has(name) {
            entry.add_value(name, now.clone());
        }
    }
}

/// The deletion CSN recorded as an `objectclass;vucsn-<csn>` subtype.
fn tombstone_csn(entry: &Entry) -> Option<String> {
    entry
        .find_all(ATTR_OBJECTCLASS)
        .filter(|a| {
            a.values
                .iter()
                .any(|v| v.eq_ignore_ascii_case(crate::entry::TOMBSTONE_OBJECTCLASS))
        })
        .find_map(|a| {
            a.name.split(';').find_map(|option| {
                let lower = option.to_lowercase();
                lower
                    .strip_prefix(CSN_SUBTYPE)
                    .map(|_| option[CSN_SUBTYPE.len()..].to_string())
            })
        })
}

fn has_scheme(value: &str) -> bool {
    value.starts_with('{') && value[1..].contains('}')
}

/// Salted SHA-256 in `{SSHA256}` form.
pub fn ssha256(password: &str, salt: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(salt);
    let mut digest = hasher.finalize().to_vec();
    digest.extend_from_slice(salt);
    format!("{{SSHA256}}{}", STANDARD.encode(digest))
}

fn encode_passwords(entry: &mut Entry) {
    let names: Vec<String> = entry
        .find_all(ATTR_USERPASSWORD)
        .map(|a| a.name.clone())
        .collect();
    for name in names {
        let values: Vec<String> = entry
            .values(&name)
            .iter()
            .map(|v| {
                if has_scheme(v) {
                    v.clone()
                } else {
                    let salt = Uuid::new_v4();
                    ssha256(v, &salt.as_bytes()[..SALT_LEN])
                }
            })
            .collect();
        entry.replace(&name, values);
    }
}
