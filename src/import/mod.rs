//! The bulk-import pipeline.
//!
//! A producer publishes entries into the [`EntryFifo`](fifo::EntryFifo) with
//! ascending sequence ids. The foreman claims them in order, maintains the
//! DN, parent and primary stores, then raises the ready watermark. One worker
//! per secondary index follows the watermark. The monitor supervises a pass
//! and the post-pass builders derive subordinate counts and ancestor ids once
//! the pipeline has drained.

pub mod ancestorid;
pub mod descriptor;
pub mod fifo;
pub mod foreman;
pub mod monitor;
pub mod prepare;
pub mod producer;
pub mod reindex;
pub mod subcount;
pub mod thread;
pub mod upgradedn;
pub mod vlv;
pub mod wire;
pub mod worker;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tracing::{error, info, instrument, warn};

use crate::config::BackendConfig;
use crate::entry::dn;
use crate::entry::uniqueid::{UniqueIdGenerator, UniqueIdPolicy};
use crate::error::{ImportError, Result};
use crate::schema::Schema;
use crate::store::id2entry::Id2Entry;
use crate::store::{self, Instance};
use descriptor::IndexDescriptor;
use fifo::EntryFifo;
use monitor::PassStatus;
use subcount::SubcountHints;
use thread::{Command, ThreadExit, ThreadInfo, ThreadKind};
use vlv::VlvDiscovery;

/// Mode switches of one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobFlags {
    /// A producer thread reads the input (files or the stored entries).
    pub use_files: bool,
    /// Entries are pushed by an external feeder.
    pub online: bool,
    pub reindexing: bool,
    /// Rewrite stored entries from the full-DN form into the RDN form.
    pub dn2rdn: bool,
    /// Build the attribute indexes.
    pub index_attrs: bool,
    pub dry_run: bool,
    /// Upgrade DN values to RFC 4514 escaping.
    pub upgrade_dn_format: bool,
    /// Normalize runs of spaces in RDN values.
    pub upgrade_dn_format_spaces: bool,
    pub encrypt: bool,
}

impl JobFlags {
    pub fn upgrading_dn(&self) -> bool {
        self.upgrade_dn_format || self.upgrade_dn_format_spaces
    }
}

/// Everything a job needs besides the backend configuration.
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub flags: JobFlags,
    /// LDIF inputs; `-` is standard input.
    pub input_files: Vec<PathBuf>,
    pub include_suffixes: Vec<String>,
    pub exclude_suffixes: Vec<String>,
    pub uniqueid: UniqueIdPolicy,
    pub uniqueid_namespace: Option<String>,
    pub remove_duplicate_values: bool,
    pub expand_objectclasses: bool,
    pub add_rdn_values: bool,
    /// End a pass after this many entries (0 lets the monitor decide).
    pub merge_chunk_size: u64,
    /// Indexes to rebuild when reindexing; empty means all of them.
    pub index_attrs: Vec<String>,
    pub show_progress: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            flags: JobFlags {
                use_files: true,
                index_attrs: true,
                ..JobFlags::default()
            },
            input_files: Vec::new(),
            include_suffixes: Vec::new(),
            exclude_suffixes: Vec::new(),
            uniqueid: UniqueIdPolicy::default(),
            uniqueid_namespace: None,
            remove_duplicate_values: false,
            expand_objectclasses: true,
            add_rdn_values: true,
            merge_chunk_size: 0,
            index_attrs: Vec::new(),
            show_progress: false,
        }
    }
}

/// Result of a DN-format dry run that found work to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnUpgradeNeed {
    Rfc4514,
    Spaces,
    Both,
}

impl DnUpgradeNeed {
    pub fn merge(self, other: DnUpgradeNeed) -> DnUpgradeNeed {
        if self == other { self } else { DnUpgradeNeed::Both }
    }

    /// Process exit code reported for this verdict.
    pub fn exit_code(&self) -> i32 {
        match self {
            DnUpgradeNeed::Rfc4514 => 2,
            DnUpgradeNeed::Spaces => 3,
            DnUpgradeNeed::Both => 4,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            DnUpgradeNeed::Rfc4514 => "DN values need the RFC 4514 upgrade",
            DnUpgradeNeed::Spaces => "DN values need space normalization",
            DnUpgradeNeed::Both => "DN values need the RFC 4514 upgrade and space normalization",
        }
    }
}

/// How a job ended without error.
#[derive(Debug, Clone)]
pub enum Outcome {
    Complete(Summary),
    NeedsDnUpgrade(DnUpgradeNeed),
}

/// Counts reported at the end of a job.
#[derive(Debug, Clone)]
pub struct Summary {
    pub op: &'static str,
    pub processed: u64,
    pub skipped: u64,
    pub not_here: u64,
    pub elapsed: Duration,
}

impl Summary {
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs();
        if secs == 0 {
            0.0
        } else {
            self.processed as f64 / secs as f64
        }
    }

    /// The final status line.
    pub fn message(&self) -> String {
        let mut skipped = Vec::new();
        if self.skipped > 0 {
            skipped.push(format!("{} bad entries were skipped", self.skipped));
        }
        if self.not_here > 0 {
            skipped.push(format!(
                "{} entries were skipped because they don't belong to this database",
                self.not_here
            ));
        }
        let detail = if skipped.is_empty() {
            String::new()
        } else {
            format!(" ({})", skipped.join(", "))
        };
        format!(
            "{} complete. Processed {} entries{} in {} seconds. ({:.2} entries/sec)",
            self.op,
            self.processed,
            detail,
            self.elapsed.as_secs(),
            self.rate()
        )
    }
}

/// Job-wide counters.
#[derive(Debug, Default)]
pub struct Counters {
    /// Entries rejected as malformed, invalid, duplicate or orphaned.
    pub skipped: AtomicU64,
    /// Published entries the foreman refused; a subset of `skipped`.
    pub rejected: AtomicU64,
    /// Entries outside the backend's suffixes.
    pub not_here: AtomicU64,
    pub files_processed: AtomicU64,
}

impl Counters {
    pub fn skip(&self) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
    }

    /// Count an entry that took a sequence id but was never committed.
    pub fn reject(&self) {
        self.rejected.fetch_add(1, Ordering::SeqCst);
        self.skip();
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::SeqCst)
    }

    pub fn not_here(&self) -> u64 {
        self.not_here.load(Ordering::SeqCst)
    }
}

/// Shared state of one import, reindex or DN-upgrade run.
pub struct ImportJob {
    pub config: BackendConfig,
    pub instance: Instance,
    pub options: JobOptions,
    pub schema: Schema,
    pub uniqueid: UniqueIdGenerator,
    pub fifo: EntryFifo,
    pub indexes: Vec<IndexDescriptor>,
    pub starting_id: u64,
    /// Last sequence id published by the producer.
    pub lead_id: AtomicU64,
    /// Last sequence id committed by the foreman.
    pub ready_id: AtomicU64,
    /// Entry id of the last committed entry.
    pub ready_entry_id: AtomicU64,
    /// Slowest worker's last processed id.
    pub trailing_id: AtomicU64,
    first_id: AtomicU64,
    abort: AtomicBool,
    producer_done: AtomicBool,
    total_pass: AtomicU32,
    pub counters: Counters,
    pub mothers: Mutex<SubcountHints>,
    pub vlv: VlvDiscovery,
    pub dn_upgrade: Mutex<Option<DnUpgradeNeed>>,
    pub wire_gate: wire::Gate,
    /// First fatal error a pipeline thread died with.
    failure: Mutex<Option<ImportError>>,
    normalized_suffixes: Vec<String>,
}

impl ImportJob {
    pub fn new(config: BackendConfig, db_dir: &Path, options: JobOptions) -> Result<Self> {
        config.validate()?;
        let instance = Instance::new(db_dir, &config.instance);
        let schema = Schema::new(&config.schema);
        let uniqueid =
            UniqueIdGenerator::new(options.uniqueid, options.uniqueid_namespace.as_deref())?;
        let capacity = fifo::capacity_for(config.cache_entries, config.cache_size);
        let fifo = EntryFifo::new(
            capacity,
            config.cache_size,
            config.memory.clone(),
            config.poll_interval(),
        );
        let indexes = descriptor::build(&config, &options, &schema)?;
        let vlv = VlvDiscovery::new(&indexes);
        let normalized_suffixes = config.suffixes.iter().map(|s| dn::normalize(s)).collect();
        let starting_id = 1;
        Ok(Self {
            config,
            instance,
            options,
            schema,
            uniqueid,
            fifo,
            indexes,
            starting_id,
            lead_id: AtomicU64::new(starting_id - 1),
            ready_id: AtomicU64::new(starting_id - 1),
            ready_entry_id: AtomicU64::new(0),
            trailing_id: AtomicU64::new(starting_id - 1),
            first_id: AtomicU64::new(starting_id),
            abort: AtomicBool::new(false),
            producer_done: AtomicBool::new(false),
            total_pass: AtomicU32::new(0),
            counters: Counters::default(),
            mothers: Mutex::new(SubcountHints::default()),
            vlv,
            dn_upgrade: Mutex::new(None),
            wire_gate: wire::Gate::default(),
            failure: Mutex::new(None),
            normalized_suffixes,
        })
    }

    pub fn flags(&self) -> JobFlags {
        self.options.flags
    }

    /// Operation name used in log lines.
    pub fn opstr(&self) -> &'static str {
        let flags = self.flags();
        if flags.upgrading_dn() {
            if flags.dry_run {
                "Upgrade Dn Dryrun"
            } else if flags.upgrade_dn_format && flags.upgrade_dn_format_spaces {
                "Upgrade Dn (Full)"
            } else if flags.upgrade_dn_format_spaces {
                "Upgrade Dn (Spaces)"
            } else {
                "Upgrade Dn (RFC 4514)"
            }
        } else if flags.reindexing {
            "Reindexing"
        } else {
            "Import"
        }
    }

    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
        self.wire_gate.open();
    }

    /// Keep a thread's fatal error, unless one is already kept, and abort.
    pub fn fail(&self, error: ImportError) {
        {
            let mut failure = self.failure.lock().unwrap_or_else(|p| p.into_inner());
            if failure.is_none() {
                *failure = Some(error);
            }
        }
        self.abort();
    }

    /// The error that aborted the job, if a thread failed.
    pub fn take_failure(&self) -> Option<ImportError> {
        self.failure.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// The abort flag, for the fifo's blocking waits.
    pub fn abort_flag(&self) -> &AtomicBool {
        &self.abort
    }

    pub fn poll_interval(&self) -> Duration {
        self.config.poll_interval()
    }

    pub fn first_id(&self) -> u64 {
        self.first_id.load(Ordering::SeqCst)
    }

    pub fn lead_id(&self) -> u64 {
        self.lead_id.load(Ordering::SeqCst)
    }

    pub fn ready_id(&self) -> u64 {
        self.ready_id.load(Ordering::SeqCst)
    }

    pub fn set_producer_done(&self) {
        self.producer_done.store(true, Ordering::SeqCst);
    }

    pub fn producer_done(&self) -> bool {
        self.producer_done.load(Ordering::SeqCst)
    }

    pub fn total_pass(&self) -> u32 {
        self.total_pass.load(Ordering::SeqCst)
    }

    /// Number of workers each committed entry is handed to.
    pub fn worker_count(&self) -> usize {
        self.indexes.len()
    }

    pub fn is_suffix(&self, ndn: &str) -> bool {
        self.normalized_suffixes.iter().any(|s| s == ndn)
    }

    /// Whether a normalized DN falls under one of the backend's suffixes.
    pub fn belongs(&self, ndn: &str) -> bool {
        self.normalized_suffixes.iter().any(|s| dn::is_within(ndn, s))
    }

    /// Record a DN-upgrade verdict from the dry-run producer.
    pub fn note_dn_upgrade(&self, need: DnUpgradeNeed) {
        let mut current = self.dn_upgrade.lock().unwrap_or_else(|p| p.into_inner());
        *current = Some(match *current {
            Some(prev) => prev.merge(need),
            None => need,
        });
    }

    pub fn dn_upgrade_need(&self) -> Option<DnUpgradeNeed> {
        *self.dn_upgrade.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Sleep one polling interval, failing when the job has been aborted.
    pub fn nap(&self) -> Result<()> {
        if self.is_aborted() {
            return Err(ImportError::Aborted);
        }
        std::thread::sleep(self.poll_interval());
        Ok(())
    }

    /// Block while a thread is paused. `Ok(false)` means it was told to stop.
    pub fn honor_command(&self, info: &ThreadInfo) -> Result<bool> {
        loop {
            if self.is_aborted() {
                return Err(ImportError::Aborted);
            }
            match info.command() {
                Command::Run => return Ok(true),
                Command::Stop => return Ok(false),
                Command::Abort => return Err(ImportError::Aborted),
                Command::Pause => {
                    info.set_state(thread::ThreadState::Waiting);
                    std::thread::sleep(self.poll_interval());
                }
            }
        }
    }

    /// Path of the rewritten primary store during a DN-to-RDN migration.
    pub fn rewrite_path(&self) -> PathBuf {
        self.instance.path_for(store::ID2ENTRY_REWRITE)
    }

    /// Path of the primary store the foreman writes to.
    pub fn primary_path(&self) -> PathBuf {
        if self.flags().dn2rdn {
            self.rewrite_path()
        } else {
            self.instance.path_for(store::ID2ENTRY)
        }
    }
}

/// Which producer feeds the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProducerKind {
    Ldif,
    Reindex,
    UpgradeDn,
    Wire,
}

fn producer_kind(flags: JobFlags) -> ProducerKind {
    if !flags.use_files {
        ProducerKind::Wire
    } else if flags.upgrading_dn() {
        ProducerKind::UpgradeDn
    } else if flags.reindexing {
        ProducerKind::Reindex
    } else {
        ProducerKind::Ldif
    }
}

/// Index files rebuilt from scratch by a job of this kind.
fn rebuilt_indexes(job: &ImportJob) -> Vec<String> {
    let mut names: Vec<String> = job.indexes.iter().map(|d| d.file_name()).collect();
    names.push(store::PARENTID.to_string());
    names.push(store::ANCESTORID.to_string());
    if job.config.entryrdn {
        if job.flags().dn2rdn {
            names.push(store::ENTRYRDN.to_string());
        }
    } else {
        names.push(store::ENTRYDN.to_string());
    }
    names
}

/// Get the instance directory ready before any thread starts.
fn prepare_instance(job: &ImportJob, kind: ProducerKind) -> Result<()> {
    match kind {
        ProducerKind::Ldif => job.instance.reset(),
        ProducerKind::Wire => job.instance.ensure(),
        ProducerKind::Reindex => {
            if !job.instance.exists() {
                return Err(ImportError::Config(format!(
                    "instance '{}' has no primary store to reindex",
                    job.instance.name()
                )));
            }
            for name in rebuilt_indexes(job) {
                job.instance.remove_index(&name)?;
            }
            if job.flags().dn2rdn {
                job.instance.remove_index(store::ID2ENTRY_REWRITE)?;
            }
            Ok(())
        }
        ProducerKind::UpgradeDn => {
            if !job.instance.exists() {
                return Err(ImportError::Config(format!(
                    "instance '{}' has no primary store to upgrade",
                    job.instance.name()
                )));
            }
            Ok(())
        }
    }
}

/// Flag or clear the offline marker of every index the job writes.
fn set_offline(job: &ImportJob, offline: bool) -> Result<()> {
    let mut primary = Id2Entry::open(&job.instance.path_for(store::ID2ENTRY))?;
    for name in rebuilt_indexes(job) {
        primary.set_index_offline(&name, offline)?;
    }
    Ok(())
}

fn spawn_producer(
    job: &Arc<ImportJob>,
    kind: ProducerKind,
    exits: &Sender<ThreadExit>,
) -> Result<Option<(Arc<ThreadInfo>, std::thread::JoinHandle<()>)>> {
    let body: fn(&ImportJob, &ThreadInfo) -> Result<()> = match kind {
        ProducerKind::Ldif => producer::run,
        ProducerKind::Reindex => reindex::run,
        ProducerKind::UpgradeDn => upgradedn::run,
        ProducerKind::Wire => return Ok(None),
    };
    let info = ThreadInfo::new("Producer", ThreadKind::Producer, job.first_id());
    let thread_job = Arc::clone(job);
    let fatal_job = Arc::clone(job);
    let handle = thread::spawn(
        Arc::clone(&info),
        exits.clone(),
        move |e| fatal_job.fail(e),
        move |info| body(&thread_job, info),
    )?;
    Ok(Some((info, handle)))
}

/// Stop the producer and wait for it to reach a terminal state.
fn stop_producer(producer: Option<(Arc<ThreadInfo>, std::thread::JoinHandle<()>)>) {
    if let Some((info, handle)) = producer {
        info!("Cleaning up producer thread...");
        info.set_command(Command::Stop);
        if handle.join().is_err() {
            error!("producer thread panicked");
        }
    }
}

/// Run a job to completion: every pass, then the post-pass builders.
///
/// The caller holds the instance lock. On failure the partially built
/// instance is removed, except for dry runs, space-only upgrades and jobs
/// that work on an existing primary store, which are left offline.
#[instrument(skip(job), fields(instance = %job.instance.name(), op = job.opstr()))]
pub fn run(job: &Arc<ImportJob>) -> Result<Outcome> {
    let started = Instant::now();
    let kind = producer_kind(job.flags());
    let result = run_passes(job, kind, started);
    if let Err(e) = &result {
        job.abort();
        error!(error = %e, "{} failed", job.opstr());
        let flags = job.flags();
        let keeps_primary = flags.dry_run
            || flags.upgrade_dn_format_spaces
            || matches!(kind, ProducerKind::Reindex | ProducerKind::UpgradeDn);
        if !keeps_primary {
            if let Err(cleanup) = job.instance.remove() {
                warn!(error = %cleanup, "could not remove the partial instance");
            }
        }
    }
    job.fifo.clear();
    result
}

fn run_passes(job: &Arc<ImportJob>, kind: ProducerKind, started: Instant) -> Result<Outcome> {
    let op = job.opstr();
    let flags = job.flags();
    prepare_instance(job, kind)?;
    if !flags.dry_run {
        set_offline(job, true)?;
    }

    let (exit_tx, exit_rx): (Sender<ThreadExit>, Receiver<ThreadExit>) =
        crossbeam_channel::unbounded();
    if kind == ProducerKind::Ldif {
        info!("Beginning import job...");
    }
    let producer = spawn_producer(job, kind, &exit_tx)?;
    if producer.is_none() {
        job.wire_gate.open();
    }
    let producer_info = producer.as_ref().map(|(info, _)| Arc::clone(info));

    loop {
        job.total_pass.fetch_add(1, Ordering::SeqCst);
        let status = monitor::run_pass(job, producer_info.as_ref(), &exit_tx, &exit_rx);
        match status {
            Ok(PassStatus::Complete) => break,
            Ok(PassStatus::Incomplete) => {
                let next = job.ready_id() + 1;
                job.first_id.store(next, Ordering::SeqCst);
                info!(
                    pass = job.total_pass() + 1,
                    first_id = next,
                    "Beginning pass number {}",
                    job.total_pass() + 1
                );
            }
            Ok(PassStatus::NeedsDnUpgrade(need)) => {
                stop_producer(producer);
                if flags.upgrade_dn_format_spaces {
                    upgradedn::finish_side_file(job)?;
                }
                warn!("{}", need.describe());
                return Ok(Outcome::NeedsDnUpgrade(need));
            }
            Ok(PassStatus::Aborted) => {
                error!("Aborting all {} threads...", op);
                job.abort();
                stop_producer(producer);
                error!("{} threads aborted.", op);
                return Err(job.take_failure().unwrap_or(ImportError::Aborted));
            }
            Err(e) => {
                job.abort();
                stop_producer(producer);
                return Err(e);
            }
        }
    }
    stop_producer(producer);

    if flags.dry_run {
        if flags.upgrade_dn_format_spaces {
            upgradedn::finish_side_file(job)?;
        }
        if let Some(need) = job.dn_upgrade_need() {
            warn!("{}", need.describe());
            return Ok(Outcome::NeedsDnUpgrade(need));
        }
    } else {
        post_process(job)?;
        set_offline(job, false)?;
    }

    let summary = Summary {
        op,
        processed: job
            .lead_id()
            .saturating_sub(job.starting_id - 1)
            .saturating_sub(job.counters.rejected()),
        skipped: job.counters.skipped(),
        not_here: job.counters.not_here(),
        elapsed: started.elapsed(),
    };
    info!("{}", summary.message());
    Ok(Outcome::Complete(summary))
}

/// Swap in the rewritten primary store, then derive subordinate counts and ancestor ids.
fn post_process(job: &Arc<ImportJob>) -> Result<()> {
    let flags = job.flags();
    info!("Indexing complete. Post-processing...");
    if flags.dn2rdn {
        info!("Replacing the primary store with its RDN-form rewrite");
        job.instance
            .replace_index(store::ID2ENTRY, &job.rewrite_path())?;
    }
    if !flags.reindexing || flags.dn2rdn {
        info!("Generating numsubordinates (this may take several minutes to complete)...");
        subcount::update_subordinate_counts(job)?;
        info!("Generating numSubordinates complete.");
    }
    job.instance.remove_index(store::ANCESTORID)?;
    ancestorid::create_index(job)?;
    let missing = job.vlv.missing_bases();
    for name in missing {
        warn!(vlv = %name, "no entry matched the base of VLV index {}", name);
    }
    info!("Flushing caches...");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{ATTR_NUMSUBORDINATES, Entry};
    use crate::store::entryrdn::EntryRdnIndex;
    use crate::store::index::{IndexFile, equality_key, id_key};
    use tempfile::tempdir;

    /// Suffix, one branch with two people, then a second Alice.
    const TREE: &str = "\
dn: dc=example,dc=com
objectClass: top
objectClass: domain
dc: example

dn: ou=people,dc=example,dc=com
objectClass: top
objectClass: organizationalUnit
ou: people

dn: cn=Alice,ou=people,dc=example,dc=com
objectClass: top
objectClass: person
cn: Alice
sn: Liddell

dn: cn=Bob,ou=people,dc=example,dc=com
objectClass: top
objectClass: person
cn: Bob
sn: Builder

dn: cn=alice,ou=people,dc=example,dc=com
objectClass: top
objectClass: person
cn: alice
sn: Again
";

    fn job(options: JobOptions) -> (tempfile::TempDir, ImportJob) {
        let dir = tempdir().unwrap();
        let job = ImportJob::new(BackendConfig::default(), dir.path(), options).unwrap();
        (dir, job)
    }

    fn fast_config() -> BackendConfig {
        BackendConfig {
            poll_interval_ms: 5,
            ..BackendConfig::default()
        }
    }

    fn ldif_job(dir: &Path, text: &str) -> Arc<ImportJob> {
        let path = dir.join("tree.ldif");
        std::fs::write(&path, text).unwrap();
        let options = JobOptions {
            input_files: vec![path],
            ..JobOptions::default()
        };
        Arc::new(ImportJob::new(fast_config(), &dir.join("db"), options).unwrap())
    }

    #[test]
    fn test_import_end_to_end() {
        let dir = tempdir().unwrap();
        let job = ldif_job(dir.path(), TREE);
        let summary = match run(&job).unwrap() {
            Outcome::Complete(summary) => summary,
            other => panic!("unexpected outcome {:?}", other),
        };

        // The second Alice took id 5 but was never committed
        assert_eq!(summary.processed, 4);
        assert_eq!(summary.skipped, 1);
        assert!(summary.message().contains("Processed 4 entries (1 bad entries were skipped)"));
        assert_eq!(job.lead_id(), 5);
        assert_eq!(job.ready_id(), 5);
        assert_eq!(job.trailing_id.load(Ordering::SeqCst), job.ready_id());

        let tree =
            EntryRdnIndex::open(&job.instance.path_for(store::ENTRYRDN), &job.config.suffixes)
                .unwrap();
        assert_eq!(tree.node(1).unwrap(), Some((0, "dc=example,dc=com".to_string())));
        assert_eq!(tree.node(2).unwrap(), Some((1, "ou=people".to_string())));
        assert_eq!(tree.node(3).unwrap(), Some((2, "cn=Alice".to_string())));
        assert_eq!(tree.node(4).unwrap(), Some((2, "cn=Bob".to_string())));
        assert_eq!(tree.node(5).unwrap(), None);
        assert_eq!(tree.lookup("cn=bob,ou=people,dc=example,dc=com").unwrap(), Some(4));

        let parentid = subcount::open_parentid(&job).unwrap();
        assert_eq!(parentid.fetch(&id_key(1)).unwrap().ids(), &[2]);
        assert_eq!(parentid.fetch(&id_key(2)).unwrap().ids(), &[3, 4]);

        let ancestorid = IndexFile::open(
            &job.instance.path_for(store::ANCESTORID),
            store::ANCESTORID,
            0,
            false,
        )
        .unwrap();
        assert_eq!(ancestorid.fetch(&id_key(1)).unwrap().ids(), &[2, 3, 4]);
        assert_eq!(ancestorid.fetch(&id_key(2)).unwrap().ids(), &[3, 4]);
        assert!(ancestorid.fetch(&id_key(3)).unwrap().is_empty());

        let primary = Id2Entry::open(&job.instance.path_for(store::ID2ENTRY)).unwrap();
        assert_eq!(primary.count().unwrap(), 4);
        let suffix = primary.get(1).unwrap().unwrap().entry;
        assert_eq!(suffix.dn(), "dc=example,dc=com");
        assert_eq!(suffix.first_value(ATTR_NUMSUBORDINATES), Some("1"));
        let people = primary.get(2).unwrap().unwrap().entry;
        assert_eq!(people.first_value(ATTR_NUMSUBORDINATES), Some("2"));
        assert!(primary.get(5).unwrap().is_none());
        assert!(primary.offline_indexes().unwrap().is_empty());

        let cn = IndexFile::open(&job.instance.path_for("cn"), "cn", 0, false).unwrap();
        assert_eq!(cn.fetch(&equality_key("alice")).unwrap().ids(), &[3]);
        assert_eq!(cn.fetch(&equality_key("bob")).unwrap().ids(), &[4]);
        let objectclass =
            IndexFile::open(&job.instance.path_for("objectclass"), "objectclass", 0, false)
                .unwrap();
        assert_eq!(objectclass.fetch(&equality_key("person")).unwrap().ids(), &[3, 4]);
    }

    #[test]
    fn test_worker_failure_is_returned() {
        let dir = tempdir().unwrap();
        let mut options = JobOptions::default();
        options.flags.use_files = false;
        let job = Arc::new(ImportJob::new(fast_config(), dir.path(), options).unwrap());
        job.instance.ensure().unwrap();
        // The cn worker cannot open a directory as its index file
        std::fs::create_dir(job.instance.path_for("cn")).unwrap();

        let result = run(&job);
        assert!(
            matches!(result, Err(ImportError::Storage(_))),
            "unexpected result {:?}",
            result.map(|_| ())
        );
        assert!(job.is_aborted());
    }

    #[test]
    fn test_first_failure_is_kept() {
        let (_d, j) = job(JobOptions::default());
        j.fail(ImportError::CorruptParentChain { id: 7 });
        j.fail(ImportError::DiskFull("cn".to_string()));
        assert!(j.is_aborted());
        assert!(matches!(
            j.take_failure(),
            Some(ImportError::CorruptParentChain { id: 7 })
        ));
        assert!(j.take_failure().is_none());
    }

    #[test]
    fn test_worker_trails_the_foreman() {
        let dir = tempdir().unwrap();
        let job = ImportJob::new(fast_config(), dir.path(), JobOptions::default()).unwrap();
        job.instance.ensure().unwrap();
        let dns = [
            "dc=example,dc=com",
            "ou=people,dc=example,dc=com",
            "cn=e3,ou=people,dc=example,dc=com",
            "cn=e4,ou=people,dc=example,dc=com",
        ];
        for (i, entry_dn) in dns.iter().enumerate() {
            let id = i as u64 + 1;
            let mut e = Entry::new(*entry_dn);
            e.add_value("objectClass", "top");
            e.add_value("cn", format!("e{}", id));
            e.set_id(id);
            assert!(producer::publish_entry(&job, id, e, fifo::Source::default()).unwrap());
        }
        let cn = job.indexes.iter().find(|d| d.name == "cn").unwrap().clone();
        let worker_info = ThreadInfo::new("cn", ThreadKind::Worker, 1);
        let foreman_info = ThreadInfo::new("Foreman", ThreadKind::Foreman, 1);

        std::thread::scope(|s| {
            let worker = s.spawn(|| worker::run(&job, &worker_info, &cn));
            // Published but not committed: the worker has nothing to read yet
            std::thread::sleep(Duration::from_millis(50));
            assert_eq!(worker_info.last_id(), 0);
            assert_eq!(worker_info.state(), thread::ThreadState::Waiting);

            let foreman = s.spawn(|| foreman::run(&job, &foreman_info));
            while worker_info.last_id() < 4 {
                assert!(worker_info.last_id() <= job.ready_id());
                std::thread::sleep(Duration::from_millis(1));
            }
            foreman_info.set_command(Command::Stop);
            worker_info.set_command(Command::Stop);
            foreman.join().unwrap().unwrap();
            worker.join().unwrap().unwrap();
        });

        assert_eq!(job.ready_id(), 4);
        let index = worker::open_index(&job, &cn).unwrap();
        assert_eq!(index.fetch(&equality_key("e4")).unwrap().ids(), &[4]);
        assert_eq!(index.fetch("+").unwrap().ids(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_opstr_by_flags() {
        let (_d, j) = job(JobOptions::default());
        assert_eq!(j.opstr(), "Import");

        let mut opts = JobOptions::default();
        opts.flags.reindexing = true;
        let (_d, j) = job(opts);
        assert_eq!(j.opstr(), "Reindexing");

        let mut opts = JobOptions::default();
        opts.flags.upgrade_dn_format = true;
        opts.flags.upgrade_dn_format_spaces = true;
        let (_d, j) = job(opts.clone());
        assert_eq!(j.opstr(), "Upgrade Dn (Full)");
        opts.flags.dry_run = true;
        let (_d, j) = job(opts);
        assert_eq!(j.opstr(), "Upgrade Dn Dryrun");
    }

    #[test]
    fn test_summary_message() {
        let summary = Summary {
            op: "Import",
            processed: 10,
            skipped: 2,
            not_here: 1,
            elapsed: Duration::from_secs(5),
        };
        assert_eq!(
            summary.message(),
            "Import complete. Processed 10 entries (2 bad entries were skipped, \
             1 entries were skipped because they don't belong to this database) \
             in 5 seconds. (2.00 entries/sec)"
        );
        let clean = Summary {
            skipped: 0,
            not_here: 0,
            elapsed: Duration::ZERO,
            ..summary
        };
        assert!(clean.message().ends_with("Processed 10 entries in 0 seconds. (0.00 entries/sec)"));
    }

    #[test]
    fn test_dn_upgrade_verdicts_merge() {
        let (_d, j) = job(JobOptions::default());
        assert_eq!(j.dn_upgrade_need(), None);
        j.note_dn_upgrade(DnUpgradeNeed::Rfc4514);
        assert_eq!(j.dn_upgrade_need(), Some(DnUpgradeNeed::Rfc4514));
        j.note_dn_upgrade(DnUpgradeNeed::Spaces);
        assert_eq!(j.dn_upgrade_need(), Some(DnUpgradeNeed::Both));
        assert_eq!(DnUpgradeNeed::Both.exit_code(), 4);
    }

    #[test]
    fn test_belongs_and_suffix() {
        let (_d, j) = job(JobOptions::default());
        assert!(j.is_suffix("dc=example,dc=com"));
        assert!(j.belongs("cn=a,dc=example,dc=com"));
        assert!(!j.belongs("cn=a,dc=other"));
    }

    #[test]
    fn test_abort_interrupts_nap() {
        let (_d, j) = job(JobOptions::default());
        assert!(j.nap().is_ok());
        j.abort();
        assert!(matches!(j.nap(), Err(ImportError::Aborted)));
    }
}
