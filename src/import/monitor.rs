//! Pass supervision: starts the foreman and the workers, watches their
//! progress, reports throughput and decides how a pass ends.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, error, info, warn};

use super::thread::{self, Command, ThreadExit, ThreadInfo, ThreadKind, ThreadState};
use super::{DnUpgradeNeed, ImportJob, foreman, worker};
use crate::error::Result;
use crate::sysmem;

/// Samples kept in the progress history.
const HISTORY_LEN: usize = 10;
/// No throughput-based give-up before the pass has run this long.
const GIVE_UP_HOLDOFF: Duration = Duration::from_secs(5 * 60);
/// Recent/average ratio under which a starved cache ends the pass.
const SLOW_RATIO: f64 = 0.5;
/// Recent/average ratio counted as a stall.
const STALL_RATIO: f64 = 0.1;
/// Consecutive stalls tolerated.
const STALL_LIMIT: u32 = 10;

/// How a pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassStatus {
    /// Every published entry went through the foreman and the workers.
    Complete,
    /// The pass was ended early; another one continues after `ready_id`.
    Incomplete,
    /// The DN-upgrade dry run found work for a real run.
    NeedsDnUpgrade(DnUpgradeNeed),
    Aborted,
}

/// Fixed ring of `(last id, elapsed)` samples of the foreman's progress.
#[derive(Debug)]
pub struct ProgressHistory {
    first_id: u64,
    samples: VecDeque<(u64, Duration)>,
}

impl ProgressHistory {
    /// Creates an empty history for a pass starting at `first_id`.
    pub fn new(first_id: u64) -> Self {
        Self {
            first_id,
            samples: VecDeque::with_capacity(HISTORY_LEN),
        }
    }

    /// Push a sample, dropping the oldest once the ring is full.
    pub fn record(&mut self, last_id: u64, elapsed: Duration) {
        if self.samples.len() == HISTORY_LEN {
            self.samples.pop_front();
        }
        self.samples.push_back((last_id, elapsed));
    }

    /// Entries per second since the pass started.
    pub fn average_rate(&self) -> f64 {
        let Some(&(last_id, elapsed)) = self.samples.back() else {
            return 0.0;
        };
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 || last_id < self.first_id {
            return 0.0;
        }
        (last_id + 1 - self.first_id) as f64 / secs
    }

    /// Entries per second over the span the ring covers.
    pub fn recent_rate(&self) -> f64 {
        let (Some(&(old_id, old_at)), Some(&(new_id, new_at))) =
            (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };
        let secs = new_at.saturating_sub(old_at).as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        new_id.saturating_sub(old_id) as f64 / secs
    }
}

/// Decides when a collapsing throughput should end the pass.
#[derive(Debug, Default)]
pub struct Throttle {
    stalls: u32,
}

impl Throttle {
    /// `cache_poor` is only consulted when the pass has slowed down.
    pub fn should_give_up(
        &mut self,
        elapsed: Duration,
        average: f64,
        recent: f64,
        cache_poor: impl FnOnce() -> bool,
    ) -> bool {
        if elapsed < GIVE_UP_HOLDOFF || average <= 0.0 {
            return false;
        }
        let ratio = recent / average;
        if ratio < SLOW_RATIO && cache_poor() {
            return true;
        }
        if ratio < STALL_RATIO {
            self.stalls += 1;
            self.stalls > STALL_LIMIT
        } else {
            self.stalls = 0;
            false
        }
    }
}

/// Whether a chunked pass has taken its share of entries.
pub fn chunk_exhausted(chunk: u64, lead_id: u64, trailing_id: u64, first_id: u64) -> bool {
    chunk > 0 && lead_id != 0 && trailing_id > first_id && trailing_id - first_id > chunk
}

struct Running {
    info: Arc<ThreadInfo>,
    handle: JoinHandle<()>,
}

fn start_threads(job: &Arc<ImportJob>, exits: &Sender<ThreadExit>) -> Result<Vec<Running>> {
    let first_id = job.first_id();
    let mut running: Vec<Running> = Vec::with_capacity(job.worker_count() + 1);

    let info = ThreadInfo::new("Foreman", ThreadKind::Foreman, first_id);
    let (thread_job, fatal_job) = (Arc::clone(job), Arc::clone(job));
    let handle = thread::spawn(
        Arc::clone(&info),
        exits.clone(),
        move |e| fatal_job.fail(e),
        move |info| foreman::run(&thread_job, info),
    )?;
    running.push(Running { info, handle });

    for descriptor in job.indexes.iter().cloned() {
        let info = ThreadInfo::new(descriptor.file_name(), ThreadKind::Worker, first_id);
        let (thread_job, fatal_job) = (Arc::clone(job), Arc::clone(job));
        let spawned = thread::spawn(
            Arc::clone(&info),
            exits.clone(),
            move |e| fatal_job.fail(e),
            move |info| worker::run(&thread_job, info, &descriptor),
        );
        match spawned {
            Ok(handle) => running.push(Running { info, handle }),
            Err(e) => {
                job.abort();
                join_all(running);
                return Err(e);
            }
        }
    }
    Ok(running)
}

fn join_all(running: Vec<Running>) {
    for thread in running {
        if thread.handle.join().is_err() {
            error!(thread = %thread.info.name, "thread panicked");
        }
    }
}

fn spinner(job: &ImportJob) -> Option<ProgressBar> {
    if !job.options.show_progress {
        return None;
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    Some(pb)
}

/// One status block line per thread.
fn log_status(job: &ImportJob, threads: &[Running], producer: Option<&Arc<ThreadInfo>>, elapsed: Duration) {
    let verb = if job.flags().reindexing { "reindex" } else { "import" };
    info!("Index status for {} of {}:", verb, job.instance.name());
    info!("-------Index Task-------State---Entry----Rate-");
    let secs = elapsed.as_secs_f64().max(1.0);
    let lines = producer.into_iter().chain(threads.iter().map(|t| &t.info));
    for info in lines {
        let done = (info.last_id() + 1).saturating_sub(info.first_id());
        info!(
            "{:<25} {}{:>10} {:>7.1}",
            info.name,
            info.state().letter(),
            info.last_id(),
            done as f64 / secs
        );
    }
}

/// Run one pass from `job.first_id()` until it completes, gives up or aborts.
///
/// The producer runs across passes; the foreman and the workers are started
/// for this pass and stopped before returning.
pub fn run_pass(
    job: &Arc<ImportJob>,
    producer: Option<&Arc<ThreadInfo>>,
    exits_tx: &Sender<ThreadExit>,
    exits_rx: &Receiver<ThreadExit>,
) -> Result<PassStatus> {
    let first_id = job.first_id();
    let pass = job.total_pass();
    let running = start_threads(job, exits_tx)?;
    let foreman = Arc::clone(&running[0].info);
    let workers: Vec<Arc<ThreadInfo>> = running[1..].iter().map(|t| Arc::clone(&t.info)).collect();
    debug!(pass, first_id, workers = workers.len(), "pass started");

    let started = Instant::now();
    let display = Duration::from_secs(job.config.display_interval_secs.max(1));
    let mut last_display = started;
    let mut history = ProgressHistory::new(first_id);
    let mut throttle = Throttle::default();
    let chunk = job.options.merge_chunk_size;
    let mut gave_up = false;
    let mut producer_done = false;
    let progress = spinner(job);

    let status = loop {
        std::thread::sleep(job.poll_interval());

        for exit in exits_rx.try_iter() {
            match exit.error {
                Some(e) => debug!(thread = %exit.name, error = %e, "thread exited with an error"),
                None => debug!(thread = %exit.name, "thread exited"),
            }
        }

        if job.is_aborted() {
            break PassStatus::Aborted;
        }
        let any_aborted = producer
            .into_iter()
            .chain(std::iter::once(&foreman))
            .chain(workers.iter())
            .any(|t| t.state() == ThreadState::Aborted);
        if any_aborted {
            break PassStatus::Aborted;
        }
        if let Some(p) = producer
            && p.state() == ThreadState::Quit
        {
            match job.dn_upgrade_need() {
                Some(need) => break PassStatus::NeedsDnUpgrade(need),
                None => producer_done = true,
            }
        }

        producer_done = producer_done
            || job.producer_done()
            || producer.is_some_and(|p| p.state() == ThreadState::Finished);
        let lead = job.lead_id();
        let ready = job.ready_id();
        let trailing = workers.iter().map(|w| w.last_id()).min().unwrap_or(ready);
        job.trailing_id.store(trailing, std::sync::atomic::Ordering::SeqCst);

        let elapsed = started.elapsed();
        history.record(foreman.last_id(), elapsed);
        if let Some(pb) = &progress {
            pb.set_message(format!(
                "pass {} | {} read | {} committed | {} indexed | {:.1}/sec",
                pass,
                lead,
                ready,
                trailing,
                history.recent_rate()
            ));
        }
        if last_display.elapsed() >= display {
            last_display = Instant::now();
            log_status(job, &running, producer, elapsed);
            let pressure = sysmem::memory_pressure();
            info!(
                "Processed {} entries (pass {}) -- average rate {:.1}/sec, recent rate {:.1}/sec, memory available {}{}",
                foreman.last_id().saturating_sub(job.starting_id - 1),
                pass,
                history.average_rate(),
                history.recent_rate(),
                pressure.available,
                if pressure.is_high() { " (under pressure)" } else { "" }
            );
        }

        if !gave_up {
            let give_up = if chunk > 0 {
                chunk_exhausted(chunk, lead, trailing, first_id)
            } else {
                throttle.should_give_up(
                    elapsed,
                    history.average_rate(),
                    history.recent_rate(),
                    || sysmem::memory_pressure().is_high(),
                )
            };
            if give_up {
                info!(pass, ready_id = ready, "Ending pass {} at entry {}", pass, ready);
                foreman.set_command(Command::Stop);
                gave_up = true;
            }
        }

        if producer_done && lead == ready {
            foreman.set_command(Command::Stop);
            if trailing == lead {
                break PassStatus::Complete;
            }
        }
        if foreman.state() == ThreadState::Finished && job.ready_id() == trailing {
            break PassStatus::Complete;
        }
    };

    if let Some(pb) = progress {
        pb.finish_and_clear();
    }

    let command = if status == PassStatus::Aborted {
        job.abort();
        Command::Abort
    } else {
        Command::Stop
    };
    for thread in &running {
        thread.info.set_command(command);
    }
    join_all(running);

    let status = match status {
        PassStatus::Complete if gave_up && !(producer_done && job.ready_id() == job.lead_id()) => {
            PassStatus::Incomplete
        }
        other => other,
    };
    match status {
        PassStatus::Aborted => warn!(pass, "pass aborted"),
        _ => debug!(pass, ?status, ready_id = job.ready_id(), "pass ended"),
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::import::JobOptions;
    use crate::import::fifo::Source;
    use crate::import::producer::publish_entry;
    use crate::entry::Entry;

    #[test]
    fn test_history_rates() {
        let mut history = ProgressHistory::new(1);
        assert_eq!(history.average_rate(), 0.0);
        history.record(99, Duration::from_secs(10));
        assert_eq!(history.average_rate(), 9.9);
        assert_eq!(history.recent_rate(), 0.0);
        history.record(199, Duration::from_secs(20));
        assert_eq!(history.recent_rate(), 10.0);
    }

    #[test]
    fn test_history_ring_drops_oldest() {
        let mut history = ProgressHistory::new(1);
        for i in 0..=HISTORY_LEN as u64 {
            history.record(i * 100, Duration::from_secs(i + 1));
        }
        assert_eq!(history.samples.len(), HISTORY_LEN);
        assert_eq!(history.samples.front().map(|s| s.0), Some(100));
        assert_eq!(history.recent_rate(), 100.0);
    }

    #[test]
    fn test_throttle_holdoff_and_stalls() {
        let mut throttle = Throttle::default();
        let early = Duration::from_secs(60);
        assert!(!throttle.should_give_up(early, 100.0, 1.0, || true));

        let late = Duration::from_secs(600);
        assert!(throttle.should_give_up(late, 100.0, 40.0, || true));
        assert!(!throttle.should_give_up(late, 100.0, 40.0, || false));

        for _ in 0..STALL_LIMIT {
            assert!(!throttle.should_give_up(late, 100.0, 5.0, || false));
        }
        assert!(throttle.should_give_up(late, 100.0, 5.0, || false));

        throttle.should_give_up(late, 100.0, 90.0, || false);
        assert!(!throttle.should_give_up(late, 100.0, 5.0, || false));
    }

    #[test]
    fn test_chunk_rule() {
        assert!(!chunk_exhausted(0, 50, 40, 1));
        assert!(!chunk_exhausted(10, 0, 40, 1));
        assert!(!chunk_exhausted(10, 50, 11, 1));
        assert!(chunk_exhausted(10, 50, 12, 1));
    }

    fn entry(dn: &str) -> Entry {
        let mut e = Entry::new(dn);
        e.add_value("objectClass", "top");
        e
    }

    fn fast_config() -> BackendConfig {
        BackendConfig {
            poll_interval_ms: 5,
            ..BackendConfig::default()
        }
    }

    #[test]
    fn test_pass_completes_when_feeder_is_done() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = JobOptions::default();
        options.flags.use_files = false;
        let job = Arc::new(ImportJob::new(fast_config(), dir.path(), options).unwrap());
        job.instance.ensure().unwrap();
        for (i, dn) in ["dc=example,dc=com", "ou=a,dc=example,dc=com"].iter().enumerate() {
            let id = i as u64 + 1;
            let mut e = entry(dn);
            e.set_id(id);
            assert!(publish_entry(&job, id, e, Source::default()).unwrap());
        }
        job.set_producer_done();

        let (tx, rx) = crossbeam_channel::unbounded();
        let status = run_pass(&job, None, &tx, &rx).unwrap();
        assert_eq!(status, PassStatus::Complete);
        assert_eq!(job.ready_id(), 2);
        assert_eq!(job.trailing_id.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn test_chunked_pass_is_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = JobOptions::default();
        options.flags.use_files = false;
        options.merge_chunk_size = 2;
        let job = Arc::new(ImportJob::new(fast_config(), dir.path(), options).unwrap());
        job.instance.ensure().unwrap();
        let dns = [
            "dc=example,dc=com",
            "ou=a,dc=example,dc=com",
            "ou=b,dc=example,dc=com",
            "ou=c,dc=example,dc=com",
            "ou=d,dc=example,dc=com",
        ];
        for (i, dn) in dns.iter().enumerate() {
            let id = i as u64 + 1;
            let mut e = entry(dn);
            e.set_id(id);
            assert!(publish_entry(&job, id, e, Source::default()).unwrap());
        }

        // The feeder is still open, so a pass past the chunk has to give up
        let (tx, rx) = crossbeam_channel::unbounded();
        let status = run_pass(&job, None, &tx, &rx).unwrap();
        assert_eq!(status, PassStatus::Incomplete);
        assert!(job.ready_id() >= 4);
    }

    #[test]
    fn test_abort_ends_the_pass() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = JobOptions::default();
        options.flags.use_files = false;
        let job = Arc::new(ImportJob::new(fast_config(), dir.path(), options).unwrap());
        job.instance.ensure().unwrap();
        job.abort();
        let (tx, rx) = crossbeam_channel::unbounded();
        assert_eq!(run_pass(&job, None, &tx, &rx).unwrap(), PassStatus::Aborted);
    }
}
