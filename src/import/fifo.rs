//! Bounded entry fifo between the producer and the foreman/workers.
//!
//! Slot `id % capacity` holds the entry with sequence id `id`. A slot is
//! recyclable once every worker has released it (`refcount == 0`) and the
//! foreman's ready watermark has passed its id. The byte budget bounds the
//! total size of occupied slots independently of the slot count.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::entry::Entry;
use crate::memory::{Growth, MemorySize};
use crate::sysmem::MemorySanity;

pub const MIN_SLOTS: usize = 100;
pub const MAX_SLOTS: usize = 8000;

/// Where an entry came from, for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct Source {
    pub file: Arc<str>,
    pub line: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum BadState {
    #[default]
    Good,
    Bad,
    BadPrinted,
}

#[derive(Debug, Default)]
struct Slot {
    id: u64,
    /// Absent while the foreman holds it for processing.
    entry: Option<Arc<Entry>>,
    /// The slot's size is accounted in the byte budget.
    occupied: bool,
    size: u64,
    source: Source,
    refcount: usize,
    bad: BadState,
}

impl Slot {
    fn retireable(&self, ready_id: u64) -> bool {
        self.refcount == 0 && self.id <= ready_id
    }
}

#[derive(Debug)]
struct Budget {
    limit: u64,
    used: u64,
}

/// The slot is still in use by a later pipeline stage; the entry is handed back.
#[derive(Debug)]
pub struct RetryLater {
    pub entry: Entry,
    pub source: Source,
}

/// A blocking wait was interrupted by the abort flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

/// An entry handed to a worker.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub entry: Arc<Entry>,
    pub source: Source,
}

/// Slot count for a cache configured with `cache_entries` entries or
/// `cache_bytes` bytes.
pub fn capacity_for(cache_entries: u64, cache_bytes: MemorySize) -> usize {
    let wanted = if cache_entries > 0 {
        cache_entries
    } else {
        cache_bytes.as_bytes() / 1024
    };
    (wanted.clamp(MIN_SLOTS as u64, MAX_SLOTS as u64)) as usize
}

pub struct EntryFifo {
    slots: Vec<Mutex<Slot>>,
    budget: Mutex<Budget>,
    sanity: MemorySanity,
    poll: Duration,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl EntryFifo {
    pub fn new(capacity: usize, budget: MemorySize, sanity: MemorySanity, poll: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| Mutex::new(Slot::default())).collect(),
            budget: Mutex::new(Budget {
                limit: budget.as_bytes(),
                used: 0,
            }),
            sanity,
            poll,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn budget(&self) -> u64 {
        lock(&self.budget).limit
    }

    pub fn used(&self) -> u64 {
        lock(&self.budget).used
    }

    fn slot(&self, id: u64) -> &Mutex<Slot> {
        &self.slots[(id % self.slots.len() as u64) as usize]
    }

    /// Release a retired slot's accounting. The slot lock must be held.
    fn retire(&self, slot: &mut Slot) {
        if slot.occupied {
            let mut budget = lock(&self.budget);
            budget.used = budget.used.saturating_sub(slot.size);
        }
        slot.entry = None;
        slot.occupied = false;
        slot.size = 0;
        slot.bad = BadState::Good;
    }

    /// Block until the slot that `id` maps to can be reused, retiring its occupant.
    pub fn wait_for_slot(
        &self,
        id: u64,
        ready_id: &AtomicU64,
        abort: &AtomicBool,
    ) -> Result<(), Interrupted> {
        loop {
            {
                let mut slot = lock(self.slot(id));
                if !slot.occupied {
                    return Ok(());
                }
                if slot.retireable(ready_id.load(Ordering::SeqCst)) {
                    self.retire(&mut slot);
                    return Ok(());
                }
            }
            if abort.load(Ordering::SeqCst) {
                return Err(Interrupted);
            }
            std::thread::sleep(self.poll);
        }
    }

    /// Reclaim every retireable slot, returning how many were freed.
    fn reclaim(&self, ready_id: u64) -> usize {
        let mut freed = 0;
        for slot in &self.slots {
            let mut slot = lock(slot);
            if slot.occupied && slot.retireable(ready_id) {
                self.retire(&mut slot);
                freed += 1;
            }
        }
        freed
    }

    /// Block until `size` more bytes fit in the budget.
    pub fn wait_for_capacity(
        &self,
        size: u64,
        ready_id: &AtomicU64,
        abort: &AtomicBool,
    ) -> Result<(), Interrupted> {
        loop {
            {
                let budget = lock(&self.budget);
                if budget.used + size <= budget.limit || budget.used == 0 {
                    return Ok(());
                }
            }
            if self.reclaim(ready_id.load(Ordering::SeqCst)) > 0 {
                continue;
            }
            if abort.load(Ordering::SeqCst) {
                return Err(Interrupted);
            }
            std::thread::sleep(self.poll);
        }
    }

    /// Make sure one entry of `size` bytes fits in the budget, growing it when
    /// the memory sanity check allows. `false` means the entry must be rejected.
    pub fn grow_if_needed(&self, size: u64) -> bool {
        let mut budget = lock(&self.budget);
        if size <= budget.limit {
            return true;
        }
        match self.sanity.plan(size) {
            Growth::Granted(new) => {
                info!(
                    entry_size = size,
                    old = %MemorySize::from_bytes(budget.limit),
                    new = %new,
                    "growing import fifo budget"
                );
                budget.limit = new.as_bytes();
                true
            }
            Growth::Reduced(new) => {
                warn!(
                    entry_size = size,
                    new = %new,
                    "not enough memory for the full fifo growth, using a reduced budget"
                );
                budget.limit = new.as_bytes();
                true
            }
            Growth::Refused => false,
        }
    }

    /// Store a new entry. The slot must have been freed with [`wait_for_slot`](Self::wait_for_slot).
    pub fn publish(&self, id: u64, entry: Entry, source: Source) -> Result<(), RetryLater> {
        let size = entry.size();
        let mut slot = lock(self.slot(id));
        if slot.occupied {
            return Err(RetryLater { entry, source });
        }
        slot.id = id;
        slot.entry = Some(Arc::new(entry));
        slot.occupied = true;
        slot.size = size;
        slot.source = source;
        slot.refcount = 0;
        slot.bad = BadState::Good;
        lock(&self.budget).used += size;
        Ok(())
    }

    /// Take the entry for exclusive processing by the foreman.
    pub fn take(&self, id: u64) -> Option<(Arc<Entry>, Source)> {
        let mut slot = lock(self.slot(id));
        if !slot.occupied || slot.id != id {
            return None;
        }
        let entry = slot.entry.take()?;
        Some((entry, slot.source.clone()))
    }

    /// Put a processed entry back and hand it to `refcount` workers.
    pub fn ready(&self, id: u64, entry: Arc<Entry>, refcount: usize) {
        let mut slot = lock(self.slot(id));
        if slot.id == id {
            slot.entry = Some(entry);
            slot.refcount = refcount;
        }
    }

    /// Flag the entry as rejected by the foreman; workers will skip it.
    pub fn mark_bad(&self, id: u64, entry: Option<Arc<Entry>>) {
        let mut slot = lock(self.slot(id));
        if slot.id == id {
            slot.entry = entry;
            slot.refcount = 0;
            slot.bad = BadState::Bad;
        }
    }

    /// Entry `id` for a worker, or `None` when it is absent or was rejected.
    pub fn fetch(&self, id: u64) -> Option<Fetched> {
        let mut slot = lock(self.slot(id));
        if !slot.occupied || slot.id != id {
            return None;
        }
        match slot.bad {
            BadState::Good => {}
            BadState::Bad => {
                slot.bad = BadState::BadPrinted;
                debug!(id, "bad entry skipped by workers");
                return None;
            }
            BadState::BadPrinted => return None,
        }
        debug_assert!(slot.refcount > 0, "entry {} handed to a worker with no references", id);
        let entry = Arc::clone(slot.entry.as_ref()?);
        Some(Fetched {
            entry,
            source: slot.source.clone(),
        })
    }

    /// Whether entry `id` is resident in its slot.
    pub fn contains(&self, id: u64) -> bool {
        let slot = lock(self.slot(id));
        slot.occupied && slot.id == id
    }

    /// A worker is done with entry `id`.
    pub fn release(&self, id: u64) {
        let mut slot = lock(self.slot(id));
        if slot.id == id && slot.refcount > 0 {
            slot.refcount -= 1;
        }
    }

    /// Drop every entry and reset the accounting.
    pub fn clear(&self) {
        for slot in &self.slots {
            *lock(slot) = Slot::default();
        }
        lock(&self.budget).used = 0;
    }
}
