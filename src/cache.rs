//! The unwind-script cache.
//!
//! Stepping through the same hot functions over and over would re-parse the
//! same CIEs and FDEs and re-run the same CFI programs every time. Instead,
//! the row computed for an IP is compiled into a small fixed-size
//! [`Script`] and kept in a fixed number of slots, found through a hash
//! table of collision chains and recycled least-recently-used first.
//!
//! The cache is only ever *tried*. A cursor that cannot get at it (it is
//! disabled, another thread holds it, or we are unwinding from inside the
//! unwinder) takes the uncached path and gets the same answer, slower.

#[cfg(test)]
mod tests;

use alloc::vec::Vec;

use arrayvec::ArrayVec;

use crate::arch::Regnum;
use crate::dwarf::state::{CfaRule, RegisterRule, StateRecord};
use crate::dynamic::Predicates;
use crate::space::ProcInfo;

/// Register rules a [`Script`] can hold. Rows with more explicit rules are
/// not cached.
pub const SCRIPT_CAPACITY: usize = 32;

pub const DEFAULT_CAPACITY: usize = 128;

/// The largest capacity a cache can be built with.
pub const MAX_CAPACITY: usize = 4096;

const NIL: u16 = u16::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Every step runs the full pipeline.
    None,
    /// One cache shared by every thread using the unwinder.
    #[default]
    Global,
    /// One cache per thread, created on that thread's first step.
    #[cfg(feature = "std")]
    PerThread,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub policy: CachePolicy,
    /// Number of scripts kept; clamped to `1..=MAX_CAPACITY`.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            policy: CachePolicy::default(),
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// The cache could not be used right now; take the uncached path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unwind cache unavailable")]
pub struct CacheUnavailable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub ip: u64,
    pub predicates: Predicates,
}

/// A compiled CFI row: everything a step needs besides the registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub cfa: CfaRule,
    /// Columns whose rule is not `SameValue`.
    pub rules: ArrayVec<(Regnum, RegisterRule), SCRIPT_CAPACITY>,
    pub return_address_column: Regnum,
    pub args_size: u64,
    pub signal_frame: bool,
    pub ra_signed: bool,
}

impl Script {
    /// `None` if the row has more explicit rules than a script can hold.
    pub fn compile(state: &StateRecord) -> Option<Self> {
        let mut rules = ArrayVec::new();
        for rule in state.current.explicit() {
            rules.try_push(rule).ok()?;
        }
        Some(Self {
            cfa: state.current.cfa,
            rules,
            return_address_column: state.return_address_column,
            args_size: state.args_size,
            signal_frame: state.signal_frame,
            ra_signed: state.ra_signed,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub flushes: u64,
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub key: CacheKey,
    pub script: Script,
    /// The proc-info the script was built from.
    pub info: ProcInfo,
}

#[derive(Debug)]
struct Slot {
    entry: Option<Entry>,
    lru_prev: u16,
    lru_next: u16,
    /// Next slot in the same hash bucket.
    chain: u16,
}

/// Fixed-capacity LRU map from [`CacheKey`] to [`Script`].
#[derive(Debug)]
pub struct ScriptCache {
    slots: Vec<Slot>,
    buckets: Vec<u16>,
    log_buckets: u32,
    /// Least recently used.
    lru_head: u16,
    /// Most recently used.
    lru_tail: u16,
    generation: u64,
    stats: CacheStats,
}

impl ScriptCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_CAPACITY);
        let buckets = (capacity * 2).next_power_of_two();
        let mut cache = Self {
            slots: Vec::with_capacity(capacity),
            buckets: alloc::vec![NIL; buckets],
            log_buckets: buckets.trailing_zeros(),
            lru_head: NIL,
            lru_tail: NIL,
            generation: 0,
            stats: CacheStats::default(),
        };
        for _ in 0..capacity {
            cache.slots.push(Slot {
                entry: None,
                lru_prev: NIL,
                lru_next: NIL,
                chain: NIL,
            });
        }
        cache.reset();
        cache
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn bucket(&self, ip: u64) -> usize {
        (ip.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> (64 - self.log_buckets)) as usize
    }

    /// Empty every slot and rebuild the LRU list in slot order.
    fn reset(&mut self) {
        self.buckets.fill(NIL);
        let last = self.slots.len() - 1;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            slot.entry = None;
            slot.chain = NIL;
            slot.lru_prev = if i == 0 { NIL } else { (i - 1) as u16 };
            slot.lru_next = if i == last { NIL } else { (i + 1) as u16 };
        }
        self.lru_head = 0;
        self.lru_tail = last as u16;
    }

    pub fn flush(&mut self) {
        debug!("flushing unwind cache");
        self.reset();
        self.stats.flushes += 1;
    }

    /// Flush if the unwinder's generation moved since we last looked.
    pub fn sync(&mut self, generation: u64) {
        if self.generation != generation {
            self.flush();
            self.generation = generation;
        }
    }

    fn matches(&self, index: u16, key: &CacheKey) -> bool {
        self.slots
            .get(usize::from(index))
            .and_then(|slot| slot.entry.as_ref())
            .is_some_and(|entry| entry.key == *key)
    }

    fn find(&self, key: &CacheKey) -> Option<u16> {
        let mut index = self.buckets[self.bucket(key.ip)];
        while index != NIL {
            if self.matches(index, key) {
                return Some(index);
            }
            index = self.slots[usize::from(index)].chain;
        }
        None
    }

    /// Move `index` to the most recently used end.
    fn touch(&mut self, index: u16) {
        if self.lru_tail == index {
            return;
        }
        let (prev, next) = {
            let slot = &self.slots[usize::from(index)];
            (slot.lru_prev, slot.lru_next)
        };
        if prev == NIL {
            self.lru_head = next;
        } else {
            self.slots[usize::from(prev)].lru_next = next;
        }
        if next != NIL {
            self.slots[usize::from(next)].lru_prev = prev;
        }

        let tail = self.lru_tail;
        self.slots[usize::from(tail)].lru_next = index;
        let slot = &mut self.slots[usize::from(index)];
        slot.lru_prev = tail;
        slot.lru_next = NIL;
        self.lru_tail = index;
    }

    fn unchain(&mut self, index: u16, bucket: usize) {
        let next = self.slots[usize::from(index)].chain;
        if self.buckets[bucket] == index {
            self.buckets[bucket] = next;
            return;
        }
        let mut cursor = self.buckets[bucket];
        while cursor != NIL {
            let slot = &mut self.slots[usize::from(cursor)];
            if slot.chain == index {
                slot.chain = next;
                return;
            }
            cursor = slot.chain;
        }
    }

    /// Look `key` up, trying the `hint` slot first. A hit becomes the most
    /// recently used entry.
    pub fn lookup(&mut self, key: &CacheKey, hint: Option<u16>) -> Option<(u16, &Entry)> {
        let index = match hint.filter(|&h| self.matches(h, key)) {
            Some(index) => index,
            None => match self.find(key) {
                Some(index) => index,
                None => {
                    self.stats.misses += 1;
                    return None;
                }
            },
        };
        self.stats.hits += 1;
        self.touch(index);
        let entry = self.slots[usize::from(index)].entry.as_ref()?;
        Some((index, entry))
    }

    /// Store `script` for `key`, recycling the least recently used slot.
    /// Returns the slot, to be used as a hint.
    pub fn insert(&mut self, key: CacheKey, script: Script, info: ProcInfo) -> u16 {
        let entry = Entry { key, script, info };
        if let Some(index) = self.find(&key) {
            self.slots[usize::from(index)].entry = Some(entry);
            self.touch(index);
            return index;
        }

        let index = self.lru_head;
        if let Some(old) = self.slots[usize::from(index)].entry.take() {
            trace!("evicting script for {:#x}", old.key.ip);
            let bucket = self.bucket(old.key.ip);
            self.unchain(index, bucket);
            self.stats.evictions += 1;
        }

        let bucket = self.bucket(key.ip);
        let slot = &mut self.slots[usize::from(index)];
        slot.entry = Some(entry);
        slot.chain = self.buckets[bucket];
        self.buckets[bucket] = index;
        self.touch(index);
        index
    }
}

#[cfg(feature = "std")]
mod per_thread {
    use core::cell::RefCell;
    use core::sync::atomic::{AtomicUsize, Ordering};

    use alloc::vec::Vec;

    use super::{CacheUnavailable, ScriptCache};

    static NEXT_OWNER: AtomicUsize = AtomicUsize::new(0);

    std::thread_local! {
        static THREAD_CACHES: RefCell<Vec<(usize, ScriptCache)>> = const { RefCell::new(Vec::new()) };
    }

    pub(super) fn new_owner() -> usize {
        NEXT_OWNER.fetch_add(1, Ordering::Relaxed)
    }

    pub(super) fn with<R>(
        owner: usize,
        capacity: usize,
        f: impl FnOnce(&mut ScriptCache) -> R,
    ) -> Result<R, CacheUnavailable> {
        THREAD_CACHES
            .try_with(|caches| {
                let mut caches = caches.try_borrow_mut().map_err(|_| CacheUnavailable)?;
                let index = match caches.iter().position(|(o, _)| *o == owner) {
                    Some(index) => index,
                    None => {
                        debug!("creating unwind cache for this thread");
                        caches.push((owner, ScriptCache::new(capacity)));
                        caches.len() - 1
                    }
                };
                Ok(f(&mut caches[index].1))
            })
            .map_err(|_| CacheUnavailable)?
    }

    /// Drop this thread's cache for `owner`. Other threads keep theirs until
    /// they exit.
    pub(super) fn release(owner: usize) {
        let _ = THREAD_CACHES.try_with(|caches| {
            if let Ok(mut caches) = caches.try_borrow_mut() {
                caches.retain(|(o, _)| *o != owner);
            }
        });
    }
}

/// The cache as configured for one unwinder.
#[derive(Debug)]
pub(crate) enum CacheHandle {
    None,
    Global(spin::Mutex<ScriptCache>),
    #[cfg(feature = "std")]
    PerThread { owner: usize, capacity: usize },
}

impl CacheHandle {
    pub(crate) fn new(config: CacheConfig) -> Self {
        match config.policy {
            CachePolicy::None => CacheHandle::None,
            CachePolicy::Global => {
                CacheHandle::Global(spin::Mutex::new(ScriptCache::new(config.capacity)))
            }
            #[cfg(feature = "std")]
            CachePolicy::PerThread => CacheHandle::PerThread {
                owner: per_thread::new_owner(),
                capacity: config.capacity,
            },
        }
    }

    /// Run `f` on the cache if it can be had without waiting.
    pub(crate) fn with<R>(
        &self,
        f: impl FnOnce(&mut ScriptCache) -> R,
    ) -> Result<R, CacheUnavailable> {
        match self {
            CacheHandle::None => Err(CacheUnavailable),
            CacheHandle::Global(cache) => {
                let mut cache = cache.try_lock().ok_or(CacheUnavailable)?;
                Ok(f(&mut cache))
            }
            #[cfg(feature = "std")]
            CacheHandle::PerThread { owner, capacity } => per_thread::with(*owner, *capacity, f),
        }
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        #[cfg(feature = "std")]
        if let CacheHandle::PerThread { owner, .. } = self {
            per_thread::release(*owner);
        }
    }
}
