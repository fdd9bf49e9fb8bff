//! The unwinder: an address space plus everything that outlives a single
//! walk over it.

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::sync::Arc;

use crate::cache::{CacheConfig, CacheHandle, CacheStats};
use crate::cursor::Cursor;
use crate::dynamic::{DynamicProc, DynamicRegistry};
use crate::space::AddressSpace;
use crate::Result;

/// Owns an address space, its script cache and the dynamic regions
/// registered for it. Create one per address space and hand out as many
/// cursors as needed; [`Unwinder::into_space`] gives the address space back.
#[derive(Debug)]
pub struct Unwinder<S: AddressSpace> {
    space: S,
    cache: CacheHandle,
    /// Bumped whenever unwind info may have changed; caches flush when they
    /// notice.
    generation: AtomicU64,
    dynamic: DynamicRegistry,
}

impl<S: AddressSpace> Unwinder<S> {
    pub fn new(space: S, config: CacheConfig) -> Self {
        debug!("unwinder for {} with {:?}", space.arch().name, config);
        Self {
            space,
            cache: CacheHandle::new(config),
            generation: AtomicU64::new(0),
            dynamic: DynamicRegistry::new(),
        }
    }

    pub fn space(&self) -> &S {
        &self.space
    }

    pub fn into_space(self) -> S {
        self.space
    }

    /// A cursor at the frame whose registers `arg` provides.
    pub fn cursor<'a>(&'a self, arg: &'a mut S::Arg) -> Result<Cursor<'a, S>> {
        Cursor::new(self, arg)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Invalidate every cached script, e.g. after a library was unloaded.
    pub fn bump_generation(&self) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("unwind info generation is now {generation}");
    }

    pub fn register_dynamic(&self, proc: DynamicProc) -> Result<Arc<DynamicProc>> {
        let proc = self.dynamic.register(proc)?;
        self.bump_generation();
        Ok(proc)
    }

    pub fn unregister_dynamic(&self, start_ip: u64) -> Option<Arc<DynamicProc>> {
        let proc = self.dynamic.unregister(start_ip)?;
        self.bump_generation();
        Some(proc)
    }

    pub fn dynamic(&self) -> &DynamicRegistry {
        &self.dynamic
    }

    pub(crate) fn cache(&self) -> &CacheHandle {
        &self.cache
    }

    /// Statistics of the calling thread's view of the cache; `None` when
    /// there is no cache or it is busy.
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.with(|cache| cache.stats()).ok()
    }
}
