//! Reference-counted pools of driver semaphores and fences backing timeline points.
//!
//! Wrappers live in index arenas; a [`SemaphoreRef`] or [`FenceRef`] is a
//! stable slot index that stays valid until the wrapper is destroyed. A wrapper
//! whose count drops to zero goes back on its free list, except for a
//! semaphore that still carries a signal nobody waited on: such a semaphore
//! cannot be signaled again and is destroyed instead.

use ash::prelude::VkResult;
use ash::vk;
use tracing::trace;

use crate::driver::Driver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemaphoreRef(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceRef(usize);

/// A pooled binary semaphore.
#[derive(Debug)]
pub struct PointSemaphore {
    pub semaphore: vk::Semaphore,
    /// A device wait on the most recent signal has been submitted.
    pub device_waited: bool,
    /// A device signal has been submitted.
    pub device_signaled: bool,
    /// Queue index whose FIFO order signals this semaphore.
    pub queue: Option<usize>,
    refcount: u32,
}

impl PointSemaphore {
    /// Safe to hand out again: nothing signaled it, or its signal was consumed.
    fn reusable(&self) -> bool {
        self.device_waited || !self.device_signaled
    }
}

#[derive(Debug)]
pub struct PointFence {
    pub fence: vk::Fence,
    refcount: u32,
}

/// Counters observable by tests and trace logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub semaphores_created: u64,
    pub semaphores_recycled: u64,
    pub semaphores_destroyed: u64,
    pub fences_created: u64,
    pub fences_recycled: u64,
    pub free_semaphores: usize,
    pub free_fences: usize,
}

struct Arena<T> {
    slots: Vec<Option<T>>,
    vacant: Vec<usize>,
}

impl<T> Arena<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
        }
    }

    fn insert(&mut self, value: T) -> usize {
        match self.vacant.pop() {
            Some(index) => {
                self.slots[index] = Some(value);
                index
            }
            None => {
                self.slots.push(Some(value));
                self.slots.len() - 1
            }
        }
    }

    fn get(&self, index: usize) -> &T {
        match self.slots.get(index) {
            Some(Some(value)) => value,
            _ => panic!("stale pool reference {index}"),
        }
    }

    fn get_mut(&mut self, index: usize) -> &mut T {
        match self.slots.get_mut(index) {
            Some(Some(value)) => value,
            _ => panic!("stale pool reference {index}"),
        }
    }

    fn remove(&mut self, index: usize) -> T {
        match self.slots.get_mut(index).and_then(Option::take) {
            Some(value) => {
                self.vacant.push(index);
                value
            }
            None => panic!("stale pool reference {index}"),
        }
    }

    fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.vacant.clear();
        self.slots.drain(..).flatten()
    }
}

/// Per-device semaphore and fence pools. Guarded by the device lock.
pub struct Pools {
    semaphores: Arena<PointSemaphore>,
    fences: Arena<PointFence>,
    free_semaphores: Vec<SemaphoreRef>,
    free_fences: Vec<FenceRef>,
    stats: PoolStats,
}

impl Default for Pools {
    fn default() -> Self {
        Self::new()
    }
}

impl Pools {
    pub fn new() -> Self {
        Self {
            semaphores: Arena::new(),
            fences: Arena::new(),
            free_semaphores: Vec::new(),
            free_fences: Vec::new(),
            stats: PoolStats::default(),
        }
    }

    // ── Semaphores ──────────────────────────────────────────

    /// Pop a free semaphore or create one. The caller owns one reference.
    pub fn acquire_semaphore(&mut self, driver: &dyn Driver) -> VkResult<SemaphoreRef> {
        if let Some(r) = self.free_semaphores.pop() {
            let entry = self.semaphores.get_mut(r.0);
            entry.device_waited = false;
            entry.device_signaled = false;
            entry.queue = None;
            entry.refcount = 1;
            self.stats.semaphores_recycled += 1;
            return Ok(r);
        }

        let semaphore = driver.create_semaphore()?;
        self.stats.semaphores_created += 1;
        let index = self.semaphores.insert(PointSemaphore {
            semaphore,
            device_waited: false,
            device_signaled: false,
            queue: None,
            refcount: 1,
        });
        trace!(?semaphore, "pool: created semaphore");
        Ok(SemaphoreRef(index))
    }

    pub fn semaphore(&self, r: SemaphoreRef) -> &PointSemaphore {
        self.semaphores.get(r.0)
    }

    pub fn semaphore_mut(&mut self, r: SemaphoreRef) -> &mut PointSemaphore {
        self.semaphores.get_mut(r.0)
    }

    pub fn ref_semaphore(&mut self, r: SemaphoreRef) {
        self.semaphores.get_mut(r.0).refcount += 1;
    }

    pub fn unref_semaphore(&mut self, driver: &dyn Driver, r: SemaphoreRef) {
        let entry = self.semaphores.get_mut(r.0);
        debug_assert!(entry.refcount > 0);
        entry.refcount -= 1;
        if entry.refcount > 0 {
            return;
        }

        if entry.reusable() {
            self.free_semaphores.push(r);
        } else {
            let entry = self.semaphores.remove(r.0);
            trace!(semaphore = ?entry.semaphore, "pool: destroying unwaited semaphore");
            driver.destroy_semaphore(entry.semaphore);
            self.stats.semaphores_destroyed += 1;
        }
    }

    // ── Fences ──────────────────────────────────────────────

    /// Pop a free fence (reset) or create one. The caller owns one reference.
    pub fn acquire_fence(&mut self, driver: &dyn Driver) -> VkResult<FenceRef> {
        if let Some(r) = self.free_fences.pop() {
            let fence = self.fences.get(r.0).fence;
            if let Err(err) = driver.reset_fence(fence) {
                self.free_fences.push(r);
                return Err(err);
            }
            self.fences.get_mut(r.0).refcount = 1;
            self.stats.fences_recycled += 1;
            return Ok(r);
        }

        let fence = driver.create_fence()?;
        self.stats.fences_created += 1;
        let index = self.fences.insert(PointFence { fence, refcount: 1 });
        trace!(?fence, "pool: created fence");
        Ok(FenceRef(index))
    }

    pub fn fence(&self, r: FenceRef) -> vk::Fence {
        self.fences.get(r.0).fence
    }

    pub fn ref_fence(&mut self, r: FenceRef) {
        self.fences.get_mut(r.0).refcount += 1;
    }

    pub fn unref_fence(&mut self, r: FenceRef) {
        let entry = self.fences.get_mut(r.0);
        debug_assert!(entry.refcount > 0);
        entry.refcount -= 1;
        if entry.refcount == 0 {
            self.free_fences.push(r);
        }
    }

    // ── Teardown ────────────────────────────────────────────

    /// Destroy every driver object owned by the pools, referenced or not.
    pub fn destroy_all(&mut self, driver: &dyn Driver) {
        self.free_semaphores.clear();
        self.free_fences.clear();
        for entry in self.semaphores.drain() {
            driver.destroy_semaphore(entry.semaphore);
            self.stats.semaphores_destroyed += 1;
        }
        for entry in self.fences.drain() {
            driver.destroy_fence(entry.fence);
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            free_semaphores: self.free_semaphores.len(),
            free_fences: self.free_fences.len(),
            ..self.stats
        }
    }
}
