//! Per-device emulation state and the queue-facing operations.
//!
//! One [`parking_lot::Mutex`] guards every point, pool and queue FIFO of the
//! device; the paired [`Condvar`] is broadcast whenever a pass advances or a
//! timeline is host-signaled. Handle classification (is this semaphore a
//! timeline, does it hold a temporary payload) goes through [`ObjectMap`]s
//! and never needs the device lock.

use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tlemu_core::config::SchedulerConfig;
use tlemu_core::handle_map::ObjectMap;
use tracing::{debug, trace, warn};

use crate::driver::Driver;
use crate::pnext;
use crate::pool::PoolStats;
use crate::queue::QueueState;
use crate::scheduler::DeviceState;
use crate::submission::{QueueSubmission, SubmitKind};
use crate::timeline::TimelineSemaphore;

/// A queue as the device was created with it.
#[derive(Debug, Clone, Copy)]
pub struct QueueInfo {
    pub handle: vk::Queue,
    pub properties: vk::QueueFamilyProperties,
}

pub struct DeviceData {
    pub(crate) state: Mutex<DeviceState>,
    pub(crate) progress: Condvar,
    pub(crate) driver: Arc<dyn Driver>,
    timelines: ObjectMap<()>,
    temporaries: ObjectMap<()>,
    config: SchedulerConfig,
}

impl DeviceData {
    pub fn new(driver: Arc<dyn Driver>, queues: &[QueueInfo], config: SchedulerConfig) -> Self {
        let queues = queues
            .iter()
            .map(|q| QueueState::new(q.handle, q.properties))
            .collect();
        Self {
            state: Mutex::new(DeviceState::new(queues)),
            progress: Condvar::new(),
            driver,
            timelines: ObjectMap::new(),
            temporaries: ObjectMap::new(),
            config,
        }
    }

    /// Run one scheduling pass and wake everyone blocked on progress.
    pub(crate) fn run_deferred(&self, state: &mut DeviceState) -> VkResult<()> {
        let (advanced, result) = state.submit_deferred(self.driver.as_ref(), self.config);
        if advanced {
            self.progress.notify_all();
        }
        result
    }

    // ── Semaphores ──────────────────────────────────────────

    /// Create an emulated timeline and return the handle the application sees.
    pub fn create_timeline(&self, initial_value: u64) -> vk::Semaphore {
        let timeline = Box::new(TimelineSemaphore::new(initial_value));
        let handle = &*timeline as *const TimelineSemaphore as u64;
        self.state.lock().timelines.insert(handle, timeline);
        self.timelines.insert(handle, ());
        debug!(handle = format_args!("{handle:#x}"), initial_value, "created timeline semaphore");
        vk::Semaphore::from_raw(handle)
    }

    pub fn destroy_timeline(&self, semaphore: vk::Semaphore) {
        let handle = semaphore.as_raw();
        if self.timelines.remove(handle).is_none() {
            return;
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(mut timeline) = state.timelines.remove(&handle) {
            if let Err(err) = timeline.collect_garbage(&mut state.pools, self.driver.as_ref()) {
                warn!(?err, "collecting timeline before destruction failed");
            }
            timeline.release_all(&mut state.pools, self.driver.as_ref());
        }
        debug!(handle = format_args!("{handle:#x}"), "destroyed timeline semaphore");
    }

    pub fn is_timeline(&self, semaphore: vk::Semaphore) -> bool {
        self.timelines.contains(semaphore.as_raw())
    }

    /// Record that `semaphore` currently holds a temporary imported payload.
    pub fn mark_temporary(&self, semaphore: vk::Semaphore) {
        if semaphore != vk::Semaphore::null() {
            self.temporaries.insert(semaphore.as_raw(), ());
        }
    }

    pub fn is_temporary(&self, semaphore: vk::Semaphore) -> bool {
        self.temporaries.contains(semaphore.as_raw())
    }

    /// Forget a binary semaphore the application destroyed.
    pub fn forget_semaphore(&self, semaphore: vk::Semaphore) {
        self.temporaries.remove(semaphore.as_raw());
    }

    // ── Queue operations ────────────────────────────────────

    fn references_timeline(&self, waits: &[vk::Semaphore], signals: &[vk::Semaphore]) -> bool {
        waits.iter().chain(signals).any(|&s| self.is_timeline(s))
    }

    /// `vkQueueSubmit` on the queue at `queue_index`.
    ///
    /// # Safety
    /// Every pointer reachable from `submits` must be valid for the call.
    pub unsafe fn queue_submit(
        &self,
        queue_index: usize,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> VkResult<()> {
        let driver = self.driver.as_ref();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let queue = state.queues[queue_index].handle;
        state.queues[queue_index].collect_garbage(&mut state.pools, driver)?;

        if submits.is_empty() {
            return self.submit_fence_only(state, queue_index, SubmitKind::Submit, fence);
        }

        let uses_timeline = submits.iter().any(|info| unsafe {
            self.references_timeline(
                pnext::array(info.p_wait_semaphores, info.wait_semaphore_count),
                pnext::array(info.p_signal_semaphores, info.signal_semaphore_count),
            )
        });
        if state.queues[queue_index].is_drained() && !uses_timeline {
            for info in submits {
                for s in unsafe { pnext::array(info.p_wait_semaphores, info.wait_semaphore_count) } {
                    self.temporaries.remove(s.as_raw());
                }
            }
            return driver.queue_submit(queue, submits, fence);
        }

        let is_timeline = |s: vk::Semaphore| self.is_timeline(s);
        let last = submits.len() - 1;
        for (i, info) in submits.iter().enumerate() {
            let submission_fence = if i == last { fence } else { vk::Fence::null() };
            let submission =
                unsafe { QueueSubmission::from_submit_info(info, submission_fence, &is_timeline) };
            state.enqueue(driver, &self.temporaries, queue_index, submission)?;
        }
        self.run_deferred(state)
    }

    /// `vkQueueBindSparse` on the queue at `queue_index`.
    ///
    /// # Safety
    /// Every pointer reachable from `binds` must be valid for the call.
    pub unsafe fn queue_bind_sparse(
        &self,
        queue_index: usize,
        binds: &[vk::BindSparseInfo<'_>],
        fence: vk::Fence,
    ) -> VkResult<()> {
        let driver = self.driver.as_ref();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let queue = state.queues[queue_index].handle;
        debug_assert!(state.queues[queue_index].supports_sparse_binding());
        state.queues[queue_index].collect_garbage(&mut state.pools, driver)?;

        if binds.is_empty() {
            return self.submit_fence_only(state, queue_index, SubmitKind::BindSparse, fence);
        }

        let uses_timeline = binds.iter().any(|info| unsafe {
            self.references_timeline(
                pnext::array(info.p_wait_semaphores, info.wait_semaphore_count),
                pnext::array(info.p_signal_semaphores, info.signal_semaphore_count),
            )
        });
        if state.queues[queue_index].is_drained() && !uses_timeline {
            for info in binds {
                for s in unsafe { pnext::array(info.p_wait_semaphores, info.wait_semaphore_count) } {
                    self.temporaries.remove(s.as_raw());
                }
            }
            return driver.queue_bind_sparse(queue, binds, fence);
        }

        let is_timeline = |s: vk::Semaphore| self.is_timeline(s);
        let last = binds.len() - 1;
        for (i, info) in binds.iter().enumerate() {
            let submission_fence = if i == last { fence } else { vk::Fence::null() };
            let submission =
                unsafe { QueueSubmission::from_bind_sparse_info(info, submission_fence, &is_timeline) };
            state.enqueue(driver, &self.temporaries, queue_index, submission)?;
        }
        self.run_deferred(state)
    }

    /// A call with no work still has to signal its fence after everything queued before it.
    fn submit_fence_only(
        &self,
        state: &mut DeviceState,
        queue_index: usize,
        kind: SubmitKind,
        fence: vk::Fence,
    ) -> VkResult<()> {
        if fence == vk::Fence::null() {
            return Ok(());
        }
        let queue = &mut state.queues[queue_index];
        if queue.is_drained() {
            return kind.submit_fence(self.driver.as_ref(), queue.handle, fence);
        }
        trace!(queue = queue_index, ?kind, "queueing fence-only placeholder");
        queue.pending.push_back(QueueSubmission::fence_only(kind, fence));
        Ok(())
    }

    /// Block until every deferred submission of `queue_index` reached the driver.
    pub fn drain_queue(&self, queue_index: usize) -> VkResult<()> {
        let mut guard = self.state.lock();
        self.drain_locked(&mut guard, |state| state.queues[queue_index].is_drained())
    }

    fn drain_locked(
        &self,
        guard: &mut MutexGuard<'_, DeviceState>,
        drained: impl Fn(&DeviceState) -> bool,
    ) -> VkResult<()> {
        loop {
            self.run_deferred(&mut **guard)?;
            if drained(&**guard) {
                return Ok(());
            }
            self.progress.wait(guard);
        }
    }

    /// `vkQueueWaitIdle`: drain the layer's FIFO, then wait for the driver.
    pub fn queue_wait_idle(&self, queue_index: usize) -> VkResult<()> {
        let queue = {
            let mut guard = self.state.lock();
            self.drain_locked(&mut guard, |state| state.queues[queue_index].is_drained())?;
            guard.queues[queue_index].handle
        };
        self.driver.queue_wait_idle(queue)?;

        let mut guard = self.state.lock();
        guard.collect_queue_garbage(self.driver.as_ref())
    }

    /// `vkDeviceWaitIdle`: drain every FIFO, then wait for the driver.
    pub fn device_wait_idle(&self) -> VkResult<()> {
        {
            let mut guard = self.state.lock();
            self.drain_locked(&mut guard, |state| state.queues.iter().all(QueueState::is_drained))?;
        }
        self.driver.device_wait_idle()?;

        let mut guard = self.state.lock();
        guard.collect_queue_garbage(self.driver.as_ref())
    }

    /// Release everything before the driver's `vkDestroyDevice`.
    pub fn destroy(&self) {
        let driver = self.driver.as_ref();
        let mut guard = self.state.lock();
        if let Err(err) = self.run_deferred(&mut guard) {
            warn!(?err, "deferred submissions failed during device teardown");
        }
        if let Err(err) = driver.device_wait_idle() {
            warn!(?err, "device wait idle failed during teardown");
        }
        let abandoned = guard.release_all(driver);
        if abandoned > 0 {
            warn!(abandoned, "device destroyed with submissions still waiting on timelines");
        }
        for handle in self.timelines.keys() {
            self.timelines.remove(handle);
        }
        self.progress.notify_all();
    }

    // ── Introspection ───────────────────────────────────────

    /// `(highest_past, highest_pending)` of a timeline, without collecting.
    pub fn timeline_values(&self, semaphore: vk::Semaphore) -> Option<(u64, u64)> {
        self.state
            .lock()
            .timelines
            .get(&semaphore.as_raw())
            .map(|t| (t.highest_past, t.highest_pending))
    }

    pub fn pending_submissions(&self, queue_index: usize) -> usize {
        self.state
            .lock()
            .queues
            .get(queue_index)
            .map_or(0, |q| q.pending.len())
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.state.lock().pools.stats()
    }
}
