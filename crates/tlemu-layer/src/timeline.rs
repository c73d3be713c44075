//! The emulated timeline: an ordered list of pending points over pooled binary semaphores.

use std::collections::VecDeque;

use ash::prelude::VkResult;
use ash::vk;
use tracing::trace;

use crate::driver::Driver;
use crate::pool::{FenceRef, Pools, SemaphoreRef};

/// One promised signal of `serial`, issued on `queue`.
#[derive(Debug)]
pub struct TimelinePoint {
    pub serial: u64,
    pub queue: usize,
    pub semaphore: SemaphoreRef,
    /// Shared with every other point created by the same driver submission.
    pub fence: FenceRef,
    /// Host waiters currently blocked on `fence`.
    pub waiting: u32,
}

/// A consumer's hold on a pooled semaphore, released once `fence` signals.
#[derive(Debug)]
pub struct WaitPoint {
    /// Serial of the point this shadows; `None` for a temporary-payload clone.
    pub source: Option<u64>,
    pub semaphore: SemaphoreRef,
    pub fence: FenceRef,
}

/// Binary semaphore a consumer must wait on to observe a timeline value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedWait {
    pub semaphore: vk::Semaphore,
    /// Set when the semaphore is fresh and still needs a signal-only submit
    /// on this queue index to carry the point's signal.
    pub serialize_on: Option<usize>,
    pub wait_semaphore: SemaphoreRef,
}

#[derive(Debug, Default)]
pub struct TimelineSemaphore {
    pub highest_past: u64,
    pub highest_pending: u64,
    points: VecDeque<TimelinePoint>,
    wait_points: VecDeque<WaitPoint>,
}

impl TimelineSemaphore {
    pub fn new(initial_value: u64) -> Self {
        Self {
            highest_past: initial_value,
            highest_pending: initial_value,
            points: VecDeque::new(),
            wait_points: VecDeque::new(),
        }
    }

    pub fn points(&self) -> impl Iterator<Item = &TimelinePoint> {
        self.points.iter()
    }

    pub fn has_points(&self) -> bool {
        !self.points.is_empty()
    }

    /// Append a point signaling `serial` from `queue`, fenced by `fence`.
    /// Returns the binary semaphore the submission must signal.
    pub fn create_point(
        &mut self,
        pools: &mut Pools,
        driver: &dyn Driver,
        queue: usize,
        serial: u64,
        fence: FenceRef,
    ) -> VkResult<vk::Semaphore> {
        debug_assert!(
            serial > self.highest_pending,
            "timeline signal {serial} does not advance past {}",
            self.highest_pending
        );

        let semaphore = pools.acquire_semaphore(driver)?;
        let entry = pools.semaphore_mut(semaphore);
        entry.queue = Some(queue);
        entry.device_signaled = true;
        let handle = entry.semaphore;
        pools.ref_fence(fence);

        self.points.push_back(TimelinePoint {
            serial,
            queue,
            semaphore,
            fence,
            waiting: 0,
        });
        self.highest_pending = serial;
        Ok(handle)
    }

    /// Undo the most recent [`create_point`](Self::create_point); the signal was never submitted.
    pub fn undo_point(&mut self, pools: &mut Pools, driver: &dyn Driver, previous_pending: u64) {
        if let Some(point) = self.points.pop_back() {
            pools.semaphore_mut(point.semaphore).device_signaled = false;
            pools.unref_semaphore(driver, point.semaphore);
            pools.unref_fence(point.fence);
        }
        self.highest_pending = previous_pending;
    }

    /// The lowest point whose value reaches `value`.
    pub fn covering_point(&self, value: u64) -> Option<&TimelinePoint> {
        self.points.iter().find(|p| p.serial >= value)
    }

    /// Resolve a device wait for `value` into a binary semaphore, or `None`
    /// if the host already observed it.
    ///
    /// The first consumer of a point waits on the point's own semaphore. Any
    /// later consumer gets a fresh semaphore that a signal-only submission on
    /// the point's queue must signal, which FIFO order places after the point.
    pub fn create_wait_point(
        &mut self,
        pools: &mut Pools,
        driver: &dyn Driver,
        value: u64,
        fence: FenceRef,
    ) -> VkResult<Option<ResolvedWait>> {
        if self.highest_past >= value {
            return Ok(None);
        }
        let Some(point) = self.points.iter().find(|p| p.serial >= value) else {
            debug_assert!(false, "wait for {value} beyond highest pending {}", self.highest_pending);
            return Ok(None);
        };
        let (serial, point_queue, point_semaphore) = (point.serial, point.queue, point.semaphore);

        let source = pools.semaphore(point_semaphore);
        let resolved = if !source.device_waited && source.device_signaled {
            pools.semaphore_mut(point_semaphore).device_waited = true;
            pools.ref_semaphore(point_semaphore);
            ResolvedWait {
                semaphore: pools.semaphore(point_semaphore).semaphore,
                serialize_on: None,
                wait_semaphore: point_semaphore,
            }
        } else {
            let fresh = pools.acquire_semaphore(driver)?;
            let entry = pools.semaphore_mut(fresh);
            entry.queue = Some(point_queue);
            entry.device_waited = true;
            trace!(serial, queue = point_queue, "timeline: point needs a serializing signal");
            ResolvedWait {
                semaphore: entry.semaphore,
                serialize_on: Some(point_queue),
                wait_semaphore: fresh,
            }
        };

        pools.ref_fence(fence);
        self.wait_points.push_back(WaitPoint {
            source: Some(serial),
            semaphore: resolved.wait_semaphore,
            fence,
        });
        Ok(Some(resolved))
    }

    /// Undo the most recent [`create_wait_point`](Self::create_wait_point); the wait was never submitted.
    ///
    /// A fresh semaphore whose serializing signal already reached the driver
    /// cannot be released yet. It is returned with the wait point's
    /// reference, and the caller must consume that signal.
    pub fn undo_wait_point(
        &mut self,
        pools: &mut Pools,
        driver: &dyn Driver,
        resolved: &ResolvedWait,
    ) -> Option<SemaphoreRef> {
        let wait_point = self.wait_points.pop_back()?;
        debug_assert_eq!(wait_point.semaphore, resolved.wait_semaphore);
        pools.unref_fence(wait_point.fence);

        let entry = pools.semaphore_mut(wait_point.semaphore);
        entry.device_waited = false;
        if resolved.serialize_on.is_some() && entry.device_signaled {
            return Some(wait_point.semaphore);
        }
        pools.unref_semaphore(driver, wait_point.semaphore);
        None
    }

    /// Retire completed wait points and points, strictly in order.
    pub fn collect_garbage(&mut self, pools: &mut Pools, driver: &dyn Driver) -> VkResult<()> {
        collect_wait_points(&mut self.wait_points, pools, driver)?;

        while let Some(point) = self.points.front() {
            if point.waiting > 0 || !driver.fence_status(pools.fence(point.fence))? {
                break;
            }
            let serial = point.serial;
            if let Some(point) = self.points.pop_front() {
                pools.unref_semaphore(driver, point.semaphore);
                pools.unref_fence(point.fence);
            }
            self.highest_past = self.highest_past.max(serial);
        }
        Ok(())
    }

    /// Pin the point carrying `serial` against collection.
    pub fn pin(&mut self, serial: u64) {
        if let Some(point) = self.points.iter_mut().find(|p| p.serial == serial) {
            point.waiting += 1;
        }
    }

    pub fn unpin(&mut self, serial: u64) {
        if let Some(point) = self.points.iter_mut().find(|p| p.serial == serial) {
            debug_assert!(point.waiting > 0);
            point.waiting -= 1;
        }
    }

    /// Host signal. Only valid with no device-side points outstanding.
    pub fn signal(&mut self, value: u64) {
        debug_assert!(
            self.points.is_empty(),
            "host signal while device signals are pending"
        );
        debug_assert!(value >= self.highest_past, "host signal moves the counter back");
        self.highest_past = value;
        self.highest_pending = self.highest_pending.max(value);
    }

    /// Drop every point and wait point without waiting on them.
    pub fn release_all(&mut self, pools: &mut Pools, driver: &dyn Driver) {
        for wait_point in self.wait_points.drain(..) {
            pools.unref_semaphore(driver, wait_point.semaphore);
            pools.unref_fence(wait_point.fence);
        }
        for point in self.points.drain(..) {
            pools.unref_semaphore(driver, point.semaphore);
            pools.unref_fence(point.fence);
        }
    }
}

/// Release wait points whose fence has signaled, stopping at the first that has not.
pub fn collect_wait_points(
    wait_points: &mut VecDeque<WaitPoint>,
    pools: &mut Pools,
    driver: &dyn Driver,
) -> VkResult<()> {
    while let Some(wait_point) = wait_points.front() {
        if !driver.fence_status(pools.fence(wait_point.fence))? {
            break;
        }
        if let Some(wait_point) = wait_points.pop_front() {
            trace!(source = ?wait_point.source, "timeline: wait point retired");
            pools.unref_semaphore(driver, wait_point.semaphore);
            pools.unref_fence(wait_point.fence);
        }
    }
    Ok(())
}
