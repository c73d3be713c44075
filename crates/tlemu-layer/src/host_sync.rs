//! Host-side timeline operations: wait, signal and counter queries.

use std::time::{Duration, Instant};

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::MutexGuard;
use tracing::trace;

use crate::device_data::DeviceData;

/// Absolute deadline for a relative timeout; `None` waits forever.
fn deadline(timeout_ns: u64) -> Option<Instant> {
    if timeout_ns == u64::MAX {
        return None;
    }
    Instant::now().checked_add(Duration::from_nanos(timeout_ns))
}

fn remaining_ns(deadline: Option<Instant>) -> u64 {
    match deadline {
        Some(deadline) => {
            let left = deadline.saturating_duration_since(Instant::now());
            u64::try_from(left.as_nanos()).unwrap_or(u64::MAX)
        }
        None => u64::MAX,
    }
}

impl DeviceData {
    /// `vkGetSemaphoreCounterValue`.
    pub fn counter_value(&self, semaphore: vk::Semaphore) -> VkResult<u64> {
        let handle = semaphore.as_raw();
        let mut guard = self.state.lock();
        guard.collect_timeline_garbage(self.driver.as_ref(), handle)?;
        Ok(guard.timelines.get(&handle).map_or(0, |t| t.highest_past))
    }

    /// `vkSignalSemaphore`: host-advance a timeline with no device signals in flight.
    pub fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> VkResult<()> {
        let handle = semaphore.as_raw();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(timeline) = state.timelines.get_mut(&handle) else {
            return Ok(());
        };
        timeline.collect_garbage(&mut state.pools, self.driver.as_ref())?;
        timeline.signal(value);
        trace!(handle = format_args!("{handle:#x}"), value, "host signal");

        let result = self.run_deferred(state);
        self.progress.notify_all();
        result
    }

    /// `vkWaitSemaphores`. `Ok(false)` reports `VK_TIMEOUT`.
    ///
    /// Blocks on the fences of the points that will reach the requested
    /// values once they exist; until then sleeps on the progress condvar.
    pub fn wait_semaphores(
        &self,
        semaphores: &[(vk::Semaphore, u64)],
        wait_any: bool,
        timeout_ns: u64,
    ) -> VkResult<bool> {
        if semaphores.is_empty() {
            return Ok(true);
        }
        let driver = self.driver.as_ref();
        let deadline = deadline(timeout_ns);
        let mut guard = self.state.lock();

        loop {
            let state = &mut *guard;
            let mut satisfied = 0;
            let mut missing = false;
            let mut pinned = Vec::new();
            let mut fences = Vec::new();

            for &(semaphore, value) in semaphores {
                let handle = semaphore.as_raw();
                let Some(timeline) = state.timelines.get_mut(&handle) else {
                    satisfied += 1;
                    continue;
                };
                timeline.collect_garbage(&mut state.pools, driver)?;
                if timeline.highest_past >= value {
                    satisfied += 1;
                    continue;
                }
                match timeline.covering_point(value) {
                    Some(point) => {
                        pinned.push((handle, point.serial));
                        fences.push(state.pools.fence(point.fence));
                    }
                    None => missing = true,
                }
            }

            if (wait_any && satisfied > 0) || satisfied == semaphores.len() {
                return Ok(true);
            }

            let on_fences = if wait_any { !pinned.is_empty() } else { !missing };
            if on_fences {
                for &(handle, serial) in &pinned {
                    if let Some(timeline) = state.timelines.get_mut(&handle) {
                        timeline.pin(serial);
                    }
                }
                let timeout = remaining_ns(deadline);
                let result = MutexGuard::unlocked(&mut guard, || {
                    driver.wait_for_fences(&fences, !wait_any, timeout)
                });
                for &(handle, serial) in &pinned {
                    if let Some(timeline) = guard.timelines.get_mut(&handle) {
                        timeline.unpin(serial);
                    }
                }
                // A signaled covering fence means a signal of at least the
                // requested value completed, whether or not earlier points retired.
                return result;
            }

            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Ok(false);
                    }
                    self.progress.wait_until(&mut guard, deadline);
                }
                None => self.progress.wait(&mut guard),
            }
        }
    }
}
