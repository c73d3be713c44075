//! Per-queue state: the FIFO of deferred submissions and payload-clone wait points.

use std::collections::VecDeque;

use ash::prelude::VkResult;
use ash::vk;

use crate::driver::Driver;
use crate::pool::{Pools, SemaphoreRef};
use crate::submission::QueueSubmission;
use crate::timeline::{collect_wait_points, WaitPoint};

#[derive(Debug)]
pub struct QueueState {
    pub handle: vk::Queue,
    pub properties: vk::QueueFamilyProperties,
    /// Never reordered; only the front is ever replayed.
    pub pending: VecDeque<QueueSubmission>,
    pub wait_points: VecDeque<WaitPoint>,
    /// Semaphores with a signal still in flight on this queue that nothing
    /// waits on. Released only at device teardown, after the device is idle.
    pub parked: Vec<SemaphoreRef>,
}

impl QueueState {
    pub fn new(handle: vk::Queue, properties: vk::QueueFamilyProperties) -> Self {
        Self {
            handle,
            properties,
            pending: VecDeque::new(),
            wait_points: VecDeque::new(),
            parked: Vec::new(),
        }
    }

    pub fn is_drained(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn supports_sparse_binding(&self) -> bool {
        self.properties
            .queue_flags
            .contains(vk::QueueFlags::SPARSE_BINDING)
    }

    pub fn collect_garbage(&mut self, pools: &mut Pools, driver: &dyn Driver) -> VkResult<()> {
        collect_wait_points(&mut self.wait_points, pools, driver)
    }

    /// Drop pending work and wait points at device teardown. Returns the
    /// number of submissions that were never replayed.
    pub fn release_all(&mut self, pools: &mut Pools, driver: &dyn Driver) -> usize {
        let abandoned = self.pending.len();
        for submission in self.pending.drain(..) {
            for clone in submission.clones {
                pools.unref_semaphore(driver, clone);
            }
        }
        for wait_point in self.wait_points.drain(..) {
            pools.unref_semaphore(driver, wait_point.semaphore);
            pools.unref_fence(wait_point.fence);
        }
        for semaphore in self.parked.drain(..) {
            pools.unref_semaphore(driver, semaphore);
        }
        abandoned
    }
}
