//! Deferred submission scheduler.
//!
//! Every queue keeps a FIFO of submissions whose timeline waits could not be
//! resolved yet. A pass replays queue fronts until no queue advances, since a
//! signal replayed on one queue can make another queue's front eligible.

use std::collections::{HashMap, HashSet};

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use tlemu_core::config::SchedulerConfig;
use tlemu_core::handle_map::ObjectMap;
use tracing::{trace, warn};

use crate::driver::Driver;
use crate::pool::{FenceRef, Pools, SemaphoreRef};
use crate::queue::QueueState;
use crate::submission::{QueueSubmission, ResolvedSemaphores, SemaphoreTarget};
use crate::timeline::{ResolvedWait, TimelineSemaphore, WaitPoint};

/// Everything guarded by the device lock.
pub struct DeviceState {
    pub pools: Pools,
    /// Keyed by the handle value handed to the application. Boxed so the
    /// handle (the box address) stays put while the map grows.
    pub timelines: HashMap<u64, Box<TimelineSemaphore>>,
    pub queues: Vec<QueueState>,
}

/// Bookkeeping done while resolving one submission, undone if a driver call fails.
enum Undo {
    Point { timeline: u64, previous_pending: u64 },
    WaitPoint { timeline: u64, resolved: ResolvedWait },
}

/// Why a replay stopped.
enum ReplayError {
    /// Nothing reached the driver; the submission stays as it was.
    NotIssued(vk::Result),
    /// The work was issued but its application fence was not.
    FenceNotIssued(vk::Result),
}

impl DeviceState {
    pub fn new(queues: Vec<QueueState>) -> Self {
        Self {
            pools: Pools::new(),
            timelines: HashMap::new(),
            queues,
        }
    }

    /// Retire finished wait points on every queue.
    pub fn collect_queue_garbage(&mut self, driver: &dyn Driver) -> VkResult<()> {
        for queue in &mut self.queues {
            queue.collect_garbage(&mut self.pools, driver)?;
        }
        Ok(())
    }

    pub fn collect_timeline_garbage(&mut self, driver: &dyn Driver, handle: u64) -> VkResult<()> {
        if let Some(timeline) = self.timelines.get_mut(&handle) {
            timeline.collect_garbage(&mut self.pools, driver)?;
        }
        Ok(())
    }

    /// Queue `submission` on `queue_index`, first moving any temporary
    /// payload it waits on into a pooled semaphore.
    pub fn enqueue(
        &mut self,
        driver: &dyn Driver,
        temporaries: &ObjectMap<()>,
        queue_index: usize,
        mut submission: QueueSubmission,
    ) -> VkResult<()> {
        for i in 0..submission.waits.len() {
            let SemaphoreTarget::Binary(semaphore) = submission.waits[i].target else {
                continue;
            };
            if !temporaries.contains(semaphore.as_raw()) {
                continue;
            }
            match self.clone_temporary(driver, queue_index, semaphore) {
                Ok((clone, handle)) => {
                    temporaries.remove(semaphore.as_raw());
                    submission.waits[i].target = SemaphoreTarget::Binary(handle);
                    submission.clones.push(clone);
                }
                Err(err) => {
                    // The submission is dropped, so nothing will wait on the clones made so far.
                    for clone in std::mem::take(&mut submission.clones) {
                        self.pools.semaphore_mut(clone).device_waited = false;
                        self.consume_signal(driver, clone);
                    }
                    return Err(err);
                }
            }
        }

        trace!(
            queue = queue_index,
            depth = self.queues[queue_index].pending.len() + 1,
            "deferring submission"
        );
        self.queues[queue_index].pending.push_back(submission);
        Ok(())
    }

    /// Consume the temporary payload of `semaphore` right away with a
    /// wait -> signal submission into a pooled semaphore the deferred work
    /// can wait on later. Returns the pooled semaphore with one reference
    /// owned by the caller.
    fn clone_temporary(
        &mut self,
        driver: &dyn Driver,
        queue_index: usize,
        semaphore: vk::Semaphore,
    ) -> VkResult<(SemaphoreRef, vk::Semaphore)> {
        let clone = self.pools.acquire_semaphore(driver)?;
        let fence = match self.pools.acquire_fence(driver) {
            Ok(fence) => fence,
            Err(err) => {
                self.pools.unref_semaphore(driver, clone);
                return Err(err);
            }
        };
        let handle = self.pools.semaphore(clone).semaphore;
        let queue = self.queues[queue_index].handle;

        let waits = [semaphore];
        let stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let signals = [handle];
        let info = vk::SubmitInfo::default()
            .wait_semaphores(&waits)
            .wait_dst_stage_mask(&stages)
            .signal_semaphores(&signals);
        if let Err(err) = driver.queue_submit(queue, std::slice::from_ref(&info), self.pools.fence(fence)) {
            self.pools.unref_semaphore(driver, clone);
            self.pools.unref_fence(fence);
            return Err(err);
        }
        trace!(queue = queue_index, ?semaphore, "cloned temporary payload");

        let entry = self.pools.semaphore_mut(clone);
        entry.device_signaled = true;
        entry.device_waited = true;
        entry.queue = Some(queue_index);
        self.pools.ref_semaphore(clone);
        self.queues[queue_index].wait_points.push_back(WaitPoint {
            source: None,
            semaphore: clone,
            fence,
        });
        Ok((clone, handle))
    }

    fn is_eligible(&self, submission: &QueueSubmission) -> bool {
        submission.waits.iter().all(|wait| match wait.target {
            SemaphoreTarget::Binary(_) => true,
            SemaphoreTarget::Timeline { handle, value } => self
                .timelines
                .get(&handle)
                .map_or(true, |timeline| timeline.highest_pending >= value),
        })
    }

    /// Replay queue fronts until no queue advances. Returns whether anything
    /// was replayed, alongside the first driver error, which ends the pass.
    pub fn submit_deferred(&mut self, driver: &dyn Driver, config: SchedulerConfig) -> (bool, VkResult<()>) {
        let mut advanced_any = false;
        loop {
            let mut advanced = false;
            for queue_index in 0..self.queues.len() {
                loop {
                    let eligible = match self.queues[queue_index].pending.front() {
                        Some(front) => self.is_eligible(front),
                        None => false,
                    };
                    if !eligible {
                        break;
                    }
                    let Some(mut submission) = self.queues[queue_index].pending.pop_front() else {
                        break;
                    };

                    match self.replay(driver, config, queue_index, &mut submission) {
                        Ok(()) => {
                            trace!(queue = queue_index, "replayed deferred submission");
                            advanced = true;
                        }
                        Err(ReplayError::NotIssued(err)) => {
                            warn!(queue = queue_index, ?err, "deferred submission failed, kept queued");
                            self.queues[queue_index].pending.push_front(submission);
                            return (advanced_any || advanced, Err(err));
                        }
                        Err(ReplayError::FenceNotIssued(err)) => {
                            warn!(queue = queue_index, ?err, "fence submission failed, kept queued");
                            self.queues[queue_index]
                                .pending
                                .push_front(QueueSubmission::fence_only(submission.kind(), submission.fence));
                            return (true, Err(err));
                        }
                    }
                }
            }
            advanced_any |= advanced;
            if !advanced {
                return (advanced_any, Ok(()));
            }
        }
    }

    fn replay(
        &mut self,
        driver: &dyn Driver,
        config: SchedulerConfig,
        queue_index: usize,
        submission: &mut QueueSubmission,
    ) -> Result<(), ReplayError> {
        let point_fence = self.pools.acquire_fence(driver).map_err(ReplayError::NotIssued)?;
        let mut journal = Vec::new();

        let touched = match self.resolve_and_issue(driver, config, queue_index, submission, point_fence, &mut journal) {
            Ok(touched) => touched,
            Err(err) => {
                self.rollback(driver, journal);
                self.pools.unref_fence(point_fence);
                return Err(ReplayError::NotIssued(err));
            }
        };

        // The clones now belong to the queue until the work that consumes them retires.
        for clone in submission.clones.drain(..) {
            self.pools.ref_fence(point_fence);
            self.queues[queue_index].wait_points.push_back(WaitPoint {
                source: None,
                semaphore: clone,
                fence: point_fence,
            });
        }
        self.pools.unref_fence(point_fence);
        debug_assert!(touched || journal.is_empty());

        if submission.fence != vk::Fence::null() {
            let queue = self.queues[queue_index].handle;
            submission
                .kind()
                .submit_fence(driver, queue, submission.fence)
                .map_err(ReplayError::FenceNotIssued)?;
        }
        Ok(())
    }

    /// Resolve every operand, then issue serializing signals and the work
    /// itself. Returns whether the point fence was attached.
    fn resolve_and_issue(
        &mut self,
        driver: &dyn Driver,
        config: SchedulerConfig,
        queue_index: usize,
        submission: &QueueSubmission,
        point_fence: FenceRef,
        journal: &mut Vec<Undo>,
    ) -> VkResult<bool> {
        let mut resolved = ResolvedSemaphores::default();
        let mut serializing: Vec<(usize, SemaphoreRef)> = Vec::new();
        let mut touched = !submission.clones.is_empty();

        for wait in &submission.waits {
            match wait.target {
                SemaphoreTarget::Binary(semaphore) => resolved.push_wait(semaphore, wait),
                SemaphoreTarget::Timeline { handle, value } => {
                    let Some(timeline) = self.timelines.get_mut(&handle) else {
                        continue;
                    };
                    let Some(r) = timeline.create_wait_point(&mut self.pools, driver, value, point_fence)? else {
                        continue;
                    };
                    touched = true;
                    resolved.push_wait(r.semaphore, wait);
                    if let Some(source_queue) = r.serialize_on {
                        serializing.push((source_queue, r.wait_semaphore));
                    }
                    journal.push(Undo::WaitPoint { timeline: handle, resolved: r });
                }
            }
        }

        for signal in &submission.signals {
            match signal.target {
                SemaphoreTarget::Binary(semaphore) => resolved.push_signal(semaphore, signal),
                SemaphoreTarget::Timeline { handle, value } => {
                    let Some(timeline) = self.timelines.get_mut(&handle) else {
                        continue;
                    };
                    let previous_pending = timeline.highest_pending;
                    let semaphore =
                        timeline.create_point(&mut self.pools, driver, queue_index, value, point_fence)?;
                    touched = true;
                    resolved.push_signal(semaphore, signal);
                    journal.push(Undo::Point { timeline: handle, previous_pending });
                }
            }
        }

        self.issue_serializing(driver, config, &serializing)?;

        let fence = if touched {
            self.pools.fence(point_fence)
        } else {
            vk::Fence::null()
        };
        if touched || !submission.is_empty() {
            submission.issue(driver, self.queues[queue_index].handle, &resolved, fence)?;
        }
        Ok(touched)
    }

    /// Signal-only submissions that fan a point's signal out to extra
    /// consumers. FIFO order on the point's queue places each one after the
    /// point itself.
    fn issue_serializing(
        &mut self,
        driver: &dyn Driver,
        config: SchedulerConfig,
        serializing: &[(usize, SemaphoreRef)],
    ) -> VkResult<()> {
        let batches: Vec<(usize, Vec<SemaphoreRef>)> = if config.batch_serializing_submits {
            let mut order = Vec::new();
            let mut seen = HashSet::new();
            for &(queue, _) in serializing {
                if seen.insert(queue) {
                    order.push(queue);
                }
            }
            order
                .into_iter()
                .map(|queue| {
                    let refs = serializing
                        .iter()
                        .filter(|(q, _)| *q == queue)
                        .map(|&(_, r)| r)
                        .collect();
                    (queue, refs)
                })
                .collect()
        } else {
            serializing.iter().map(|&(queue, r)| (queue, vec![r])).collect()
        };

        for (queue_index, refs) in batches {
            let signals: Vec<vk::Semaphore> = refs.iter().map(|&r| self.pools.semaphore(r).semaphore).collect();
            let info = vk::SubmitInfo::default().signal_semaphores(&signals);
            driver.queue_submit(
                self.queues[queue_index].handle,
                std::slice::from_ref(&info),
                vk::Fence::null(),
            )?;
            trace!(queue = queue_index, count = signals.len(), "serializing submission");
            for r in refs {
                self.pools.semaphore_mut(r).device_signaled = true;
            }
        }
        Ok(())
    }

    fn rollback(&mut self, driver: &dyn Driver, journal: Vec<Undo>) {
        for undo in journal.into_iter().rev() {
            match undo {
                Undo::Point { timeline, previous_pending } => {
                    if let Some(t) = self.timelines.get_mut(&timeline) {
                        t.undo_point(&mut self.pools, driver, previous_pending);
                    }
                }
                Undo::WaitPoint { timeline, resolved } => {
                    let in_flight = match self.timelines.get_mut(&timeline) {
                        Some(t) => t.undo_wait_point(&mut self.pools, driver, &resolved),
                        None => None,
                    };
                    if let Some(semaphore) = in_flight {
                        self.consume_signal(driver, semaphore);
                    }
                }
            }
        }
    }

    /// Take over a semaphore whose signal was submitted but that nothing
    /// will wait on. A wait-only submission on the signaling queue consumes
    /// the signal, and the semaphore returns to the pool once its fence
    /// retires. If that submission fails, the semaphore stays parked on the
    /// queue until the device is destroyed.
    fn consume_signal(&mut self, driver: &dyn Driver, semaphore: SemaphoreRef) {
        let Some(queue_index) = self.pools.semaphore(semaphore).queue else {
            debug_assert!(false, "signaled semaphore without a queue");
            return;
        };
        let fence = match self.pools.acquire_fence(driver) {
            Ok(fence) => fence,
            Err(err) => {
                warn!(queue = queue_index, ?err, "no fence to consume a stray signal, parking semaphore");
                self.queues[queue_index].parked.push(semaphore);
                return;
            }
        };

        let waits = [self.pools.semaphore(semaphore).semaphore];
        let stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let info = vk::SubmitInfo::default()
            .wait_semaphores(&waits)
            .wait_dst_stage_mask(&stages);
        let queue = self.queues[queue_index].handle;
        if let Err(err) = driver.queue_submit(queue, std::slice::from_ref(&info), self.pools.fence(fence)) {
            warn!(queue = queue_index, ?err, "consuming a stray signal failed, parking semaphore");
            self.pools.unref_fence(fence);
            self.queues[queue_index].parked.push(semaphore);
            return;
        }
        trace!(queue = queue_index, "consumed an unwaited signal");

        self.pools.semaphore_mut(semaphore).device_waited = true;
        self.queues[queue_index].wait_points.push_back(WaitPoint {
            source: None,
            semaphore,
            fence,
        });
    }

    /// Release every queue, timeline and pooled object. Returns the number of
    /// submissions that were never replayed.
    pub fn release_all(&mut self, driver: &dyn Driver) -> usize {
        let mut abandoned = 0;
        for queue in &mut self.queues {
            abandoned += queue.release_all(&mut self.pools, driver);
        }
        for (_, mut timeline) in self.timelines.drain() {
            timeline.release_all(&mut self.pools, driver);
        }
        self.pools.destroy_all(driver);
        abandoned
    }
}
