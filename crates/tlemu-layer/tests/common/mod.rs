//! Scripted driver used by the integration tests.
//!
//! Models binary semaphores, fences and one FIFO per queue. Work on a queue
//! executes as soon as its waits are signaled unless the queue is held, which
//! stands in for a GPU that is still busy.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::{Condvar, Mutex};
use tlemu_core::config::SchedulerConfig;
use tlemu_layer::device_data::{DeviceData, QueueInfo};
use tlemu_layer::driver::Driver;

/// One driver submission as the fake saw it.
#[derive(Debug, Clone)]
pub struct SubmitRecord {
    pub queue: vk::Queue,
    pub waits: Vec<vk::Semaphore>,
    pub signals: Vec<vk::Semaphore>,
    pub command_buffers: usize,
    pub sparse_buffer_binds: usize,
    pub fence: vk::Fence,
    /// Went through `vkQueueBindSparse`.
    pub sparse: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FakeStats {
    pub semaphores_created: u64,
    pub semaphores_destroyed: u64,
    pub fences_created: u64,
    pub fences_destroyed: u64,
    pub fence_waits: u64,
}

struct Op {
    waits: Vec<u64>,
    signals: Vec<u64>,
    fence: u64,
}

#[derive(Default)]
struct FakeQueue {
    held: bool,
    fifo: VecDeque<Op>,
}

#[derive(Default)]
struct FakeState {
    next_handle: u64,
    semaphores: HashMap<u64, bool>,
    fences: HashMap<u64, bool>,
    internal: HashSet<u64>,
    queues: Vec<(u64, FakeQueue)>,
    results: HashMap<&'static str, VecDeque<vk::Result>>,
    log: Vec<SubmitRecord>,
    stats: FakeStats,
}

impl FakeState {
    fn alloc(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn next_result(&mut self, func_name: &'static str) -> vk::Result {
        self.results
            .get_mut(func_name)
            .and_then(VecDeque::pop_front)
            .unwrap_or(vk::Result::SUCCESS)
    }

    fn queue_mut(&mut self, queue: vk::Queue) -> &mut FakeQueue {
        let raw = queue.as_raw();
        &mut self
            .queues
            .iter_mut()
            .find(|(handle, _)| *handle == raw)
            .unwrap_or_else(|| panic!("unknown queue {raw:#x}"))
            .1
    }

    /// Execute every runnable op until nothing moves.
    fn pump(&mut self) {
        loop {
            let mut progressed = false;
            for i in 0..self.queues.len() {
                loop {
                    let (held, runnable) = {
                        let queue = &self.queues[i].1;
                        let runnable = queue.fifo.front().map(|op| {
                            op.waits
                                .iter()
                                .all(|w| self.semaphores.get(w).copied().unwrap_or(false))
                        });
                        (queue.held, runnable)
                    };
                    if held || runnable != Some(true) {
                        break;
                    }
                    let Some(op) = self.queues[i].1.fifo.pop_front() else {
                        break;
                    };
                    for w in &op.waits {
                        self.semaphores.insert(*w, false);
                    }
                    for s in &op.signals {
                        self.semaphores.insert(*s, true);
                    }
                    if op.fence != 0 {
                        self.fences.insert(op.fence, true);
                    }
                    progressed = true;
                }
            }
            if !progressed {
                return;
            }
        }
    }

    fn fences_done(&self, fences: &[vk::Fence], wait_all: bool) -> bool {
        let signaled = |f: &vk::Fence| self.fences.get(&f.as_raw()).copied().unwrap_or(false);
        if wait_all {
            fences.iter().all(signaled)
        } else {
            fences.iter().any(signaled)
        }
    }
}

pub struct FakeDriver {
    state: Mutex<FakeState>,
    progress: Condvar,
}

impl FakeDriver {
    pub fn new(queue_count: usize) -> Arc<Self> {
        let mut state = FakeState {
            next_handle: 0x1000,
            ..Default::default()
        };
        for _ in 0..queue_count {
            let handle = state.alloc();
            state.queues.push((handle, FakeQueue::default()));
        }
        Arc::new(Self {
            state: Mutex::new(state),
            progress: Condvar::new(),
        })
    }

    pub fn queue(&self, index: usize) -> vk::Queue {
        vk::Queue::from_raw(self.state.lock().queues[index].0)
    }

    pub fn queue_infos(&self) -> Vec<QueueInfo> {
        let state = self.state.lock();
        let properties = vk::QueueFamilyProperties {
            queue_flags: vk::QueueFlags::GRAPHICS
                | vk::QueueFlags::COMPUTE
                | vk::QueueFlags::SPARSE_BINDING,
            queue_count: state.queues.len() as u32,
            ..Default::default()
        };
        state
            .queues
            .iter()
            .map(|(handle, _)| QueueInfo {
                handle: vk::Queue::from_raw(*handle),
                properties,
            })
            .collect()
    }

    /// A binary semaphore owned by the "application".
    pub fn app_semaphore(&self) -> vk::Semaphore {
        let mut state = self.state.lock();
        let handle = state.alloc();
        state.semaphores.insert(handle, false);
        vk::Semaphore::from_raw(handle)
    }

    pub fn app_fence(&self) -> vk::Fence {
        let mut state = self.state.lock();
        let handle = state.alloc();
        state.fences.insert(handle, false);
        vk::Fence::from_raw(handle)
    }

    /// Signal a semaphore from outside any queue, like a presentation engine.
    pub fn signal_external(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        state.semaphores.insert(semaphore.as_raw(), true);
        state.pump();
        self.progress.notify_all();
    }

    pub fn signal_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        state.fences.insert(fence.as_raw(), true);
        self.progress.notify_all();
    }

    pub fn hold(&self, queue: usize) {
        self.state.lock().queues[queue].1.held = true;
    }

    pub fn release(&self, queue: usize) {
        let mut state = self.state.lock();
        state.queues[queue].1.held = false;
        state.pump();
        self.progress.notify_all();
    }

    /// Make the next call to `func_name` fail with `result`.
    pub fn queue_result(&self, func_name: &'static str, result: vk::Result) {
        self.state
            .lock()
            .results
            .entry(func_name)
            .or_default()
            .push_back(result);
    }

    pub fn is_signaled(&self, fence: vk::Fence) -> bool {
        self.state.lock().fences.get(&fence.as_raw()).copied().unwrap_or(false)
    }

    pub fn submissions(&self) -> Vec<SubmitRecord> {
        self.state.lock().log.clone()
    }

    pub fn submissions_on(&self, queue: usize) -> Vec<SubmitRecord> {
        let queue = self.queue(queue);
        self.submissions().into_iter().filter(|r| r.queue == queue).collect()
    }

    pub fn stats(&self) -> FakeStats {
        self.state.lock().stats
    }

    /// Layer-created semaphores and fences that are still alive.
    pub fn live_internal_objects(&self) -> usize {
        self.state.lock().internal.len()
    }

    fn record(&self, state: &mut FakeState, queue: vk::Queue, record: SubmitRecord, op: Op) {
        state.log.push(record);
        state.queue_mut(queue).fifo.push_back(op);
    }

    /// A call with no batches that only signals `fence` behind earlier work.
    fn record_fence_only(&self, state: &mut FakeState, queue: vk::Queue, fence: vk::Fence, sparse: bool) {
        if fence == vk::Fence::null() {
            return;
        }
        let record = SubmitRecord {
            queue,
            waits: Vec::new(),
            signals: Vec::new(),
            command_buffers: 0,
            sparse_buffer_binds: 0,
            fence,
            sparse,
        };
        let op = Op {
            waits: Vec::new(),
            signals: Vec::new(),
            fence: fence.as_raw(),
        };
        self.record(state, queue, record, op);
    }
}

impl Driver for FakeDriver {
    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let mut state = self.state.lock();
        state.next_result("vkCreateSemaphore").result()?;
        let handle = state.alloc();
        state.semaphores.insert(handle, false);
        state.internal.insert(handle);
        state.stats.semaphores_created += 1;
        Ok(vk::Semaphore::from_raw(handle))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        state.semaphores.remove(&semaphore.as_raw());
        state.internal.remove(&semaphore.as_raw());
        state.stats.semaphores_destroyed += 1;
    }

    fn create_fence(&self) -> VkResult<vk::Fence> {
        let mut state = self.state.lock();
        state.next_result("vkCreateFence").result()?;
        let handle = state.alloc();
        state.fences.insert(handle, false);
        state.internal.insert(handle);
        state.stats.fences_created += 1;
        Ok(vk::Fence::from_raw(handle))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        state.fences.remove(&fence.as_raw());
        state.internal.remove(&fence.as_raw());
        state.stats.fences_destroyed += 1;
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        state.next_result("vkResetFences").result()?;
        state.fences.insert(fence.as_raw(), false);
        Ok(())
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        let state = self.state.lock();
        state
            .fences
            .get(&fence.as_raw())
            .copied()
            .ok_or(vk::Result::ERROR_DEVICE_LOST)
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], wait_all: bool, timeout_ns: u64) -> VkResult<bool> {
        let deadline = Instant::now().checked_add(Duration::from_nanos(timeout_ns));
        let mut state = self.state.lock();
        state.stats.fence_waits += 1;
        loop {
            if state.fences_done(fences, wait_all) {
                return Ok(true);
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Ok(false);
                    }
                    self.progress.wait_until(&mut state, deadline);
                }
                None => self.progress.wait(&mut state),
            }
        }
    }

    fn queue_submit(&self, queue: vk::Queue, submits: &[vk::SubmitInfo<'_>], fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        state.next_result("vkQueueSubmit").result()?;

        if submits.is_empty() {
            self.record_fence_only(&mut state, queue, fence, false);
        }
        for (i, info) in submits.iter().enumerate() {
            let op_fence = if i + 1 == submits.len() { fence } else { vk::Fence::null() };
            let (waits, signals) = unsafe {
                (
                    slice(info.p_wait_semaphores, info.wait_semaphore_count),
                    slice(info.p_signal_semaphores, info.signal_semaphore_count),
                )
            };
            let record = SubmitRecord {
                queue,
                waits: waits.clone(),
                signals: signals.clone(),
                command_buffers: info.command_buffer_count as usize,
                sparse_buffer_binds: 0,
                fence: op_fence,
                sparse: false,
            };
            let op = Op {
                waits: waits.iter().map(|s| s.as_raw()).collect(),
                signals: signals.iter().map(|s| s.as_raw()).collect(),
                fence: op_fence.as_raw(),
            };
            self.record(&mut state, queue, record, op);
        }
        state.pump();
        self.progress.notify_all();
        Ok(())
    }

    fn queue_bind_sparse(&self, queue: vk::Queue, binds: &[vk::BindSparseInfo<'_>], fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        state.next_result("vkQueueBindSparse").result()?;

        if binds.is_empty() {
            self.record_fence_only(&mut state, queue, fence, true);
        }
        for (i, info) in binds.iter().enumerate() {
            let op_fence = if i + 1 == binds.len() { fence } else { vk::Fence::null() };
            let (waits, signals) = unsafe {
                (
                    slice(info.p_wait_semaphores, info.wait_semaphore_count),
                    slice(info.p_signal_semaphores, info.signal_semaphore_count),
                )
            };
            let record = SubmitRecord {
                queue,
                waits: waits.clone(),
                signals: signals.clone(),
                command_buffers: 0,
                sparse_buffer_binds: info.buffer_bind_count as usize,
                fence: op_fence,
                sparse: true,
            };
            let op = Op {
                waits: waits.iter().map(|s| s.as_raw()).collect(),
                signals: signals.iter().map(|s| s.as_raw()).collect(),
                fence: op_fence.as_raw(),
            };
            self.record(&mut state, queue, record, op);
        }
        state.pump();
        self.progress.notify_all();
        Ok(())
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        let mut state = self.state.lock();
        while !state.queue_mut(queue).fifo.is_empty() {
            self.progress.wait(&mut state);
        }
        Ok(())
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        let mut state = self.state.lock();
        while state.queues.iter().any(|(_, q)| !q.fifo.is_empty()) {
            self.progress.wait(&mut state);
        }
        Ok(())
    }
}

unsafe fn slice<T: Copy>(ptr: *const T, len: u32) -> Vec<T> {
    if ptr.is_null() || len == 0 {
        Vec::new()
    } else {
        std::slice::from_raw_parts(ptr, len as usize).to_vec()
    }
}

// ── Submission helpers ──────────────────────────────────────

/// One `VkSubmitInfo`, with timeline values carried next to each semaphore.
#[derive(Default, Clone)]
pub struct Submit {
    pub waits: Vec<(vk::Semaphore, u64)>,
    pub signals: Vec<(vk::Semaphore, u64)>,
    pub command_buffers: Vec<vk::CommandBuffer>,
}

impl Submit {
    pub fn new() -> Self {
        Self {
            command_buffers: vec![vk::CommandBuffer::from_raw(0xc0ffee)],
            ..Default::default()
        }
    }

    pub fn wait(mut self, semaphore: vk::Semaphore, value: u64) -> Self {
        self.waits.push((semaphore, value));
        self
    }

    pub fn signal(mut self, semaphore: vk::Semaphore, value: u64) -> Self {
        self.signals.push((semaphore, value));
        self
    }
}

/// Build the `VkSubmitInfo` array (with chained timeline values) and submit it.
pub fn submit(data: &DeviceData, queue: usize, submits: &[Submit], fence: vk::Fence) -> VkResult<()> {
    let wait_semaphores: Vec<Vec<vk::Semaphore>> =
        submits.iter().map(|s| s.waits.iter().map(|w| w.0).collect()).collect();
    let wait_values: Vec<Vec<u64>> = submits.iter().map(|s| s.waits.iter().map(|w| w.1).collect()).collect();
    let wait_stages: Vec<Vec<vk::PipelineStageFlags>> = submits
        .iter()
        .map(|s| vec![vk::PipelineStageFlags::ALL_COMMANDS; s.waits.len()])
        .collect();
    let signal_semaphores: Vec<Vec<vk::Semaphore>> =
        submits.iter().map(|s| s.signals.iter().map(|w| w.0).collect()).collect();
    let signal_values: Vec<Vec<u64>> =
        submits.iter().map(|s| s.signals.iter().map(|w| w.1).collect()).collect();

    let mut timeline_infos: Vec<vk::TimelineSemaphoreSubmitInfo<'_>> = (0..submits.len())
        .map(|i| {
            vk::TimelineSemaphoreSubmitInfo::default()
                .wait_semaphore_values(&wait_values[i])
                .signal_semaphore_values(&signal_values[i])
        })
        .collect();
    let infos: Vec<vk::SubmitInfo<'_>> = timeline_infos
        .iter_mut()
        .enumerate()
        .map(|(i, timeline)| {
            vk::SubmitInfo::default()
                .wait_semaphores(&wait_semaphores[i])
                .wait_dst_stage_mask(&wait_stages[i])
                .command_buffers(&submits[i].command_buffers)
                .signal_semaphores(&signal_semaphores[i])
                .push_next(timeline)
        })
        .collect();
    unsafe { data.queue_submit(queue, &infos, fence) }
}

pub fn new_device(queue_count: usize) -> (Arc<FakeDriver>, DeviceData) {
    new_device_with(queue_count, SchedulerConfig::default())
}

pub fn new_device_with(queue_count: usize, config: SchedulerConfig) -> (Arc<FakeDriver>, DeviceData) {
    let fake = FakeDriver::new(queue_count);
    let data = DeviceData::new(fake.clone(), &fake.queue_infos(), config);
    (fake, data)
}
