//! Deferred queue submissions: owned copies of `VkSubmitInfo` / `VkBindSparseInfo`.
//!
//! A submission is copied when it cannot be handed to the driver right away.
//! Its timeline references stay symbolic until the scheduler resolves them
//! into binary semaphores at replay time.

use ash::prelude::VkResult;
use ash::vk;
use tracing::warn;

use crate::driver::Driver;
use crate::pnext;
use crate::pool::SemaphoreRef;

/// A semaphore operand before resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreTarget {
    Binary(vk::Semaphore),
    Timeline { handle: u64, value: u64 },
}

#[derive(Debug, Clone, Copy)]
pub struct WaitEntry {
    pub target: SemaphoreTarget,
    pub stage: vk::PipelineStageFlags,
    pub device_index: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct SignalEntry {
    pub target: SemaphoreTarget,
    pub device_index: u32,
}

#[derive(Debug, Clone, Default)]
pub struct SparseBinds {
    pub buffer_binds: Vec<(vk::Buffer, Vec<vk::SparseMemoryBind>)>,
    pub image_opaque_binds: Vec<(vk::Image, Vec<vk::SparseMemoryBind>)>,
    pub image_binds: Vec<(vk::Image, Vec<vk::SparseImageMemoryBind>)>,
}

impl SparseBinds {
    fn is_empty(&self) -> bool {
        self.buffer_binds.is_empty() && self.image_opaque_binds.is_empty() && self.image_binds.is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum Payload {
    Submit { command_buffers: Vec<vk::CommandBuffer> },
    BindSparse(SparseBinds),
}

/// The driver entry point a submission goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitKind {
    Submit,
    BindSparse,
}

impl SubmitKind {
    /// Signal `fence` once all earlier work on `queue` completes, through the matching entry point.
    pub fn submit_fence(self, driver: &dyn Driver, queue: vk::Queue, fence: vk::Fence) -> VkResult<()> {
        match self {
            SubmitKind::Submit => driver.queue_submit(queue, &[], fence),
            SubmitKind::BindSparse => driver.queue_bind_sparse(queue, &[], fence),
        }
    }
}

/// Extension structures carried over from the application's `pNext` chain.
#[derive(Debug, Clone, Default)]
pub struct ExtensionChain {
    pub protected_submit: Option<bool>,
    /// `VkDeviceGroupSubmitInfo` command buffer masks; semaphore device
    /// indices travel with the wait and signal entries.
    pub device_group_masks: Option<Vec<u32>>,
    /// `VkDeviceGroupBindSparseInfo` (resource, memory) device indices.
    pub device_group_bind_sparse: Option<(u32, u32)>,
}

/// Binary semaphore arrays produced by resolving a submission.
#[derive(Debug, Default)]
pub struct ResolvedSemaphores {
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub wait_stages: Vec<vk::PipelineStageFlags>,
    pub wait_device_indices: Vec<u32>,
    pub signal_semaphores: Vec<vk::Semaphore>,
    pub signal_device_indices: Vec<u32>,
}

impl ResolvedSemaphores {
    pub fn push_wait(&mut self, semaphore: vk::Semaphore, entry: &WaitEntry) {
        self.wait_semaphores.push(semaphore);
        self.wait_stages.push(entry.stage);
        self.wait_device_indices.push(entry.device_index);
    }

    pub fn push_signal(&mut self, semaphore: vk::Semaphore, entry: &SignalEntry) {
        self.signal_semaphores.push(semaphore);
        self.signal_device_indices.push(entry.device_index);
    }
}

#[derive(Debug)]
pub struct QueueSubmission {
    pub payload: Payload,
    pub chain: ExtensionChain,
    pub waits: Vec<WaitEntry>,
    pub signals: Vec<SignalEntry>,
    /// Application fence, signaled by its own empty submission after the work.
    pub fence: vk::Fence,
    /// Pooled copies of temporary payloads this submission waits on.
    pub clones: Vec<SemaphoreRef>,
}

impl QueueSubmission {
    /// Placeholder whose only job is to signal `fence` in queue order.
    pub fn fence_only(kind: SubmitKind, fence: vk::Fence) -> Self {
        let payload = match kind {
            SubmitKind::Submit => Payload::Submit {
                command_buffers: Vec::new(),
            },
            SubmitKind::BindSparse => Payload::BindSparse(SparseBinds::default()),
        };
        Self {
            payload,
            chain: ExtensionChain::default(),
            waits: Vec::new(),
            signals: Vec::new(),
            fence,
            clones: Vec::new(),
        }
    }

    /// Deep-copy one `VkSubmitInfo`.
    ///
    /// # Safety
    /// Every pointer in `info` and its `pNext` chain must be valid.
    pub unsafe fn from_submit_info(
        info: &vk::SubmitInfo<'_>,
        fence: vk::Fence,
        is_timeline: &dyn Fn(vk::Semaphore) -> bool,
    ) -> Self {
        let wait_semaphores = unsafe { pnext::array(info.p_wait_semaphores, info.wait_semaphore_count) };
        let wait_stages = unsafe { pnext::array(info.p_wait_dst_stage_mask, info.wait_semaphore_count) };
        let signal_semaphores =
            unsafe { pnext::array(info.p_signal_semaphores, info.signal_semaphore_count) };
        let command_buffers =
            unsafe { pnext::array(info.p_command_buffers, info.command_buffer_count) }.to_vec();

        let mut chain = ExtensionChain::default();
        let mut wait_device_indices: &[u32] = &[];
        let mut signal_device_indices: &[u32] = &[];
        if let Some(protected) = unsafe {
            pnext::find::<vk::ProtectedSubmitInfo<'_>>(info.p_next, vk::StructureType::PROTECTED_SUBMIT_INFO)
        } {
            chain.protected_submit = Some(protected.protected_submit != vk::FALSE);
        }
        if let Some(group) = unsafe {
            pnext::find::<vk::DeviceGroupSubmitInfo<'_>>(info.p_next, vk::StructureType::DEVICE_GROUP_SUBMIT_INFO)
        } {
            unsafe {
                wait_device_indices =
                    pnext::array(group.p_wait_semaphore_device_indices, group.wait_semaphore_count);
                signal_device_indices =
                    pnext::array(group.p_signal_semaphore_device_indices, group.signal_semaphore_count);
                chain.device_group_masks = Some(
                    pnext::array(group.p_command_buffer_device_masks, group.command_buffer_count).to_vec(),
                );
            }
        }
        unsafe {
            warn_unsupported(
                info.p_next,
                &[
                    vk::StructureType::PROTECTED_SUBMIT_INFO,
                    vk::StructureType::DEVICE_GROUP_SUBMIT_INFO,
                ],
            );
        }

        let (wait_values, signal_values) = unsafe { timeline_values(info.p_next) };
        let waits = wait_semaphores
            .iter()
            .enumerate()
            .map(|(i, &semaphore)| WaitEntry {
                target: target(semaphore, wait_values.get(i).copied(), is_timeline),
                stage: wait_stages.get(i).copied().unwrap_or_default(),
                device_index: wait_device_indices.get(i).copied().unwrap_or(0),
            })
            .collect();
        let signals = signal_semaphores
            .iter()
            .enumerate()
            .map(|(i, &semaphore)| SignalEntry {
                target: target(semaphore, signal_values.get(i).copied(), is_timeline),
                device_index: signal_device_indices.get(i).copied().unwrap_or(0),
            })
            .collect();

        Self {
            payload: Payload::Submit { command_buffers },
            chain,
            waits,
            signals,
            fence,
            clones: Vec::new(),
        }
    }

    /// Deep-copy one `VkBindSparseInfo`, nested bind arrays included.
    ///
    /// # Safety
    /// Every pointer in `info` and its `pNext` chain must be valid.
    pub unsafe fn from_bind_sparse_info(
        info: &vk::BindSparseInfo<'_>,
        fence: vk::Fence,
        is_timeline: &dyn Fn(vk::Semaphore) -> bool,
    ) -> Self {
        let wait_semaphores = unsafe { pnext::array(info.p_wait_semaphores, info.wait_semaphore_count) };
        let signal_semaphores =
            unsafe { pnext::array(info.p_signal_semaphores, info.signal_semaphore_count) };

        let mut binds = SparseBinds::default();
        unsafe {
            for bind in pnext::array(info.p_buffer_binds, info.buffer_bind_count) {
                binds
                    .buffer_binds
                    .push((bind.buffer, pnext::array(bind.p_binds, bind.bind_count).to_vec()));
            }
            for bind in pnext::array(info.p_image_opaque_binds, info.image_opaque_bind_count) {
                binds
                    .image_opaque_binds
                    .push((bind.image, pnext::array(bind.p_binds, bind.bind_count).to_vec()));
            }
            for bind in pnext::array(info.p_image_binds, info.image_bind_count) {
                binds
                    .image_binds
                    .push((bind.image, pnext::array(bind.p_binds, bind.bind_count).to_vec()));
            }
        }

        let mut chain = ExtensionChain::default();
        if let Some(group) = unsafe {
            pnext::find::<vk::DeviceGroupBindSparseInfo<'_>>(
                info.p_next,
                vk::StructureType::DEVICE_GROUP_BIND_SPARSE_INFO,
            )
        } {
            chain.device_group_bind_sparse =
                Some((group.resource_device_index, group.memory_device_index));
        }
        unsafe { warn_unsupported(info.p_next, &[vk::StructureType::DEVICE_GROUP_BIND_SPARSE_INFO]) };

        let (wait_values, signal_values) = unsafe { timeline_values(info.p_next) };
        let waits = wait_semaphores
            .iter()
            .enumerate()
            .map(|(i, &semaphore)| WaitEntry {
                target: target(semaphore, wait_values.get(i).copied(), is_timeline),
                stage: vk::PipelineStageFlags::empty(),
                device_index: 0,
            })
            .collect();
        let signals = signal_semaphores
            .iter()
            .enumerate()
            .map(|(i, &semaphore)| SignalEntry {
                target: target(semaphore, signal_values.get(i).copied(), is_timeline),
                device_index: 0,
            })
            .collect();

        Self {
            payload: Payload::BindSparse(binds),
            chain,
            waits,
            signals,
            fence,
            clones: Vec::new(),
        }
    }

    pub fn kind(&self) -> SubmitKind {
        match self.payload {
            Payload::Submit { .. } => SubmitKind::Submit,
            Payload::BindSparse(_) => SubmitKind::BindSparse,
        }
    }

    /// Nothing to submit besides the application fence.
    pub fn is_empty(&self) -> bool {
        let no_work = match &self.payload {
            Payload::Submit { command_buffers } => command_buffers.is_empty(),
            Payload::BindSparse(binds) => binds.is_empty(),
        };
        no_work && self.waits.is_empty() && self.signals.is_empty() && self.clones.is_empty()
    }

    /// Hand the work to the driver with `resolved` substituted for the
    /// semaphore operands.
    pub fn issue(
        &self,
        driver: &dyn Driver,
        queue: vk::Queue,
        resolved: &ResolvedSemaphores,
        fence: vk::Fence,
    ) -> VkResult<()> {
        match &self.payload {
            Payload::Submit { command_buffers } => {
                let mut protected = self
                    .chain
                    .protected_submit
                    .map(|p| vk::ProtectedSubmitInfo::default().protected_submit(p));
                let mut group = self.chain.device_group_masks.as_ref().map(|masks| {
                    vk::DeviceGroupSubmitInfo::default()
                        .wait_semaphore_device_indices(&resolved.wait_device_indices)
                        .command_buffer_device_masks(masks)
                        .signal_semaphore_device_indices(&resolved.signal_device_indices)
                });

                let mut info = vk::SubmitInfo::default()
                    .wait_semaphores(&resolved.wait_semaphores)
                    .wait_dst_stage_mask(&resolved.wait_stages)
                    .command_buffers(command_buffers)
                    .signal_semaphores(&resolved.signal_semaphores);
                if let Some(protected) = protected.as_mut() {
                    info = info.push_next(protected);
                }
                if let Some(group) = group.as_mut() {
                    info = info.push_next(group);
                }
                driver.queue_submit(queue, std::slice::from_ref(&info), fence)
            }
            Payload::BindSparse(binds) => {
                let buffer_binds: Vec<_> = binds
                    .buffer_binds
                    .iter()
                    .map(|(buffer, b)| vk::SparseBufferMemoryBindInfo::default().buffer(*buffer).binds(b))
                    .collect();
                let image_opaque_binds: Vec<_> = binds
                    .image_opaque_binds
                    .iter()
                    .map(|(image, b)| vk::SparseImageOpaqueMemoryBindInfo::default().image(*image).binds(b))
                    .collect();
                let image_binds: Vec<_> = binds
                    .image_binds
                    .iter()
                    .map(|(image, b)| vk::SparseImageMemoryBindInfo::default().image(*image).binds(b))
                    .collect();
                let mut group = self.chain.device_group_bind_sparse.map(|(resource, memory)| {
                    vk::DeviceGroupBindSparseInfo::default()
                        .resource_device_index(resource)
                        .memory_device_index(memory)
                });

                let mut info = vk::BindSparseInfo::default()
                    .wait_semaphores(&resolved.wait_semaphores)
                    .buffer_binds(&buffer_binds)
                    .image_opaque_binds(&image_opaque_binds)
                    .image_binds(&image_binds)
                    .signal_semaphores(&resolved.signal_semaphores);
                if let Some(group) = group.as_mut() {
                    info = info.push_next(group);
                }
                driver.queue_bind_sparse(queue, std::slice::from_ref(&info), fence)
            }
        }
    }
}

fn target(
    semaphore: vk::Semaphore,
    value: Option<u64>,
    is_timeline: &dyn Fn(vk::Semaphore) -> bool,
) -> SemaphoreTarget {
    use ash::vk::Handle;
    if is_timeline(semaphore) {
        SemaphoreTarget::Timeline {
            handle: semaphore.as_raw(),
            value: value.unwrap_or(0),
        }
    } else {
        SemaphoreTarget::Binary(semaphore)
    }
}

/// Wait and signal value arrays of a chained `VkTimelineSemaphoreSubmitInfo`.
unsafe fn timeline_values<'a>(p_next: *const std::ffi::c_void) -> (&'a [u64], &'a [u64]) {
    match unsafe {
        pnext::find::<vk::TimelineSemaphoreSubmitInfo<'_>>(
            p_next,
            vk::StructureType::TIMELINE_SEMAPHORE_SUBMIT_INFO,
        )
    } {
        Some(values) => unsafe {
            (
                pnext::array(values.p_wait_semaphore_values, values.wait_semaphore_value_count),
                pnext::array(values.p_signal_semaphore_values, values.signal_semaphore_value_count),
            )
        },
        None => (&[], &[]),
    }
}

/// # Safety
/// `p_next` must be null or the head of a valid structure chain.
unsafe fn warn_unsupported(p_next: *const std::ffi::c_void, carried: &[vk::StructureType]) {
    for s_type in unsafe { pnext::structure_types(p_next) } {
        if s_type != vk::StructureType::TIMELINE_SEMAPHORE_SUBMIT_INFO && !carried.contains(&s_type) {
            warn!(?s_type, "dropping unsupported structure from deferred submission");
        }
    }
}
